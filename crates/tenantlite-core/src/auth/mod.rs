//! Privilege model: access keys and the statement authorizer.

pub mod access_key;
pub mod authorizer;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use access_key::AccessKey;
pub use authorizer::{AuthAction, AuthDecision, Authorizer};

/// A privilege verb granted on a table or on the wildcard `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Privilege {
    All,
    Create,
    Alter,
    Drop,
    Index,
    Insert,
    Delete,
    Update,
    Select,
    Pragma,
    Trigger,
}

impl Privilege {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::All => "ALL",
            Privilege::Create => "CREATE",
            Privilege::Alter => "ALTER",
            Privilege::Drop => "DROP",
            Privilege::Index => "INDEX",
            Privilege::Insert => "INSERT",
            Privilege::Delete => "DELETE",
            Privilege::Update => "UPDATE",
            Privilege::Select => "SELECT",
            Privilege::Pragma => "PRAGMA",
            Privilege::Trigger => "TRIGGER",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
