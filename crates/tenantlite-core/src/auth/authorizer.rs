use std::sync::Arc;

use crate::error::PrivilegeError;

use super::{AccessKey, Privilege};

/// A statement action reported by the engine's authorizer hook, reduced to
/// what the privilege checks need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction<'a> {
    /// Index maintenance: create/drop index, reindex, analyze.
    Index { table: &'a str },
    /// Create a table or view.
    Create { table: &'a str },
    CreateTrigger { table: &'a str },
    /// Drop a table, view or trigger.
    Drop { table: &'a str },
    Insert { table: &'a str },
    Delete { table: &'a str },
    Update { table: &'a str },
    Alter { table: &'a str },
    Pragma,
    Read,
    Select,
    /// Transactions, savepoints, function calls, recursive CTEs.
    Permitted,
    /// Attach, detach, virtual tables and anything unrecognized.
    Forbidden,
}

/// The answer returned to the engine for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(PrivilegeError),
    /// Omit the result silently instead of failing the statement.
    Ignore,
}

/// Authorizes engine actions against one access key.
#[derive(Debug, Clone)]
pub struct Authorizer {
    key: Arc<AccessKey>,
}

impl Authorizer {
    pub fn new(key: Arc<AccessKey>) -> Self {
        Self { key }
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.key
    }

    /// Decide one action. `database` is the schema name the action targets
    /// (`main`, `temp`, or an attached name); absent means `main`.
    pub fn authorize(&self, action: AuthAction<'_>, database: Option<&str>) -> AuthDecision {
        let database = database.unwrap_or("main");
        let key = &self.key;
        let result = match action {
            AuthAction::Index { table } => key.can_index(table),
            AuthAction::Create { table } => key.can_create(table, database),
            AuthAction::CreateTrigger { table } => key.can_trigger(table),
            AuthAction::Drop { table } => key.can_drop(table),
            AuthAction::Insert { table } => key.can_insert(table, database),
            AuthAction::Delete { table } => key.can_delete(table, database),
            AuthAction::Update { table } => key.can_update(table),
            AuthAction::Alter { table } => key.can_alter(table),
            AuthAction::Pragma => key.can_pragma(),
            // Column reads are not restricted here; SELECT gates them.
            AuthAction::Read => Ok(()),
            AuthAction::Select => {
                return match key.can_select() {
                    Ok(()) => AuthDecision::Allow,
                    Err(_) => AuthDecision::Ignore,
                };
            }
            AuthAction::Permitted => Ok(()),
            AuthAction::Forbidden => Err(PrivilegeError::new(Privilege::All)),
        };
        match result {
            Ok(()) => AuthDecision::Allow,
            Err(e) => AuthDecision::Deny(e),
        }
    }
}
