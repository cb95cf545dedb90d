use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::PrivilegeError;
use crate::types::WILDCARD;

use super::Privilege;

/// Names under which SQLite exposes its schema tables to the authorizer.
const SCHEMA_TABLES: [&str; 4] = [
    "sqlite_master",
    "sqlite_schema",
    "sqlite_temp_master",
    "sqlite_temp_schema",
];

pub fn is_schema_table(table: &str) -> bool {
    SCHEMA_TABLES.iter().any(|t| t.eq_ignore_ascii_case(table))
}

fn is_main_or_temp(database: &str) -> bool {
    database.eq_ignore_ascii_case("main") || database.eq_ignore_ascii_case("temp")
}

/// The privilege grant set of an authenticated caller.
///
/// Privileges are keyed by table name, with `*` granting across every
/// table. Each `can_*` check applies the general rule (the table's grant or
/// the wildcard grant contains `ALL` or the verb) plus the carve-outs that
/// let DDL through, since SQLite reports DDL as writes to its schema table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKey {
    pub tenant: String,
    pub branch: String,
    pub access_key_id: String,
    #[serde(default)]
    pub privileges: BTreeMap<String, BTreeSet<Privilege>>,
}

type Check = Result<(), PrivilegeError>;

fn check(allowed: bool, verb: Privilege) -> Check {
    if allowed {
        Ok(())
    } else {
        Err(PrivilegeError::new(verb))
    }
}

impl AccessKey {
    pub fn new(
        tenant: impl Into<String>,
        branch: impl Into<String>,
        access_key_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            branch: branch.into(),
            access_key_id: access_key_id.into(),
            privileges: BTreeMap::new(),
        }
    }

    /// Add `verbs` to the grant for `table` (or `*`).
    pub fn grant(
        mut self,
        table: impl Into<String>,
        verbs: impl IntoIterator<Item = Privilege>,
    ) -> Self {
        self.privileges.entry(table.into()).or_default().extend(verbs);
        self
    }

    fn grants(&self, table: &str, verb: Privilege) -> bool {
        self.privileges
            .get(table)
            .is_some_and(|set| set.contains(&Privilege::All) || set.contains(&verb))
    }

    /// The general rule: the table's grant or the wildcard grant contains
    /// `ALL` or `verb`.
    pub fn general(&self, table: &str, verb: Privilege) -> bool {
        self.grants(table, verb) || self.grants(WILDCARD, verb)
    }

    pub fn can_alter(&self, table: &str) -> Check {
        let allowed = self.general(table, Privilege::Alter)
            || (is_schema_table(table) && self.can_index(table).is_ok());
        check(allowed, Privilege::Alter)
    }

    /// Creating in `main` or `temp` falls through to the trigger check when
    /// the create grant itself does not pass.
    pub fn can_create(&self, table: &str, database: &str) -> Check {
        let allowed = self.general(table, Privilege::Create)
            || (is_schema_table(table)
                && (self.can_alter(table).is_ok() || self.can_drop(table).is_ok()));
        if allowed {
            return Ok(());
        }
        if is_main_or_temp(database) {
            return self.can_trigger(table).map_err(|_| PrivilegeError::new(Privilege::Create));
        }
        Err(PrivilegeError::new(Privilege::Create))
    }

    pub fn can_delete(&self, table: &str, database: &str) -> Check {
        let allowed = self.general(table, Privilege::Delete)
            || (is_main_or_temp(database) && self.can_drop(table).is_ok())
            || (is_schema_table(table) && self.can_drop(table).is_ok());
        check(allowed, Privilege::Delete)
    }

    pub fn can_drop(&self, table: &str) -> Check {
        check(self.general(table, Privilege::Drop), Privilege::Drop)
    }

    pub fn can_index(&self, table: &str) -> Check {
        check(self.general(table, Privilege::Index), Privilege::Index)
    }

    pub fn can_insert(&self, table: &str, database: &str) -> Check {
        let allowed = self.general(table, Privilege::Insert)
            || (is_schema_table(table)
                && (self.can_create(table, database).is_ok() || self.can_index(table).is_ok()));
        check(allowed, Privilege::Insert)
    }

    /// Triggers are granted through the `INSERT` verb.
    pub fn can_trigger(&self, table: &str) -> Check {
        check(self.general(table, Privilege::Insert), Privilege::Trigger)
    }

    /// Schema-table updates always pass; SQLite issues them for renames and
    /// other DDL bookkeeping.
    pub fn can_update(&self, table: &str) -> Check {
        if is_schema_table(table) {
            return Ok(());
        }
        check(self.general(table, Privilege::Update), Privilege::Update)
    }

    /// Only the wildcard grant can allow pragmas.
    pub fn can_pragma(&self) -> Check {
        check(self.grants(WILDCARD, Privilege::Pragma), Privilege::Pragma)
    }

    /// Only the wildcard grant can allow selects; a table-scoped `SELECT`
    /// does not.
    pub fn can_select(&self) -> Check {
        check(self.grants(WILDCARD, Privilege::Select), Privilege::Select)
    }
}
