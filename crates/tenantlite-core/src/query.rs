//! Statements, their parameters and results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ValidationError};

/// One SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub statement: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
}

impl Query {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: impl IntoIterator<Item = Value>) -> Self {
        self.parameters = parameters.into_iter().collect();
        self
    }

    /// Checks that do not need the engine. The parameter count is checked
    /// against the prepared statement at execution time.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.statement.trim().is_empty() {
            return Err(ValidationError::field("statement", "must not be empty"));
        }
        Ok(())
    }
}

/// Rows and counters produced by one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows changed by a writing statement; zero for reads.
    pub changes: u64,
    pub last_insert_row_id: i64,
}

/// Outcome of one statement inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Ok {
        #[serde(flatten)]
        result: QueryResult,
    },
    Error {
        error: String,
        message: String,
    },
}

impl BatchItem {
    pub fn is_ok(&self) -> bool {
        matches!(self, BatchItem::Ok { .. })
    }
}

impl From<Result<QueryResult, Error>> for BatchItem {
    fn from(result: Result<QueryResult, Error>) -> Self {
        match result {
            Ok(result) => BatchItem::Ok { result },
            Err(e) => BatchItem::Error {
                error: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }
}

/// Per-statement outcomes of a batch, plus the backup commit its
/// transaction produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: Vec<BatchItem>,
    /// Hash of the incremental backup commit, if pages changed.
    pub commit: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Privilege;
    use crate::error::PrivilegeError;
    use serde_json::json;

    #[test]
    fn test_validate_rejects_blank() {
        assert!(Query::new("SELECT 1").validate().is_ok());
        let err = Query::new("   ").validate().unwrap_err();
        assert_eq!(err.errors[0].field, "statement");
    }

    #[test]
    fn test_query_deserialize_defaults_parameters() {
        let q: Query = serde_json::from_value(json!({"statement": "SELECT 1"})).unwrap();
        assert!(q.parameters.is_empty());
    }

    #[test]
    fn test_batch_item_from_error() {
        let item = BatchItem::from(Err(Error::Privilege(PrivilegeError::new(Privilege::Insert))));
        assert!(!item.is_ok());
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "PrivilegeError");
    }

    #[test]
    fn test_batch_item_ok_flattens_result() {
        let item = BatchItem::from(Ok(QueryResult {
            columns: vec!["x".into()],
            rows: vec![vec![json!(1)]],
            changes: 0,
            last_insert_row_id: 0,
        }));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["rows"], json!([[1]]));
    }
}
