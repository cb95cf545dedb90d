//! Client library for connecting to a `tenantlite-server` via Unix socket.
//!
//! Each method serializes a JSON-line request, sends it, reads a JSON-line
//! response, and returns the parsed result.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use tenantlite_core::backup::{Commit, FullBackupHandle, RestoreSummary};
use tenantlite_core::query::{BatchResult, Query, QueryResult};
use tenantlite_core::types::ConnectionKey;

use crate::error::ClientError;
use crate::protocol::ErrorResponse;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client for a TenantLite server.
pub struct TenantLiteClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    line_buf: String,
}

impl TenantLiteClient {
    /// Connect to a TenantLite server at the given Unix socket path.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            line_buf: String::new(),
        })
    }

    /// Run one statement.
    pub async fn query(
        &mut self,
        key: &ConnectionKey,
        statement: &str,
        parameters: Vec<Value>,
    ) -> Result<QueryResult> {
        let req = request(
            "query",
            key,
            json!({"statement": statement, "parameters": parameters}),
        );
        let resp = self.send_request(&req).await?;
        parse(resp)
    }

    /// Run statements as one batch.
    pub async fn batch(&mut self, key: &ConnectionKey, statements: &[Query]) -> Result<BatchResult> {
        let req = request("batch", key, json!({"statements": statements}));
        let resp = self.send_request(&req).await?;
        parse(resp)
    }

    /// Flush buffered pages and back them up. Returns the new commit, if
    /// any pages changed.
    pub async fn checkpoint(&mut self, key: &ConnectionKey) -> Result<Option<Commit>> {
        let req = request("checkpoint", key, json!({}));
        let resp = self.send_request(&req).await?;
        field(resp, "commit")
    }

    pub async fn full_backup(&mut self, key: &ConnectionKey) -> Result<FullBackupHandle> {
        let req = request("full_backup", key, json!({}));
        let resp = self.send_request(&req).await?;
        field(resp, "backup")
    }

    pub async fn backup_size(&mut self, key: &ConnectionKey, timestamp: i64) -> Result<u64> {
        let req = request("backup_size", key, json!({"timestamp": timestamp}));
        let resp = self.send_request(&req).await?;
        field(resp, "size")
    }

    pub async fn delete_backup(&mut self, key: &ConnectionKey, timestamp: i64) -> Result<()> {
        let req = request("delete_backup", key, json!({"timestamp": timestamp}));
        let resp = self.send_request(&req).await?;
        check_error(&resp)
    }

    /// Rebuild the branch into `destination` as of the last backup of the
    /// UTC day containing `timestamp`.
    pub async fn restore(
        &mut self,
        key: &ConnectionKey,
        timestamp: i64,
        destination: &str,
    ) -> Result<RestoreSummary> {
        let req = request(
            "restore",
            key,
            json!({"timestamp": timestamp, "destination": destination}),
        );
        let resp = self.send_request(&req).await?;
        field(resp, "restore")
    }

    pub async fn restore_full_backup(
        &mut self,
        key: &ConnectionKey,
        timestamp: i64,
        destination: &str,
    ) -> Result<u64> {
        let req = request(
            "restore_full_backup",
            key,
            json!({"timestamp": timestamp, "destination": destination}),
        );
        let resp = self.send_request(&req).await?;
        field(resp, "bytes")
    }

    /// Drop a cached access key. Returns the number of connections closed.
    pub async fn invalidate_access_key(&mut self, access_key_id: &str) -> Result<usize> {
        let req = json!({"op": "invalidate_access_key", "access_key_id": access_key_id});
        let resp = self.send_request(&req).await?;
        field(resp, "connections")
    }

    async fn send_request(&mut self, req: &Value) -> Result<Value> {
        let mut data = serde_json::to_vec(req).map_err(ClientError::Serialization)?;
        data.push(b'\n');
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;

        self.line_buf.clear();
        let n = self.reader.read_line(&mut self.line_buf).await?;
        if n == 0 {
            return Err(ClientError::Disconnected);
        }

        let resp: Value =
            serde_json::from_str(self.line_buf.trim()).map_err(ClientError::Serialization)?;
        Ok(resp)
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

fn request(op: &str, key: &ConnectionKey, mut body: Value) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("op".into(), json!(op));
        obj.insert("tenant".into(), json!(key.tenant));
        obj.insert("branch".into(), json!(key.branch));
        obj.insert("access_key_id".into(), json!(key.access_key_id));
    }
    body
}

fn check_error(resp: &Value) -> Result<()> {
    if let Some(err) = resp.get("error") {
        let error = err.as_str().unwrap_or("Unknown").to_string();
        let message = resp
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        return Err(ClientError::Server(ErrorResponse { error, message }));
    }
    Ok(())
}

fn parse<T: DeserializeOwned>(resp: Value) -> Result<T> {
    check_error(&resp)?;
    serde_json::from_value(resp).map_err(ClientError::Serialization)
}

fn field<T: DeserializeOwned>(mut resp: Value, name: &str) -> Result<T> {
    check_error(&resp)?;
    let value = resp
        .as_object_mut()
        .and_then(|obj| obj.remove(name))
        .unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(ClientError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_names_caller() {
        let key = ConnectionKey::new("acme", "main", "k1");
        let req = request("checkpoint", &key, json!({}));
        assert_eq!(
            req,
            json!({"op": "checkpoint", "tenant": "acme", "branch": "main", "access_key_id": "k1"})
        );
    }

    #[test]
    fn test_server_error_is_surfaced() {
        let resp = json!({"error": "PrivilegeError", "message": "not authorized"});
        match field::<u64>(resp, "size") {
            Err(ClientError::Server(e)) => assert_eq!(e.error, "PrivilegeError"),
            other => panic!("expected Server error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_optional_field_is_none() {
        let commit: Option<Commit> = field(json!({"ok": true}), "commit").unwrap();
        assert!(commit.is_none());
    }
}
