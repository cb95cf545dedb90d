//! Integration tests for tenantlite-server: start server, connect client, verify ops.

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{Duration, sleep};

use tenantlite_core::auth::{AccessKey, Privilege};
use tenantlite_core::config::Config;
use tenantlite_core::context::Context;
use tenantlite_core::query::{BatchItem, Query};
use tenantlite_core::resolver::Resolver;
use tenantlite_core::secrets::MemorySecretsStore;
use tenantlite_core::types::ConnectionKey;
use tenantlite_server::client::TenantLiteClient;
use tenantlite_server::error::ClientError;
use tenantlite_server::server::TenantLiteServer;

/// Start a server on a temp socket and return the socket path.
/// The server runs in a background tokio task.
async fn start_test_server() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("test.sock");

    let secrets = Arc::new(MemorySecretsStore::new());
    secrets.put_database("acme", "main", "acme/main.db");
    secrets.put_access_key(AccessKey::new("acme", "main", "admin").grant("*", [Privilege::All]));
    secrets.put_access_key(AccessKey::new("acme", "main", "reader").grant("*", [Privilege::Select]));

    let context = Context::new(Config::new(dir.path().join("root")), secrets, None).unwrap();
    let server = TenantLiteServer::new(Resolver::new(context), socket_path.clone());

    tokio::spawn(async move {
        server.run().await.unwrap();
    });

    // Give the server a moment to bind.
    sleep(Duration::from_millis(50)).await;

    (dir, socket_path)
}

fn admin() -> ConnectionKey {
    ConnectionKey::new("acme", "main", "admin")
}

#[tokio::test]
async fn test_query_and_checkpoint() {
    let (_dir, sock) = start_test_server().await;
    let mut client = TenantLiteClient::connect(&sock).await.unwrap();
    let key = admin();

    client
        .query(&key, "CREATE TABLE t (x INTEGER, name TEXT)", vec![])
        .await
        .unwrap();
    let inserted = client
        .query(&key, "INSERT INTO t VALUES (?1, ?2)", vec![json!(1), json!("one")])
        .await
        .unwrap();
    assert_eq!(inserted.changes, 1);
    assert_eq!(inserted.last_insert_row_id, 1);

    let rows = client
        .query(&key, "SELECT x, name FROM t", vec![])
        .await
        .unwrap();
    assert_eq!(rows.columns, vec!["x", "name"]);
    assert_eq!(rows.rows, vec![vec![json!(1), json!("one")]]);

    // Everything was flushed when the write committed.
    assert!(client.checkpoint(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_batch_reports_items() {
    let (_dir, sock) = start_test_server().await;
    let mut client = TenantLiteClient::connect(&sock).await.unwrap();
    let key = admin();

    let batch = client
        .batch(
            &key,
            &[
                Query::new("CREATE TABLE t (x INTEGER)"),
                Query::new("INSERT INTO nope VALUES (1)"),
                Query::new("INSERT INTO t VALUES (2)"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(batch.results.len(), 3);
    assert!(batch.results[0].is_ok());
    match &batch.results[1] {
        BatchItem::Error { error, .. } => assert_eq!(error, "EngineError"),
        other => panic!("expected error item, got {other:?}"),
    }
    assert!(batch.results[2].is_ok());
    assert!(batch.commit.is_some());
}

#[tokio::test]
async fn test_privilege_error_response() {
    let (_dir, sock) = start_test_server().await;
    let mut client = TenantLiteClient::connect(&sock).await.unwrap();

    client
        .query(&admin(), "CREATE TABLE t (x INTEGER)", vec![])
        .await
        .unwrap();

    let reader = ConnectionKey::new("acme", "main", "reader");
    let err = client
        .query(&reader, "INSERT INTO t VALUES (1)", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some("PrivilegeError"));

    let count = client
        .query(&reader, "SELECT count(*) FROM t", vec![])
        .await
        .unwrap();
    assert_eq!(count.rows, vec![vec![json!(0)]]);

    let foreign = ConnectionKey::new("other", "main", "admin");
    let err = client.query(&foreign, "SELECT 1", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), Some("AccessDenied"));
}

#[tokio::test]
async fn test_full_backup_lifecycle() {
    let (_dir, sock) = start_test_server().await;
    let mut client = TenantLiteClient::connect(&sock).await.unwrap();
    let key = admin();

    client
        .query(&key, "CREATE TABLE t (x INTEGER)", vec![])
        .await
        .unwrap();

    let backup = client.full_backup(&key).await.unwrap();
    assert!(backup.key.ends_with(".db.gz"));
    assert!(backup.size > 0);
    assert_eq!(
        client.backup_size(&key, backup.timestamp).await.unwrap(),
        backup.size
    );

    let bytes = client
        .restore_full_backup(&key, backup.timestamp, "acme/copy.db")
        .await
        .unwrap();
    assert!(bytes > 0);

    let summary = client.restore(&key, i64::MAX, "acme/pitr.db").await.unwrap();
    assert_eq!(summary.snapshots, 1);

    client.delete_backup(&key, backup.timestamp).await.unwrap();
    assert_eq!(client.backup_size(&key, backup.timestamp).await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalidate_access_key() {
    let (_dir, sock) = start_test_server().await;
    let mut client = TenantLiteClient::connect(&sock).await.unwrap();
    let key = admin();

    client.query(&key, "SELECT 1", vec![]).await.unwrap();
    assert_eq!(client.invalidate_access_key("admin").await.unwrap(), 1);
    assert_eq!(client.invalidate_access_key("admin").await.unwrap(), 0);

    // The key reloads from the store and a fresh connection opens.
    client.query(&key, "SELECT 1", vec![]).await.unwrap();
}

#[tokio::test]
async fn test_malformed_request() {
    let (_dir, sock) = start_test_server().await;
    let stream = UnixStream::connect(&sock).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"{\"op\": \"nope\"}\n").await.unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let resp: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(resp["error"], "ParseError");
}

#[tokio::test]
async fn test_branch_mismatch_denied() {
    let (_dir, sock) = start_test_server().await;
    let mut client = TenantLiteClient::connect(&sock).await.unwrap();

    let err = client
        .query(&ConnectionKey::new("acme", "dev", "admin"), "SELECT 1", vec![])
        .await
        .unwrap_err();
    match err {
        ClientError::Server(resp) => assert_eq!(resp.error, "AccessDenied"),
        other => panic!("expected server error, got {other:?}"),
    }
}
