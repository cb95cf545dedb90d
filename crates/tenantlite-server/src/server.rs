//! Unix domain socket server that wraps a TenantLite `Resolver`.
//!
//! Each connected client sends JSON-line requests and receives JSON-line
//! responses. Requests run on the blocking pool: engine calls do file I/O
//! and writers wait on the global write gate.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use tenantlite_core::backup::FullBackupHandle;
use tenantlite_core::error::Error as CoreError;
use tenantlite_core::query::Query;
use tenantlite_core::resolver::Resolver;
use tenantlite_core::types::ConnectionKey;

use crate::protocol::{Request, Response};

/// A TenantLite server listening on a Unix socket.
pub struct TenantLiteServer {
    resolver: Resolver,
    socket_path: PathBuf,
}

impl TenantLiteServer {
    pub fn new(resolver: Resolver, socket_path: PathBuf) -> Self {
        Self {
            resolver,
            socket_path,
        }
    }

    /// Run the server, accepting connections until a shutdown signal is received.
    ///
    /// On startup, removes any stale socket file and binds a new one.
    /// On shutdown (SIGINT or SIGTERM), closes every tenant connection and
    /// removes the socket file before exiting.
    pub async fn run(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "server listening");

        let accept_loop = async {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let resolver = self.resolver.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(resolver, stream).await {
                                warn!(error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = shutdown_signal() => {
                info!("shutdown signal received");
            }
        }

        let resolver = self.resolver.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || resolver.context().shutdown()).await {
            warn!(error = %e, "context shutdown failed");
        }

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "failed to remove socket file on shutdown");
            } else {
                info!(path = %self.socket_path.display(), "socket file removed");
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    resolver: Resolver,
    stream: tokio::net::UnixStream,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => {
                let resolver = resolver.clone();
                tokio::task::spawn_blocking(move || dispatch(&resolver, req))
                    .await
                    .unwrap_or_else(|e| Response::error("InternalError", e.to_string()))
            }
            Err(e) => Response::error("ParseError", e.to_string()),
        };

        let mut resp_bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                let fallback = Response::error("SerializationError", e.to_string());
                serde_json::to_vec(&fallback).map_err(std::io::Error::other)?
            }
        };
        resp_bytes.push(b'\n');

        writer.write_all(&resp_bytes).await?;
        writer.flush().await?;
    }

    Ok(())
}

fn dispatch(resolver: &Resolver, req: Request) -> Response {
    match req {
        Request::Query {
            tenant,
            branch,
            access_key_id,
            statement,
            parameters,
        } => {
            let key = ConnectionKey::new(tenant, branch, access_key_id);
            let query = Query::new(statement).with_parameters(parameters);
            match resolver.handle_query(&key, query) {
                Ok(result) => Response::ok_query(result),
                Err(e) => error_to_response(e),
            }
        }

        Request::Batch {
            tenant,
            branch,
            access_key_id,
            statements,
        } => {
            let key = ConnectionKey::new(tenant, branch, access_key_id);
            match resolver.handle_batch(&key, statements) {
                Ok(batch) => Response::ok_batch(batch.results, batch.commit),
                Err(e) => error_to_response(e),
            }
        }

        Request::Checkpoint {
            tenant,
            branch,
            access_key_id,
        } => {
            let key = ConnectionKey::new(tenant, branch, access_key_id);
            match resolver.checkpoint(&key) {
                Ok(commit) => Response::ok_checkpoint(commit),
                Err(e) => error_to_response(e),
            }
        }

        Request::FullBackup {
            tenant,
            branch,
            access_key_id,
        } => {
            let key = ConnectionKey::new(tenant, branch, access_key_id);
            match resolver.full_backup(&key) {
                Ok(handle) => Response::ok_backup(handle),
                Err(e) => error_to_response(e),
            }
        }

        Request::BackupSize {
            tenant,
            branch,
            access_key_id,
            timestamp,
        } => {
            let handle = FullBackupHandle::new(&tenant, &branch, timestamp);
            let key = ConnectionKey::new(tenant, branch, access_key_id);
            match resolver.backup_size(&key, &handle) {
                Ok(size) => Response::ok_size(size),
                Err(e) => error_to_response(e),
            }
        }

        Request::DeleteBackup {
            tenant,
            branch,
            access_key_id,
            timestamp,
        } => {
            let handle = FullBackupHandle::new(&tenant, &branch, timestamp);
            let key = ConnectionKey::new(tenant, branch, access_key_id);
            match resolver.delete_backup(&key, &handle) {
                Ok(()) => Response::ok_empty(),
                Err(e) => error_to_response(e),
            }
        }

        Request::Restore {
            tenant,
            branch,
            access_key_id,
            timestamp,
            destination,
        } => {
            let key = ConnectionKey::new(tenant, branch, access_key_id);
            match resolver.restore(&key, timestamp, &destination) {
                Ok(summary) => Response::ok_restore(summary),
                Err(e) => error_to_response(e),
            }
        }

        Request::RestoreFullBackup {
            tenant,
            branch,
            access_key_id,
            timestamp,
            destination,
        } => {
            let handle = FullBackupHandle::new(&tenant, &branch, timestamp);
            let key = ConnectionKey::new(tenant, branch, access_key_id);
            match resolver.restore_full_backup(&key, &handle, &destination) {
                Ok(bytes) => Response::ok_bytes(bytes),
                Err(e) => error_to_response(e),
            }
        }

        Request::InvalidateAccessKey { access_key_id } => {
            Response::ok_invalidated(resolver.invalidate_access_key(&access_key_id))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

fn error_to_response(err: CoreError) -> Response {
    if err.is_fatal() {
        error!(fatal = true, kind = err.kind(), error = %err, "request failed");
    } else {
        debug!(kind = err.kind(), error = %err, "request failed");
    }
    Response::error(err.kind(), err.to_string())
}
