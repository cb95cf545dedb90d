//! TenantLite server binary.
//!
//! Lays out tenant storage under a root directory and serves it over a Unix
//! domain socket.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tenantlite_core::backup::{LocalObjectStorage, ObjectStorage};
use tenantlite_core::config::{BackupMode, Config};
use tenantlite_core::context::Context;
use tenantlite_core::resolver::Resolver;
use tenantlite_core::secrets::FileSecretsStore;
use tenantlite_core::types::DEFAULT_PAGE_SIZE;
use tenantlite_server::TenantLiteServer;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Local,
    Remote,
    Testing,
}

/// TenantLite server: multi-tenant SQLite over a Unix socket.
#[derive(Parser, Debug)]
#[command(name = "tenantlite-server", version)]
struct Cli {
    /// Root directory for tenant data, scratch files and backups
    /// (default: ~/.local/share/tenantlite).
    #[arg(long, env = "TENANTLITE_ROOT")]
    root: Option<PathBuf>,

    /// Unix socket path (default: <root>/server.sock).
    #[arg(long, env = "TENANTLITE_SOCKET")]
    socket: Option<PathBuf>,

    /// Directory holding access_keys/ and databases.json (default: <root>/secrets).
    #[arg(long, env = "TENANTLITE_SECRETS")]
    secrets: Option<PathBuf>,

    /// Where full backups go.
    #[arg(long, value_enum, default_value_t = Mode::Local, env = "TENANTLITE_BACKUP_MODE")]
    backup_mode: Mode,

    /// Bucket for remote full backups.
    #[arg(long, env = "TENANTLITE_BUCKET")]
    bucket: Option<String>,

    /// Directory backing remote object storage (default: <root>/object-storage).
    #[arg(long, env = "TENANTLITE_OBJECT_STORAGE")]
    object_storage: Option<PathBuf>,

    /// Page size for newly created databases.
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,

    /// Prepared statements cached per connection.
    #[arg(long, default_value_t = 64)]
    statement_cache_capacity: usize,
}

fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tenantlite")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(default_root);
    let socket_path = cli.socket.unwrap_or_else(|| root.join("server.sock"));
    let secrets_dir = cli.secrets.unwrap_or_else(|| root.join("secrets"));

    let mut config = Config::new(&root).with_page_size(cli.page_size);
    config.statement_cache_capacity = cli.statement_cache_capacity;
    let mut object_storage: Option<Arc<dyn ObjectStorage>> = None;
    match cli.backup_mode {
        Mode::Local => {}
        Mode::Testing => config = config.with_backup_mode(BackupMode::Testing),
        Mode::Remote => {
            let bucket = cli.bucket.ok_or("--bucket is required in remote mode")?;
            let storage_root = cli
                .object_storage
                .unwrap_or_else(|| root.join("object-storage"));
            object_storage = Some(Arc::new(LocalObjectStorage::new(storage_root)));
            config = config.with_backup_mode(BackupMode::Remote { bucket });
        }
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!(
        root = %root.display(),
        socket = %socket_path.display(),
        secrets = %secrets_dir.display(),
        "starting"
    );

    let secrets = Arc::new(FileSecretsStore::new(secrets_dir));
    let context = Context::new(config, secrets, object_storage)?;
    let server = TenantLiteServer::new(Resolver::new(context), socket_path);
    server.run().await?;

    Ok(())
}
