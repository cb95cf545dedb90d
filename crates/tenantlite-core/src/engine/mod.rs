//! The embedded engine: VFS registration, connections and their cache.

pub mod connection;
pub(crate) mod ffi;
pub mod manager;
pub mod operator;

pub use connection::{Connection, StatementInfo, statement_key};
pub use manager::ConnectionManager;
pub use operator::Operator;
