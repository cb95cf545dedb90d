//! Storage: page-addressed database files, the SQLite header, advisory locks.

pub mod file;
pub mod header;
pub mod lock;

pub use file::{PageFile, page_offset};
pub use header::DatabaseHeader;
pub use lock::FileLock;
