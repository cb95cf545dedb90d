//! TenantLite server and client library.
//!
//! Serves a [`tenantlite_core::resolver::Resolver`] over a Unix domain
//! socket so that request front-ends share one process-wide write gate and
//! connection cache.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::TenantLiteClient;
pub use server::TenantLiteServer;
