//! Core types: page numbers, connection identity, shared constants.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Zero-based page index within a database file (`offset / page_size`).
pub type PageNumber = u32;

/// Pages written by one checkpoint, keyed and ordered by page number.
pub type ChangedPages = BTreeMap<PageNumber, Vec<u8>>;

/// Page size used for newly created databases.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Smallest page size SQLite accepts.
pub const MIN_PAGE_SIZE: u32 = 512;

/// Largest page size SQLite accepts.
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Size of the SQLite database header at the start of page 0.
pub const HEADER_SIZE: usize = 100;

/// A backup lock whose file is older than this is considered abandoned.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(180);

/// Wildcard table key in an access key's privilege map.
pub const WILDCARD: &str = "*";

/// Identifies one cached connection: a tenant database branch opened on
/// behalf of one access key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub tenant: String,
    pub branch: String,
    pub access_key_id: String,
}

impl ConnectionKey {
    pub fn new(
        tenant: impl Into<String>,
        branch: impl Into<String>,
        access_key_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            branch: branch.into(),
            access_key_id: access_key_id.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.tenant, self.branch, self.access_key_id)
    }
}

/// Returns true if `value` is a power of two within SQLite's page size range.
pub fn is_valid_page_size(value: u32) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&value) && value.is_power_of_two()
}
