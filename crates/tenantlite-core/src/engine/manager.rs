use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::auth::AccessKey;
use crate::config::Config;
use crate::error::Result;
use crate::types::ConnectionKey;
use crate::vfs::HandleRegistry;

use super::connection::Connection;

/// Open connections keyed by tenant, branch and access key.
#[derive(Debug)]
pub struct ConnectionManager {
    handles: Arc<HandleRegistry>,
    connections: Mutex<HashMap<ConnectionKey, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new(handles: Arc<HandleRegistry>) -> Self {
        Self {
            handles,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    /// Return the cached connection for `key`, opening `database_name` when
    /// there is none or the cached one was closed.
    pub fn get_or_open(
        &self,
        key: &ConnectionKey,
        database_name: &str,
        config: &Config,
        access_key: Arc<AccessKey>,
    ) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get(key) {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = Arc::new(Connection::open(
            key.clone(),
            database_name,
            config,
            Arc::clone(&self.handles),
            access_key,
        )?);
        connections.insert(key.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.connections.lock().get(key).cloned()
    }

    /// Close and forget every connection opened for `access_key_id`.
    pub fn close_access_key(&self, access_key_id: &str) -> usize {
        let closed: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock();
            let keys: Vec<ConnectionKey> = connections
                .keys()
                .filter(|k| k.access_key_id == access_key_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| connections.remove(k)).collect()
        };
        for conn in &closed {
            conn.close();
        }
        if !closed.is_empty() {
            info!(access_key_id, connections = closed.len(), "connections closed");
        }
        closed.len()
    }

    pub fn close_all(&self) {
        let closed: Vec<Arc<Connection>> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in closed {
            conn.close();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
