//! Minimal stand-in for the connection-lifecycle collaborator.
//! Connection lifecycle proper (accept/teardown, transport) is out of
//! scope; the resource manager only needs a stable identity and a
//! handle map scoped to it.

use std::sync::Arc;

use crate::config::ResourceManagerConfig;
use crate::handle_map::HandleMap;

/// A client connection. Every command and response threads a
/// `Connection` through the virtualizer so that handle rewriting is
/// scoped to the right client.
pub struct Connection {
    id: u64,
    transient_map: Arc<HandleMap>,
}

impl Connection {
    /// A new connection with its own, empty transient handle map.
    pub fn new(id: u64, config: &ResourceManagerConfig) -> Connection {
        Connection {
            id,
            transient_map: Arc::new(HandleMap::with_config(config)),
        }
    }

    /// Opaque connection identity, stable for the connection's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// This connection's transient handle map.
    pub fn transient_handle_map(&self) -> &Arc<HandleMap> {
        &self.transient_map
    }

    /// Tear down the connection: drop every live entry in its handle
    /// map.
    pub fn close(&self) {
        self.transient_map.clear();
    }
}
