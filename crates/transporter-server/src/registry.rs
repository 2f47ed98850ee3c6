//! Registry of live tunnels, addressable by agent id and by public port
//!
//! Both indexes sit behind a single lock so that a lookup by either key never
//! observes a half-applied insert or removal.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace};

struct Entry<T> {
    port: u16,
    value: Arc<T>,
}

struct Indexes<T> {
    by_agent: HashMap<String, Entry<T>>,
    by_port: HashMap<u16, String>,
}

/// Bidirectional map `agent id <-> public port -> value`
pub struct Registry<T> {
    indexes: RwLock<Indexes<T>>,
}

/// Registry of tunnels served by one server
pub type TunnelRegistry = Registry<crate::tunnel::Tunnel>;

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(Indexes {
                by_agent: HashMap::new(),
                by_port: HashMap::new(),
            }),
        }
    }

    /// Insert `value` under both keys. Returns the entry previously held by
    /// this agent, which the caller is expected to shut down.
    pub fn register(&self, agent_id: &str, port: u16, value: Arc<T>) -> Option<Arc<T>> {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);

        // A port can only belong to one agent; drop any stale owner
        if let Some(owner) = indexes.by_port.remove(&port) {
            if owner != agent_id {
                indexes.by_agent.remove(&owner);
                debug!(agent_id = %owner, port, "Dropped stale registry entry for reused port");
            }
        }

        let replaced = indexes
            .by_agent
            .insert(agent_id.to_string(), Entry { port, value });
        if let Some(old) = &replaced {
            if old.port != port {
                indexes.by_port.remove(&old.port);
            }
        }
        indexes.by_port.insert(port, agent_id.to_string());

        trace!(agent_id = %agent_id, port, "Registered tunnel");
        replaced.map(|entry| entry.value)
    }

    pub fn get_by_agent(&self, agent_id: &str) -> Option<Arc<T>> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes
            .by_agent
            .get(agent_id)
            .map(|entry| Arc::clone(&entry.value))
    }

    pub fn get_by_port(&self, port: u16) -> Option<Arc<T>> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let agent_id = indexes.by_port.get(&port)?;
        indexes
            .by_agent
            .get(agent_id)
            .map(|entry| Arc::clone(&entry.value))
    }

    pub fn port_of(&self, agent_id: &str) -> Option<u16> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes.by_agent.get(agent_id).map(|entry| entry.port)
    }

    /// Remove the entry for `agent_id` only if it is still paired with `port`.
    /// A tunnel that was already replaced therefore cannot evict its successor.
    pub fn remove(&self, agent_id: &str, port: u16) -> bool {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);

        match indexes.by_agent.get(agent_id) {
            Some(entry) if entry.port == port => {
                indexes.by_agent.remove(agent_id);
                indexes.by_port.remove(&port);
                trace!(agent_id = %agent_id, port, "Unregistered tunnel");
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every registered value
    pub fn values(&self) -> Vec<Arc<T>> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes
            .by_agent
            .values()
            .map(|entry| Arc::clone(&entry.value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_agent
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
