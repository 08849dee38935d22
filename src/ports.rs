//! Registry of live transport ports, keyed by tab (content) or popup
//! (extension).
//!
//! A port is the sending half of an unbounded channel whose receiver belongs
//! to the connected peer. When the peer drops its receiver the port is
//! removed, but only if the registry entry still belongs to that same
//! connection.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{ExtensionError, Result};
use crate::messages::{TransportResponse, PORT_CONTENT, PORT_EXTENSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Content,
    Extension,
}

impl PortKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            PORT_CONTENT => Ok(PortKind::Content),
            PORT_EXTENSION => Ok(PortKind::Extension),
            other => Err(ExtensionError::UnknownConnection(other.to_string())),
        }
    }
}

/// Where a port lives. Content ports always belong to a tab; the popup may
/// or may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PortKey {
    Content(u32),
    Extension(Option<u32>),
}

impl PortKey {
    pub fn classify(name: &str, tab: Option<u32>) -> Result<Self> {
        match (PortKind::from_name(name)?, tab) {
            (PortKind::Content, Some(tab)) => Ok(PortKey::Content(tab)),
            (PortKind::Content, None) => Err(ExtensionError::UnknownConnection(format!("{} without tab", name))),
            (PortKind::Extension, tab) => Ok(PortKey::Extension(tab)),
        }
    }
}

impl std::fmt::Display for PortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortKey::Content(tab) => write!(f, "content:{}", tab),
            PortKey::Extension(Some(tab)) => write!(f, "extension:{}", tab),
            PortKey::Extension(None) => write!(f, "extension"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Port {
    pub key: PortKey,
    pub connection_id: u64,
    tx: mpsc::UnboundedSender<TransportResponse>,
}

impl Port {
    pub fn post(&self, frame: TransportResponse) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| ExtensionError::PortNotConnected(self.key.to_string()))
    }
}

#[derive(Default)]
pub struct PortRegistry {
    ports: Mutex<HashMap<PortKey, Port>>,
    next_connection: AtomicU64,
}

impl PortRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PortKey, Port>> {
        self.ports.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `tx` under `key`, replacing any previous port. Must be called
    /// from within a tokio runtime; the disconnect watcher is a spawned task.
    pub fn register(self: &Arc<Self>, key: PortKey, tx: mpsc::UnboundedSender<TransportResponse>) -> Port {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let port = Port {
            key,
            connection_id,
            tx: tx.clone(),
        };
        if let Some(old) = self.lock().insert(key, port.clone()) {
            debug!("Port {} replaced (connection {} -> {})", key, old.connection_id, connection_id);
        }
        info!("Port {} connected (connection {})", key, connection_id);

        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tx.closed().await;
            if let Some(registry) = registry.upgrade() {
                registry.disconnect(key, connection_id);
            }
        });
        port
    }

    /// Remove `key` if it still belongs to `connection_id`.
    pub fn disconnect(&self, key: PortKey, connection_id: u64) -> bool {
        let mut ports = self.lock();
        match ports.get(&key) {
            Some(port) if port.connection_id == connection_id => {
                ports.remove(&key);
                info!("Port {} disconnected (connection {})", key, connection_id);
                true
            }
            _ => {
                debug!("Ignoring stale disconnect of {} (connection {})", key, connection_id);
                false
            }
        }
    }

    pub fn get(&self, key: PortKey) -> Result<Port> {
        self.lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| ExtensionError::PortNotConnected(key.to_string()))
    }

    /// Deliver to whatever port currently holds `key`.
    pub fn post(&self, key: PortKey, frame: TransportResponse) -> Result<()> {
        self.get(key)?.post(frame)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
