pub mod extension;
pub mod tabs;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::messages::{to_json, TransportResponse};
use crate::ports::{PortKey, PortRegistry};

pub use extension::Extension;
pub use tabs::Tabs;

/// Push target of one subscription: the port connection that asked for it.
pub(crate) struct SubscriptionSink {
    ports: Arc<PortRegistry>,
    port: PortKey,
    connection_id: u64,
    id: String,
}

impl SubscriptionSink {
    pub fn new(ports: Arc<PortRegistry>, port: PortKey, id: &str) -> Result<Self> {
        let connection_id = ports.get(port)?.connection_id;
        Ok(Self {
            ports,
            port,
            connection_id,
            id: id.to_string(),
        })
    }

    /// False once the subscribing connection is gone or replaced.
    pub fn push<T: Serialize>(&self, value: &T) -> bool {
        let port = match self.ports.get(self.port) {
            Ok(port) if port.connection_id == self.connection_id => port,
            _ => {
                debug!("Subscription {} ended, {} went away", self.id, self.port);
                return false;
            }
        };
        let value = match to_json(value) {
            Ok(value) => value,
            Err(e) => {
                warn!("Subscription {} dropped an update: {}", self.id, e);
                return true;
            }
        };
        port.post(TransportResponse::subscription(self.id.clone(), value)).is_ok()
    }
}

/// Stream every later value of `rx` to `sink` until either side goes away.
pub(crate) fn forward<T>(sink: SubscriptionSink, mut rx: watch::Receiver<T>)
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    rx.borrow_and_update();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let value = rx.borrow_and_update().clone();
            if !sink.push(&value) {
                break;
            }
        }
    });
}
