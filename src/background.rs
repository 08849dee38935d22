//! The background process: owns every service and routes port traffic to the
//! two handlers.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ExtensionConfig;
use crate::error::{ExtensionError, Result};
use crate::handlers::{Extension, Tabs};
use crate::keyring::Keyring;
use crate::messages::{PriMethod, PubMethod, TransportRequest, TransportResponse};
use crate::password_cache::PasswordCache;
use crate::ports::{PortKey, PortRegistry};
use crate::state::{url_origin, State};
use crate::storage::Stores;

pub struct Background {
    pub config: ExtensionConfig,
    pub state: Arc<State>,
    pub keyring: Arc<Keyring>,
    pub ports: Arc<PortRegistry>,
    pub password_cache: PasswordCache,
    tabs: Tabs,
    extension: Extension,
}

impl Background {
    /// Open the configured stores and load everything from them.
    pub async fn start(config: ExtensionConfig) -> Result<Arc<Self>> {
        let stores = Stores::open(&config.storage)?;
        Self::with_stores(config, stores).await
    }

    pub async fn with_stores(config: ExtensionConfig, stores: Stores) -> Result<Arc<Self>> {
        let keyring = Arc::new(Keyring::load(stores.local.clone(), config.keyring.clone()).await?);
        let state = Arc::new(State::load(stores.local.clone()).await?);
        let password_cache = PasswordCache::new(stores.session.clone());
        let ports = PortRegistry::new();

        let tabs = Tabs::new(state.clone(), keyring.clone(), ports.clone());
        let extension = Extension::new(
            state.clone(),
            keyring.clone(),
            ports.clone(),
            password_cache.clone(),
            config.password_cache.ttl_ms,
        );
        info!("Background ready ({} accounts)", keyring.accounts().len());

        Ok(Arc::new(Self {
            config,
            state,
            keyring,
            ports,
            password_cache,
            tabs,
            extension,
        }))
    }

    /// Open a port. `name` decides whether it speaks the page or the popup
    /// namespace.
    pub fn connect(self: &Arc<Self>, name: &str, tab: Option<u32>) -> Result<Connection> {
        let key = PortKey::classify(name, tab)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let port = self.ports.register(key, tx);
        Ok(Connection {
            sender: PortSender {
                background: self.clone(),
                key,
            },
            connection_id: port.connection_id,
            rx,
        })
    }

    /// Handle one inbound frame from `key`.
    pub async fn dispatch(&self, key: PortKey, frame: TransportRequest) -> Result<Value> {
        match key {
            PortKey::Content(_) => {
                let method = PubMethod::from_message(&frame.message)?;
                let origin = frame
                    .origin
                    .as_deref()
                    .ok_or_else(|| ExtensionError::InvalidRequest("page request without origin".to_string()))?;
                let url = url_origin(origin)?;
                self.tabs.handle(&frame.id, method, &url, key, frame.request).await
            }
            PortKey::Extension(_) => {
                let method = PriMethod::from_message(&frame.message)?;
                self.extension.handle(&frame.id, method, key, frame.request).await
            }
        }
    }

    /// Send a response to whatever port currently holds `key`. Failure is
    /// logged and goes no further.
    fn deliver(&self, key: PortKey, response: TransportResponse) {
        let id = response.id.clone();
        if let Err(e) = self.ports.post(key, response) {
            warn!("Unable to deliver response {} to {}: {}", id, key, e);
        }
    }
}

/// Cloneable inbound half of a connection.
#[derive(Clone)]
pub struct PortSender {
    background: Arc<Background>,
    key: PortKey,
}

impl PortSender {
    /// Handle `frame` on its own task; the response goes back through the
    /// port registry.
    pub fn send(&self, frame: TransportRequest) -> JoinHandle<()> {
        let background = self.background.clone();
        let key = self.key;
        tokio::spawn(async move {
            let id = frame.id.clone();
            let message = frame.message.clone();
            let result = background.dispatch(key, frame).await;
            if let Err(e) = &result {
                debug!("{} {} from {} failed: {}", message, id, key, e);
            }
            background.deliver(key, TransportResponse::from_result(id, result));
        })
    }
}

pub struct Connection {
    sender: PortSender,
    connection_id: u64,
    rx: mpsc::UnboundedReceiver<TransportResponse>,
}

impl Connection {
    pub fn key(&self) -> PortKey {
        self.sender.key
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: TransportRequest) -> JoinHandle<()> {
        self.sender.send(frame)
    }

    pub async fn recv(&mut self) -> Option<TransportResponse> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportResponse> {
        self.rx.try_recv().ok()
    }

    /// Close the port. Requests already in flight keep running.
    pub fn disconnect(self) {
        debug!("Closing {} (connection {})", self.sender.key, self.connection_id);
    }
}
