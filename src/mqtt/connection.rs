//! Connection Manager
//!
//! Owns the single live client handle and the router task bound to it.
//! Opening a new connection always retires the previous one first, so at most
//! one handle feeds the registry at any time.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{ClientHandle, Connector};
use super::config::MqttConfig;
use super::error::ClientError;
use super::router::MessageRouter;

struct LiveConnection<H> {
    handle: Arc<H>,
    router: JoinHandle<()>,
}

impl<H: ClientHandle> LiveConnection<H> {
    async fn shutdown(self, force: bool) -> Result<(), ClientError> {
        let result = self.handle.end(force).await;
        self.router.abort();
        result
    }
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    current: Mutex<Option<LiveConnection<C::Handle>>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            current: Mutex::new(None),
        }
    }

    /// Opens the first connection. Use [`connect`](Self::connect) once a
    /// connection may already be live.
    pub fn open(&self, config: &MqttConfig, router: MessageRouter) -> Result<(), ClientError> {
        let (handle, events) = self.connector.connect(config)?;
        let live = LiveConnection {
            handle: Arc::new(handle),
            router: router.spawn(events),
        };
        info!("Opened MQTT connection to {}", config.broker_url());
        *self.current.lock() = Some(live);
        Ok(())
    }

    /// Force-closes any live connection, then opens a new one.
    pub async fn connect(&self, config: &MqttConfig, router: MessageRouter) -> Result<(), ClientError> {
        let previous = self.current.lock().take();
        if let Some(previous) = previous {
            debug!("Force-closing previous connection before reconnecting");
            if let Err(e) = previous.shutdown(true).await {
                warn!("Previous connection did not close cleanly: {}", e);
            }
        }
        self.open(config, router)
    }

    pub fn handle(&self) -> Option<Arc<C::Handle>> {
        self.current.lock().as_ref().map(|live| live.handle.clone())
    }

    /// Closes the live connection. Returns false when there was none.
    pub async fn close(&self, force: bool) -> Result<bool, ClientError> {
        let live = self.current.lock().take();
        match live {
            Some(live) => {
                live.shutdown(force).await?;
                info!("MQTT connection closed (force: {})", force);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
