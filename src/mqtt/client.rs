//! Seam between the service and the MQTT client library.
//!
//! The service only needs a handful of primitives from a client: open a
//! connection, subscribe, unsubscribe, publish, close, plus a feed of
//! connection events. [`Connector`] and [`ClientHandle`] describe exactly that,
//! so the production adapter ([`RumqttConnector`](super::mqtt_handler::RumqttConnector))
//! and test doubles are interchangeable.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::config::MqttConfig;
use super::error::ClientError;
use super::types::{PublishOptions, SubscribeOptions, SubscriptionGrant};

/// Raw events emitted by a live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Publish received from the broker
    Message { topic: String, payload: Vec<u8> },
    /// Broker accepted the connection (initial connect or reconnect)
    Connect,
    /// Connection lost; the client may be retrying in the background
    Offline,
}

pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;
pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

/// Handle to one physical broker connection.
#[async_trait]
pub trait ClientHandle: Send + Sync + 'static {
    /// Subscribes and resolves with the broker's grants once acknowledged.
    ///
    /// Some brokers/clients acknowledge with an empty list; callers must cope.
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<Vec<SubscriptionGrant>, ClientError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), ClientError>;

    /// Closes the connection. `force` skips the graceful disconnect handshake.
    async fn end(&self, force: bool) -> Result<(), ClientError>;

    fn is_connected(&self) -> bool;
}

/// Factory for connections.
pub trait Connector: Send + Sync + 'static {
    type Handle: ClientHandle;

    /// Opens a connection and returns its handle together with its event feed.
    ///
    /// Must be called from within a Tokio runtime.
    fn connect(&self, config: &MqttConfig) -> Result<(Self::Handle, EventReceiver), ClientError>;
}
