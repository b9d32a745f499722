//! # MQTT Integration Module
//!
//! Shares one broker connection between any number of topic subscriptions and
//! exposes each subscription as its own stream.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── client.rs           - Seam to the MQTT client library (traits + events)
//! ├── mqtt_handler.rs     - rumqttc implementation of the seam
//! ├── connection.rs       - Connection Manager: the single live handle
//! ├── status.rs           - Connection status tracking
//! ├── registry.rs         - Topic Registry: topic -> grant + broadcast stream
//! ├── router.rs           - Inbound event dispatch into the registry
//! ├── stream.rs           - Per-consumer topic streams
//! ├── service.rs          - Subscribe/publish/unsubscribe orchestration
//! ├── message_manager.rs  - Payload decoding and encoding
//! ├── config.rs           - Connection settings
//! └── types.rs / error.rs - Shared value and error types
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! broker ─> client event feed ─> MessageRouter ─> TopicRegistry ─> TopicStream(s)
//! caller ─> MqttService::publish_to ─> OutboundPayload::encode ─> ClientHandle ─> broker
//! caller ─> MqttService::subscribe_to ─> status gate ─> ClientHandle ─> TopicRegistry
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mqttstreams::mqtt::{MqttConfig, MqttService, RumqttConnector, SubscribeOptions, TopicEvent};
//!
//! # async fn run() -> Result<(), mqttstreams::mqtt::MqttError> {
//! let service = MqttService::new(MqttConfig::new("localhost", 1883), RumqttConnector)?;
//! let mut stream = service.subscribe_to("fooBar", SubscribeOptions::default()).await?;
//! while let Some(event) = stream.next().await {
//!     match event? {
//!         TopicEvent::Granted(grant) => println!("subscribed: {}", grant),
//!         TopicEvent::Message(msg) => println!("{}", msg.render()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod registry;
pub mod router;
pub mod service;
pub mod status;
pub mod stream;
pub mod types;


pub use client::{ClientEvent, ClientHandle, Connector, EventReceiver};
pub use config::{MqttConfig, Protocol};
pub use error::{ClientError, MqttError};
pub use message_manager::{InboundMessage, OutboundPayload, Payload};
pub use mqtt_handler::{RumqttConnector, RumqttHandle};
pub use registry::{ResubscribePolicy, TopicRegistry};
pub use service::{IntoTopics, MqttService};
pub use status::{ConnectionStatus, StatusWatch};
pub use stream::{TopicEvent, TopicStream};
pub use types::{PublishOptions, QoS, SubscribeOptions, SubscriptionGrant};
