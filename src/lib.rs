//! # mqttstreams
//!
//! Topic-multiplexed MQTT subscriptions as async streams. A single broker
//! connection is shared by every subscription; each subscription is an
//! independent stream that starts with the broker's grant.
//!
//! - `mqtt`: connection, subscription lifecycle, routing and payload handling
//! - `config`: application configuration stored as TOML

pub mod config;
pub mod mqtt;
