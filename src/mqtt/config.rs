//! Broker connection settings.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::registry::ResubscribePolicy;

/// Transport used to reach the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Mqtt,
    Mqtts,
    Ws,
    Wss,
}

impl Protocol {
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Mqtt => 1883,
            Protocol::Mqtts => 8883,
            Protocol::Ws => 80,
            Protocol::Wss => 443,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Mqtts => "mqtts",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        };
        f.write_str(scheme)
    }
}

/// Everything needed to open (and reopen) the broker connection.
///
/// Deserialized from the `[mqtt]` table of the application config. Missing
/// keys fall back to [`MqttConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub protocol: Protocol,
    pub port: u16,
    /// Request path, only used by websocket transports
    pub path: String,
    /// Keep-alive interval in seconds
    pub keepalive: u64,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    /// When true the service does not connect on construction
    pub manage_connection_manually: bool,
    /// Capacity of the request queue towards the client event loop
    pub request_capacity: usize,
    /// Per-topic broadcast buffer; slower consumers skip overflowed messages
    pub topic_capacity: usize,
    pub reconnect_delay_ms: u64,
    pub resubscribe_policy: ResubscribePolicy,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            protocol: Protocol::Mqtt,
            port: Protocol::Mqtt.default_port(),
            path: "/mqtt".to_string(),
            keepalive: 60,
            client_id: None,
            username: None,
            password: None,
            clean_session: true,
            manage_connection_manually: false,
            request_capacity: 100,
            topic_capacity: 256,
            reconnect_delay_ms: 3000,
            resubscribe_policy: ResubscribePolicy::default(),
        }
    }
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Broker address in URL form, e.g. `ws://broker.hivemq.com:8000/mqtt`.
    pub fn broker_url(&self) -> String {
        if self.protocol.is_websocket() {
            let path = if self.path.starts_with('/') {
                self.path.clone()
            } else {
                format!("/{}", self.path)
            };
            format!("{}://{}:{}{}", self.protocol, self.host, self.port, path)
        } else {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        }
    }

    /// Configured client id, or a generated one unique per process start.
    pub fn client_id(&self) -> String {
        match &self.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!(
                "mqttstreams-{}-{}",
                std::process::id(),
                Local::now().timestamp_millis()
            ),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_includes_path() {
        let config = MqttConfig {
            host: "broker.hivemq.com".into(),
            protocol: Protocol::Ws,
            port: 8000,
            path: "mqtt".into(),
            keepalive: 5,
            ..Default::default()
        };
        assert_eq!(config.broker_url(), "ws://broker.hivemq.com:8000/mqtt");
        assert_eq!(config.keep_alive(), Duration::from_secs(5));
    }

    #[test]
    fn tcp_url_ignores_path() {
        let config = MqttConfig::new("localhost", 1883);
        assert_eq!(config.broker_url(), "mqtt://localhost:1883");
    }

    #[test]
    fn generated_client_id_when_missing() {
        let mut config = MqttConfig::default();
        assert!(config.client_id().starts_with("mqttstreams-"));
        config.client_id = Some("fixed".into());
        assert_eq!(config.client_id(), "fixed");
    }
}
