//! Error types for the MQTT service and the client seam beneath it

use thiserror::Error;

/// Failure reported by the underlying MQTT client.
///
/// Cloneable so a single broker answer can be handed to every caller waiting
/// on the same request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The broker answered the request with a failure
    #[error("Broker rejected request: {0}")]
    Rejected(String),

    /// The connection that carried the request was closed or replaced
    #[error("Connection closed before the request completed")]
    Closed,

    /// Request could not be handed to the network layer
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection options could not be built from the configuration
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl From<rumqttc::ClientError> for ClientError {
    fn from(e: rumqttc::ClientError) -> Self {
        ClientError::Transport(e.to_string())
    }
}

/// Errors surfaced by [`MqttService`](super::service::MqttService) operations.
#[derive(Debug, Error)]
pub enum MqttError {
    /// Subscribe attempted while the connection status is `Disconnected`
    #[error("No connection with MQTT.")]
    NoConnection,

    /// No client handle exists yet (manual connection management, `connect` not called)
    #[error("MQTT client not connected, call connect first")]
    NotConnected,

    #[error("Failed to connect: {0}")]
    Connect(#[source] ClientError),

    #[error("Subscribe failed: {0}")]
    Subscribe(#[source] ClientError),

    #[error("Unsubscribe failed: {0}")]
    Unsubscribe(#[source] ClientError),

    #[error("Publish failed: {0}")]
    Publish(#[source] ClientError),

    #[error("Failed to close connection: {0}")]
    Close(#[source] ClientError),

    /// Outgoing payload could not be serialized
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl MqttError {
    /// The client error carried by a broker operation failure, if any.
    pub fn client_error(&self) -> Option<&ClientError> {
        match self {
            MqttError::Connect(e)
            | MqttError::Subscribe(e)
            | MqttError::Unsubscribe(e)
            | MqttError::Publish(e)
            | MqttError::Close(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_connection_message() {
        assert_eq!(MqttError::NoConnection.to_string(), "No connection with MQTT.");
    }

    #[test]
    fn broker_errors_keep_the_client_error() {
        let err = MqttError::Subscribe(ClientError::Rejected("subscription error".into()));
        assert_eq!(
            err.client_error(),
            Some(&ClientError::Rejected("subscription error".into()))
        );
        assert!(err.to_string().contains("subscription error"));
        assert!(MqttError::NotConnected.client_error().is_none());
    }
}
