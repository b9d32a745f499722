//! Message Router
//!
//! One router task runs per physical connection. It drains the client's event
//! feed in order, so per-topic delivery order matches broker order.
//!
//! With a clean session the broker forgets every subscription when the
//! connection drops. The router then clears the registry on `Offline`, so a
//! later `subscribe_to` issues a fresh broker subscribe instead of joining a
//! stale entry.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::client::{ClientEvent, EventReceiver};
use super::message_manager::InboundMessage;
use super::registry::TopicRegistry;
use super::status::{ConnectionStatus, StatusTracker};

pub struct MessageRouter {
    registry: Arc<TopicRegistry>,
    status: Arc<StatusTracker>,
    clean_session: bool,
}

impl MessageRouter {
    pub fn new(registry: Arc<TopicRegistry>, status: Arc<StatusTracker>) -> Self {
        Self {
            registry,
            status,
            clean_session: false,
        }
    }

    /// Clear registry entries whenever the connection is lost.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Handles a single event. Returns true when an inbound message reached a
    /// registered topic.
    pub fn route(&self, event: ClientEvent) -> bool {
        match event {
            ClientEvent::Message { topic, payload } => {
                let message = InboundMessage::from_raw(topic, &payload);
                let topic = message.topic.clone();
                if self.registry.deliver(message) {
                    trace!("Routed message on {}", topic);
                    true
                } else {
                    debug!("Dropping message for untracked topic {}", topic);
                    false
                }
            }
            ClientEvent::Connect => {
                self.status.set(ConnectionStatus::Connected);
                false
            }
            ClientEvent::Offline => {
                self.status.set(ConnectionStatus::Disconnected);
                if self.clean_session {
                    let cleared = self.registry.clear_entries();
                    if cleared > 0 {
                        info!("Session lost, dropped {} subscriptions", cleared);
                    }
                }
                false
            }
        }
    }

    pub fn spawn(self, mut events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.route(event);
            }
            info!("Client event feed closed, router stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::registry::{Claim, ResubscribePolicy};
    use crate::mqtt::types::{QoS, SubscriptionGrant};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn router() -> (MessageRouter, Arc<TopicRegistry>, Arc<StatusTracker>) {
        let registry = Arc::new(TopicRegistry::new(8));
        let status = Arc::new(StatusTracker::new());
        (
            MessageRouter::new(registry.clone(), status.clone()),
            registry,
            status,
        )
    }

    #[tokio::test]
    async fn routes_decoded_message_to_topic() {
        let (router, registry, _) = router();
        let mut membership = match registry.claim("fooBar", ResubscribePolicy::Share) {
            Claim::Owner(in_flight) => in_flight
                .complete(SubscriptionGrant::new("fooBar", QoS::AtMostOnce))
                .unwrap(),
            _ => panic!("expected owner"),
        };

        assert!(router.route(ClientEvent::Message {
            topic: "fooBar".into(),
            payload: br#"{"bar":"foo"}"#.to_vec(),
        }));
        let message = membership.messages.recv().await.unwrap();
        assert_eq!(message.payload.as_json(), Some(&json!({"bar": "foo"})));
    }

    #[test]
    fn drops_untracked_topic() {
        let (router, _, _) = router();
        assert!(!router.route(ClientEvent::Message {
            topic: "unknown".into(),
            payload: b"x".to_vec(),
        }));
    }

    #[test]
    fn connection_events_update_status() {
        let (router, _, status) = router();
        router.route(ClientEvent::Offline);
        assert_eq!(status.current(), ConnectionStatus::Disconnected);
        router.route(ClientEvent::Connect);
        assert_eq!(status.current(), ConnectionStatus::Connected);
    }

    fn subscribed(registry: &TopicRegistry, topic: &str) {
        match registry.claim(topic, ResubscribePolicy::Share) {
            Claim::Owner(in_flight) => {
                in_flight
                    .complete(SubscriptionGrant::new(topic, QoS::AtMostOnce))
                    .unwrap();
            }
            _ => panic!("expected owner"),
        }
    }

    #[test]
    fn clean_session_offline_clears_entries() {
        let (router, registry, _) = router();
        let router = router.clean_session(true);
        subscribed(&registry, "fooBar");

        router.route(ClientEvent::Offline);
        assert!(registry.is_empty());
    }

    #[test]
    fn persistent_session_keeps_entries() {
        let (router, registry, _) = router();
        subscribed(&registry, "fooBar");

        router.route(ClientEvent::Offline);
        router.route(ClientEvent::Connect);
        assert!(registry.contains("fooBar"));
    }

    #[tokio::test]
    async fn task_stops_when_feed_closes() {
        let (router, _, status) = router();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = router.spawn(rx);
        tx.send(ClientEvent::Offline).unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(status.current(), ConnectionStatus::Disconnected);
    }
}
