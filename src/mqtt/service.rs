//! # MQTT Service
//!
//! Public entry point. One service shares a single broker connection between
//! any number of topic streams.
//!
//! ## Subscribing
//!
//! `subscribe_to` turns a request into a [`TopicStream`] whose first item is
//! the [`SubscriptionGrant`]:
//!
//! 1. Disconnected status fails immediately with [`MqttError::NoConnection`];
//!    neither the registry nor the client is touched.
//! 2. A topic already in the registry is joined without a broker call
//!    (the grant is replayed, live messages follow).
//! 3. A subscribe already in flight for the topic is awaited and then joined.
//! 4. Otherwise exactly one broker subscribe is issued. An empty grant list is
//!    answered with a grant built from the request.
//!
//! ## Teardown
//!
//! `end` removes every topic from the registry, unsubscribes them at the
//! broker, releases the status tracker and finally closes the connection.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::{ClientHandle, Connector};
use super::config::MqttConfig;
use super::connection::ConnectionManager;
use super::error::MqttError;
use super::message_manager::OutboundPayload;
use super::registry::{Claim, Membership, TopicRegistry};
use super::router::MessageRouter;
use super::status::{ConnectionStatus, StatusTracker, StatusWatch};
use super::stream::TopicStream;
use super::types::{PublishOptions, SubscribeOptions, SubscriptionGrant};

/// Upper bound for the broker unsubscribes issued during `end`, all together.
const TEARDOWN_UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One topic or many, for `unsubscribe_from`.
pub trait IntoTopics {
    fn into_topics(self) -> Vec<String>;
}

impl IntoTopics for &str {
    fn into_topics(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoTopics for String {
    fn into_topics(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoTopics for Vec<String> {
    fn into_topics(self) -> Vec<String> {
        self
    }
}

impl IntoTopics for &[String] {
    fn into_topics(self) -> Vec<String> {
        self.to_vec()
    }
}

impl IntoTopics for &[&str] {
    fn into_topics(self) -> Vec<String> {
        self.iter().map(|t| t.to_string()).collect()
    }
}

impl<const N: usize> IntoTopics for [&str; N] {
    fn into_topics(self) -> Vec<String> {
        self.iter().map(|t| t.to_string()).collect()
    }
}

struct Shared<C: Connector> {
    config: parking_lot::RwLock<MqttConfig>,
    registry: Arc<TopicRegistry>,
    status: Arc<StatusTracker>,
    connection: ConnectionManager<C>,
}

pub struct MqttService<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for MqttService<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> MqttService<C> {
    /// Builds the service and connects right away unless the config asks for
    /// manual connection management.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: MqttConfig, connector: C) -> Result<Self, MqttError> {
        let shared = Shared {
            registry: Arc::new(TopicRegistry::new(config.topic_capacity)),
            status: Arc::new(StatusTracker::new()),
            connection: ConnectionManager::new(connector),
            config: parking_lot::RwLock::new(config),
        };
        let service = Self {
            shared: Arc::new(shared),
        };

        let config = service.config();
        if config.manage_connection_manually {
            info!("Manual connection management, waiting for connect()");
        } else {
            service
                .shared
                .connection
                .open(&config, service.router())
                .map_err(MqttError::Connect)?;
        }
        Ok(service)
    }

    fn router(&self) -> MessageRouter {
        let clean_session = self.shared.config.read().clean_session;
        MessageRouter::new(self.shared.registry.clone(), self.shared.status.clone())
            .clean_session(clean_session)
    }

    fn stream(&self, membership: Membership) -> TopicStream {
        TopicStream::new(membership, self.shared.status.watch().receiver())
    }

    pub fn config(&self) -> MqttConfig {
        self.shared.config.read().clone()
    }

    /// Replaces the live connection (force-closing it) with one built from
    /// `config`.
    ///
    /// In-flight operations of the old connection fail; registered topics are
    /// kept but the new connection is not subscribed to them.
    pub async fn connect(&self, config: MqttConfig) -> Result<(), MqttError> {
        self.shared.status.rearm();
        *self.shared.config.write() = config.clone();
        self.shared
            .connection
            .connect(&config, self.router())
            .await
            .map_err(MqttError::Connect)
    }

    pub async fn subscribe_to(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<TopicStream, MqttError> {
        let policy = self.shared.config.read().resubscribe_policy;

        loop {
            if self.shared.status.current() == ConnectionStatus::Disconnected {
                warn!("Cannot subscribe to {} while disconnected", topic);
                return Err(MqttError::NoConnection);
            }

            match self.shared.registry.claim(topic, policy) {
                Claim::Joined(membership) => {
                    debug!("Already subscribed to {}, joining", topic);
                    return Ok(self.stream(membership));
                }
                Claim::Pending(settled) => match settled.await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => return Err(MqttError::Subscribe(e)),
                    // owner gave up, take another turn
                    Err(_) => continue,
                },
                Claim::Owner(in_flight) => {
                    let handle = self
                        .shared
                        .connection
                        .handle()
                        .ok_or(MqttError::NotConnected)?;

                    debug!("Subscribing to {}", topic);
                    match handle.subscribe(topic, options).await {
                        Ok(grants) => {
                            let grant = grants.into_iter().next().unwrap_or_else(|| {
                                debug!("Empty grant list for {}, using requested QoS", topic);
                                SubscriptionGrant::new(topic, options.requested_qos())
                            });
                            return match in_flight.complete(grant.clone()) {
                                Ok(membership) => {
                                    info!("Subscribed to {}", grant);
                                    Ok(self.stream(membership))
                                }
                                Err(e) => {
                                    warn!("Subscription to {} was removed while in flight", topic);
                                    Err(MqttError::Subscribe(e))
                                }
                            };
                        }
                        Err(e) => {
                            warn!("Subscribe to {} failed: {}", topic, e);
                            in_flight.fail(e.clone());
                            return Err(MqttError::Subscribe(e));
                        }
                    }
                }
            }
        }
    }

    /// Removes the topics from the registry (closing their streams and
    /// revoking subscribes still in flight), then unsubscribes each of them at
    /// the broker.
    ///
    /// Every topic is attempted; the first broker error is returned.
    pub async fn unsubscribe_from(&self, topics: impl IntoTopics) -> Result<(), MqttError> {
        let topics = topics.into_topics();
        for topic in &topics {
            self.shared.registry.remove(topic);
        }

        let handle = self
            .shared
            .connection
            .handle()
            .ok_or(MqttError::NotConnected)?;

        let mut first_error = None;
        for topic in &topics {
            match handle.unsubscribe(topic).await {
                Ok(()) => info!("Unsubscribed from {}", topic),
                Err(e) => {
                    warn!("Unsubscribe from {} failed: {}", topic, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(MqttError::Unsubscribe(e)),
            None => Ok(()),
        }
    }

    /// Encodes `message` by content type and publishes it.
    ///
    /// Resolves once the broker acknowledged the publish (QoS 0: once
    /// written). Failures are reported once and not retried.
    pub async fn publish_to(
        &self,
        topic: &str,
        message: impl Into<OutboundPayload>,
        options: PublishOptions,
    ) -> Result<(), MqttError> {
        let payload = message.into().into_bytes()?;
        let handle = self
            .shared
            .connection
            .handle()
            .ok_or(MqttError::NotConnected)?;

        debug!("Publishing {} bytes to {}", payload.len(), topic);
        handle
            .publish(topic, payload, options)
            .await
            .map_err(|e| {
                warn!("Publish to {} failed: {}", topic, e);
                MqttError::Publish(e)
            })
    }

    /// Serializes `value` and publishes it like [`publish_to`](Self::publish_to).
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<(), MqttError> {
        let payload = OutboundPayload::json(value)?;
        self.publish_to(topic, payload, options).await
    }

    /// Observer of the connection status; yields the current value first and
    /// then only changes.
    pub fn status(&self) -> StatusWatch {
        self.shared.status.watch()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.shared.status.current()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.shared.registry.topics()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.shared.registry.contains(topic)
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .connection
            .handle()
            .map(|handle| handle.is_connected())
            .unwrap_or(false)
    }

    /// Unsubscribes every registered topic, releases the status tracker and
    /// closes the connection.
    pub async fn end(&self, force: bool) -> Result<(), MqttError> {
        let topics = self.shared.registry.remove_all();
        info!("Ending MQTT service, unsubscribing {} topics", topics.len());

        if let Some(handle) = self.shared.connection.handle() {
            let requests = topics.iter().map(|topic| {
                let handle = handle.clone();
                async move { (topic, handle.unsubscribe(topic).await) }
            });
            match tokio::time::timeout(TEARDOWN_UNSUBSCRIBE_TIMEOUT, join_all(requests)).await {
                Ok(results) => {
                    for (topic, result) in results {
                        match result {
                            Ok(()) => debug!("Unsubscribed from {}", topic),
                            Err(e) => {
                                warn!("Unsubscribe from {} failed during shutdown: {}", topic, e)
                            }
                        }
                    }
                }
                Err(_) => warn!("Unsubscribing {} topics timed out during shutdown", topics.len()),
            }
        }

        self.shared.status.release();
        self.shared
            .connection
            .close(force)
            .await
            .map_err(MqttError::Close)?;
        Ok(())
    }

    /// Like [`end`](Self::end), invoking `callback` once closing completed.
    pub async fn end_with_callback<F>(&self, force: bool, callback: F) -> Result<(), MqttError>
    where
        F: FnOnce() + Send,
    {
        let result = self.end(force).await;
        callback();
        result
    }
}
