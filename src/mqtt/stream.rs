//! Per-consumer view of one topic subscription.

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::MqttError;
use super::message_manager::InboundMessage;
use super::registry::Membership;
use super::status::ConnectionStatus;
use super::types::SubscriptionGrant;

/// Item yielded by a [`TopicStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    /// Always the first item, confirms the subscription
    Granted(SubscriptionGrant),
    Message(InboundMessage),
}

impl TopicEvent {
    pub fn into_message(self) -> Option<InboundMessage> {
        match self {
            TopicEvent::Message(message) => Some(message),
            TopicEvent::Granted(_) => None,
        }
    }
}

/// Stream of one topic: the grant first, then every message that arrives
/// while the consumer is attached.
///
/// The stream ends when the topic is unsubscribed, the service shuts down, or
/// a later subscriber replaces this one. Losing the connection ends it with a
/// final `Err(MqttError::NoConnection)`. Dropping the stream only detaches this
/// consumer; the broker subscription stays until `unsubscribe_from`.
#[derive(Debug)]
pub struct TopicStream {
    grant: SubscriptionGrant,
    grant_pending: bool,
    messages: broadcast::Receiver<InboundMessage>,
    detached: CancellationToken,
    status: Option<watch::Receiver<ConnectionStatus>>,
    finished: bool,
}

impl TopicStream {
    pub(crate) fn new(membership: Membership, status: watch::Receiver<ConnectionStatus>) -> Self {
        Self {
            grant: membership.grant,
            grant_pending: true,
            messages: membership.messages,
            detached: membership.detached,
            status: Some(status),
            finished: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.grant.topic
    }

    pub fn grant(&self) -> &SubscriptionGrant {
        &self.grant
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next(&mut self) -> Option<Result<TopicEvent, MqttError>> {
        if self.finished {
            return None;
        }
        if self.grant_pending {
            self.grant_pending = false;
            return Some(Ok(TopicEvent::Granted(self.grant.clone())));
        }

        loop {
            tokio::select! {
                biased;

                lost = connection_lost(&mut self.status) => {
                    if lost {
                        debug!("Connection lost, ending stream for {}", self.grant.topic);
                        self.finished = true;
                        return Some(Err(MqttError::NoConnection));
                    }
                    // tracker released; the registry closes the stream on shutdown
                    self.status = None;
                }

                _ = self.detached.cancelled() => {
                    debug!("Stream for {} closed", self.grant.topic);
                    self.finished = true;
                    return None;
                }

                received = self.messages.recv() => match received {
                    Ok(message) => return Some(Ok(TopicEvent::Message(message))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Consumer of {} lagged, skipped {} messages", self.grant.topic, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.finished = true;
                        return None;
                    }
                },
            }
        }
    }

    /// Waits for the next message, skipping the grant.
    pub async fn next_message(&mut self) -> Option<Result<InboundMessage, MqttError>> {
        loop {
            match self.next().await? {
                Ok(TopicEvent::Granted(_)) => continue,
                Ok(TopicEvent::Message(message)) => return Some(Ok(message)),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = Result<TopicEvent, MqttError>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}

/// Resolves with true on a transition to `Disconnected`, false when the status
/// channel closes. Never resolves without a receiver.
async fn connection_lost(status: &mut Option<watch::Receiver<ConnectionStatus>>) -> bool {
    let Some(receiver) = status.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.changed().await {
            Ok(()) => {
                if *receiver.borrow_and_update() == ConnectionStatus::Disconnected {
                    return true;
                }
            }
            Err(_) => return false,
        }
    }
}
