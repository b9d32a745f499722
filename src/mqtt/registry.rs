//! # Topic Registry
//!
//! Single source of truth for "what is this process subscribed to". Each
//! subscribed topic owns one entry: the broker grant plus a broadcast
//! channel feeding every consumer of that topic.
//!
//! ## Invariants
//!
//! - At most one entry per topic name.
//! - An entry exists exactly while the process believes it holds a broker
//!   subscription for the topic. Subscribe requests still waiting for their
//!   acknowledgement are tracked in a separate in-flight table and never
//!   count as entries.
//! - Removing a topic revokes its in-flight subscribe. A revoked subscribe
//!   that is acknowledged later is refused instead of registered.
//! - The lock guards map operations only and is never held across an await.
//!
//! ## Stream handles
//!
//! Every handed-out stream carries the entry's current [`CancellationToken`].
//! Removing the entry cancels it (all consumers end immediately, buffered
//! messages included), and the [`ResubscribePolicy::Replace`] policy swaps in a
//! fresh token so only the newest joiner keeps receiving.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::ClientError;
use super::message_manager::InboundMessage;
use super::types::SubscriptionGrant;

/// What a repeated subscribe does to consumers already attached to the topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResubscribePolicy {
    /// New caller joins; existing consumers keep receiving
    #[default]
    Share,
    /// Existing consumers are closed before the new caller joins
    Replace,
}

#[derive(Debug)]
struct TopicEntry {
    grant: SubscriptionGrant,
    sender: broadcast::Sender<InboundMessage>,
    handles: CancellationToken,
}

impl TopicEntry {
    fn new(grant: SubscriptionGrant, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            grant,
            sender,
            handles: CancellationToken::new(),
        }
    }

    fn join(&self) -> Membership {
        Membership {
            grant: self.grant.clone(),
            messages: self.sender.subscribe(),
            detached: self.handles.clone(),
        }
    }

    fn close(self) {
        self.handles.cancel();
    }
}

/// Everything a stream needs to follow one topic.
#[derive(Debug)]
pub(crate) struct Membership {
    pub grant: SubscriptionGrant,
    pub messages: broadcast::Receiver<InboundMessage>,
    pub detached: CancellationToken,
}

type Waiter = oneshot::Sender<Result<(), ClientError>>;

pub(crate) enum Claim<'a> {
    /// Topic already subscribed, caller joined it
    Joined(Membership),
    /// Another caller's subscribe is in flight; resolves when it settles
    Pending(oneshot::Receiver<Result<(), ClientError>>),
    /// Caller must issue the broker subscribe
    Owner(InFlight<'a>),
}

#[derive(Debug, Default)]
struct InFlightSlot {
    waiters: Vec<Waiter>,
    revoked: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<String, TopicEntry>,
    in_flight: HashMap<String, InFlightSlot>,
}

#[derive(Debug)]
pub struct TopicRegistry {
    state: Mutex<RegistryState>,
    capacity: usize,
}

impl TopicRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            capacity,
        }
    }

    /// Joins an existing entry, waits on an in-flight subscribe, or makes the
    /// caller responsible for subscribing.
    pub(crate) fn claim(&self, topic: &str, policy: ResubscribePolicy) -> Claim<'_> {
        let mut state = self.state.lock();

        if let Some(entry) = state.entries.get_mut(topic) {
            if policy == ResubscribePolicy::Replace {
                debug!("Closing existing consumers of {}", topic);
                entry.handles.cancel();
                entry.handles = CancellationToken::new();
            }
            trace!("Joining existing subscription to {}", topic);
            return Claim::Joined(entry.join());
        }

        if let Some(slot) = state.in_flight.get_mut(topic) {
            let (tx, rx) = oneshot::channel();
            slot.waiters.push(tx);
            trace!("Waiting on in-flight subscribe to {}", topic);
            return Claim::Pending(rx);
        }

        state.in_flight.insert(topic.to_string(), InFlightSlot::default());
        Claim::Owner(InFlight {
            registry: self,
            topic: topic.to_string(),
            settled: false,
        })
    }

    fn register(&self, topic: &str, grant: SubscriptionGrant) -> Result<Membership, ClientError> {
        let mut state = self.state.lock();
        let slot = state.in_flight.remove(topic).unwrap_or_default();
        if slot.revoked {
            // waiters are dropped and retry against the current state
            debug!("Subscribe to {} was revoked before its acknowledgement", topic);
            return Err(ClientError::Closed);
        }

        let entry = TopicEntry::new(grant, self.capacity);
        let membership = entry.join();
        if let Some(previous) = state.entries.insert(topic.to_string(), entry) {
            previous.close();
        }
        drop(state);

        for waiter in slot.waiters {
            let _ = waiter.send(Ok(()));
        }
        Ok(membership)
    }

    fn release_in_flight(&self, topic: &str, error: Option<ClientError>) {
        let slot = self.state.lock().in_flight.remove(topic).unwrap_or_default();
        // without an error the waiters are dropped, which makes them retry
        if let Some(error) = error {
            for waiter in slot.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Closes the topic's stream, deletes the entry and revokes a subscribe
    /// still in flight for it. Returns false when the topic was unknown.
    pub fn remove(&self, topic: &str) -> bool {
        let (removed, revoked) = {
            let mut state = self.state.lock();
            let revoked = match state.in_flight.get_mut(topic) {
                Some(slot) => {
                    slot.revoked = true;
                    true
                }
                None => false,
            };
            (state.entries.remove(topic), revoked)
        };
        match removed {
            Some(entry) => {
                entry.close();
                debug!("Removed topic {} from registry", topic);
                true
            }
            None => revoked,
        }
    }

    /// Removes every entry and revokes every in-flight subscribe.
    ///
    /// Returns the registered topics followed by the revoked ones, so the
    /// caller can unsubscribe all of them at the broker.
    pub fn remove_all(&self) -> Vec<String> {
        let (drained, mut revoked) = {
            let mut state = self.state.lock();
            let revoked: Vec<String> = state
                .in_flight
                .iter_mut()
                .map(|(topic, slot)| {
                    slot.revoked = true;
                    topic.clone()
                })
                .collect();
            let drained: Vec<(String, TopicEntry)> = state.entries.drain().collect();
            (drained, revoked)
        };

        let mut topics: Vec<String> = drained
            .into_iter()
            .map(|(topic, entry)| {
                entry.close();
                topic
            })
            .collect();
        topics.append(&mut revoked);
        topics
    }

    /// Drops every entry but leaves in-flight subscribes alone. Used when the
    /// broker forgot the session, so the entries no longer hold.
    pub fn clear_entries(&self) -> usize {
        let drained: Vec<TopicEntry> = self.state.lock().entries.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            entry.close();
        }
        count
    }

    /// Pushes a message onto its topic's stream.
    ///
    /// Returns false when the topic is not registered; the message is dropped.
    pub fn deliver(&self, message: InboundMessage) -> bool {
        let state = self.state.lock();
        match state.entries.get(&message.topic) {
            Some(entry) => {
                if entry.sender.send(message).is_err() {
                    trace!("No active consumers, message discarded");
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.state.lock().entries.contains_key(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().entries.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of an in-flight subscribe for one topic.
///
/// Dropping it unsettled (e.g. the subscribing future was cancelled) frees the
/// slot and wakes waiters so one of them takes over.
pub(crate) struct InFlight<'a> {
    registry: &'a TopicRegistry,
    topic: String,
    settled: bool,
}

impl InFlight<'_> {
    /// Registers the entry. Fails with [`ClientError::Closed`] when the topic
    /// was removed while the subscribe was in flight.
    pub fn complete(mut self, grant: SubscriptionGrant) -> Result<Membership, ClientError> {
        self.settled = true;
        self.registry.register(&self.topic, grant)
    }

    pub fn fail(mut self, error: ClientError) {
        self.settled = true;
        self.registry.release_in_flight(&self.topic, Some(error));
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Subscribe to {} abandoned", self.topic);
            self.registry.release_in_flight(&self.topic, None);
        }
    }
}
