//! Connection status tracking.
//!
//! The tracker starts optimistic (`Connected`) and only publishes a value when
//! it differs from the current one, so downstream gating never reacts twice to
//! the same state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => f.write_str("CONNECTED"),
            ConnectionStatus::Disconnected => f.write_str("DISCONNECTED"),
        }
    }
}

#[derive(Debug)]
pub struct StatusTracker {
    // None once released
    sender: Mutex<Option<watch::Sender<ConnectionStatus>>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ConnectionStatus::Connected);
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Records a new status. Returns true when watchers were notified.
    pub fn set(&self, status: ConnectionStatus) -> bool {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            debug!("Status tracker released, ignoring {}", status);
            return false;
        };

        let changed = sender.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            info!("MQTT connection status: {}", status);
        }
        changed
    }

    /// Current status. A released tracker reports `Disconnected`.
    pub fn current(&self) -> ConnectionStatus {
        self.sender
            .lock()
            .as_ref()
            .map(|sender| *sender.borrow())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn watch(&self) -> StatusWatch {
        match self.sender.lock().as_ref() {
            Some(sender) => StatusWatch::new(sender.subscribe()),
            None => StatusWatch::closed(),
        }
    }

    /// Closes the channel; every watcher ends after its pending value.
    pub fn release(&self) {
        if self.sender.lock().take().is_some() {
            debug!("Status tracker released");
        }
    }

    /// Installs a fresh channel after a release. Existing channels are kept.
    pub fn rearm(&self) {
        let mut guard = self.sender.lock();
        if guard.is_none() {
            let (sender, _) = watch::channel(ConnectionStatus::Connected);
            *guard = Some(sender);
            debug!("Status tracker re-armed");
        }
    }
}

/// Observer of the connection status.
///
/// Yields the status current at creation first, then every change.
#[derive(Debug)]
pub struct StatusWatch {
    receiver: watch::Receiver<ConnectionStatus>,
    primed: bool,
}

impl StatusWatch {
    fn new(receiver: watch::Receiver<ConnectionStatus>) -> Self {
        Self {
            receiver,
            primed: false,
        }
    }

    fn closed() -> Self {
        let (sender, receiver) = watch::channel(ConnectionStatus::Disconnected);
        drop(sender);
        Self {
            receiver,
            primed: true,
        }
    }

    pub async fn next(&mut self) -> Option<ConnectionStatus> {
        if !self.primed {
            self.primed = true;
            return Some(*self.receiver.borrow_and_update());
        }
        match self.receiver.changed().await {
            Ok(()) => Some(*self.receiver.borrow_and_update()),
            Err(_) => None,
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.receiver.borrow()
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = ConnectionStatus> {
        futures::stream::unfold(self, |mut watch| async move {
            watch.next().await.map(|status| (status, watch))
        })
    }

    pub(crate) fn receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.receiver.clone()
    }
}
