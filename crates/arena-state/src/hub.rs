//! Per-user status broadcast.
//!
//! Subsystems publish a [`StatusEvent`] after every committed transition;
//! an external delivery layer subscribes per user. Publishing never blocks
//! and never fails: an event sent with no live subscribers is dropped.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{WorkloadId, WorkloadStatus};

const DEFAULT_CAPACITY: usize = 64;

/// A committed status change, as seen by the owning user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub server_id: WorkloadId,
    pub status: WorkloadStatus,
    pub message: Option<String>,
    pub timestamp: u64,
}

/// Fan-out of status events keyed by user id.
#[derive(Clone)]
pub struct StatusHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<StatusEvent>>>>,
    capacity: usize,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl StatusHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to every event published for `user_id`.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<StatusEvent> {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event to `user_id`'s subscribers.
    ///
    /// Returns the number of receivers the event reached. Channels whose
    /// subscribers have all gone away are pruned.
    pub fn publish(&self, user_id: &str, event: StatusEvent) -> usize {
        let delivered = {
            let channels = self
                .channels
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match channels.get(user_id) {
                Some(sender) => sender.send(event).ok(),
                None => return 0,
            }
        };

        match delivered {
            Some(count) => {
                trace!(user_id, receivers = count, "status event published");
                count
            }
            None => {
                let mut channels = self
                    .channels
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if channels
                    .get(user_id)
                    .is_some_and(|sender| sender.receiver_count() == 0)
                {
                    channels.remove(user_id);
                }
                0
            }
        }
    }

    /// Number of users with an open channel.
    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
