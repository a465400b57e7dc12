//! Change-notification channels consumed by the UI boundary.
//!
//! Broadcast-based so any number of observers (windows, tray, tests) can
//! subscribe independently; the engine never waits on its listeners.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::Job;

/// Default channel capacity for change events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A job-collection change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    Added { job: Job },
    Updated { job: Job },
    Removed { job: Job },
}

impl JobEvent {
    /// The job snapshot carried by the event.
    pub fn job(&self) -> &Job {
        match self {
            Self::Added { job } | Self::Updated { job } | Self::Removed { job } => job,
        }
    }
}

/// A history-view change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HistoryEvent {
    Deleted { id: Uuid },
    Cleared,
}

/// Broadcaster for engine change events.
pub struct EventBroadcaster<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBroadcaster<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Publish an event, returning the number of receivers that saw it.
    /// Zero subscribers is not an error.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBroadcaster<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> Clone for EventBroadcaster<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
