//! Event notifier for record changes and sync results.
//!
//! Publishing never blocks. A subscriber that falls behind loses the oldest
//! events it hasn't read yet; [`Subscription::missed`] counts them.

use crate::outcome::SyncOutcome;
use crate::types::RecordId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::trace;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Where a record change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// A write made on this device.
    Local,
    /// A remote record applied by a sync pass.
    Remote,
}

/// An event published by the store or the sync manager.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A record was written.
    RecordChanged {
        /// Collection of the record.
        collection: String,
        /// The record's id.
        id: RecordId,
        /// Where the write came from.
        origin: ChangeOrigin,
    },
    /// A pass finished.
    SyncCompleted(Arc<SyncOutcome>),
    /// A pass failed as a whole.
    SyncFailed {
        /// Collection being synced.
        collection: String,
        /// Pass number.
        pass: u64,
        /// Human-readable cause.
        reason: String,
        /// True if the failure won't be retried automatically.
        fatal: bool,
        /// Delay before the automatic retry, if one is scheduled.
        retry_in: Option<Duration>,
    },
}

impl SyncEvent {
    /// Returns the collection the event concerns.
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::RecordChanged { collection, .. } | Self::SyncFailed { collection, .. } => {
                collection
            }
            Self::SyncCompleted(outcome) => &outcome.collection,
        }
    }
}

/// Fans events out to any number of subscribers.
///
/// Cloning yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventNotifier {
    /// Creates a notifier with the default per-subscriber buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a notifier buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to every current subscriber.
    ///
    /// Returns the number of subscribers that will see it.
    pub fn publish(&self, event: SyncEvent) -> usize {
        // An error only means nobody is listening.
        let delivered = self.sender.send(event).unwrap_or(0);
        trace!(delivered, "published event");
        delivered
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle receiving events in publish order.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<SyncEvent>,
    missed: u64,
}

impl Subscription {
    /// Waits for the next event.
    ///
    /// Returns `None` once every notifier handle has been dropped and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.missed += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.missed += n,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Number of events this subscriber lost by falling behind.
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
