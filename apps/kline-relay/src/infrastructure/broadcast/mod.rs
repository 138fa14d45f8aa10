//! Per-Symbol Broadcast Topics
//!
//! Fans reconciled kline events out to any number of downstream consumers
//! using tokio broadcast channels, one topic per symbol.
//!
//! # Architecture
//!
//! The streaming service enqueues into a single bounded `mpsc` queue.
//! [`TopicHub::run_publisher`] drains that queue and publishes every event on
//! its symbol's topic. Topics are created lazily, either by the first
//! subscriber or by the first event, so subscribers may attach before any
//! data has arrived.
//!
//! Slow subscribers are not allowed to stall the queue: a receiver that
//! falls more than `capacity` events behind observes `RecvError::Lagged` and
//! skips ahead.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{KlineEvent, Symbol};
use crate::infrastructure::metrics;

// =============================================================================
// Topic Hub
// =============================================================================

/// Registry of per-symbol broadcast topics.
#[derive(Debug)]
pub struct TopicHub {
    capacity: usize,
    topics: RwLock<HashMap<Symbol, broadcast::Sender<KlineEvent>>>,
}

/// Shared topic hub reference.
pub type SharedTopicHub = Arc<TopicHub>;

impl TopicHub {
    /// Create a hub whose topics buffer up to `capacity` events each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Per-topic buffer size.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender(&self, symbol: &Symbol) -> broadcast::Sender<KlineEvent> {
        if let Some(tx) = self.topics.read().get(symbol) {
            return tx.clone();
        }
        self.topics
            .write()
            .entry(symbol.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to a symbol's topic, creating it if needed.
    #[must_use]
    pub fn subscribe(&self, symbol: &Symbol) -> broadcast::Receiver<KlineEvent> {
        self.sender(symbol).subscribe()
    }

    /// Publish one event on its symbol's topic.
    ///
    /// Returns the number of receivers that got it; zero when nobody is
    /// listening.
    pub fn publish(&self, event: KlineEvent) -> usize {
        self.sender(&event.symbol).send(event).unwrap_or(0)
    }

    /// Active receivers on one topic.
    #[must_use]
    pub fn receiver_count(&self, symbol: &Symbol) -> usize {
        self.topics
            .read()
            .get(symbol)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Snapshot of topic statistics.
    #[must_use]
    pub fn stats(&self) -> TopicStats {
        let topics = self.topics.read();
        TopicStats {
            topics: topics.len(),
            receivers: topics.values().map(broadcast::Sender::receiver_count).sum(),
        }
    }

    /// Drain `queue` into the topics until it closes or `cancel` fires.
    ///
    /// Returns the number of events published. Events already queued when
    /// cancellation fires are left in the queue.
    pub async fn run_publisher(
        &self,
        mut queue: mpsc::Receiver<KlineEvent>,
        cancel: CancellationToken,
    ) -> u64 {
        info!(capacity = self.capacity, "Publisher started");
        let mut published = 0_u64;
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = queue.recv() => event,
            };
            let Some(event) = event else {
                debug!("Event queue closed");
                break;
            };
            let delivered = self.publish(event);
            published += 1;
            metrics::record_events_published(u64::try_from(delivered).unwrap_or(u64::MAX));
        }
        info!(published, "Publisher stopped");
        published
    }
}

/// Statistics about broadcast topics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStats {
    /// Topics created so far.
    pub topics: usize,
    /// Receivers across all topics.
    pub receivers: usize,
}

// =============================================================================
// Tests
// =============================================================================
