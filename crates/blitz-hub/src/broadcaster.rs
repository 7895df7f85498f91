use crate::registry::{ClientRegistry, DeliveryReport};
use blitz_core::{FeedMessage, FeedType};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

const FEED_COUNT: usize = FeedType::ALL.len();


/// Fans feed messages out to every registered consumer. Each feed has its
/// own cursor lock, held across the fan-out, so one feed is seen in the
/// same order everywhere while different feeds never wait on each other.
pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
    cursors: [Mutex<u64>; FEED_COUNT],
}

impl Broadcaster {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            cursors: std::array::from_fn(|_| Mutex::new(0)),
        }
    }

    pub fn publish(&self, feed_type: FeedType, data: Value) -> DeliveryReport {
        self.publish_message(FeedMessage::new(feed_type, data))
    }

    pub fn publish_message(&self, message: FeedMessage) -> DeliveryReport {
        let feed_type = message.feed_type;
        let mut cursor = self.cursors[slot(feed_type)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cursor += 1;
        let seq = *cursor;
        let degraded = message.is_degraded();
        let message = Arc::new(message.with_seq(seq));
        let report = self
            .registry
            .for_each(|entry| entry.transport().deliver(Arc::clone(&message)));
        debug!(
            event = "feed_published",
            feed = %feed_type,
            seq = seq,
            degraded = degraded,
            delivered = report.delivered,
            dropped = report.dropped,
        );
        report
    }

    /// Seq of the last message published on `feed_type`, 0 before the first.
    pub fn last_seq(&self, feed_type: FeedType) -> u64 {
        *self.cursors[slot(feed_type)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn slot(feed_type: FeedType) -> usize {
    feed_type as usize
}
