use crate::registry::{Transport, TransportError};
use blitz_core::FeedMessage;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

struct Queue {
    messages: VecDeque<Arc<FeedMessage>>,
    waiting_since: Option<Instant>,
}

/// Bounded per-consumer queue between the broadcaster and one response
/// stream. A full queue drops its oldest message of the incoming feed type
/// (or the oldest message overall) instead of blocking the publisher.
pub struct Outbox {
    capacity: usize,
    queue: Mutex<Queue>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: Mutex::new(Queue {
                messages: VecDeque::with_capacity(capacity),
                waiting_since: None,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, message: Arc<FeedMessage>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.messages.len() >= self.capacity {
                let victim = queue
                    .messages
                    .iter()
                    .position(|queued| queued.feed_type == message.feed_type)
                    .unwrap_or(0);
                queue.messages.remove(victim);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            if queue.messages.is_empty() {
                queue.waiting_since = Some(Instant::now());
            }
            queue.messages.push_back(message);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<Arc<FeedMessage>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let message = queue.messages.pop_front()?;
        queue.waiting_since = if queue.messages.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        Some(message)
    }

    /// Waits for the next message. Returns `None` once the outbox is closed.
    pub async fn recv(&self) -> Option<Arc<FeedMessage>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .messages
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for Outbox {
    fn deliver(&self, message: Arc<FeedMessage>) -> Result<(), TransportError> {
        self.push(message)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pending(&self) -> usize {
        self.len()
    }

    fn idle_for(&self) -> Duration {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting_since
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blitz_core::FeedType;

    fn msg(feed: FeedType, n: u64) -> Arc<FeedMessage> {
        Arc::new(FeedMessage::new(feed, serde_json::json!({ "n": n })).with_seq(n))
    }

    #[test]
    fn full_queue_drops_oldest_of_same_feed() {
        let outbox = Outbox::new(3);
        outbox.push(msg(FeedType::NodeInfo, 1)).expect("push");
        outbox.push(msg(FeedType::HardwareInfo, 1)).expect("push");
        outbox.push(msg(FeedType::HardwareInfo, 2)).expect("push");
        outbox.push(msg(FeedType::HardwareInfo, 3)).expect("push");

        let drained = std::iter::from_fn(|| outbox.try_pop())
            .map(|m| (m.feed_type, m.seq))
            .collect::<Vec<_>>();
        assert_eq!(
            drained,
            vec![
                (FeedType::NodeInfo, Some(1)),
                (FeedType::HardwareInfo, Some(2)),
                (FeedType::HardwareInfo, Some(3)),
            ]
        );
        assert_eq!(outbox.dropped(), 1);
    }

    #[test]
    fn full_queue_without_same_feed_drops_oldest_overall() {
        let outbox = Outbox::new(2);
        outbox.push(msg(FeedType::NodeInfo, 1)).expect("push");
        outbox.push(msg(FeedType::SystemInfo, 1)).expect("push");
        outbox.push(msg(FeedType::WalletBalance, 1)).expect("push");

        let feeds = std::iter::from_fn(|| outbox.try_pop())
            .map(|m| m.feed_type)
            .collect::<Vec<_>>();
        assert_eq!(feeds, vec![FeedType::SystemInfo, FeedType::WalletBalance]);
    }

    #[test]
    fn closed_outbox_rejects_delivery() {
        let outbox = Outbox::new(4);
        outbox.close();
        assert_eq!(
            outbox.deliver(msg(FeedType::NodeInfo, 1)),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn idle_time_counts_only_while_messages_wait() {
        let outbox = Outbox::new(4);
        assert_eq!(outbox.idle_for(), Duration::ZERO);
        outbox.push(msg(FeedType::NodeInfo, 1)).expect("push");
        std::thread::sleep(Duration::from_millis(5));
        assert!(outbox.idle_for() >= Duration::from_millis(5));
        outbox.try_pop();
        assert_eq!(outbox.idle_for(), Duration::ZERO);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_and_ends_on_close() {
        let outbox = Arc::new(Outbox::new(4));
        let reader = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(message) = outbox.recv().await {
                    seen.push(message.seq);
                }
                seen
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.push(msg(FeedType::NodeInfo, 1)).expect("push");
        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.close();

        let seen = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader finished")
            .expect("join");
        assert_eq!(seen, vec![Some(1)]);
    }
}
