use crate::broadcaster::Broadcaster;
use crate::registry::DeliveryReport;
use async_trait::async_trait;
use blitz_core::{FeedMessage, FeedType};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Upstream value source for one feed (node RPC, sensors, wallet query).
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn feed_type(&self) -> FeedType;
    async fn fetch(&self) -> Result<Value, ProducerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Published(DeliveryReport),
    Degraded(DeliveryReport),
    Coalesced,
}

pub struct FeedProducer {
    source: Arc<dyn FeedSource>,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    fetch_timeout: Duration,
    in_flight: AtomicBool,
    rerun: AtomicBool,
}

impl FeedProducer {
    pub fn new(
        source: Arc<dyn FeedSource>,
        broadcaster: Arc<Broadcaster>,
        interval: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            broadcaster,
            interval,
            fetch_timeout,
            in_flight: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        }
    }

    pub fn feed_type(&self) -> FeedType {
        self.source.feed_type()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fetches and publishes one snapshot. A call that lands while another
    /// run is in flight does not overlap it: it asks the running call to go
    /// once more and returns `Coalesced`.
    pub async fn run_once(&self) -> PollOutcome {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.rerun.store(true, Ordering::SeqCst);
            return PollOutcome::Coalesced;
        }
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            let outcome = self.produce().await;
            if self.rerun.swap(false, Ordering::SeqCst) {
                continue;
            }
            self.in_flight.store(false, Ordering::SeqCst);
            // A request may have arrived between the swap and the release.
            if self.rerun.load(Ordering::SeqCst) && !self.in_flight.swap(true, Ordering::SeqCst) {
                continue;
            }
            return outcome;
        }
    }

    async fn produce(&self) -> PollOutcome {
        let feed_type = self.feed_type();
        match tokio::time::timeout(self.fetch_timeout, self.source.fetch()).await {
            Ok(Ok(data)) => PollOutcome::Published(self.broadcaster.publish(feed_type, data)),
            Ok(Err(err)) => {
                warn!(event = "feed_source_error", feed = %feed_type, error = %err);
                let message = FeedMessage::degraded(feed_type, "source_error", err.to_string());
                PollOutcome::Degraded(self.broadcaster.publish_message(message))
            }
            Err(_) => {
                warn!(
                    event = "feed_source_timeout",
                    feed = %feed_type,
                    timeout_ms = self.fetch_timeout.as_millis() as u64
                );
                let message = FeedMessage::degraded(
                    feed_type,
                    "source_timeout",
                    format!("no answer within {}ms", self.fetch_timeout.as_millis()),
                );
                PollOutcome::Degraded(self.broadcaster.publish_message(message))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedIntervals {
    pub node_info: Duration,
    pub lightning_info: Duration,
    pub app_status: Duration,
    pub system_info: Duration,
    pub hardware_info: Duration,
    pub wallet_balance: Duration,
    pub startup_info: Duration,
}

impl Default for FeedIntervals {
    fn default() -> Self {
        Self {
            node_info: Duration::from_secs(5),
            lightning_info: Duration::from_secs(5),
            app_status: Duration::from_secs(30),
            system_info: Duration::from_secs(10),
            hardware_info: Duration::from_secs(2),
            wallet_balance: Duration::from_secs(5),
            startup_info: Duration::from_secs(10),
        }
    }
}

impl FeedIntervals {
    pub fn for_feed(&self, feed_type: FeedType) -> Duration {
        match feed_type {
            FeedType::NodeInfo => self.node_info,
            FeedType::LightningInfoLite => self.lightning_info,
            FeedType::InstalledAppStatus => self.app_status,
            FeedType::SystemInfo => self.system_info,
            FeedType::HardwareInfo => self.hardware_info,
            FeedType::WalletBalance => self.wallet_balance,
            FeedType::SystemStartupInfo => self.startup_info,
        }
    }
}

/// Runs every producer on its own timer, once per tick regardless of how
/// many consumers are connected.
pub struct FeedScheduler {
    producers: BTreeMap<FeedType, Arc<FeedProducer>>,
}

impl FeedScheduler {
    pub fn new(producers: impl IntoIterator<Item = Arc<FeedProducer>>) -> Self {
        Self {
            producers: producers
                .into_iter()
                .map(|producer| (producer.feed_type(), producer))
                .collect(),
        }
    }

    pub fn feeds(&self) -> Vec<FeedType> {
        self.producers.keys().copied().collect()
    }

    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.producers
            .values()
            .filter(|producer| !producer.interval().is_zero())
            .map(|producer| spawn_ticker(Arc::clone(producer), shutdown.clone()))
            .collect()
    }

    /// Pulls a fresh snapshot from every producer without waiting for it.
    /// Each producer runs on its own task so a slow source holds up nobody.
    pub fn refresh_all(&self) {
        for producer in self.producers.values() {
            let producer = Arc::clone(producer);
            tokio::spawn(async move {
                producer.run_once().await;
            });
        }
    }

    pub async fn refresh_all_now(&self) -> Vec<(FeedType, PollOutcome)> {
        let runs = self.producers.values().map(|producer| async move {
            (producer.feed_type(), producer.run_once().await)
        });
        futures_util::future::join_all(runs).await
    }

    /// Runs one feed out of schedule, e.g. after an install job changed state.
    pub fn trigger(&self, feed_type: FeedType) {
        if let Some(producer) = self.producers.get(&feed_type) {
            let producer = Arc::clone(producer);
            tokio::spawn(async move {
                producer.run_once().await;
            });
        }
    }
}

fn spawn_ticker(producer: Arc<FeedProducer>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let feed_type = producer.feed_type();
        let mut ticker = tokio::time::interval(producer.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            event = "feed_producer_start",
            feed = %feed_type,
            interval_ms = producer.interval().as_millis() as u64
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let worker = Arc::clone(&producer);
                    // Detached so a hung source only delays its own next tick.
                    tokio::spawn(async move {
                        worker.run_once().await;
                    });
                }
            }
        }
        info!(event = "feed_producer_stop", feed = %feed_type);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{tests::FakeTransport, ClientRegistry};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    struct CountingSource {
        feed: FeedType,
        calls: AtomicU32,
        gate: Option<Arc<Semaphore>>,
        fail: AtomicBool,
        hang: bool,
    }

    impl CountingSource {
        fn new(feed: FeedType) -> Self {
            Self {
                feed,
                calls: AtomicU32::new(0),
                gate: None,
                fail: AtomicBool::new(false),
                hang: false,
            }
        }
    }

    #[async_trait]
    impl FeedSource for CountingSource {
        fn feed_type(&self) -> FeedType {
            self.feed
        }

        async fn fetch(&self) -> Result<Value, ProducerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.expect("gate open");
                permit.forget();
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProducerError::Unavailable("rpc refused".to_string()));
            }
            Ok(serde_json::json!({ "call": call }))
        }
    }

    fn harness() -> (Arc<ClientRegistry>, Arc<Broadcaster>, Arc<FakeTransport>) {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let consumer = Arc::new(FakeTransport::default());
        registry.register(consumer.clone()).expect("register");
        (registry, broadcaster, consumer)
    }

    #[tokio::test]
    async fn source_error_publishes_degraded_message() {
        let (_registry, broadcaster, consumer) = harness();
        let source = Arc::new(CountingSource::new(FeedType::NodeInfo));
        source.fail.store(true, Ordering::SeqCst);
        let producer = FeedProducer::new(
            source,
            broadcaster,
            Duration::from_secs(5),
            Duration::from_secs(1),
        );

        let outcome = producer.run_once().await;
        assert!(matches!(outcome, PollOutcome::Degraded(_)));
        let received = consumer.messages();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0].error.as_ref().map(|fault| fault.code.as_str()),
            Some("source_error")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_source_times_out_into_degraded_message() {
        let (_registry, broadcaster, consumer) = harness();
        let mut source = CountingSource::new(FeedType::HardwareInfo);
        source.hang = true;
        let producer = FeedProducer::new(
            Arc::new(source),
            broadcaster,
            Duration::from_secs(2),
            Duration::from_millis(500),
        );

        let outcome = producer.run_once().await;
        assert!(matches!(outcome, PollOutcome::Degraded(_)));
        assert_eq!(
            consumer.messages()[0]
                .error
                .as_ref()
                .map(|fault| fault.code.as_str()),
            Some("source_timeout")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_runs_coalesce_into_one_rerun() {
        let (_registry, broadcaster, consumer) = harness();
        let gate = Arc::new(Semaphore::new(0));
        let mut source = CountingSource::new(FeedType::WalletBalance);
        source.gate = Some(Arc::clone(&gate));
        let source = Arc::new(source);
        let producer = Arc::new(FeedProducer::new(
            source.clone(),
            broadcaster,
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));

        let first = {
            let producer = Arc::clone(&producer);
            tokio::spawn(async move { producer.run_once().await })
        };
        while source.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(producer.run_once().await, PollOutcome::Coalesced);
        assert_eq!(producer.run_once().await, PollOutcome::Coalesced);

        gate.add_permits(2);
        let outcome = first.await.expect("join");
        assert!(matches!(outcome, PollOutcome::Published(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(consumer.messages().len(), 2);
    }

    #[tokio::test]
    async fn refresh_all_now_runs_each_feed_once() {
        let (_registry, broadcaster, consumer) = harness();
        let producers = [FeedType::NodeInfo, FeedType::SystemInfo, FeedType::WalletBalance]
            .into_iter()
            .map(|feed| {
                Arc::new(FeedProducer::new(
                    Arc::new(CountingSource::new(feed)),
                    Arc::clone(&broadcaster),
                    Duration::from_secs(5),
                    Duration::from_secs(1),
                ))
            });
        let scheduler = FeedScheduler::new(producers);

        let outcomes = scheduler.refresh_all_now().await;
        assert_eq!(outcomes.len(), 3);
        let mut feeds = consumer
            .messages()
            .iter()
            .map(|m| m.feed_type)
            .collect::<Vec<_>>();
        feeds.sort();
        assert_eq!(
            feeds,
            vec![FeedType::NodeInfo, FeedType::SystemInfo, FeedType::WalletBalance]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_publishes_without_consumers_and_stops_on_shutdown() {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let producer = Arc::new(FeedProducer::new(
            Arc::new(CountingSource::new(FeedType::HardwareInfo)),
            Arc::clone(&broadcaster),
            Duration::from_secs(2),
            Duration::from_secs(1),
        ));
        let scheduler = FeedScheduler::new([producer]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = scheduler.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert_eq!(broadcaster.last_seq(FeedType::HardwareInfo), 3);

        shutdown_tx.send(true).expect("shutdown");
        for handle in handles {
            handle.await.expect("ticker stopped");
        }
    }
}
