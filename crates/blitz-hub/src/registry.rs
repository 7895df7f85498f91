use blitz_core::FeedMessage;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{error, info, warn};

pub type ConsumerId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("consumer {0} is already registered")]
    DuplicateConsumer(ConsumerId),
    #[error("registry is shut down")]
    ShutDown,
    #[error("consumer limit of {0} reached")]
    Full(usize),
}

/// Write side of one subscriber connection. Implementations must not block:
/// `deliver` either queues the message or fails.
pub trait Transport: Send + Sync {
    fn deliver(&self, message: Arc<FeedMessage>) -> Result<(), TransportError>;
    fn close(&self);
    fn is_closed(&self) -> bool;

    fn pending(&self) -> usize {
        0
    }

    /// How long queued messages have been waiting for the peer to read.
    fn idle_for(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closed => 2,
        }
    }
}

pub struct ConsumerEntry {
    id: ConsumerId,
    state: AtomicU8,
    transport: Arc<dyn Transport>,
    registered_at: Instant,
}

impl ConsumerEntry {
    fn new(id: ConsumerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            transport,
            registered_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn mark_closed(&self) -> bool {
        self.state.swap(ConnectionState::Closed.as_u8(), Ordering::SeqCst)
            != ConnectionState::Closed.as_u8()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// The set of live subscribers. Created once per hub and handed to the
/// endpoint and broadcaster by `Arc`.
pub struct ClientRegistry {
    next_id: AtomicU64,
    consumers: RwLock<BTreeMap<ConsumerId, Arc<ConsumerEntry>>>,
    max_consumers: usize,
    shut_down: AtomicBool,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// A registry that refuses consumers once `max_consumers` are connected.
    pub fn with_limit(max_consumers: usize) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            consumers: RwLock::new(BTreeMap::new()),
            max_consumers,
            shut_down: AtomicBool::new(false),
        }
    }

    fn next_consumer_id(&self) -> ConsumerId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Adds a consumer. The shutdown flag and the limit are checked under the
    /// write lock, so a refused transport is closed and never enters the map.
    pub fn register(&self, transport: Arc<dyn Transport>) -> Result<ConsumerId, RegistryError> {
        let entry = {
            let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
            if self.shut_down.load(Ordering::SeqCst) {
                transport.close();
                return Err(RegistryError::ShutDown);
            }
            if consumers.len() >= self.max_consumers {
                transport.close();
                return Err(RegistryError::Full(self.max_consumers));
            }
            let id = self.next_consumer_id();
            if consumers.contains_key(&id) {
                error!(event = "registry_invariant", consumer_id = id, "duplicate consumer id");
                return Err(RegistryError::DuplicateConsumer(id));
            }
            let entry = Arc::new(ConsumerEntry::new(id, transport));
            consumers.insert(id, Arc::clone(&entry));
            entry
        };
        let id = entry.id;
        entry.transition(ConnectionState::Connecting, ConnectionState::Open);
        info!(event = "consumer_connected", consumer_id = id, consumers = self.len());
        Ok(id)
    }

    /// Removes a consumer and closes its transport. Returns false when the
    /// consumer was already gone, so every disconnect signal can call it.
    pub fn unregister(&self, id: ConsumerId, reason: &str) -> bool {
        let entry = self
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let Some(entry) = entry else {
            return false;
        };
        if !entry.mark_closed() {
            return false;
        }
        entry.transport.close();
        info!(
            event = "consumer_disconnected",
            consumer_id = id,
            reason = reason,
            connected_ms = entry.registered_at.elapsed().as_millis() as u64,
        );
        true
    }

    pub fn contains(&self, id: ConsumerId) -> bool {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ConsumerId> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<ConsumerEntry>> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Applies `deliver` to every open consumer. Iterates over a copy of the
    /// membership so callbacks may unregister anyone, themselves included.
    /// A failing consumer is removed and the walk continues.
    pub fn for_each<F>(&self, mut deliver: F) -> DeliveryReport
    where
        F: FnMut(&ConsumerEntry) -> Result<(), TransportError>,
    {
        let mut report = DeliveryReport::default();
        for entry in self.snapshot() {
            if entry.state() != ConnectionState::Open {
                continue;
            }
            if entry.transport.is_closed() {
                self.unregister(entry.id, "transport_closed");
                report.dropped += 1;
                continue;
            }
            match deliver(&entry) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(event = "send_error", consumer_id = entry.id, error = %err);
                    self.unregister(entry.id, "send_error");
                    report.dropped += 1;
                }
            }
        }
        report
    }

    /// Unregisters consumers whose peer stopped reading for longer than
    /// `stale_after`.
    pub fn reap_stale(&self, stale_after: Duration) -> Vec<ConsumerId> {
        let mut reaped = Vec::new();
        for entry in self.snapshot() {
            let transport = entry.transport();
            if transport.pending() > 0 && transport.idle_for() > stale_after {
                warn!(
                    event = "stale_close",
                    consumer_id = entry.id,
                    pending = transport.pending(),
                    idle_ms = transport.idle_for().as_millis() as u64,
                );
                if self.unregister(entry.id, "stale") {
                    reaped.push(entry.id);
                }
            }
        }
        reaped
    }

    pub fn shutdown(&self) {
        {
            let _consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
            self.shut_down.store(true, Ordering::SeqCst);
        }
        let ids = self.ids();
        let count = ids.len();
        for id in ids {
            self.unregister(id, "shutdown");
        }
        info!(event = "registry_shutdown", closed = count);
    }
}
