use crate::store::FeedStore;
use blitz_core::{decode_feed_message, StreamEvent};
use futures_util::StreamExt;
use reqwest_eventsource::{CannotCloneRequestError, Event, EventSource};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

pub const SUBSCRIBE_PATH: &str = "/api/sse/subscribe";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("event stream: {0}")]
    EventStream(#[from] reqwest_eventsource::Error),
    #[error("subscribe request cannot be retried: {0}")]
    Request(#[from] CannotCloneRequestError),
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub base_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
}

impl StreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn subscribe_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), SUBSCRIBE_PATH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open { consumer_id: Option<u64> },
    Backoff { retry_in: Duration },
    Closed,
}

pub struct StreamClient;

impl StreamClient {
    /// Starts the subscription loop on the current runtime. The loop keeps
    /// reconnecting until the returned handle is closed or dropped.
    pub fn spawn(config: StreamConfig, store: Arc<FeedStore>) -> StreamHandle {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run(config, store, status_tx, cancel_rx));
        StreamHandle {
            status: status_rx,
            cancel: cancel_tx,
            closed: AtomicBool::new(false),
            task: Some(task),
        }
    }
}

pub struct StreamHandle {
    status: watch::Receiver<ConnectionStatus>,
    cancel: watch::Sender<bool>,
    closed: AtomicBool,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stops the subscription. Safe to call more than once; only the first
    /// call has an effect.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.send_replace(true);
        }
    }

    /// Closes and waits for the loop to release the connection.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    config: StreamConfig,
    store: Arc<FeedStore>,
    status: watch::Sender<ConnectionStatus>,
    mut cancel: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(event = "stream_client_error", error = %err);
            status.send_replace(ConnectionStatus::Closed);
            return;
        }
    };
    let url = config.subscribe_url();
    let mut backoff = config.initial_backoff;

    loop {
        status.send_replace(ConnectionStatus::Connecting);
        let mut source = match open(&client, &url) {
            Ok(source) => source,
            Err(err) => {
                warn!(event = "stream_client_error", error = %err);
                break;
            }
        };
        let finished = tokio::select! {
            _ = cancelled(&mut cancel) => None,
            result = pump(&mut source, &store, &status) => Some(result),
        };
        // EventSource retries on its own unless closed.
        source.close();
        let Some(finished) = finished else { break };

        let was_open = matches!(*status.borrow(), ConnectionStatus::Open { .. });
        if was_open {
            backoff = config.initial_backoff;
        }
        match finished {
            Ok(()) => info!(event = "stream_ended", url = %url),
            Err(err) if was_open => warn!(event = "stream_read_error", error = %err),
            Err(err) => warn!(event = "stream_connect_error", url = %url, error = %err),
        }

        store.mark_all_stale();
        status.send_replace(ConnectionStatus::Backoff { retry_in: backoff });
        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff, config.max_backoff);
    }

    status.send_replace(ConnectionStatus::Closed);
    info!(event = "stream_closed", url = %url);
}

fn open(client: &reqwest::Client, url: &str) -> Result<EventSource, ClientError> {
    let request = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    Ok(EventSource::new(request)?)
}

/// Feeds one connection's events into the store until the server ends the
/// stream or the connection fails.
async fn pump(
    source: &mut EventSource,
    store: &FeedStore,
    status: &watch::Sender<ConnectionStatus>,
) -> Result<(), ClientError> {
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => {
                info!(event = "stream_open");
                status.send_replace(ConnectionStatus::Open { consumer_id: None });
            }
            Ok(Event::Message(message)) => {
                handle_event(&message.event, &message.data, store, status);
            }
            Err(reqwest_eventsource::Error::StreamEnded) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_event(
    event: &str,
    data: &str,
    store: &FeedStore,
    status: &watch::Sender<ConnectionStatus>,
) {
    match decode_feed_message(event, data) {
        Ok(StreamEvent::Feed(message)) => {
            store.apply(message);
        }
        Ok(StreamEvent::Connected { consumer_id }) => {
            debug!(event = "stream_connected", consumer_id = ?consumer_id);
            status.send_replace(ConnectionStatus::Open { consumer_id });
        }
        Ok(StreamEvent::Placeholder) => {}
        Ok(StreamEvent::Ignored { event }) => {
            debug!(event = "stream_event_ignored", name = %event);
        }
        Err(err) => warn!(event = "stream_decode_error", error = %err),
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}
