pub mod apps;
pub mod broadcaster;
mod endpoint;
pub mod outbox;
pub mod producers;
pub mod registry;
pub mod sources;

use crate::apps::{InstallJobs, SimulatedInstallJobs};
use crate::broadcaster::Broadcaster;
use crate::producers::{FeedIntervals, FeedProducer, FeedScheduler};
use crate::registry::ClientRegistry;
use crate::sources::{NodeModel, NodeSource};
use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use blitz_core::FeedType;
use serde_json::{json, Map, Value};
use std::{io, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub const SUBSCRIBE_PATH: &str = "/api/sse/subscribe";

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub outbox_capacity: usize,
    pub max_consumers: usize,
    pub keep_alive: Duration,
    /// Zero disables the stale reaper.
    pub stale_after: Duration,
    pub fetch_timeout: Duration,
    pub install_delay: Duration,
    pub ui_origin: String,
    pub intervals: FeedIntervals,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 64,
            max_consumers: 256,
            keep_alive: Duration::from_secs(15),
            stale_after: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
            install_delay: Duration::from_secs(3),
            ui_origin: "http://localhost:3000".to_string(),
            intervals: FeedIntervals::default(),
        }
    }
}

pub struct HubState {
    pub config: HubConfig,
    pub registry: Arc<ClientRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub scheduler: Arc<FeedScheduler>,
    pub model: Arc<NodeModel>,
    pub jobs: Arc<dyn InstallJobs>,
    shutdown: watch::Receiver<bool>,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        model: Arc<NodeModel>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::with_limit(config.max_consumers));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let producers = NodeSource::all(&model).into_iter().map(|source| {
            let interval = config.intervals.for_feed(source.feed_type());
            Arc::new(FeedProducer::new(
                source,
                Arc::clone(&broadcaster),
                interval,
                config.fetch_timeout,
            ))
        });
        let scheduler = Arc::new(FeedScheduler::new(producers));
        let jobs = Arc::new(SimulatedInstallJobs::new(
            Arc::clone(&model),
            Arc::clone(&scheduler),
            config.install_delay,
        ));
        Arc::new(Self {
            config,
            registry,
            broadcaster,
            scheduler,
            model,
            jobs,
            shutdown,
        })
    }

    pub fn spawn_stale_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let stale_after = self.config.stale_after;
        if stale_after.is_zero() {
            return None;
        }
        let hub = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stale_after / 2);
            loop {
                tokio::select! {
                    _ = endpoint::shutdown_requested(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        hub.registry.reap_stale(stale_after);
                    }
                }
            }
        }))
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    let router = Router::new()
        .route(SUBSCRIBE_PATH, get(endpoint::subscribe))
        .route("/api/v1/apps/install/:id", post(apps::install_app))
        .route("/api/v1/apps/uninstall/:id", post(apps::uninstall_app))
        .route("/health", get(health));
    let router = match HeaderValue::from_str(&hub.config.ui_origin) {
        Ok(origin) => router.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_credentials(true)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        ),
        Err(err) => {
            warn!(event = "cors_origin_invalid", origin = %hub.config.ui_origin, error = %err);
            router
        }
    };
    router.with_state(hub)
}

/// Liveness plus the consumer count and the last seq published per feed.
async fn health(State(hub): State<Arc<HubState>>) -> Json<Value> {
    let feeds: Map<String, Value> = FeedType::ALL
        .iter()
        .map(|feed| (feed.to_string(), json!(hub.broadcaster.last_seq(*feed))))
        .collect();
    Json(json!({
        "status": "ok",
        "consumers": hub.registry.len(),
        "feeds": feeds,
    }))
}

/// Serves the hub on `listener` until `shutdown` flips to true, then closes
/// every remaining consumer.
pub async fn run(
    listener: TcpListener,
    config: HubConfig,
    model: Arc<NodeModel>,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let hub = HubState::new(config, model, shutdown.clone());
    let producers = hub.scheduler.spawn(shutdown.clone());
    let reaper = hub.spawn_stale_reaper();
    info!(
        event = "hub_start",
        addr = %listener.local_addr()?,
        feeds = hub.scheduler.feeds().len(),
        max_consumers = hub.config.max_consumers
    );

    let mut signal = shutdown;
    let served = axum::serve(listener, router(Arc::clone(&hub)))
        .with_graceful_shutdown(async move { endpoint::shutdown_requested(&mut signal).await })
        .await;

    hub.registry.shutdown();
    for task in producers.into_iter().chain(reaper) {
        let _ = task.await;
    }
    info!(event = "hub_stop");
    served
}

#[cfg(test)]
pub(crate) fn test_state(config: HubConfig) -> (Arc<HubState>, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let model = Arc::new(NodeModel::with_apps(["lnd", "rtl"]));
    (HubState::new(config, model, rx), tx)
}
