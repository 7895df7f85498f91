use anyhow::Context;
use blitz_client::{AppActions, ConnectionStatus, FeedHandle, FeedStore, StreamClient, StreamConfig};
use blitz_core::FeedType;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "blitz-monitor")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long)]
    install: Option<String>,
    #[arg(long)]
    uninstall: Option<String>,
    #[arg(long, default_value_t = false)]
    keep_data: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);
    let base_url = resolve_url(&args.url);

    let store = Arc::new(FeedStore::new());
    let stream = StreamClient::spawn(StreamConfig::new(base_url.clone()), Arc::clone(&store));
    let mut watchers = FeedType::ALL
        .into_iter()
        .map(|feed_type| tokio::spawn(print_updates(store.feed(feed_type))))
        .collect::<Vec<_>>();

    let mut status = stream.status();
    watchers.push(tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            match current {
                ConnectionStatus::Backoff { retry_in } => info!(
                    event = "connection",
                    status = "backoff",
                    retry_in_ms = retry_in.as_millis() as u64
                ),
                other => info!(event = "connection", status = ?other),
            }
        }
    }));

    let actions = AppActions::new(base_url, Arc::clone(&store));
    if let Some(app_id) = &args.install {
        let accepted = actions
            .install(app_id)
            .await
            .with_context(|| format!("install {app_id}"))?;
        info!(event = "install_started", app = %accepted.id);
    }
    if let Some(app_id) = &args.uninstall {
        let accepted = actions
            .uninstall(app_id, args.keep_data)
            .await
            .with_context(|| format!("uninstall {app_id}"))?;
        info!(event = "uninstall_started", app = %accepted.id);
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    stream.shutdown().await;
    for watcher in watchers {
        watcher.abort();
    }
    Ok(())
}

async fn print_updates(mut feed: FeedHandle) {
    while feed.changed().await.is_ok() {
        let Some(slice) = feed.get() else {
            continue;
        };
        info!(
            event = "feed_update",
            feed = %feed.feed_type(),
            seq = ?slice.seq,
            stale = slice.stale,
            fault = ?slice.fault.as_ref().map(|fault| fault.code.as_str()),
            received_at = %slice.received_at.to_rfc3339(),
            data = %slice.data
        );
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("BLITZ_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn resolve_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(addr) = std::env::var("BLITZ_HUB_ADDR") {
        if !addr.trim().is_empty() {
            return format!("http://{addr}");
        }
    }
    "http://127.0.0.1:8000".to_string()
}
