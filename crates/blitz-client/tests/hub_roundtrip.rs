use blitz_client::{AppActions, ActionError, ConnectionStatus, FeedStore, StreamClient, StreamConfig};
use blitz_core::payloads::WalletBalance;
use blitz_core::FeedType;
use blitz_hub::{producers::FeedIntervals, sources::NodeModel, HubConfig};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

struct TestHub {
    base_url: String,
    model: Arc<NodeModel>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

fn hub_config(wallet_every: Duration) -> HubConfig {
    let fast = Duration::from_millis(100);
    HubConfig {
        install_delay: Duration::from_millis(300),
        fetch_timeout: Duration::from_secs(1),
        intervals: FeedIntervals {
            node_info: fast,
            lightning_info: fast,
            app_status: Duration::from_secs(30),
            system_info: fast,
            hardware_info: fast,
            wallet_balance: wallet_every,
            startup_info: fast,
        },
        ..HubConfig::default()
    }
}

async fn launch_hub() -> TestHub {
    launch_hub_with("127.0.0.1:0", hub_config(Duration::from_millis(100))).await
}

async fn launch_hub_with(addr: &str, config: HubConfig) -> TestHub {
    let listener = TcpListener::bind(addr).await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let model = Arc::new(NodeModel::with_apps(["lnd", "rtl"]));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(blitz_hub::run(
        listener,
        config,
        Arc::clone(&model),
        shutdown_rx,
    ));
    TestHub {
        base_url: format!("http://{addr}"),
        model,
        shutdown,
        task,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wallet_balance_reaches_the_wallet_slice() {
    let hub = launch_hub().await;
    hub.model.set_wallet_balance(WalletBalance {
        onchain_confirmed_balance: 1000,
        onchain_total_balance: 1000,
        ..WalletBalance::default()
    });

    let store = Arc::new(FeedStore::new());
    let stream = StreamClient::spawn(StreamConfig::new(&hub.base_url), Arc::clone(&store));
    let wallet = store.feed(FeedType::WalletBalance);
    eventually("wallet balance", || {
        let wallet = wallet.clone();
        async move {
            matches!(
                wallet.get_as::<WalletBalance>(),
                Some(Ok(balance)) if balance.onchain_confirmed_balance == 1000
            )
        }
    })
    .await;
    assert!(matches!(
        *stream.status().borrow(),
        ConnectionStatus::Open { consumer_id: Some(_) }
    ));

    // Other slices fill independently of the wallet.
    eventually("node info", || {
        let node = store.feed(FeedType::NodeInfo);
        async move { node.get().is_some() }
    })
    .await;

    stream.shutdown().await;
    hub.shutdown.send(true).expect("signal");
    hub.task.await.expect("join").expect("hub run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn install_flow_updates_installing_and_installed_flags() {
    let hub = launch_hub().await;
    let store = Arc::new(FeedStore::new());
    let stream = StreamClient::spawn(StreamConfig::new(&hub.base_url), Arc::clone(&store));
    eventually("app catalog", || {
        let present = store.app("lnd").is_some();
        async move { present }
    })
    .await;

    let actions = AppActions::new(&hub.base_url, Arc::clone(&store));
    let accepted = actions.install("lnd").await.expect("install accepted");
    assert_eq!(accepted.id, "lnd");
    assert!(store.app("lnd").expect("lnd").installing);

    eventually("lnd installed", || {
        let done = store
            .app("lnd")
            .map(|app| app.status.installed && !app.installing)
            .unwrap_or(false);
        async move { done }
    })
    .await;

    let err = actions.install("nope").await.expect_err("unknown app");
    assert!(matches!(err, ActionError::UnknownApp(_)));
    let err = actions.install("lnd").await.expect_err("already installed");
    assert!(matches!(err, ActionError::Rejected { status: 409, .. }));

    stream.shutdown().await;
    hub.shutdown.send(true).expect("signal");
    hub.task.await.expect("join").expect("hub run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hub_restart_goes_stale_then_fresh_with_seqs_from_one() {
    let hub = launch_hub().await;
    let addr = hub.base_url.trim_start_matches("http://").to_string();
    let store = Arc::new(FeedStore::new());
    let mut config = StreamConfig::new(&hub.base_url);
    config.initial_backoff = Duration::from_millis(200);
    config.max_backoff = Duration::from_secs(1);
    let stream = StreamClient::spawn(config, Arc::clone(&store));
    let wallet = store.feed(FeedType::WalletBalance);
    eventually("several wallet updates", || {
        let seq = wallet.get().and_then(|slice| slice.seq).unwrap_or(0);
        async move { seq >= 5 }
    })
    .await;

    hub.model.set_offline(FeedType::WalletBalance, true);
    eventually("degraded wallet", || {
        let degraded = wallet.get().map(|slice| slice.fault.is_some()).unwrap_or(false);
        async move { degraded }
    })
    .await;
    assert!(wallet.get().expect("slice").data.is_object());
    let seq_before = wallet.get().and_then(|slice| slice.seq).expect("seq");

    hub.shutdown.send(true).expect("signal");
    hub.task.await.expect("join").expect("hub run");

    eventually("stale wallet", || {
        let stale = wallet.get().map(|slice| slice.stale).unwrap_or(false);
        async move { stale }
    })
    .await;
    let status = stream.status();
    eventually("backoff", || {
        let backing_off = !matches!(*status.borrow(), ConnectionStatus::Open { .. });
        async move { backing_off }
    })
    .await;

    // Same address, fresh process state. The wallet only publishes on
    // subscribe, so its seqs stay far below the first hub's.
    let restarted = launch_hub_with(&addr, hub_config(Duration::from_secs(60))).await;
    eventually("fresh wallet after restart", || {
        let fresh = wallet
            .get()
            .map(|slice| !slice.stale && slice.fault.is_none())
            .unwrap_or(false);
        async move { fresh }
    })
    .await;
    let slice = wallet.get().expect("slice");
    assert!(slice.seq.expect("seq") < seq_before);
    assert!(matches!(
        *stream.status().borrow(),
        ConnectionStatus::Open { .. }
    ));

    stream.shutdown().await;
    restarted.shutdown.send(true).expect("signal");
    restarted.task.await.expect("join").expect("hub run");
}
