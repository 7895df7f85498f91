use crate::apps::{AppAction, JobRejection};
use crate::producers::{FeedSource, ProducerError};
use async_trait::async_trait;
use blitz_core::payloads::{
    AppStatus, HardwareInfo, LightningInfoLite, NodeInfo, StartupState, SystemInfo,
    SystemStartupInfo, WalletBalance,
};
use blitz_core::FeedType;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

pub const DEFAULT_APPS: [&str; 8] = [
    "btc-rpc-explorer",
    "btcpayserver",
    "electrs",
    "jam",
    "lnbits",
    "mempool",
    "rtl",
    "specter",
];

const GENESIS_OFFSET_BLOCKS: u64 = 820_000;

struct NodeState {
    alias: String,
    block_interval: Duration,
    wallet: WalletBalance,
    active_channels: u32,
    pending_channels: u32,
    peers: u32,
    apps: BTreeMap<String, AppStatus>,
    jobs: BTreeMap<String, AppAction>,
    failing: BTreeSet<FeedType>,
}

/// In-memory stand-in for the node: bitcoind, the lightning daemon, the
/// wallet and the app manager. Every feed source reads from it.
pub struct NodeModel {
    started: Instant,
    state: Mutex<NodeState>,
}

impl Default for NodeModel {
    fn default() -> Self {
        Self::with_apps(DEFAULT_APPS)
    }
}

impl NodeModel {
    pub fn with_apps<I, S>(app_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let apps = app_ids
            .into_iter()
            .map(|id| {
                let id: String = id.into();
                let status = AppStatus {
                    id: id.clone(),
                    status: "offline".to_string(),
                    ..AppStatus::default()
                };
                (id, status)
            })
            .collect();
        Self {
            started: Instant::now(),
            state: Mutex::new(NodeState {
                alias: "RaspiBlitz".to_string(),
                block_interval: Duration::from_secs(60),
                wallet: WalletBalance {
                    onchain_confirmed_balance: 1_250_000,
                    onchain_unconfirmed_balance: 0,
                    onchain_total_balance: 1_250_000,
                    channel_local_balance: 4_800_000,
                    channel_remote_balance: 3_100_000,
                    channel_pending_open_local_balance: 0,
                },
                active_channels: 4,
                pending_channels: 0,
                peers: 6,
                apps,
                jobs: BTreeMap::new(),
                failing: BTreeSet::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Makes the upstream of `feed_type` fail until cleared.
    pub fn set_offline(&self, feed_type: FeedType, offline: bool) {
        let mut state = self.state();
        if offline {
            state.failing.insert(feed_type);
        } else {
            state.failing.remove(&feed_type);
        }
    }

    fn check_online(&self, feed_type: FeedType) -> Result<(), ProducerError> {
        if self.state().failing.contains(&feed_type) {
            return Err(ProducerError::Unavailable(format!(
                "{} backend not reachable",
                feed_type.legacy_name()
            )));
        }
        Ok(())
    }

    pub fn set_wallet_balance(&self, wallet: WalletBalance) {
        self.state().wallet = wallet;
    }

    pub fn set_block_interval(&self, interval: Duration) {
        self.state().block_interval = interval.max(Duration::from_millis(1));
    }

    fn block_height(&self, state: &NodeState) -> u64 {
        let mined = self.started.elapsed().as_millis() / state.block_interval.as_millis().max(1);
        GENESIS_OFFSET_BLOCKS + mined as u64
    }

    pub fn node_info(&self) -> NodeInfo {
        let state = self.state();
        let blocks = self.block_height(&state);
        NodeInfo {
            version: 260_000,
            subversion: "/Satoshi:26.0.0/".to_string(),
            chain: "main".to_string(),
            blocks,
            headers: blocks,
            verification_progress: 0.999_999,
            difficulty: 72_006_146_478_567.1,
            size_on_disk: 612_000_000_000 + blocks * 1_500_000,
            connections_in: 8,
            connections_out: 10,
            networks: vec!["ipv4".to_string(), "onion".to_string()],
        }
    }

    pub fn lightning_info(&self) -> LightningInfoLite {
        let state = self.state();
        LightningInfoLite {
            implementation: "LND_GRPC".to_string(),
            version: "0.17.4-beta".to_string(),
            identity_pubkey: "0325e38f35b7b4e4bbd4b2c0e9c6e1e6a0e4f6a8a4d33a6c5c1b2e0cba5f5d7e21"
                .to_string(),
            num_pending_channels: state.pending_channels,
            num_active_channels: state.active_channels,
            num_inactive_channels: 0,
            num_peers: state.peers,
            block_height: self.block_height(&state),
            synced_to_chain: true,
            synced_to_graph: true,
        }
    }

    pub fn system_info(&self) -> SystemInfo {
        let state = self.state();
        SystemInfo {
            alias: state.alias.clone(),
            color: "#FF9900".to_string(),
            platform: "raspiblitz".to_string(),
            platform_version: "v1.11.0".to_string(),
            api_version: "v0.5.0".to_string(),
            chain: "main".to_string(),
            lan_web_ui: "http://localhost:3000".to_string(),
            lan_api: "http://localhost:8000".to_string(),
            tor_web_ui: String::new(),
            tor_api: String::new(),
            ssh_address: "admin@localhost".to_string(),
            uptime: self.uptime().as_secs(),
        }
    }

    pub fn wallet_balance(&self) -> WalletBalance {
        self.state().wallet.clone()
    }

    pub fn startup_info(&self) -> SystemStartupInfo {
        let state = self.state();
        let (bitcoin, bitcoin_msg) = if state.failing.contains(&FeedType::NodeInfo) {
            (StartupState::Offline, "bitcoind not responding".to_string())
        } else {
            (StartupState::Done, String::new())
        };
        let (lightning, lightning_msg) = if state.failing.contains(&FeedType::LightningInfoLite) {
            (StartupState::Offline, "lnd not responding".to_string())
        } else {
            (StartupState::Done, String::new())
        };
        SystemStartupInfo {
            bitcoin,
            bitcoin_msg,
            lightning,
            lightning_msg,
        }
    }

    pub fn app_statuses(&self) -> Vec<AppStatus> {
        self.state().apps.values().cloned().collect()
    }

    pub fn app_status(&self, app_id: &str) -> Option<AppStatus> {
        self.state().apps.get(app_id).cloned()
    }

    pub(crate) fn begin_job(&self, app_id: &str, action: AppAction) -> Result<(), JobRejection> {
        let mut state = self.state();
        if state.jobs.contains_key(app_id) {
            return Err(JobRejection::Busy);
        }
        let Some(app) = state.apps.get_mut(app_id) else {
            return Err(JobRejection::UnknownApp);
        };
        match action {
            AppAction::Install if app.installed => return Err(JobRejection::AlreadyInstalled),
            AppAction::Uninstall if !app.installed => return Err(JobRejection::NotInstalled),
            _ => {}
        }
        app.installing = true;
        app.status = action.progress_status().to_string();
        app.error = None;
        state.jobs.insert(app_id.to_string(), action);
        Ok(())
    }

    pub(crate) fn finish_job(&self, app_id: &str, keep_data: bool) -> Option<AppAction> {
        let mut state = self.state();
        let action = state.jobs.remove(app_id)?;
        if let Some(app) = state.apps.get_mut(app_id) {
            app.installing = false;
            match action {
                AppAction::Install => {
                    app.installed = true;
                    app.status = "online".to_string();
                    app.version = Some("latest".to_string());
                    app.address = Some(format!("http://localhost/{app_id}"));
                    app.hidden_service = Some(format!("{app_id}.onion"));
                }
                AppAction::Uninstall => {
                    app.installed = false;
                    app.status = "offline".to_string();
                    app.address = None;
                    app.hidden_service = None;
                    if !keep_data {
                        app.version = None;
                    }
                }
            }
        }
        Some(action)
    }
}

/// Adapts one feed of the node model to the producer seam.
pub struct NodeSource {
    feed_type: FeedType,
    model: Arc<NodeModel>,
}

impl NodeSource {
    pub fn new(feed_type: FeedType, model: Arc<NodeModel>) -> Self {
        Self { feed_type, model }
    }

    pub fn all(model: &Arc<NodeModel>) -> Vec<Arc<dyn FeedSource>> {
        FeedType::ALL
            .into_iter()
            .map(|feed_type| {
                Arc::new(NodeSource::new(feed_type, Arc::clone(model))) as Arc<dyn FeedSource>
            })
            .collect()
    }
}

#[async_trait]
impl FeedSource for NodeSource {
    fn feed_type(&self) -> FeedType {
        self.feed_type
    }

    async fn fetch(&self) -> Result<Value, ProducerError> {
        // Startup info reports on the other backends, so it never fails itself.
        if self.feed_type != FeedType::SystemStartupInfo {
            self.model.check_online(self.feed_type)?;
        }
        match self.feed_type {
            FeedType::NodeInfo => to_value(&self.model.node_info()),
            FeedType::LightningInfoLite => to_value(&self.model.lightning_info()),
            FeedType::InstalledAppStatus => to_value(&self.model.app_statuses()),
            FeedType::SystemInfo => to_value(&self.model.system_info()),
            FeedType::HardwareInfo => to_value(&read_hardware_info().await),
            FeedType::WalletBalance => to_value(&self.model.wallet_balance()),
            FeedType::SystemStartupInfo => to_value(&self.model.startup_info()),
        }
    }
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value, ProducerError> {
    serde_json::to_value(payload).map_err(|err| ProducerError::InvalidPayload(err.to_string()))
}

async fn read_hardware_info() -> HardwareInfo {
    let cpus = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    let load = tokio::fs::read_to_string("/proc/loadavg")
        .await
        .ok()
        .and_then(|raw| parse_loadavg(&raw))
        .unwrap_or([0.42, 0.38, 0.35]);
    let (total, available) = tokio::fs::read_to_string("/proc/meminfo")
        .await
        .ok()
        .and_then(|raw| parse_meminfo(&raw))
        .unwrap_or((4_096 * 1024 * 1024, 2_560 * 1024 * 1024));

    let cpu_overall_percent = (load[0] / cpus as f64 * 100.0).clamp(0.0, 100.0);
    let used = total.saturating_sub(available);
    HardwareInfo {
        cpu_overall_percent,
        cpu_per_cpu_percent: vec![cpu_overall_percent; cpus],
        load_average: load,
        vram_total_bytes: total,
        vram_available_bytes: available,
        vram_used_bytes: used,
        vram_usage_percent: if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        },
        temperature_celsius: None,
    }
}

fn parse_loadavg(raw: &str) -> Option<[f64; 3]> {
    let mut fields = raw.split_whitespace().map(|field| field.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

fn parse_meminfo(raw: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .map(|kib| kib * 1024)
    };
    Some((field("MemTotal:")?, field("MemAvailable:")?))
}
