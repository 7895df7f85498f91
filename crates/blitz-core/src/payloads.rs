use crate::feed::FeedType;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeInfo {
    pub version: u64,
    pub subversion: String,
    pub chain: String,
    pub blocks: u64,
    pub headers: u64,
    pub verification_progress: f64,
    pub difficulty: f64,
    pub size_on_disk: u64,
    pub connections_in: u32,
    pub connections_out: u32,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LightningInfoLite {
    pub implementation: String,
    pub version: String,
    pub identity_pubkey: String,
    pub num_pending_channels: u32,
    pub num_active_channels: u32,
    pub num_inactive_channels: u32,
    pub num_peers: u32,
    pub block_height: u64,
    pub synced_to_chain: bool,
    pub synced_to_graph: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppStatus {
    pub id: String,
    pub installed: bool,
    pub installing: bool,
    pub status: String,
    pub version: Option<String>,
    pub address: Option<String>,
    #[serde(rename = "hiddenService")]
    pub hidden_service: Option<String>,
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl AppStatus {
    /// True when the status itself reports a running job.
    pub fn reports_installing(&self) -> bool {
        self.installing || matches!(self.status.as_str(), "installing" | "uninstalling")
    }
}

/// Accepts the InstalledAppStatus payload either as an array of statuses
/// or as a single status object.
pub fn app_statuses(data: &Value) -> Result<Vec<AppStatus>, serde_json::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<AppStatus>),
        One(AppStatus),
    }

    match OneOrMany::deserialize(data)? {
        OneOrMany::Many(list) => Ok(list),
        OneOrMany::One(item) => Ok(vec![item]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppAction {
    Install,
    Uninstall,
}

impl AppAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AppAction::Install => "install",
            AppAction::Uninstall => "uninstall",
        }
    }

    /// Status string an app reports while this action runs.
    pub fn progress_status(self) -> &'static str {
        match self {
            AppAction::Install => "installing",
            AppAction::Uninstall => "uninstalling",
        }
    }
}

/// Body of the 202 answer to an install or uninstall request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionAccepted {
    pub id: String,
    pub action: AppAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemInfo {
    pub alias: String,
    pub color: String,
    pub platform: String,
    pub platform_version: String,
    pub api_version: String,
    pub chain: String,
    pub lan_web_ui: String,
    pub lan_api: String,
    pub tor_web_ui: String,
    pub tor_api: String,
    pub ssh_address: String,
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HardwareInfo {
    pub cpu_overall_percent: f64,
    pub cpu_per_cpu_percent: Vec<f64>,
    pub load_average: [f64; 3],
    pub vram_total_bytes: u64,
    pub vram_available_bytes: u64,
    pub vram_used_bytes: u64,
    pub vram_usage_percent: f64,
    pub temperature_celsius: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WalletBalance {
    pub onchain_confirmed_balance: u64,
    pub onchain_unconfirmed_balance: u64,
    pub onchain_total_balance: u64,
    pub channel_local_balance: u64,
    pub channel_remote_balance: u64,
    pub channel_pending_open_local_balance: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupState {
    Offline,
    Booting,
    Syncing,
    Done,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemStartupInfo {
    pub bitcoin: StartupState,
    pub bitcoin_msg: String,
    #[serde(deserialize_with = "nullable_state")]
    pub lightning: StartupState,
    pub lightning_msg: String,
}

/// Checks that `data` has the payload shape of `feed_type`. Fields may be
/// missing, but present ones must have the right type.
pub fn validate_payload(feed_type: FeedType, data: &Value) -> Result<(), serde_json::Error> {
    fn check<T: DeserializeOwned>(data: &Value) -> Result<(), serde_json::Error> {
        <T as Deserialize>::deserialize(data).map(drop)
    }

    match feed_type {
        FeedType::NodeInfo => check::<NodeInfo>(data),
        FeedType::LightningInfoLite => check::<LightningInfoLite>(data),
        FeedType::InstalledAppStatus => app_statuses(data).map(drop),
        FeedType::SystemInfo => check::<SystemInfo>(data),
        FeedType::HardwareInfo => check::<HardwareInfo>(data),
        FeedType::WalletBalance => check::<WalletBalance>(data),
        FeedType::SystemStartupInfo => check::<SystemStartupInfo>(data),
    }
}

fn nullable_state<'de, D>(deserializer: D) -> Result<StartupState, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StartupState>::deserialize(deserializer)?.unwrap_or_default())
}
