use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The closed set of independently paced feeds pushed to every subscriber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedType {
    NodeInfo,
    LightningInfoLite,
    InstalledAppStatus,
    SystemInfo,
    HardwareInfo,
    WalletBalance,
    SystemStartupInfo,
}

impl FeedType {
    pub const ALL: [FeedType; 7] = [
        FeedType::SystemStartupInfo,
        FeedType::SystemInfo,
        FeedType::HardwareInfo,
        FeedType::NodeInfo,
        FeedType::LightningInfoLite,
        FeedType::InstalledAppStatus,
        FeedType::WalletBalance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NodeInfo => "NodeInfo",
            Self::LightningInfoLite => "LightningInfoLite",
            Self::InstalledAppStatus => "InstalledAppStatus",
            Self::SystemInfo => "SystemInfo",
            Self::HardwareInfo => "HardwareInfo",
            Self::WalletBalance => "WalletBalance",
            Self::SystemStartupInfo => "SystemStartupInfo",
        }
    }

    /// Legacy snake_case event name, still accepted by `FromStr`.
    pub fn legacy_name(self) -> &'static str {
        match self {
            Self::NodeInfo => "btc_info",
            Self::LightningInfoLite => "ln_info_lite",
            Self::InstalledAppStatus => "installed_app_status",
            Self::SystemInfo => "system_info",
            Self::HardwareInfo => "hardware_info",
            Self::WalletBalance => "wallet_balance",
            Self::SystemStartupInfo => "system_startup_info",
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feed type: {0}")]
pub struct UnknownFeedType(pub String);

impl FromStr for FeedType {
    type Err = UnknownFeedType;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        FeedType::ALL
            .into_iter()
            .find(|feed| feed.as_str() == trimmed || feed.legacy_name() == trimmed)
            .ok_or_else(|| UnknownFeedType(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedFault {
    pub code: String,
    pub message: String,
}

/// One tagged emission of a feed. Immutable once built; the hub shares it
/// between consumers behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedMessage {
    #[serde(rename = "type")]
    pub feed_type: FeedType,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FeedFault>,
}

impl FeedMessage {
    pub fn new(feed_type: FeedType, data: Value) -> Self {
        Self {
            feed_type,
            data,
            seq: None,
            error: None,
        }
    }

    pub fn degraded(feed_type: FeedType, code: &str, message: impl Into<String>) -> Self {
        Self {
            feed_type,
            data: Value::Null,
            seq: None,
            error: Some(FeedFault {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}
