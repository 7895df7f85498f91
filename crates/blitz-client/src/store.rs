use blitz_core::payloads::{app_statuses, validate_payload, AppAction, AppStatus};
use blitz_core::{FeedFault, FeedMessage, FeedType};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Latest state of one feed as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSlice {
    pub data: Value,
    pub seq: Option<u64>,
    pub received_at: DateTime<Utc>,
    /// Set after a disconnect until the feed delivers again.
    pub stale: bool,
    /// Set while the server reports the feed's upstream as failing.
    pub fault: Option<FeedFault>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppView {
    pub status: AppStatus,
    pub installing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Updated,
    Degraded,
    Duplicate,
    /// `data` does not fit the feed's payload type; the slice is untouched.
    Rejected,
}

pub type AppMap = BTreeMap<String, AppView>;

const FEED_COUNT: usize = FeedType::ALL.len();

/// Demultiplexes the single subscription into one watch channel per feed.
pub struct FeedStore {
    slices: [watch::Sender<Option<FeedSlice>>; FEED_COUNT],
    last_seq: Mutex<BTreeMap<FeedType, u64>>,
    apps: watch::Sender<AppMap>,
}

impl Default for FeedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedStore {
    pub fn new() -> Self {
        Self {
            slices: std::array::from_fn(|_| watch::channel(None).0),
            last_seq: Mutex::new(BTreeMap::new()),
            apps: watch::channel(AppMap::new()).0,
        }
    }

    fn sender(&self, feed_type: FeedType) -> &watch::Sender<Option<FeedSlice>> {
        &self.slices[feed_type as usize]
    }

    pub fn apply(&self, message: FeedMessage) -> ApplyOutcome {
        let feed_type = message.feed_type;
        if message.error.is_none() {
            if let Err(err) = validate_payload(feed_type, &message.data) {
                warn!(
                    event = "stream_decode_error",
                    feed = %feed_type,
                    seq = ?message.seq,
                    error = %err
                );
                return ApplyOutcome::Rejected;
            }
        }
        if let Some(seq) = message.seq {
            let mut last_seq = self.last_seq.lock().unwrap_or_else(PoisonError::into_inner);
            let last = last_seq.entry(feed_type).or_insert(0);
            if seq <= *last {
                debug!(event = "feed_duplicate", feed = %feed_type, seq, last = *last);
                return ApplyOutcome::Duplicate;
            }
            *last = seq;
        }

        let now = Utc::now();
        if let Some(fault) = message.error {
            warn!(
                event = "feed_degraded",
                feed = %feed_type,
                code = %fault.code,
                message = %fault.message
            );
            self.sender(feed_type).send_modify(|slice| match slice {
                Some(slice) => {
                    slice.seq = message.seq;
                    slice.fault = Some(fault);
                }
                None => {
                    *slice = Some(FeedSlice {
                        data: message.data,
                        seq: message.seq,
                        received_at: now,
                        stale: false,
                        fault: Some(fault),
                    });
                }
            });
            return ApplyOutcome::Degraded;
        }

        if feed_type == FeedType::InstalledAppStatus {
            self.merge_apps(&message.data);
        }
        self.sender(feed_type).send_replace(Some(FeedSlice {
            data: message.data,
            seq: message.seq,
            received_at: now,
            stale: false,
            fault: None,
        }));
        ApplyOutcome::Updated
    }

    fn merge_apps(&self, data: &Value) {
        let statuses = match app_statuses(data) {
            Ok(statuses) => statuses,
            Err(err) => {
                warn!(event = "app_status_malformed", error = %err);
                return;
            }
        };
        self.apps.send_modify(|apps| {
            for status in statuses {
                let installing = status.reports_installing();
                apps.insert(status.id.clone(), AppView { status, installing });
            }
        });
    }

    /// Marks an app as installing right after the action was accepted. The
    /// next status update for that app decides the flag again.
    pub fn begin_install(&self, app_id: &str) {
        self.begin_action(app_id, AppAction::Install);
    }

    /// Sets the installing flag for an accepted action unless a status update
    /// already showed the action finished.
    pub fn begin_action(&self, app_id: &str, action: AppAction) {
        self.apps.send_if_modified(|apps| {
            let finished = apps.get(app_id).is_some_and(|view| match action {
                AppAction::Install => view.status.installed,
                AppAction::Uninstall => !view.status.installed,
            });
            if finished {
                debug!(event = "app_action_already_done", app = %app_id, action = action.as_str());
                return false;
            }
            apps.entry(app_id.to_string())
                .or_insert_with(|| AppView {
                    status: AppStatus {
                        id: app_id.to_string(),
                        installed: action == AppAction::Uninstall,
                        ..AppStatus::default()
                    },
                    installing: false,
                })
                .installing = true;
            true
        });
    }

    /// Flags every slice stale and forgets the seq history, since a new
    /// server process numbers its feeds from 1 again.
    pub fn mark_all_stale(&self) {
        for sender in &self.slices {
            sender.send_if_modified(|slice| match slice {
                Some(slice) if !slice.stale => {
                    slice.stale = true;
                    true
                }
                _ => false,
            });
        }
        self.last_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn feed(&self, feed_type: FeedType) -> FeedHandle {
        FeedHandle {
            feed_type,
            rx: self.sender(feed_type).subscribe(),
        }
    }

    pub fn apps(&self) -> watch::Receiver<AppMap> {
        self.apps.subscribe()
    }

    pub fn app(&self, app_id: &str) -> Option<AppView> {
        self.apps.borrow().get(app_id).cloned()
    }
}

/// Read side of a single feed, for consumers that care about nothing else.
#[derive(Clone)]
pub struct FeedHandle {
    feed_type: FeedType,
    rx: watch::Receiver<Option<FeedSlice>>,
}

impl FeedHandle {
    pub fn feed_type(&self) -> FeedType {
        self.feed_type
    }

    pub fn get(&self) -> Option<FeedSlice> {
        self.rx.borrow().clone()
    }

    /// Decodes the current data into a typed payload. `None` before the feed
    /// first delivered.
    pub fn get_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.rx
            .borrow()
            .as_ref()
            .map(|slice| serde_json::from_value(slice.data.clone()))
    }

    /// Waits for the next change of this slice.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }
}
