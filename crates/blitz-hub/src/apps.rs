use crate::producers::FeedScheduler;
use crate::sources::NodeModel;
use crate::HubState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
pub use blitz_core::payloads::{ActionAccepted, AppAction};
use blitz_core::FeedType;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JobRejection {
    #[error("unknown app")]
    UnknownApp,
    #[error("another job is running for this app")]
    Busy,
    #[error("app is already installed")]
    AlreadyInstalled,
    #[error("app is not installed")]
    NotInstalled,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown app: {0}")]
    UnknownApp(String),
    #[error("cannot {action} {app_id}: {reason}")]
    Conflict {
        app_id: String,
        action: &'static str,
        reason: JobRejection,
    },
}

impl ActionError {
    fn rejected(app_id: &str, action: AppAction, reason: JobRejection) -> Self {
        match reason {
            JobRejection::UnknownApp => ActionError::UnknownApp(app_id.to_string()),
            reason => ActionError::Conflict {
                app_id: app_id.to_string(),
                action: action.as_str(),
                reason,
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ActionError::UnknownApp(_) => StatusCode::NOT_FOUND,
            ActionError::Conflict { .. } => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for ActionError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// Starts install and uninstall jobs. Progress is reported only through the
/// `InstalledAppStatus` feed; `start` returns as soon as the job is accepted.
pub trait InstallJobs: Send + Sync {
    fn start(&self, app_id: &str, action: AppAction, keep_data: bool) -> Result<(), ActionError>;
}

pub struct SimulatedInstallJobs {
    model: Arc<NodeModel>,
    scheduler: Arc<FeedScheduler>,
    delay: Duration,
}

impl SimulatedInstallJobs {
    pub fn new(model: Arc<NodeModel>, scheduler: Arc<FeedScheduler>, delay: Duration) -> Self {
        Self {
            model,
            scheduler,
            delay,
        }
    }
}

impl InstallJobs for SimulatedInstallJobs {
    fn start(&self, app_id: &str, action: AppAction, keep_data: bool) -> Result<(), ActionError> {
        self.model
            .begin_job(app_id, action)
            .map_err(|reason| ActionError::rejected(app_id, action, reason))?;
        info!(event = "app_job_start", app = %app_id, action = action.as_str());
        self.scheduler.trigger(FeedType::InstalledAppStatus);

        let model = Arc::clone(&self.model);
        let scheduler = Arc::clone(&self.scheduler);
        let delay = self.delay;
        let app_id = app_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match model.finish_job(&app_id, keep_data) {
                Some(action) => {
                    info!(event = "app_job_done", app = %app_id, action = action.as_str())
                }
                None => warn!(event = "app_job_missing", app = %app_id),
            }
            scheduler.trigger(FeedType::InstalledAppStatus);
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallRequest {
    #[serde(default)]
    pub keep_data: bool,
}

pub(crate) async fn install_app(
    State(hub): State<Arc<HubState>>,
    Path(app_id): Path<String>,
) -> Result<(StatusCode, Json<ActionAccepted>), ActionError> {
    hub.jobs.start(&app_id, AppAction::Install, true)?;
    Ok(accepted(app_id, AppAction::Install))
}

pub(crate) async fn uninstall_app(
    State(hub): State<Arc<HubState>>,
    Path(app_id): Path<String>,
    body: Option<Json<UninstallRequest>>,
) -> Result<(StatusCode, Json<ActionAccepted>), ActionError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    hub.jobs
        .start(&app_id, AppAction::Uninstall, request.keep_data)?;
    Ok(accepted(app_id, AppAction::Uninstall))
}

fn accepted(id: String, action: AppAction) -> (StatusCode, Json<ActionAccepted>) {
    (StatusCode::ACCEPTED, Json(ActionAccepted { id, action }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Broadcaster;
    use crate::producers::FeedProducer;
    use crate::registry::{tests::FakeTransport, ClientRegistry};
    use crate::sources::NodeSource;
    use blitz_core::payloads::app_statuses;

    fn jobs_with_consumer() -> (SimulatedInstallJobs, Arc<NodeModel>, Arc<FakeTransport>) {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let consumer = Arc::new(FakeTransport::default());
        registry.register(consumer.clone()).expect("register");

        let model = Arc::new(NodeModel::with_apps(["lnd", "rtl"]));
        let producer = FeedProducer::new(
            Arc::new(NodeSource::new(
                FeedType::InstalledAppStatus,
                Arc::clone(&model),
            )),
            broadcaster,
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        let scheduler = Arc::new(FeedScheduler::new([Arc::new(producer)]));
        let jobs = SimulatedInstallJobs::new(Arc::clone(&model), scheduler, Duration::from_secs(3));
        (jobs, model, consumer)
    }

    fn lnd_flags(consumer: &FakeTransport) -> Vec<(bool, bool)> {
        consumer
            .messages()
            .iter()
            .filter_map(|message| app_statuses(&message.data).ok())
            .filter_map(|apps| apps.into_iter().find(|app| app.id == "lnd"))
            .map(|app| (app.installing, app.installed))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn install_reports_progress_through_the_feed() {
        let (jobs, model, consumer) = jobs_with_consumer();
        jobs.start("lnd", AppAction::Install, true).expect("accepted");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lnd_flags(&consumer), vec![(true, false)]);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(lnd_flags(&consumer), vec![(true, false), (false, true)]);
        assert_eq!(
            model.app_status("lnd").map(|app| app.status),
            Some("online".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_unknown_and_conflicting_jobs() {
        let (jobs, _model, _consumer) = jobs_with_consumer();
        let err = jobs
            .start("nope", AppAction::Install, true)
            .expect_err("unknown");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = jobs
            .start("rtl", AppAction::Uninstall, false)
            .expect_err("not installed");
        assert_eq!(err.status(), StatusCode::CONFLICT);

        jobs.start("rtl", AppAction::Install, true).expect("accepted");
        let err = jobs
            .start("rtl", AppAction::Install, true)
            .expect_err("busy");
        assert!(matches!(
            err,
            ActionError::Conflict {
                reason: JobRejection::Busy,
                ..
            }
        ));
    }
}
