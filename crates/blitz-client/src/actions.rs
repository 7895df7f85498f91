use crate::store::FeedStore;
use blitz_core::payloads::{ActionAccepted, AppAction};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unknown app: {0}")]
    UnknownApp(String),
    #[error("{action} {app_id} rejected ({status}): {detail}")]
    Rejected {
        app_id: String,
        action: &'static str,
        status: u16,
        detail: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: String,
}

/// Install and uninstall calls against the hub. Results come back on the
/// feed; a returned error is the only synchronous failure path.
pub struct AppActions {
    http: reqwest::Client,
    base_url: String,
    store: Arc<FeedStore>,
}

impl AppActions {
    pub fn new(base_url: impl Into<String>, store: Arc<FeedStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
        }
    }

    pub async fn install(&self, app_id: &str) -> Result<ActionAccepted, ActionError> {
        let accepted = self.send(app_id, AppAction::Install, None).await?;
        self.store.begin_install(app_id);
        Ok(accepted)
    }

    pub async fn uninstall(
        &self,
        app_id: &str,
        keep_data: bool,
    ) -> Result<ActionAccepted, ActionError> {
        let body = serde_json::json!({ "keepData": keep_data });
        let accepted = self.send(app_id, AppAction::Uninstall, Some(body)).await?;
        self.store.begin_action(app_id, AppAction::Uninstall);
        Ok(accepted)
    }

    async fn send(
        &self,
        app_id: &str,
        action: AppAction,
        body: Option<serde_json::Value>,
    ) -> Result<ActionAccepted, ActionError> {
        let url = format!("{}/api/v1/apps/{}/{}", self.base_url, action.as_str(), app_id);
        let mut request = self.http.post(&url);
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            let accepted = response.json::<ActionAccepted>().await?;
            info!(event = "app_action_accepted", app = %app_id, action = action.as_str());
            return Ok(accepted);
        }

        let detail = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.detail)
            .unwrap_or_default();
        warn!(
            event = "app_action_rejected",
            app = %app_id,
            action = action.as_str(),
            status = status.as_u16(),
            detail = %detail
        );
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ActionError::UnknownApp(app_id.to_string()));
        }
        Err(ActionError::Rejected {
            app_id: app_id.to_string(),
            action: action.as_str(),
            status: status.as_u16(),
            detail,
        })
    }
}
