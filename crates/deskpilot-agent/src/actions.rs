//! Client for the downstream action service: one `execute-action` endpoint
//! per application, authenticated with a pre-shared key.

use std::time::Duration;

use async_trait::async_trait;
use deskpilot_contracts::{
    ActionErrorBody, ActionErrorKind, ActionRequest, ActionResponse, AppType, OutcomeError,
};
use deskpilot_kernel::messages::status_fallback_message;
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {user_message}")]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub user_message: String,
    pub action_suggestion: Option<String>,
    pub status: Option<u16>,
    pub technical_detail: Option<String>,
}

impl ActionError {
    pub fn connection(user_message: &str, detail: impl Into<String>) -> Self {
        Self {
            kind: ActionErrorKind::Connection,
            user_message: user_message.to_string(),
            action_suggestion: Some("Your request will be retried automatically.".to_string()),
            status: None,
            technical_detail: Some(detail.into()),
        }
    }

    /// Structured body fields win; otherwise the text is derived from the
    /// status code alone.
    pub fn from_status(status: u16, body: Option<ActionErrorBody>) -> Self {
        let kind = match status {
            400 => ActionErrorKind::InvalidAction,
            401 => ActionErrorKind::Authentication,
            _ => ActionErrorKind::Execution,
        };
        let (fallback_message, fallback_suggestion) = status_fallback_message(status);
        let body = body.unwrap_or_default();
        Self {
            kind,
            user_message: body
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| fallback_message.to_string()),
            action_suggestion: body
                .action_suggestion
                .or_else(|| Some(fallback_suggestion.to_string())),
            status: Some(status),
            technical_detail: body.detail.map(|d| match d {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
        }
    }

    /// Only transport-level failures are worth another attempt; HTTP errors
    /// are classified immediately.
    pub fn is_transient(&self) -> bool {
        self.kind == ActionErrorKind::Connection
    }

    pub fn to_outcome_error(&self) -> OutcomeError {
        OutcomeError {
            kind: self.kind,
            user_message: self.user_message.clone(),
            action_suggestion: self.action_suggestion.clone(),
            status: self.status,
            technical_detail: self.technical_detail.clone(),
        }
    }
}

pub fn endpoint_for(app: AppType) -> String {
    format!("/api/apps/{}/execute-action", app.as_str())
}

#[async_trait]
pub trait ActionService: Send + Sync {
    async fn execute(&self, app: AppType, request: &ActionRequest) -> Result<ActionResponse, ActionError>;
}

/// Pooled client shared by every ticket task.
pub struct HttpActionService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpActionService {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ActionService for HttpActionService {
    async fn execute(&self, app: AppType, request: &ActionRequest) -> Result<ActionResponse, ActionError> {
        let url = format!("{}{}", self.base_url, endpoint_for(app));
        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ActionError::connection("The request took too long to process.", e.to_string())
                } else if e.is_connect() {
                    ActionError::connection(
                        "Could not connect to the system. The service may be temporarily unavailable.",
                        e.to_string(),
                    )
                } else {
                    ActionError::connection(
                        "An error occurred while communicating with the system.",
                        e.to_string(),
                    )
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<ActionErrorBody>().await.ok();
            return Err(ActionError::from_status(status.as_u16(), body));
        }
        response.json::<ActionResponse>().await.map_err(|e| ActionError {
            kind: ActionErrorKind::Execution,
            user_message: "The system returned an invalid response.".to_string(),
            action_suggestion: Some("Your request will be retried automatically.".to_string()),
            status: Some(status.as_u16()),
            technical_detail: Some(e.to_string()),
        })
    }
}
