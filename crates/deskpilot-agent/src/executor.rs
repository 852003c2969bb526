use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deskpilot_contracts::{
    ActionErrorKind, ActionOutcome, ActionRequest, ActionResponse, AppPlan, AppRole, AppType,
    DownstreamAction, ExecutionPlan, OutcomeError, Redacted, REDACTION_MARKER,
};
use serde_json::Value;

use crate::actions::{endpoint_for, ActionError, ActionService};
use crate::retry::{retry_with_backoff, Backoff};

/// Receives execution progress. Implemented by the ledger for live updates.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn action_finished(&self, done: usize, total: usize, outcome: &ActionOutcome);
}

/// Why execution stopped early.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    AccountNotFound { app: AppType, account: String },
    LookupFailed { app: AppType, error: OutcomeError },
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub outcomes: Vec<ActionOutcome>,
    pub halt: Option<Halt>,
}

impl ExecutionReport {
    pub fn any_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.success && o.action_type != DownstreamAction::FindUser)
    }

    pub fn first_failure(&self) -> Option<&OutcomeError> {
        self.outcomes.iter().find_map(|o| o.error.as_ref())
    }
}

pub struct ActionExecutor {
    service: Arc<dyn ActionService>,
    backoff: Backoff,
}

fn is_secret_key(key: &str) -> bool {
    key.to_ascii_lowercase().contains("password")
}

/// Replaces every password-like value so result payloads can be audited.
pub fn scrub_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_secret_key(k) && !v.is_null() {
                        Value::String(REDACTION_MARKER.to_string())
                    } else {
                        scrub_secrets(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(scrub_secrets).collect()),
        other => other.clone(),
    }
}

fn credential_from(response: &ActionResponse) -> Option<Redacted> {
    response
        .generated_password
        .clone()
        .or_else(|| {
            ["generated_password", "password", "new_password"]
                .iter()
                .find_map(|k| response.result.get(*k).and_then(Value::as_str).map(str::to_string))
        })
        .filter(|p| !p.is_empty())
        .map(Redacted::new)
}

fn lookup_found(response: &ActionResponse) -> bool {
    response
        .result
        .get("found")
        .and_then(Value::as_bool)
        .unwrap_or(response.success)
}

impl ActionExecutor {
    pub fn new(service: Arc<dyn ActionService>, backoff: Backoff) -> Self {
        Self { service, backoff }
    }

    async fn call(
        &self,
        ticket_id: i64,
        role: AppRole,
        app: AppType,
        request: ActionRequest,
    ) -> (ActionOutcome, Option<ActionResponse>) {
        let endpoint = endpoint_for(app);
        tracing::info!(
            ticket_id,
            app = app.as_str(),
            action = request.action_type.as_str(),
            user_id = %request.user_id,
            "invoking action service"
        );
        let result = retry_with_backoff(self.backoff, ActionError::is_transient, |attempt| {
            let request = &request;
            async move {
                if attempt > 1 {
                    tracing::warn!(ticket_id, attempt, "retrying action call");
                }
                self.service.execute(app, request).await
            }
        })
        .await;

        let mut outcome = ActionOutcome {
            app_role: role,
            app,
            action_type: request.action_type,
            endpoint,
            success: false,
            result: Value::Null,
            message: None,
            credential: None,
            error: None,
            executed_at: Utc::now(),
        };
        match result {
            Ok(response) => {
                outcome.success = response.success;
                outcome.result = scrub_secrets(&response.result);
                outcome.message = response.message.clone();
                outcome.credential = credential_from(&response);
                if !response.success {
                    outcome.error = Some(OutcomeError {
                        kind: ActionErrorKind::Execution,
                        user_message: response
                            .message
                            .clone()
                            .unwrap_or_else(|| "The action could not be completed.".to_string()),
                        action_suggestion: None,
                        status: None,
                        technical_detail: None,
                    });
                }
                tracing::info!(
                    ticket_id,
                    app = app.as_str(),
                    action = request.action_type.as_str(),
                    success = response.success,
                    credential = ?outcome.credential,
                    "action completed"
                );
                (outcome, Some(response))
            }
            Err(err) => {
                tracing::error!(
                    ticket_id,
                    app = app.as_str(),
                    action = request.action_type.as_str(),
                    kind = ?err.kind,
                    status = err.status,
                    detail = err.technical_detail.as_deref().unwrap_or(""),
                    "action failed"
                );
                outcome.error = Some(err.to_outcome_error());
                (outcome, None)
            }
        }
    }

    /// Runs one application's actions. Returns `Some(halt)` when the mandatory
    /// account lookup did not succeed.
    async fn run_app(
        &self,
        ticket_id: i64,
        role: AppRole,
        app_plan: &AppPlan,
        plan: &ExecutionPlan,
        report: &mut ExecutionReport,
        progress: &dyn ProgressSink,
        total: usize,
    ) -> Option<Halt> {
        let app = app_plan.app;
        let user_name = if app.requires_account_lookup() {
            plan.account_name.clone()
        } else {
            None
        };

        if app.requires_account_lookup() {
            let account = user_name.clone().unwrap_or_else(|| plan.user_id.clone());
            let (outcome, response) = self
                .call(
                    ticket_id,
                    role,
                    app,
                    ActionRequest {
                        user_id: plan.user_id.clone(),
                        action_type: DownstreamAction::FindUser,
                        user_name: Some(account.clone()),
                    },
                )
                .await;
            let halt = match (&response, &outcome.error) {
                (Some(r), _) if r.success && lookup_found(r) => None,
                (Some(r), _) if r.success => Some(Halt::AccountNotFound { app, account }),
                (_, Some(err)) => Some(Halt::LookupFailed {
                    app,
                    error: err.clone(),
                }),
                _ => Some(Halt::AccountNotFound { app, account }),
            };
            report.outcomes.push(outcome);
            if let Some(last) = report.outcomes.last() {
                progress.action_finished(report.outcomes.len(), total, last).await;
            }
            if halt.is_some() {
                return halt;
            }
        }

        for action in app_plan
            .actions
            .iter()
            .filter(|a| **a != DownstreamAction::FindUser)
        {
            let (outcome, _) = self
                .call(
                    ticket_id,
                    role,
                    app,
                    ActionRequest {
                        user_id: plan.user_id.clone(),
                        action_type: *action,
                        user_name: user_name.clone(),
                    },
                )
                .await;
            report.outcomes.push(outcome);
            if let Some(last) = report.outcomes.last() {
                progress.action_finished(report.outcomes.len(), total, last).await;
            }
        }
        None
    }

    /// Primary application first, then the secondary one. Sibling actions
    /// tolerate each other's failures; a failed lookup stops everything.
    pub async fn execute(
        &self,
        ticket_id: i64,
        plan: &ExecutionPlan,
        progress: &dyn ProgressSink,
    ) -> ExecutionReport {
        let count = |p: &AppPlan| {
            p.actions
                .iter()
                .filter(|a| **a != DownstreamAction::FindUser)
                .count()
                + usize::from(p.app.requires_account_lookup())
        };
        let total = count(&plan.primary) + plan.secondary.as_ref().map(count).unwrap_or(0);

        let mut report = ExecutionReport::default();
        let mut apps = vec![(AppRole::Primary, &plan.primary)];
        if let Some(secondary) = &plan.secondary {
            apps.push((AppRole::Secondary, secondary));
        }
        for (role, app_plan) in apps {
            if let Some(halt) = self
                .run_app(ticket_id, role, app_plan, plan, &mut report, progress, total)
                .await
            {
                tracing::warn!(ticket_id, app = app_plan.app.as_str(), ?halt, "execution halted");
                report.halt = Some(halt);
                break;
            }
        }
        report
    }
}
