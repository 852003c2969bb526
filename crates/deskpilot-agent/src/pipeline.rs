//! Drives one ticket from its creation event to a terminal resolution.

use chrono::Utc;
use deskpilot_contracts::{
    ClosureReason, ExecutionPlan, ProcessingStage, RiskLevel, TicketRecord, TicketState,
};
use deskpilot_kernel::audit::classification_fields;
use deskpilot_kernel::messages::{
    account_not_found, compose_resolution, rejection_message, with_suggestion, IGNORED,
    NOT_AUTHORIZED, UNEXPECTED_ERROR,
};
use deskpilot_kernel::{
    assess, authorize, reconcile, validate_ticket, Rejection, SecurityIndicators, ValidTicket,
    ValidationLimits, ValidationReport,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::categories::CategoryCache;
use crate::classifier::ClassificationAdapter;
use crate::executor::{ActionExecutor, ExecutionReport, Halt};
use crate::ledger::{Terminal, TicketLedger};
use crate::rate_limit::RateLimiter;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("audit encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How a ticket left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not eligible for automation; nothing was written.
    Skipped,
    Closed(ClosureReason),
    /// Processing failed and the ticket was closed with the generic error text.
    Failed,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub limits: ValidationLimits,
    pub indicators: SecurityIndicators,
}

pub struct Pipeline {
    ledger: TicketLedger,
    categories: CategoryCache,
    rate_limiter: RateLimiter,
    classifier: ClassificationAdapter,
    executor: ActionExecutor,
    settings: PipelineSettings,
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

fn rejected(rejection: &Rejection, details: Vec<String>) -> Terminal {
    Terminal::new(
        ClosureReason::Rejected,
        ProcessingStage::Rejected,
        rejection.reason_code(),
        rejection_message(rejection),
    )
    .with_audit(object(json!({
        "rejection": {
            "reason_code": rejection.reason_code(),
            "details": details,
            "rejected_at": Utc::now().to_rfc3339(),
        }
    })))
}

fn ignored(reason: &str) -> Terminal {
    Terminal::new(ClosureReason::Ignored, ProcessingStage::Ignored, reason, IGNORED).with_audit(
        object(json!({
            "ignored": true,
            "ignore_reason": reason,
            "requires_human_review": true,
            "auto_processing_skipped": true,
            "ignored_at": Utc::now().to_rfc3339(),
        })),
    )
}

/// Turns the executor's report into the terminal outcome. Sentences for
/// actions that completed are kept even when execution halted later.
pub fn execution_terminal(plan: &ExecutionPlan, report: &ExecutionReport) -> Result<Terminal, serde_json::Error> {
    let primary = plan.primary.app;
    let secondary = plan.secondary.as_ref().map(|s| s.app);
    let completed = report
        .any_succeeded()
        .then(|| compose_resolution(primary, secondary, &report.outcomes));
    let prefixed = |message: String| match &completed {
        Some(done) => format!("{done}\n\n{message}"),
        None => message,
    };

    let mut audit = Map::new();
    audit.insert("executed_actions".to_string(), serde_json::to_value(&report.outcomes)?);
    audit.insert(
        "execution_completed_at".to_string(),
        json!(Utc::now().to_rfc3339()),
    );

    let terminal = match &report.halt {
        Some(Halt::AccountNotFound { app, account }) => {
            audit.insert(
                "error".to_string(),
                json!({"code": "account_not_found", "app": app, "account": account}),
            );
            Terminal::new(
                ClosureReason::Rejected,
                ProcessingStage::Rejected,
                "account_not_found",
                prefixed(account_not_found(*app, account)),
            )
        }
        Some(Halt::LookupFailed { app, error }) => {
            audit.insert(
                "error".to_string(),
                json!({"code": "account_lookup_failed", "app": app, "cause": error}),
            );
            Terminal::new(
                ClosureReason::Error,
                ProcessingStage::Error,
                "account_lookup_failed",
                prefixed(with_suggestion(&error.user_message, error.action_suggestion.as_deref())),
            )
        }
        None => match (completed, report.first_failure()) {
            (Some(text), failure) => Terminal::new(
                ClosureReason::Resolved,
                ProcessingStage::Completed,
                if failure.is_some() { "partially_resolved" } else { "resolved" },
                text,
            ),
            (None, Some(failure)) => {
                audit.insert("error".to_string(), json!({"code": "actions_failed", "cause": failure}));
                Terminal::new(
                    ClosureReason::Error,
                    ProcessingStage::Error,
                    "actions_failed",
                    with_suggestion(&failure.user_message, failure.action_suggestion.as_deref()),
                )
            }
            (None, None) => Terminal::new(
                ClosureReason::Resolved,
                ProcessingStage::Completed,
                "resolved",
                compose_resolution(primary, secondary, &report.outcomes),
            ),
        },
    };
    Ok(terminal.with_audit(audit))
}

impl Pipeline {
    pub fn new(
        ledger: TicketLedger,
        categories: CategoryCache,
        rate_limiter: RateLimiter,
        classifier: ClassificationAdapter,
        executor: ActionExecutor,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger,
            categories,
            rate_limiter,
            classifier,
            executor,
            settings,
        }
    }

    /// Never fails: any internal error closes the ticket with the generic
    /// unexpected-error resolution.
    pub async fn process(&self, record: TicketRecord) -> Disposition {
        let ticket_id = record.id;
        match self.run(record).await {
            Ok(disposition) => disposition,
            Err(e) => {
                tracing::error!(ticket_id, error = %e, "pipeline failed");
                if let Some(id) = ticket_id.filter(|id| *id > 0) {
                    self.resolve_unexpected(id, &e.to_string()).await;
                }
                Disposition::Failed
            }
        }
    }

    /// Last-resort close. A ticket that is already resolved is left alone.
    pub async fn resolve_unexpected(&self, ticket_id: i64, detail: &str) {
        let terminal = Terminal::new(
            ClosureReason::Error,
            ProcessingStage::Error,
            "unexpected_error",
            UNEXPECTED_ERROR,
        )
        .with_audit(object(json!({
            "error": {"code": "unexpected_error", "detail": detail}
        })));
        match self.ledger.resolve(ticket_id, terminal).await {
            Ok(_) => {}
            Err(StoreError::Immutable(_)) => {
                tracing::warn!(ticket_id, "ticket already resolved, unexpected error not recorded");
            }
            Err(e) => tracing::error!(ticket_id, error = %e, "could not close ticket after failure"),
        }
    }

    async fn close(&self, ticket_id: i64, terminal: Terminal) -> Result<Disposition, PipelineError> {
        let closure = terminal.closure;
        self.ledger.resolve(ticket_id, terminal).await?;
        Ok(Disposition::Closed(closure))
    }

    async fn reject(&self, ticket_id: i64, report: ValidationReport) -> Result<Disposition, PipelineError> {
        let rejection = report.primary().cloned().unwrap_or(Rejection::InvalidData);
        tracing::info!(
            ticket_id,
            reason = rejection.reason_code(),
            details = ?report.reasons(),
            "ticket rejected"
        );
        self.close(ticket_id, rejected(&rejection, report.reasons())).await
    }

    /// The event only triggers processing. Everything downstream reads the
    /// stored row returned by the claim.
    async fn run(&self, trigger: TicketRecord) -> Result<Disposition, PipelineError> {
        let Some(ticket_id) = trigger.id.filter(|id| *id > 0) else {
            tracing::warn!(id = ?trigger.id, "event without a usable ticket id dropped");
            return Ok(Disposition::Skipped);
        };
        if let Some(state) = trigger.state.as_deref().and_then(TicketState::parse) {
            if state != TicketState::Pending {
                tracing::debug!(ticket_id, state = state.as_str(), "ticket not pending, skipped");
                return Ok(Disposition::Skipped);
            }
        }
        let stored = match self.ledger.claim(ticket_id).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => return Ok(Disposition::Skipped),
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(ticket_id, "event for unknown ticket dropped");
                return Ok(Disposition::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        let record = TicketRecord::from(&stored);
        if trigger.requester != record.requester
            || trigger.category_code != record.category_code
            || trigger.description != record.description
        {
            tracing::warn!(ticket_id, "event payload differs from the stored ticket, stored row used");
        }
        tracing::info!(
            ticket_id,
            category = record.category_code,
            description_len = record.description.as_deref().map(|d| d.chars().count()),
            "processing ticket"
        );

        let now = Utc::now();
        let ticket = match validate_ticket(&record, &self.settings.limits, now) {
            Ok(t) => t,
            Err(report) => return self.reject(ticket_id, report).await,
        };
        if !self.categories.exists(ticket.category.code()).await {
            return self
                .reject(
                    ticket_id,
                    ValidationReport::single(
                        Rejection::InvalidCategory,
                        format!("category {} is not in the reference table", ticket.category.code()),
                    ),
                )
                .await;
        }

        let assessment = assess(&ticket.description, &self.settings.indicators);
        if !assessment.is_safe() {
            tracing::warn!(
                ticket_id,
                risk = ?assessment.risk,
                score = assessment.score,
                "unsafe description rejected"
            );
            let terminal = rejected(&Rejection::SecurityRisk, Vec::new()).with_audit(object(json!({
                "security": serde_json::to_value(&assessment)?
            })));
            return self.close(ticket_id, terminal).await;
        }

        let quota = self.rate_limiter.check(&ticket.requester, ticket_id, now).await;
        if !quota.within_limit {
            tracing::info!(
                ticket_id,
                current = quota.current_count,
                limit = quota.limit,
                "requester over quota"
            );
            let terminal = rejected(&Rejection::RateLimited(quota.clone()), Vec::new())
                .with_audit(object(json!({ "rate_limit": serde_json::to_value(&quota)? })));
            return self.close(ticket_id, terminal).await;
        }

        self.ledger.mark_validated(ticket_id).await?;
        self.automate(ticket_id, &ticket, assessment.risk).await
    }

    async fn automate(
        &self,
        ticket_id: i64,
        ticket: &ValidTicket,
        risk: RiskLevel,
    ) -> Result<Disposition, PipelineError> {
        let mut extra = Map::new();
        extra.insert("security_risk".to_string(), serde_json::to_value(risk)?);
        self.ledger
            .progress(
                ticket_id,
                ProcessingStage::Classifying,
                ProcessingStage::Classifying.base_percent(),
                extra,
            )
            .await?;

        let report = match self
            .classifier
            .classify(ticket_id, &ticket.description, ticket.category)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(ticket_id, error = %e, "no automatic classification possible");
                return self.close(ticket_id, ignored("fallback_unavailable")).await;
            }
        };
        let result = &report.result;
        let reconciliation = reconcile(ticket.category, result.app_type());
        let effective = reconciliation.corrected.unwrap_or(ticket.category);

        let mut fields = classification_fields(ticket.category, result, &reconciliation);
        fields.insert("prompt_variant".to_string(), serde_json::to_value(report.variant)?);
        fields.insert("classifier_attempts".to_string(), json!(report.attempts));
        if let Some(failure) = &report.failure {
            fields.insert(
                "classifier_failure".to_string(),
                json!({"code": failure.reason_code(), "detail": failure.to_string()}),
            );
        }

        if reconciliation.corrected.is_some() && !self.categories.exists(effective.code()).await {
            self.ledger.record_classification(ticket_id, None, fields).await?;
            return self
                .close(ticket_id, ignored("corrected_category_unavailable"))
                .await;
        }
        self.ledger
            .record_classification(ticket_id, reconciliation.corrected, fields)
            .await?;

        self.ledger
            .progress(
                ticket_id,
                ProcessingStage::Validating,
                ProcessingStage::Validating.base_percent(),
                Map::new(),
            )
            .await?;
        let authorization = match authorize(
            result,
            &ticket.requester,
            effective.app_type(),
            &ticket.description,
        ) {
            Ok(a) => a,
            Err(errors) => {
                tracing::warn!(ticket_id, ?errors, "execution not authorized");
                let terminal = Terminal::new(
                    ClosureReason::Rejected,
                    ProcessingStage::Rejected,
                    "authorization_failed",
                    NOT_AUTHORIZED,
                )
                .with_audit(object(json!({ "authorization_errors": errors })));
                return self.close(ticket_id, terminal).await;
            }
        };
        for warning in &authorization.warnings {
            tracing::warn!(ticket_id, warning = %warning, "authorization warning");
        }

        let plan = authorization.plan;
        let mut extra = Map::new();
        extra.insert("execution_plan".to_string(), serde_json::to_value(&plan)?);
        if !authorization.warnings.is_empty() {
            extra.insert(
                "authorization_warnings".to_string(),
                json!(authorization.warnings),
            );
        }
        self.ledger
            .progress(
                ticket_id,
                ProcessingStage::ExecutingActions,
                ProcessingStage::ExecutingActions.base_percent(),
                extra,
            )
            .await?;

        let execution = self
            .executor
            .execute(ticket_id, &plan, &self.ledger.execution_progress(ticket_id))
            .await;
        let terminal = execution_terminal(&plan, &execution)?;
        self.close(ticket_id, terminal).await
    }
}
