//! The single writer of ticket state. Every other component reports what it
//! decided; the ledger turns that into store updates and audit records.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deskpilot_contracts::{
    ActionOutcome, Category, ClosureReason, ProcessingStage, Ticket, TicketState, TicketUpdate,
};
use deskpilot_kernel::audit::{execution_percent, progress_fields};
use serde_json::{json, Map, Value};

use crate::audit::{AuditJsonl, AuditRecord};
use crate::executor::ProgressSink;
use crate::store::{StoreError, TicketStore};

/// A terminal outcome ready to be written.
#[derive(Debug, Clone)]
pub struct Terminal {
    pub closure: ClosureReason,
    pub stage: ProcessingStage,
    pub reason_code: String,
    /// Requester-facing text. May carry a generated credential, so it only
    /// goes to the ticket, never to logs or the decision log.
    pub resolution: String,
    pub audit: Map<String, Value>,
}

impl Terminal {
    pub fn new(
        closure: ClosureReason,
        stage: ProcessingStage,
        reason_code: impl Into<String>,
        resolution: impl Into<String>,
    ) -> Self {
        Self {
            closure,
            stage,
            reason_code: reason_code.into(),
            resolution: resolution.into(),
            audit: Map::new(),
        }
    }

    pub fn with_audit(mut self, audit: Map<String, Value>) -> Self {
        self.audit.extend(audit);
        self
    }
}

pub struct TicketLedger {
    store: Arc<dyn TicketStore>,
    resolver_id: String,
    audit: Arc<AuditJsonl>,
}

impl TicketLedger {
    pub fn new(store: Arc<dyn TicketStore>, resolver_id: String, audit: Arc<AuditJsonl>) -> Self {
        Self {
            store,
            resolver_id,
            audit,
        }
    }

    /// Takes a pending ticket for this worker and returns the stored row.
    /// `None` means another delivery got there first.
    pub async fn claim(&self, ticket_id: i64) -> Result<Option<Ticket>, StoreError> {
        let mut audit = Map::new();
        audit.insert(
            "processing_started_at".to_string(),
            json!(Utc::now().to_rfc3339()),
        );
        let claimed = self.store.claim(ticket_id, audit).await?;
        if claimed.is_none() {
            tracing::debug!(ticket_id, "ticket already taken");
        }
        Ok(claimed)
    }

    pub async fn mark_validated(&self, ticket_id: i64) -> Result<(), StoreError> {
        self.progress(
            ticket_id,
            ProcessingStage::Validated,
            ProcessingStage::Validated.base_percent(),
            Map::new(),
        )
        .await
    }

    pub async fn progress(
        &self,
        ticket_id: i64,
        stage: ProcessingStage,
        percent: u8,
        extra: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut audit = progress_fields(stage, percent, Utc::now());
        audit.extend(extra);
        self.store
            .update(
                ticket_id,
                TicketUpdate {
                    audit: Some(audit),
                    ..TicketUpdate::default()
                },
            )
            .await?;
        tracing::debug!(ticket_id, stage = stage.as_str(), percent, "progress recorded");
        Ok(())
    }

    /// Persists the classification fields and, when the classifier disagreed
    /// with the declared category, the corrected category code.
    pub async fn record_classification(
        &self,
        ticket_id: i64,
        corrected: Option<Category>,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut audit = progress_fields(
            ProcessingStage::Classifying,
            ProcessingStage::Classifying.base_percent(),
            Utc::now(),
        );
        audit.extend(fields);
        self.store
            .update(
                ticket_id,
                TicketUpdate {
                    category_code: corrected.map(Category::code),
                    audit: Some(audit),
                    ..TicketUpdate::default()
                },
            )
            .await?;
        if let Some(category) = corrected {
            tracing::info!(ticket_id, corrected_category = category.code(), "category corrected");
        }
        Ok(())
    }

    pub async fn resolve(&self, ticket_id: i64, terminal: Terminal) -> Result<Ticket, StoreError> {
        let now = Utc::now();
        let mut audit = progress_fields(terminal.stage, 100, now);
        audit.insert("closure_reason".to_string(), json!(terminal.closure.as_str()));
        audit.extend(terminal.audit);

        let ticket = self
            .store
            .update(
                ticket_id,
                TicketUpdate {
                    state: Some(TicketState::Resolved),
                    resolution: Some(terminal.resolution),
                    resolver: Some(self.resolver_id.clone()),
                    resolved_at: Some(now),
                    closed_at: Some(now),
                    closure_reason: Some(terminal.closure),
                    audit: Some(audit),
                    ..TicketUpdate::default()
                },
            )
            .await?;

        tracing::info!(
            ticket_id,
            closure = terminal.closure.as_str(),
            stage = terminal.stage.as_str(),
            reason = %terminal.reason_code,
            "ticket resolved"
        );
        self.audit
            .append(
                AuditRecord::new(
                    ticket_id,
                    terminal.stage.as_str(),
                    terminal.closure.as_str(),
                    &terminal.reason_code,
                )
                .with_detail(json!({
                    "category_code": ticket.category_code,
                    "requester": ticket.requester,
                })),
            )
            .await;
        Ok(ticket)
    }

    pub fn execution_progress(&self, ticket_id: i64) -> ExecutionProgress<'_> {
        ExecutionProgress {
            ledger: self,
            ticket_id,
        }
    }
}

/// Per-ticket view handed to the executor; advances the 70–90% band.
pub struct ExecutionProgress<'a> {
    ledger: &'a TicketLedger,
    ticket_id: i64,
}

#[async_trait]
impl<'a> ProgressSink for ExecutionProgress<'a> {
    async fn action_finished(&self, done: usize, total: usize, outcome: &ActionOutcome) {
        let mut extra = Map::new();
        extra.insert(
            "last_action".to_string(),
            json!({
                "app": outcome.app,
                "action_type": outcome.action_type,
                "success": outcome.success,
            }),
        );
        if let Err(e) = self
            .ledger
            .progress(
                self.ticket_id,
                ProcessingStage::ExecutingActions,
                execution_percent(done, total),
                extra,
            )
            .await
        {
            tracing::warn!(ticket_id = self.ticket_id, error = %e, "execution progress not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewTicket};

    async fn ledger() -> (TicketLedger, Arc<MemoryStore>, i64, String) {
        let store = Arc::new(MemoryStore::default());
        let id = store
            .insert(NewTicket {
                category_code: 300,
                requester: "jdoe".to_string(),
                description: "reset my domain password please".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap()
            .id;
        let path = std::env::temp_dir()
            .join(format!("deskpilot-ledger-{}.jsonl", uuid::Uuid::new_v4().as_simple()))
            .to_string_lossy()
            .to_string();
        let audit = Arc::new(AuditJsonl::new(&path).await.unwrap());
        (
            TicketLedger::new(store.clone(), "agent-ms".to_string(), audit),
            store,
            id,
            path,
        )
    }

    #[tokio::test]
    async fn walks_the_lifecycle() {
        let (ledger, store, id, path) = ledger().await;
        let claimed = ledger.claim(id).await.unwrap().unwrap();
        assert_eq!(claimed.state, TicketState::Pending);
        assert!(ledger.claim(id).await.unwrap().is_none());
        ledger.mark_validated(id).await.unwrap();
        ledger
            .record_classification(id, Some(Category::Amerika), Map::new())
            .await
            .unwrap();
        let t = store.get(id).await.unwrap().unwrap();
        assert_eq!(t.state, TicketState::InProgress);
        assert_eq!(t.category_code, 400);
        assert_eq!(t.audit["progress_percent"], json!(30));

        let resolved = ledger
            .resolve(
                id,
                Terminal::new(ClosureReason::Resolved, ProcessingStage::Completed, "resolved", "done"),
            )
            .await
            .unwrap();
        assert_eq!(resolved.state, TicketState::Resolved);
        assert_eq!(resolved.resolver.as_deref(), Some("agent-ms"));
        assert!(resolved.closed_at.is_some());
        assert_eq!(resolved.audit["progress_percent"], json!(100));
        assert!(resolved.audit.contains_key("processing_started_at"));

        // resolved tickets are immutable
        assert!(ledger.claim(id).await.unwrap().is_none());
        assert!(ledger.mark_validated(id).await.is_err());
        assert!(crate::audit::verify_audit_chain(&path).is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn resolution_text_stays_out_of_decision_log() {
        let (ledger, _store, id, path) = ledger().await;
        ledger
            .resolve(
                id,
                Terminal::new(
                    ClosureReason::Resolved,
                    ProcessingStage::Completed,
                    "resolved",
                    "Your new password is: Hunter2!",
                ),
            )
            .await
            .unwrap();
        let log = std::fs::read_to_string(&path).unwrap();
        assert!(!log.contains("Hunter2"));
        let _ = std::fs::remove_file(&path);
    }
}
