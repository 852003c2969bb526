pub mod actions;
pub mod audit;
pub mod categories;
pub mod classifier;
pub mod executor;
pub mod feed;
pub mod ledger;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use deskpilot_config::Config;
use deskpilot_contracts::Ticket;
use deskpilot_kernel::{decode_ticket_event, PromptPolicy, SecurityIndicators, ValidationLimits};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::actions::{ActionService, HttpActionService};
use crate::audit::AuditJsonl;
use crate::categories::CategoryCache;
use crate::classifier::{
    AdapterSettings, ClassificationAdapter, ClassifierBackend, GeminiClassifier, GenerationSettings,
};
use crate::executor::ActionExecutor;
use crate::feed::{bind_with_retry, run_dispatcher, EventFeed};
use crate::ledger::TicketLedger;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::rate_limit::RateLimiter;
use crate::retry::Backoff;
use crate::store::{MemoryStore, NewTicket, SqliteStore, TicketStore};

pub use audit::verify_audit_chain;

/// External collaborators, constructed once and shared by every ticket task.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn TicketStore>,
    pub classifier: Arc<dyn ClassifierBackend>,
    pub actions: Arc<dyn ActionService>,
}

impl Services {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let store: Arc<dyn TicketStore> = match cfg.store.kind.as_str() {
            "memory" => Arc::new(MemoryStore::default()),
            "sqlite" => {
                let path = cfg
                    .store
                    .sqlite_path
                    .as_deref()
                    .ok_or_else(|| "store.sqlite_path is required for sqlite".to_string())?;
                Arc::new(SqliteStore::new(path).map_err(|e| e.to_string())?)
            }
            other => return Err(format!("unsupported store type: {other}")),
        };
        let classifier = GeminiClassifier::new(
            &cfg.classifier.endpoint,
            &cfg.classifier.model,
            cfg.classifier_api_key().map_err(|e| e.to_string())?,
            Duration::from_millis(cfg.classifier.timeout_ms),
            GenerationSettings {
                temperature: cfg.classifier.temperature,
                max_output_tokens: cfg.classifier.max_output_tokens,
            },
        )?;
        let actions = HttpActionService::new(
            &cfg.actions.base_url,
            cfg.actions_api_key().map_err(|e| e.to_string())?,
            Duration::from_millis(cfg.actions.timeout_ms),
        )?;
        Ok(Self {
            store,
            classifier: Arc::new(classifier),
            actions: Arc::new(actions),
        })
    }
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn TicketStore>,
    feed: EventFeed,
}

/// A running agent: the ingestion state plus the dispatcher task that owns
/// the pipeline.
pub struct Agent {
    state: AppState,
    dispatcher: JoinHandle<()>,
}

fn build_pipeline(cfg: &Config, services: &Services, audit: Arc<AuditJsonl>) -> Pipeline {
    let store = Arc::clone(&services.store);
    Pipeline::new(
        TicketLedger::new(Arc::clone(&store), cfg.resolution.resolver_id.clone(), audit),
        CategoryCache::new(Arc::clone(&store)),
        RateLimiter::new(
            store,
            cfg.rate_limit.enabled,
            cfg.rate_limit.max_requests_per_user,
            cfg.rate_limit.window_hours,
        ),
        ClassificationAdapter::new(
            Arc::clone(&services.classifier),
            AdapterSettings {
                policy: PromptPolicy {
                    examples_always: cfg.classifier.examples_always,
                    short_description_threshold: cfg.classifier.short_description_threshold,
                    long_description_threshold: cfg.classifier.long_description_threshold,
                },
                reasoning_max_chars: cfg.classifier.reasoning_max_chars,
                input_max_chars: cfg.classifier.input_max_chars,
                rate_limit_retry_delay: Duration::from_millis(cfg.classifier.rate_limit_retry_delay_ms),
            },
        ),
        ActionExecutor::new(
            Arc::clone(&services.actions),
            Backoff::new(
                cfg.actions.retry_max_attempts,
                Duration::from_millis(cfg.actions.retry_initial_delay_ms),
            ),
        ),
        PipelineSettings {
            limits: ValidationLimits {
                min_description_length: cfg.validation.min_description_length,
                max_description_length: cfg.validation.max_description_length,
                max_request_age_hours: cfg.validation.max_request_age_hours,
            },
            indicators: SecurityIndicators {
                enabled: cfg.security.enabled,
                prompt_injection_keywords: cfg.security.prompt_injection_keywords.clone(),
                dangerous_instruction_patterns: cfg.security.dangerous_instruction_patterns.clone(),
                bypass_phrases: cfg.security.bypass_phrases.clone(),
                code_injection_markers: cfg.security.code_injection_markers.clone(),
            },
        },
    )
}

impl Agent {
    pub async fn from_config(cfg: &Config) -> Result<Self, String> {
        let services = Services::from_config(cfg)?;
        Self::with_services(cfg, services).await
    }

    /// Must run inside a tokio runtime; spawns the dispatcher.
    pub async fn with_services(cfg: &Config, services: Services) -> Result<Self, String> {
        let audit = Arc::new(AuditJsonl::new(&cfg.audit.jsonl_path).await?);
        let pipeline = Arc::new(build_pipeline(cfg, &services, audit));
        let (feed, rx) = feed::channel(cfg.feed.channel_capacity);
        let dispatcher = tokio::spawn(run_dispatcher(rx, pipeline));
        Ok(Self {
            state: AppState {
                store: services.store,
                feed,
            },
            dispatcher,
        })
    }

    pub fn feed(&self) -> EventFeed {
        self.state.feed.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/healthz", get(healthz))
            .route("/v1/tickets", post(submit_ticket))
            .route("/v1/tickets/{id}", get(get_ticket))
            .route("/v1/ticket-events", post(ticket_events))
            .with_state(self.state.clone())
    }

    /// Closes the feed and waits for in-flight tickets. Routers handed out
    /// earlier must be dropped first or the feed stays open.
    pub async fn shutdown(self) {
        let Agent { state, dispatcher } = self;
        drop(state);
        if let Err(e) = dispatcher.await {
            tracing::error!(error = %e, "dispatcher ended abnormally");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let agent = Agent::from_config(&cfg).await?;
    let listener = bind_with_retry(
        addr,
        Backoff::new(
            cfg.feed.reconnect_max_attempts,
            Duration::from_millis(cfg.feed.reconnect_initial_delay_ms),
        ),
    )
    .await?;
    tracing::info!(%addr, store = %cfg.store.kind, "deskpilot listening");

    axum::serve(listener, agent.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))?;

    agent.shutdown().await;
    tracing::info!("http clients released");
    Ok(())
}

fn error_body(code: &str, message: impl Into<String>) -> Json<Value> {
    Json(json!({"error": {"code": code, "message": message.into()}}))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
struct SubmitTicket {
    category_code: i64,
    requester: String,
    description: String,
}

/// Inserts a pending ticket and announces it on the feed the way a change
/// feed would. Content is validated by the pipeline, not here.
async fn submit_ticket(
    State(state): State<AppState>,
    Json(input): Json<SubmitTicket>,
) -> Result<(StatusCode, Json<Ticket>), (StatusCode, Json<Value>)> {
    let ticket = state
        .store
        .insert(NewTicket {
            category_code: input.category_code,
            requester: input.requester,
            description: input.description,
            created_at: Utc::now(),
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "ticket insert failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("store_error", "ticket could not be stored"),
            )
        })?;
    let row = serde_json::to_value(&ticket).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("encode_error", e.to_string()),
        )
    })?;
    state.feed.publish(json!({ "new": row })).await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("feed_closed", e.to_string()),
        )
    })?;
    tracing::info!(ticket_id = ticket.id, category = ticket.category_code, "ticket submitted");
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

async fn get_ticket(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Ticket>, (StatusCode, Json<Value>)> {
    match state.store.get(id).await {
        Ok(Some(ticket)) => Ok(Json(ticket)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            error_body("not_found", format!("ticket {id} not found")),
        )),
        Err(e) => {
            tracing::error!(ticket_id = id, error = %e, "ticket lookup failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("store_error", "ticket could not be read"),
            ))
        }
    }
}

/// Change-feed webhook. Any of the known envelope shapes is accepted.
async fn ticket_events(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let Some(event) = decode_ticket_event(&payload) else {
        return Err((
            StatusCode::BAD_REQUEST,
            error_body("validation_error", "no ticket row found in payload"),
        ));
    };
    let ticket_id = event.record.id;
    state.feed.publish(payload).await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("feed_closed", e.to_string()),
        )
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"accepted": true, "ticket_id": ticket_id, "strategy": event.strategy})),
    ))
}
