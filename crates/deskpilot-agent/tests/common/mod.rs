#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deskpilot_agent::actions::{ActionError, ActionService};
use deskpilot_agent::classifier::{ClassifierBackend, ClassifierRequest};
use deskpilot_agent::store::{MemoryStore, NewTicket, StoreError, TicketStore};
use deskpilot_agent::{Agent, Services};
use deskpilot_config::Config;
use deskpilot_contracts::{ActionRequest, ActionResponse, AppType, DownstreamAction, Ticket, TicketUpdate};
use deskpilot_kernel::ClassifierFailure;
use serde_json::{json, Map, Value};

pub const GENERATED: &str = "Gen3rated!Pw";

pub fn temp_path(prefix: &str, ext: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    std::env::temp_dir()
        .join(format!("{prefix}-{nanos}.{ext}"))
        .to_string_lossy()
        .to_string()
}

pub fn test_config() -> Config {
    serde_json::from_value(json!({
        "server": {"listen_addr": "127.0.0.1:0"},
        "store": {"type": "memory"},
        "classifier": {
            "endpoint": "http://127.0.0.1:9",
            "api_key": "test-key",
            "rate_limit_retry_delay_ms": 1
        },
        "actions": {
            "base_url": "http://127.0.0.1:9",
            "api_key": "test-key",
            "retry_initial_delay_ms": 1
        },
        "audit": {"jsonl_path": temp_path("deskpilot-audit", "jsonl")}
    }))
    .expect("test config must deserialize")
}

/// Answers every call with the same reply and counts invocations.
pub struct FakeClassifier {
    reply: Result<String, ClassifierFailure>,
    delay: Duration,
    pub calls: AtomicU32,
}

impl FakeClassifier {
    pub fn answering(raw: Value) -> Arc<Self> {
        Self::answering_after(raw, Duration::ZERO)
    }

    pub fn answering_after(raw: Value, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(raw.to_string()),
            delay,
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing(failure: ClassifierFailure) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(failure),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        })
    }

    pub fn count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierBackend for FakeClassifier {
    async fn generate(&self, _request: &ClassifierRequest) -> Result<String, ClassifierFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.reply.clone()
    }
}

/// Downstream service double. Lookups report `found: false` for the
/// accounts listed in `missing`.
#[derive(Default)]
pub struct FakeActions {
    pub missing: Vec<String>,
    pub delay: Duration,
    pub calls: Mutex<Vec<(AppType, ActionRequest)>>,
}

impl FakeActions {
    pub fn requests(&self) -> Vec<ActionRequest> {
        self.calls.lock().unwrap().iter().map(|(_, req)| req.clone()).collect()
    }

    pub fn recorded(&self) -> Vec<(AppType, DownstreamAction)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(app, req)| (*app, req.action_type))
            .collect()
    }
}

#[async_trait]
impl ActionService for FakeActions {
    async fn execute(&self, app: AppType, request: &ActionRequest) -> Result<ActionResponse, ActionError> {
        self.calls.lock().unwrap().push((app, request.clone()));
        tokio::time::sleep(self.delay).await;
        let body = match request.action_type {
            DownstreamAction::FindUser => {
                let name = request.user_name.clone().unwrap_or_default();
                json!({"success": true, "result": {"found": !self.missing.contains(&name)}})
            }
            a if a.is_password_action() => json!({
                "success": true,
                "action_type": a.as_str(),
                "result": {"password": GENERATED},
                "generated_password": GENERATED
            }),
            a => json!({"success": true, "action_type": a.as_str(), "result": {}}),
        };
        Ok(serde_json::from_value(body).expect("fake response must deserialize"))
    }
}

/// Memory store whose lookups used by the rate limiter and category check
/// always fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
}

#[async_trait]
impl TicketStore for FlakyStore {
    async fn get(&self, id: i64) -> Result<Option<Ticket>, StoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, ticket: NewTicket) -> Result<Ticket, StoreError> {
        self.inner.insert(ticket).await
    }

    async fn update(&self, id: i64, update: TicketUpdate) -> Result<Ticket, StoreError> {
        self.inner.update(id, update).await
    }

    async fn claim(&self, id: i64, audit: Map<String, Value>) -> Result<Option<Ticket>, StoreError> {
        self.inner.claim(id, audit).await
    }

    async fn category_exists(&self, _code: i64) -> Result<bool, StoreError> {
        Err(StoreError::Backend("connection reset".to_string()))
    }

    async fn created_since(
        &self,
        _requester: &str,
        _categories: &[i64],
        _since: DateTime<Utc>,
        _exclude: Option<i64>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        Err(StoreError::Backend("connection reset".to_string()))
    }
}

pub async fn start_agent(
    cfg: &Config,
    store: Arc<dyn TicketStore>,
    classifier: Arc<FakeClassifier>,
    actions: Arc<FakeActions>,
) -> Agent {
    Agent::with_services(
        cfg,
        Services {
            store,
            classifier,
            actions,
        },
    )
    .await
    .expect("agent must start")
}

pub fn new_ticket(category_code: i64, requester: &str, description: &str, created_at: DateTime<Utc>) -> NewTicket {
    NewTicket {
        category_code,
        requester: requester.to_string(),
        description: description.to_string(),
        created_at,
    }
}
