use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Hard upper bound on classifier reasoning text, in characters.
pub const MAX_REASONING_CHARS: usize = 200;

/// Requester identifiers are bounded by the ticketing system's column width.
pub const MAX_REQUESTER_LEN: usize = 25;

pub const REDACTION_MARKER: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Pending,
    InProgress,
    Resolved,
}

impl TicketState {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketState::Pending => "pending",
            TicketState::InProgress => "in_progress",
            TicketState::Resolved => "resolved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(TicketState::Pending),
            "in_progress" => Some(TicketState::InProgress),
            "resolved" => Some(TicketState::Resolved),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            TicketState::Pending => 0,
            TicketState::InProgress => 1,
            TicketState::Resolved => 2,
        }
    }

    /// Strictly forward. Moving into the current state is refused so that only
    /// one worker can take a pending ticket.
    pub fn can_advance_to(self, next: TicketState) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    Amerika,
    Dominio,
}

impl AppType {
    pub fn as_str(self) -> &'static str {
        match self {
            AppType::Amerika => "amerika",
            AppType::Dominio => "dominio",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "amerika" => Some(AppType::Amerika),
            "dominio" => Some(AppType::Dominio),
            _ => None,
        }
    }

    pub fn category(self) -> Category {
        match self {
            AppType::Amerika => Category::Amerika,
            AppType::Dominio => Category::Dominio,
        }
    }

    pub fn other(self) -> AppType {
        match self {
            AppType::Amerika => AppType::Dominio,
            AppType::Dominio => AppType::Amerika,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AppType::Amerika => "Amerika",
            AppType::Dominio => "Dominio",
        }
    }

    /// Only the directory application needs a named account resolved before
    /// anything else can run against it.
    pub fn requires_account_lookup(self) -> bool {
        matches!(self, AppType::Dominio)
    }
}

/// Ticket categories the agent is allowed to automate. Each maps 1:1 to an
/// application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Dominio,
    Amerika,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Dominio, Category::Amerika];

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            300 => Some(Category::Dominio),
            400 => Some(Category::Amerika),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Category::Dominio => 300,
            Category::Amerika => 400,
        }
    }

    pub fn app_type(self) -> AppType {
        match self {
            Category::Dominio => AppType::Dominio,
            Category::Amerika => AppType::Amerika,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Category::Dominio => "Domain account password change",
            Category::Amerika => "Amerika password change",
        }
    }
}

/// Action vocabulary the classifier is allowed to emit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierAction {
    ChangePassword,
    UnlockAccount,
}

impl ClassifierAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ClassifierAction::ChangePassword => "change_password",
            ClassifierAction::UnlockAccount => "unlock_account",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "change_password" => Some(ClassifierAction::ChangePassword),
            "unlock_account" => Some(ClassifierAction::UnlockAccount),
            _ => None,
        }
    }
}

/// Action names understood by the downstream action service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamAction {
    GeneratePassword,
    ChangePassword,
    UnlockAccount,
    FindUser,
}

impl DownstreamAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DownstreamAction::GeneratePassword => "generate_password",
            DownstreamAction::ChangePassword => "change_password",
            DownstreamAction::UnlockAccount => "unlock_account",
            DownstreamAction::FindUser => "find_user",
        }
    }

    pub fn is_password_action(self) -> bool {
        matches!(
            self,
            DownstreamAction::GeneratePassword | DownstreamAction::ChangePassword
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    Resolved,
    Rejected,
    Ignored,
    Error,
}

impl ClosureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ClosureReason::Resolved => "resolved",
            ClosureReason::Rejected => "rejected",
            ClosureReason::Ignored => "ignored",
            ClosureReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 10 => RiskLevel::Critical,
            s if s >= 5 => RiskLevel::High,
            s if s >= 2 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    pub fn is_unsafe(self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    Base,
    WithExamples,
}

/// Progress labels written while a ticket is in progress. These are not
/// lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Validated,
    Classifying,
    Validating,
    ExecutingActions,
    Completed,
    Rejected,
    Ignored,
    Error,
}

impl ProcessingStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStage::Validated => "validated",
            ProcessingStage::Classifying => "classifying",
            ProcessingStage::Validating => "validating",
            ProcessingStage::ExecutingActions => "executing_actions",
            ProcessingStage::Completed => "completed",
            ProcessingStage::Rejected => "rejected",
            ProcessingStage::Ignored => "ignored",
            ProcessingStage::Error => "error",
        }
    }

    /// Nominal percent for the stage. Action execution reports its own
    /// finer-grained percent between 70 and 90.
    pub fn base_percent(self) -> u8 {
        match self {
            ProcessingStage::Validated => 10,
            ProcessingStage::Classifying => 30,
            ProcessingStage::Validating => 50,
            ProcessingStage::ExecutingActions => 70,
            ProcessingStage::Completed
            | ProcessingStage::Rejected
            | ProcessingStage::Ignored
            | ProcessingStage::Error => 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: i64,
    pub category_code: i64,
    pub state: TicketState,
    pub requester: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub resolver: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closure_reason: Option<ClosureReason>,
    #[serde(default)]
    pub audit: Map<String, Value>,
}

/// Merge-style partial update. `None` leaves the stored column alone; the
/// audit map is merged key by key rather than replaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketUpdate {
    pub state: Option<TicketState>,
    pub category_code: Option<i64>,
    pub resolution: Option<String>,
    pub resolver: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closure_reason: Option<ClosureReason>,
    pub audit: Option<Map<String, Value>>,
}

impl TicketUpdate {
    pub fn is_empty(&self) -> bool {
        *self == TicketUpdate::default()
    }
}

/// Raw row values as delivered by the change feed, before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketRecord {
    pub id: Option<i64>,
    pub category_code: Option<i64>,
    pub state: Option<String>,
    pub requester: Option<String>,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&Ticket> for TicketRecord {
    fn from(ticket: &Ticket) -> Self {
        Self {
            id: Some(ticket.id),
            category_code: Some(ticket.category_code),
            state: Some(ticket.state.as_str().to_string()),
            requester: Some(ticket.requester.clone()),
            description: Some(ticket.description.clone()),
            created_at: Some(ticket.created_at),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationOrigin {
    Model,
    Fallback,
}

#[derive(Debug, Error, PartialEq)]
pub enum ClassificationError {
    #[error("unknown app_type: {0}")]
    UnknownAppType(String),
    #[error("confidence must be within [0, 1], got {0}")]
    ConfidenceOutOfRange(f64),
    #[error("detected_actions must not be empty")]
    NoActions,
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("secondary_app_actions must not be empty when requires_secondary_app is set")]
    EmptySecondaryActions,
    #[error("reasoning exceeds {MAX_REASONING_CHARS} characters")]
    ReasoningTooLong,
}

/// Unvalidated classifier output. Only `ClassificationResult::new` turns it
/// into something the rest of the pipeline will accept.
#[derive(Debug, Clone, Default)]
pub struct ClassificationDraft {
    pub app_type: String,
    pub confidence: f64,
    pub detected_actions: Vec<String>,
    pub reasoning: String,
    pub extracted_params: Map<String, Value>,
    pub requires_secondary_app: bool,
    pub secondary_app_actions: Vec<String>,
    pub raw_classification: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClassificationResult {
    app_type: AppType,
    confidence: f64,
    detected_actions: Vec<ClassifierAction>,
    reasoning: String,
    extracted_params: Map<String, Value>,
    requires_secondary_app: bool,
    secondary_app_actions: Vec<ClassifierAction>,
    raw_classification: String,
    classified_at: DateTime<Utc>,
    origin: ClassificationOrigin,
}

impl ClassificationResult {
    pub fn new(
        draft: ClassificationDraft,
        origin: ClassificationOrigin,
        classified_at: DateTime<Utc>,
    ) -> Result<Self, ClassificationError> {
        let app_type = AppType::parse(&draft.app_type)
            .ok_or_else(|| ClassificationError::UnknownAppType(draft.app_type.clone()))?;
        if !draft.confidence.is_finite() || !(0.0..=1.0).contains(&draft.confidence) {
            return Err(ClassificationError::ConfidenceOutOfRange(draft.confidence));
        }
        if draft.detected_actions.is_empty() {
            return Err(ClassificationError::NoActions);
        }
        let detected_actions = parse_actions(&draft.detected_actions)?;
        let secondary_app_actions = if draft.requires_secondary_app {
            if draft.secondary_app_actions.is_empty() {
                return Err(ClassificationError::EmptySecondaryActions);
            }
            parse_actions(&draft.secondary_app_actions)?
        } else {
            Vec::new()
        };
        if draft.reasoning.chars().count() > MAX_REASONING_CHARS {
            return Err(ClassificationError::ReasoningTooLong);
        }
        Ok(Self {
            app_type,
            confidence: draft.confidence,
            detected_actions,
            reasoning: draft.reasoning,
            extracted_params: draft.extracted_params,
            requires_secondary_app: draft.requires_secondary_app,
            secondary_app_actions,
            raw_classification: draft.raw_classification,
            classified_at,
            origin,
        })
    }

    pub fn app_type(&self) -> AppType {
        self.app_type
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn detected_actions(&self) -> &[ClassifierAction] {
        &self.detected_actions
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn extracted_params(&self) -> &Map<String, Value> {
        &self.extracted_params
    }

    pub fn requires_secondary_app(&self) -> bool {
        self.requires_secondary_app
    }

    pub fn secondary_app_actions(&self) -> &[ClassifierAction] {
        &self.secondary_app_actions
    }

    pub fn raw_classification(&self) -> &str {
        &self.raw_classification
    }

    pub fn classified_at(&self) -> DateTime<Utc> {
        self.classified_at
    }

    pub fn origin(&self) -> ClassificationOrigin {
        self.origin
    }

    pub fn is_fallback(&self) -> bool {
        self.origin == ClassificationOrigin::Fallback
    }
}

fn parse_actions(raw: &[String]) -> Result<Vec<ClassifierAction>, ClassificationError> {
    raw.iter()
        .map(|a| ClassifierAction::parse(a).ok_or_else(|| ClassificationError::UnknownAction(a.clone())))
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AppPlan {
    pub app: AppType,
    pub actions: Vec<DownstreamAction>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionPlan {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    pub primary: AppPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary: Option<AppPlan>,
}

impl ExecutionPlan {
    pub fn is_dual(&self) -> bool {
        self.secondary.is_some()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionRequest {
    pub user_id: String,
    pub action_type: DownstreamAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub generated_password: Option<String>,
}

/// Structured error body returned by the action service on non-2xx.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub action_suggestion: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
}

/// A secret that must never reach logs or the audit trail.
#[derive(Clone, PartialEq, Eq)]
pub struct Redacted(String);

impl Redacted {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Redacted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTION_MARKER)
    }
}

impl Serialize for Redacted {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTION_MARKER)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    InvalidAction,
    Authentication,
    Connection,
    Execution,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutcomeError {
    pub kind: ActionErrorKind,
    pub user_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionOutcome {
    pub app_role: AppRole,
    pub app: AppType,
    pub action_type: DownstreamAction,
    pub endpoint: String,
    pub success: bool,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<Redacted>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    pub executed_at: DateTime<Utc>,
}
