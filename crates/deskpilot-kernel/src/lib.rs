pub mod audit;
pub mod authorize;
pub mod classification;
pub mod messages;
pub mod payload;
pub mod quota;
pub mod security;
pub mod validation;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use audit::merge_audit;
pub use authorize::{authorize, map_action, reconcile, resolve_account_name, Authorization, Reconciliation};
pub use classification::{
    build_user_message, decide_next_step, extract_json_object, fallback_classification,
    parse_classification, select_prompt, system_prompt, truncate_reasoning, ClassifierFailure,
    ClassifierStep, FallbackUnavailable, PromptPolicy,
};
pub use payload::{decode_ticket_event, DecodedEvent};
pub use quota::{evaluate_quota, QuotaStatus};
pub use security::{assess, SecurityAssessment, SecurityIndicators};
pub use validation::{
    check_request_age, sanitize_description, validate_requester, validate_ticket, Rejection,
    SanitizeError, ValidTicket, ValidationLimits, ValidationReport,
};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
