//! Prompt selection, output parsing and the retry/fallback decision for the
//! classifier. Everything here is synchronous; the network call lives in the
//! agent crate.

use chrono::{DateTime, Utc};
use deskpilot_contracts::{
    Category, ClassificationDraft, ClassificationOrigin, ClassificationResult, PromptVariant,
};
use serde_json::{Map, Value};
use thiserror::Error;

pub const FALLBACK_CONFIDENCE: f64 = 0.5;
pub const FALLBACK_RAW: &str = "FALLBACK";
const FALLBACK_REASONING: &str =
    "Automatic fallback: classified from the declared category because the classifier was unavailable.";

const MULTI_APP_MARKERS: &[&str] = &[
    "both", "as well as", "ambas", "ambos", "las dos", "y también", "además de", "tanto",
];
const AMBIGUITY_MARKERS: &[&str] = &[
    "not sure", "no estoy seguro", "no sé", "help", "ayuda", "error", "problema",
];
const AMERIKA_TERMS: &[&str] = &["amerika"];
const DOMINIO_TERMS: &[&str] = &["dominio", "domain", "windows", "active directory"];

const BASE_PROMPT: &str = r#"You classify IT service-desk requests for corporate access management.

Categories:
- 300 "Domain account password change" maps to app_type "dominio".
- 400 "Amerika password change" maps to app_type "amerika".

The declared category is only a hint. The description is the source of truth:
- If the user names one application explicitly, that application is app_type even when the category differs.
- If the user names both applications, app_type is the application of the category, requires_secondary_app is true and secondary_app_actions lists what the other application needs.
- If no application is named, follow the category and lower the confidence.

Confidence guide: 0.9-1.0 explicit application and action matching the category; 0.7-0.89 explicit mentions that contradict the category; 0.5-0.69 clear context without an explicit application; below 0.5 insufficient context.

Allowed actions: "change_password", "unlock_account".

Answer with exactly one JSON object and nothing else:
{
  "app_type": "amerika" | "dominio",
  "confidence": 0.0-1.0,
  "detected_actions": ["change_password" | "unlock_account", ...],
  "reasoning": "short explanation, at most 200 characters",
  "extracted_params": {"user_name": "account name, only if stated explicitly"},
  "requires_secondary_app": true | false,
  "secondary_app_actions": null | ["change_password" | "unlock_account", ...]
}"#;

const EXAMPLES: &str = r#"

Examples:

category: 400 (Amerika password change)
Description: I forgot my Amerika password and cannot get in
{"app_type":"amerika","confidence":0.95,"detected_actions":["change_password"],"reasoning":"Explicit Amerika password reset","extracted_params":{},"requires_secondary_app":false,"secondary_app_actions":null}

category: 300 (Domain account password change)
Description: Necesito cambiar mi contraseña de Amerika
{"app_type":"amerika","confidence":0.85,"detected_actions":["change_password"],"reasoning":"Mentions Amerika although the category is domain","extracted_params":{},"requires_secondary_app":false,"secondary_app_actions":null}

category: 400 (Amerika password change)
Description: My Amerika account is locked and I also need a new domain password, user jperez
{"app_type":"amerika","confidence":0.92,"detected_actions":["unlock_account"],"reasoning":"Both applications requested","extracted_params":{"user_name":"jperez"},"requires_secondary_app":true,"secondary_app_actions":["change_password"]}

category: 300 (Domain account password change)
Description: help, error when logging in
{"app_type":"dominio","confidence":0.55,"detected_actions":["change_password"],"reasoning":"Vague login problem, following the category","extracted_params":{},"requires_secondary_app":false,"secondary_app_actions":null}"#;

pub fn system_prompt(variant: PromptVariant) -> String {
    match variant {
        PromptVariant::Base => BASE_PROMPT.to_string(),
        PromptVariant::WithExamples => format!("{BASE_PROMPT}{EXAMPLES}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromptPolicy {
    pub examples_always: bool,
    pub short_description_threshold: usize,
    pub long_description_threshold: usize,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self {
            examples_always: false,
            short_description_threshold: 20,
            long_description_threshold: 500,
        }
    }
}

fn mentions(text: &str, terms: &[&str]) -> bool {
    terms.iter().any(|t| text.contains(t))
}

pub fn select_prompt(description: &str, category: Category, policy: &PromptPolicy) -> PromptVariant {
    if policy.examples_always {
        return PromptVariant::WithExamples;
    }
    let lowered = description.to_lowercase();
    let len = description.chars().count();
    let names_amerika = mentions(&lowered, AMERIKA_TERMS);
    let names_dominio = mentions(&lowered, DOMINIO_TERMS);

    let short = len < policy.short_description_threshold;
    let long = len > policy.long_description_threshold;
    let multi_app = (names_amerika && names_dominio) || mentions(&lowered, MULTI_APP_MARKERS);
    let mismatch = match category {
        Category::Dominio => names_amerika && !names_dominio,
        Category::Amerika => names_dominio && !names_amerika,
    };
    let ambiguous = mentions(&lowered, AMBIGUITY_MARKERS);

    if short || long || multi_app || mismatch || ambiguous {
        PromptVariant::WithExamples
    } else {
        PromptVariant::Base
    }
}

pub fn build_user_message(category: Category, description: &str, input_max_chars: usize) -> String {
    let text = if description.chars().count() > input_max_chars {
        let cut: String = description.chars().take(input_max_chars).collect();
        format!("{cut}...")
    } else {
        description.to_string()
    };
    format!(
        "category: {} ({})\nDescription: {}",
        category.code(),
        category.name(),
        text
    )
}

/// Direct parse first, then the widest `{...}` span in the text.
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw.trim()) {
        return Some(map);
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Cuts at the last word boundary in the final quarter of the budget, or
/// mid-word if there is none, and appends an ellipsis. The result never
/// exceeds `cap` characters.
pub fn truncate_reasoning(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let budget = cap.saturating_sub(3);
    let cut: String = text.chars().take(budget).collect();
    let boundary_floor = cap * 3 / 4;
    let trimmed = match cut.rfind(' ') {
        Some(byte_idx) if cut[..byte_idx].chars().count() > boundary_floor => &cut[..byte_idx],
        _ => cut.as_str(),
    };
    format!("{}...", trimmed.trim_end())
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifierFailure {
    #[error("classifier rate limited: {0}")]
    RateLimited(String),
    #[error("classifier quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("classifier timed out: {0}")]
    Timeout(String),
    #[error("classifier unreachable: {0}")]
    Connection(String),
    #[error("classifier returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("classifier output is not a JSON object: {0}")]
    Unparseable(String),
    #[error("classifier output violates the result schema: {0}")]
    Schema(String),
}

impl ClassifierFailure {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ClassifierFailure::RateLimited(_) => "rate_limited",
            ClassifierFailure::QuotaExceeded(_) => "quota_exceeded",
            ClassifierFailure::Timeout(_) => "timeout",
            ClassifierFailure::Connection(_) => "connection",
            ClassifierFailure::Api { .. } => "api_error",
            ClassifierFailure::Unparseable(_) => "unparseable",
            ClassifierFailure::Schema(_) => "schema",
        }
    }

    /// Quota exhaustion is checked first: it also arrives as HTTP 429 but a
    /// retry cannot help.
    pub fn from_http(status: u16, body: &str) -> Self {
        let lowered = body.to_lowercase();
        if lowered.contains("quota") {
            ClassifierFailure::QuotaExceeded(snippet(body))
        } else if status == 429 || lowered.contains("rate limit") {
            ClassifierFailure::RateLimited(snippet(body))
        } else {
            ClassifierFailure::Api {
                status,
                message: snippet(body),
            }
        }
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(300).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierStep {
    Retry,
    Fallback,
}

/// `attempts` counts classifier calls already made for this ticket.
pub fn decide_next_step(failure: &ClassifierFailure, attempts: u32) -> ClassifierStep {
    match failure {
        ClassifierFailure::RateLimited(_) if attempts < 2 => ClassifierStep::Retry,
        _ => ClassifierStep::Fallback,
    }
}

fn schema(msg: impl Into<String>) -> ClassifierFailure {
    ClassifierFailure::Schema(msg.into())
}

fn string_list(obj: &Map<String, Value>, key: &str) -> Result<Vec<String>, ClassifierFailure> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| schema(format!("{key} must contain strings")))
            })
            .collect(),
        Some(_) => Err(schema(format!("{key} must be a list"))),
    }
}

pub fn parse_classification(
    raw: &str,
    reasoning_cap: usize,
    now: DateTime<Utc>,
) -> Result<ClassificationResult, ClassifierFailure> {
    let obj = extract_json_object(raw).ok_or_else(|| ClassifierFailure::Unparseable(snippet(raw)))?;

    let app_type = obj
        .get("app_type")
        .and_then(Value::as_str)
        .ok_or_else(|| schema("app_type is required"))?
        .to_string();
    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| schema("confidence must be a number"))?;
    if !obj.contains_key("detected_actions") {
        return Err(schema("detected_actions is required"));
    }
    let detected_actions = string_list(&obj, "detected_actions")?;
    let reasoning = obj
        .get("reasoning")
        .and_then(Value::as_str)
        .ok_or_else(|| schema("reasoning is required"))?;
    let extracted_params = match obj.get("extracted_params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(_) => return Err(schema("extracted_params must be an object")),
    };
    let requires_secondary_app = match obj.get("requires_secondary_app") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(schema("requires_secondary_app must be a boolean")),
    };
    let secondary_app_actions = string_list(&obj, "secondary_app_actions")?;

    let draft = ClassificationDraft {
        app_type,
        confidence,
        detected_actions,
        reasoning: truncate_reasoning(reasoning, reasoning_cap),
        extracted_params,
        requires_secondary_app,
        secondary_app_actions,
        raw_classification: raw.to_string(),
    };
    ClassificationResult::new(draft, ClassificationOrigin::Model, now).map_err(|e| schema(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("no deterministic classification exists for category {0}")]
pub struct FallbackUnavailable(pub i64);

/// AI-free classification from the declared category alone. Apart from the
/// timestamp the output depends only on `category_code`.
pub fn fallback_classification(
    category_code: i64,
    now: DateTime<Utc>,
) -> Result<ClassificationResult, FallbackUnavailable> {
    let category = Category::from_code(category_code).ok_or(FallbackUnavailable(category_code))?;
    let draft = ClassificationDraft {
        app_type: category.app_type().as_str().to_string(),
        confidence: FALLBACK_CONFIDENCE,
        detected_actions: vec!["change_password".to_string()],
        reasoning: FALLBACK_REASONING.to_string(),
        extracted_params: Map::new(),
        requires_secondary_app: false,
        secondary_app_actions: Vec::new(),
        raw_classification: FALLBACK_RAW.to_string(),
    };
    ClassificationResult::new(draft, ClassificationOrigin::Fallback, now)
        .map_err(|_| FallbackUnavailable(category_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskpilot_contracts::{AppType, ClassifierAction};

    #[test]
    fn short_and_mismatched_descriptions_get_examples() {
        let policy = PromptPolicy::default();
        assert_eq!(
            select_prompt("locked out", Category::Amerika, &policy),
            PromptVariant::WithExamples
        );
        assert_eq!(
            select_prompt("Necesito cambiar mi contraseña de Amerika", Category::Dominio, &policy),
            PromptVariant::WithExamples
        );
        assert_eq!(
            select_prompt("Please reset the password of my Amerika account", Category::Amerika, &policy),
            PromptVariant::Base
        );
    }

    #[test]
    fn ambiguity_and_forced_examples() {
        let policy = PromptPolicy::default();
        assert_eq!(
            select_prompt("I am not sure what happened to my login", Category::Amerika, &policy),
            PromptVariant::WithExamples
        );
        let forced = PromptPolicy {
            examples_always: true,
            ..policy
        };
        assert_eq!(
            select_prompt("Please reset the password of my Amerika account", Category::Amerika, &forced),
            PromptVariant::WithExamples
        );
    }

    #[test]
    fn user_message_shortens_long_input() {
        let msg = build_user_message(Category::Amerika, &"a".repeat(600), 500);
        assert!(msg.starts_with("category: 400 (Amerika password change)\nDescription: "));
        assert!(msg.ends_with("..."));
        assert_eq!(msg.lines().nth(1).unwrap().chars().count(), "Description: ".len() + 503);
    }

    #[test]
    fn extracts_object_wrapped_in_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"app_type\":\"dominio\",\"x\":{\"y\":1}}\n```";
        let obj = extract_json_object(raw).unwrap();
        assert_eq!(obj["app_type"], "dominio");
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn truncation_prefers_word_boundary() {
        let text = format!("{} tailword", "word ".repeat(45));
        let out = truncate_reasoning(&text, 200);
        assert!(out.chars().count() <= 200);
        assert!(out.ends_with("..."));
        assert!(!out.contains("tailw"));

        let unbroken = "x".repeat(300);
        let out = truncate_reasoning(&unbroken, 200);
        assert_eq!(out.chars().count(), 200);
    }

    #[test]
    fn parses_valid_output() {
        let raw = r#"{"app_type":"amerika","confidence":0.9,"detected_actions":["change_password"],"reasoning":"ok","extracted_params":{"user_name":"jdoe"},"requires_secondary_app":false,"secondary_app_actions":null}"#;
        let result = parse_classification(raw, 200, Utc::now()).unwrap();
        assert_eq!(result.app_type(), AppType::Amerika);
        assert_eq!(result.extracted_params()["user_name"], "jdoe");
    }

    #[test]
    fn schema_violations_are_typed() {
        let raw = r#"{"app_type":"amerika","confidence":"high","detected_actions":["change_password"],"reasoning":"x"}"#;
        assert!(matches!(
            parse_classification(raw, 200, Utc::now()),
            Err(ClassifierFailure::Schema(_))
        ));
        let raw = r#"{"app_type":"amerika","confidence":0.9,"detected_actions":[],"reasoning":"x"}"#;
        assert!(matches!(
            parse_classification(raw, 200, Utc::now()),
            Err(ClassifierFailure::Schema(_))
        ));
        assert!(matches!(
            parse_classification("garbage", 200, Utc::now()),
            Err(ClassifierFailure::Unparseable(_))
        ));
    }

    #[test]
    fn only_first_rate_limit_is_retried() {
        let rl = ClassifierFailure::RateLimited("slow down".to_string());
        assert_eq!(decide_next_step(&rl, 1), ClassifierStep::Retry);
        assert_eq!(decide_next_step(&rl, 2), ClassifierStep::Fallback);
        let quota = ClassifierFailure::QuotaExceeded("quota".to_string());
        assert_eq!(decide_next_step(&quota, 1), ClassifierStep::Fallback);
        let timeout = ClassifierFailure::Timeout("30s".to_string());
        assert_eq!(decide_next_step(&timeout, 1), ClassifierStep::Fallback);
    }

    #[test]
    fn quota_wins_over_rate_limit_status() {
        assert!(matches!(
            ClassifierFailure::from_http(429, "Quota exceeded for project"),
            ClassifierFailure::QuotaExceeded(_)
        ));
        assert!(matches!(
            ClassifierFailure::from_http(429, "Too many requests"),
            ClassifierFailure::RateLimited(_)
        ));
        assert!(matches!(
            ClassifierFailure::from_http(500, "boom"),
            ClassifierFailure::Api { status: 500, .. }
        ));
    }

    #[test]
    fn fallback_is_deterministic() {
        let a = fallback_classification(300, Utc::now()).unwrap();
        let b = fallback_classification(300, a.classified_at()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.app_type(), AppType::Dominio);
        assert_eq!(a.confidence(), FALLBACK_CONFIDENCE);
        assert_eq!(a.detected_actions(), &[ClassifierAction::ChangePassword]);
        assert!(a.is_fallback());
        assert_eq!(fallback_classification(999, Utc::now()), Err(FallbackUnavailable(999)));
    }
}
