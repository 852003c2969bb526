//! Structural, content and temporal checks run before any classifier or
//! downstream work is attempted.

use chrono::{DateTime, Utc};
use deskpilot_contracts::{Category, TicketRecord, TicketState, MAX_REQUESTER_LEN};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::quota::QuotaStatus;

static REQUESTER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("requester pattern must compile"));

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationLimits {
    pub min_description_length: usize,
    pub max_description_length: usize,
    pub max_request_age_hours: Option<f64>,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            min_description_length: 10,
            max_description_length: 4_000,
            max_request_age_hours: None,
        }
    }
}

/// Why a ticket was turned away before automation. Carries whatever the
/// requester-facing message needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    InvalidData,
    InvalidDescription { min: usize, max: usize },
    InvalidCategory,
    InvalidRequester,
    RequestTooOld,
    SecurityRisk,
    RateLimited(QuotaStatus),
}

impl Rejection {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Rejection::InvalidData => "invalid_data",
            Rejection::InvalidDescription { .. } => "invalid_description",
            Rejection::InvalidCategory => "invalid_category",
            Rejection::InvalidRequester => "invalid_requester",
            Rejection::RequestTooOld => "request_too_old",
            Rejection::SecurityRisk => "security_risk",
            Rejection::RateLimited(_) => "rate_limit_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SanitizeError {
    #[error("description is empty")]
    Empty,
    #[error("description contains control character U+{0:04X}")]
    ControlCharacter(u32),
    #[error("description too short ({len} < {min} characters)")]
    TooShort { len: usize, min: usize },
    #[error("description too long ({len} > {max} characters)")]
    TooLong { len: usize, max: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    failures: Vec<(Rejection, String)>,
}

impl ValidationReport {
    fn push(&mut self, rejection: Rejection, detail: impl Into<String>) {
        self.failures.push((rejection, detail.into()));
    }

    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }

    /// The rejection reported to the requester; the first failing check wins.
    pub fn primary(&self) -> Option<&Rejection> {
        self.failures.first().map(|(r, _)| r)
    }

    pub fn reasons(&self) -> Vec<String> {
        self.failures.iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn single(rejection: Rejection, detail: impl Into<String>) -> Self {
        let mut report = Self::default();
        report.push(rejection, detail);
        report
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidTicket {
    pub id: i64,
    pub category: Category,
    pub requester: String,
    pub description: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Trims, collapses whitespace runs and enforces length bounds. Control
/// characters other than newline, carriage return and tab are refused before
/// any normalization happens.
pub fn sanitize_description(raw: &str, min: usize, max: usize) -> Result<String, SanitizeError> {
    if let Some(c) = raw
        .chars()
        .find(|c| c.is_ascii_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(SanitizeError::ControlCharacter(c as u32));
    }
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return Err(SanitizeError::Empty);
    }
    let len = collapsed.chars().count();
    if len < min {
        return Err(SanitizeError::TooShort { len, min });
    }
    if len > max {
        return Err(SanitizeError::TooLong { len, max });
    }
    Ok(collapsed)
}

pub fn validate_requester(requester: &str) -> Result<(), String> {
    if requester.trim().is_empty() {
        return Err("requester is missing".to_string());
    }
    if requester.chars().count() > MAX_REQUESTER_LEN {
        return Err(format!(
            "requester exceeds {MAX_REQUESTER_LEN} characters"
        ));
    }
    if !REQUESTER_PATTERN.is_match(requester) {
        return Err("requester contains characters outside [A-Za-z0-9_]".to_string());
    }
    Ok(())
}

/// Skipped entirely when no maximum is configured or the creation time is
/// unknown.
pub fn check_request_age(
    created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_age_hours: Option<f64>,
) -> Result<(), String> {
    let (Some(created_at), Some(max_hours)) = (created_at, max_age_hours) else {
        return Ok(());
    };
    let age_hours = (now - created_at).num_seconds() as f64 / 3600.0;
    if age_hours > max_hours {
        return Err(format!(
            "request is {age_hours:.1} hours old (limit {max_hours} hours)"
        ));
    }
    Ok(())
}

/// Runs every structural and content check and reports all failures together.
/// The age check only runs once those pass. Category existence against the
/// reference table is an I/O concern and is left to the caller.
pub fn validate_ticket(
    record: &TicketRecord,
    limits: &ValidationLimits,
    now: DateTime<Utc>,
) -> Result<ValidTicket, ValidationReport> {
    let mut report = ValidationReport::default();

    let id = match record.id {
        Some(id) if id > 0 => Some(id),
        Some(id) => {
            report.push(Rejection::InvalidData, format!("ticket id {id} is not positive"));
            None
        }
        None => {
            report.push(Rejection::InvalidData, "ticket id is missing");
            None
        }
    };

    match record.state.as_deref().map(TicketState::parse) {
        Some(Some(TicketState::Pending)) => {}
        Some(Some(other)) => report.push(
            Rejection::InvalidData,
            format!("ticket state is {} instead of pending", other.as_str()),
        ),
        Some(None) | None => report.push(Rejection::InvalidData, "ticket state is missing or unknown"),
    }

    let category = match record.category_code {
        Some(code) => match Category::from_code(code) {
            Some(c) => Some(c),
            None => {
                report.push(
                    Rejection::InvalidCategory,
                    format!("category {code} is not automatable"),
                );
                None
            }
        },
        None => {
            report.push(Rejection::InvalidCategory, "category is missing");
            None
        }
    };

    let description = match record.description.as_deref() {
        Some(raw) => match sanitize_description(
            raw,
            limits.min_description_length,
            limits.max_description_length,
        ) {
            Ok(clean) => Some(clean),
            Err(err) => {
                report.push(
                    Rejection::InvalidDescription {
                        min: limits.min_description_length,
                        max: limits.max_description_length,
                    },
                    err.to_string(),
                );
                None
            }
        },
        None => {
            report.push(
                Rejection::InvalidDescription {
                    min: limits.min_description_length,
                    max: limits.max_description_length,
                },
                "description is missing",
            );
            None
        }
    };

    let requester = match record.requester.as_deref() {
        Some(r) => match validate_requester(r) {
            Ok(()) => Some(r.to_string()),
            Err(detail) => {
                report.push(Rejection::InvalidRequester, detail);
                None
            }
        },
        None => {
            report.push(Rejection::InvalidRequester, "requester is missing");
            None
        }
    };

    let (Some(id), Some(category), Some(description), Some(requester), true) =
        (id, category, description, requester, report.is_valid())
    else {
        return Err(report);
    };

    if let Err(detail) = check_request_age(record.created_at, now, limits.max_request_age_hours) {
        return Err(ValidationReport::single(Rejection::RequestTooOld, detail));
    }

    Ok(ValidTicket {
        id,
        category,
        requester,
        description,
        created_at: record.created_at,
    })
}
