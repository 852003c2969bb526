//! Requester-facing text. Nothing here may carry technical detail.

use deskpilot_contracts::{ActionOutcome, AppRole, AppType, DownstreamAction};

use crate::validation::Rejection;

pub const GENERIC_SUCCESS: &str = "Your request has been processed successfully.";
pub const UNEXPECTED_ERROR: &str =
    "An unexpected error occurred while processing your request. Your request will be retried automatically.";
pub const IGNORED: &str =
    "This request cannot be processed automatically. It has been forwarded to a support agent for review.";
pub const NOT_AUTHORIZED: &str =
    "Your request could not be processed automatically because some required information is missing or inconsistent. A support agent will review it.";

pub fn rejection_message(rejection: &Rejection) -> String {
    match rejection {
        Rejection::InvalidDescription { min, max } => format!(
            "The description of your request does not meet the requirements. It must be at least {min} and at most {max} characters long and describe the problem."
        ),
        Rejection::InvalidCategory => {
            "The selected category is not valid for this type of request.".to_string()
        }
        Rejection::InvalidRequester => {
            "The requesting user could not be identified. Please submit the request from your own account.".to_string()
        }
        Rejection::RequestTooOld => {
            "This request is too old to be processed automatically. Please create a new request.".to_string()
        }
        Rejection::SecurityRisk => {
            "Your request contains instructions that cannot be processed. Please describe your problem plainly without including instructions for the system.".to_string()
        }
        Rejection::RateLimited(status) => {
            let retry = match status.hours_until_reset {
                Some(h) if h > 0 => format!("Please try again in {h} hours."),
                _ => "Please try again later.".to_string(),
            };
            format!(
                "You have reached the request limit. You can create up to {} password change or unlock requests every {} hours. You currently have {} requests in the current window. {}",
                status.limit, status.window_hours, status.current_count, retry
            )
        }
        Rejection::InvalidData => {
            "Your request could not be processed. Please contact support.".to_string()
        }
    }
}

/// Fallback (message, suggestion) when a failed downstream call carries no
/// structured error body.
pub fn status_fallback_message(status: u16) -> (&'static str, &'static str) {
    match status {
        400 => (
            "The request could not be processed. Please check that all data is correct.",
            "Review the submitted data and try again.",
        ),
        401 => (
            "Authentication with the system failed. The agent will reconnect automatically.",
            "Your request will be processed once the system reconnects. No action is needed.",
        ),
        403 => (
            "There is no permission to perform this action in the system.",
            "Contact the system administrator if you believe this is an error.",
        ),
        404 => (
            "The requested resource does not exist in the system.",
            "Your request will be retried automatically.",
        ),
        422 => (
            "The submitted data is not valid. Please check the information.",
            "Your request will be processed with the available data.",
        ),
        500 => (
            "The system is temporarily unavailable. Your request will be processed automatically once the service recovers.",
            "No action is needed. The system will retry automatically.",
        ),
        503 => (
            "The service is temporarily unavailable. Your request will be retried automatically.",
            "No action is needed. The system will retry automatically.",
        ),
        _ => (
            "An error occurred while processing the request.",
            "Your request will be retried automatically.",
        ),
    }
}

pub fn account_not_found(app: AppType, account: &str) -> String {
    format!(
        "The user '{account}' was not found in {}. Please verify the user name and submit a new request.",
        app.display_name()
    )
}

pub fn with_suggestion(message: &str, suggestion: Option<&str>) -> String {
    match suggestion {
        Some(s) if !s.trim().is_empty() => format!("{message} {s}"),
        _ => message.to_string(),
    }
}

/// Sentence for one successful action, or `None` for failures and for
/// actions with nothing to tell the requester.
pub fn outcome_sentence(outcome: &ActionOutcome) -> Option<String> {
    if !outcome.success {
        return None;
    }
    let app = outcome.app.display_name();
    match outcome.action_type {
        a if a.is_password_action() => Some(match &outcome.credential {
            Some(secret) => format!(
                "A new password has been generated for your {app} account. Your new password is: {}. Please store it securely and change it after logging in.",
                secret.expose()
            ),
            None => format!("A new password has been generated for your {app} account."),
        }),
        DownstreamAction::UnlockAccount => Some(format!(
            "Your {app} account has been unlocked successfully. You can now sign in normally."
        )),
        _ => None,
    }
}

fn heading(app: AppType) -> String {
    format!("**{}**:", app.as_str().to_uppercase())
}

/// Flat list for a single application, per-application sections when a
/// secondary application was involved.
pub fn compose_resolution(
    primary: AppType,
    secondary: Option<AppType>,
    outcomes: &[ActionOutcome],
) -> String {
    let sentences = |role: AppRole| -> Vec<String> {
        outcomes
            .iter()
            .filter(|o| o.app_role == role)
            .filter_map(outcome_sentence)
            .collect()
    };

    let Some(secondary) = secondary else {
        let lines = sentences(AppRole::Primary);
        return if lines.is_empty() {
            GENERIC_SUCCESS.to_string()
        } else {
            lines.join("\n")
        };
    };

    let primary_lines = sentences(AppRole::Primary);
    let secondary_lines = sentences(AppRole::Secondary);
    if primary_lines.is_empty() && secondary_lines.is_empty() {
        return GENERIC_SUCCESS.to_string();
    }
    let mut sections = Vec::new();
    if !primary_lines.is_empty() {
        sections.push(format!("{}\n{}", heading(primary), primary_lines.join("\n")));
    }
    if !secondary_lines.is_empty() {
        sections.push(format!("{}\n{}", heading(secondary), secondary_lines.join("\n")));
    }
    format!(
        "Your requests were processed in both applications:\n\n{}",
        sections.join("\n\n")
    )
}
