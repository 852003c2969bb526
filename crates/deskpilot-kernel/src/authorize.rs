use deskpilot_contracts::{
    AppPlan, AppType, Category, ClassificationResult, ClassifierAction, DownstreamAction,
    ExecutionPlan, MAX_REQUESTER_LEN,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static ACCOUNT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{1,25}$").expect("account pattern must compile"));

static LABELLED_ACCOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:nombre de usuario|usuario|username|user|account|cuenta)\s*[:=]\s*([^\s,;]+)")
        .expect("label pattern must compile")
});

pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub agrees: bool,
    /// Category matching the detected application, present only on
    /// disagreement. Computed, never applied here.
    pub corrected: Option<Category>,
}

pub fn reconcile(declared: Category, detected: AppType) -> Reconciliation {
    if declared.app_type() == detected {
        Reconciliation {
            agrees: true,
            corrected: None,
        }
    } else {
        Reconciliation {
            agrees: false,
            corrected: Some(detected.category()),
        }
    }
}

/// Amerika exposes password changes as `generate_password`; Dominio takes the
/// classifier vocabulary as-is.
pub fn map_action(app: AppType, action: ClassifierAction) -> DownstreamAction {
    match (app, action) {
        (AppType::Amerika, ClassifierAction::ChangePassword) => DownstreamAction::GeneratePassword,
        (AppType::Dominio, ClassifierAction::ChangePassword) => DownstreamAction::ChangePassword,
        (_, ClassifierAction::UnlockAccount) => DownstreamAction::UnlockAccount,
    }
}

fn valid_account(candidate: &str) -> Option<String> {
    let trimmed = candidate.trim();
    ACCOUNT_NAME.is_match(trimmed).then(|| trimmed.to_string())
}

/// Priority: classifier-extracted `user_name`, then a `label: value` scan of
/// the description, then the requester. Values failing the account pattern
/// fall through to the next source.
pub fn resolve_account_name(
    params: &Map<String, Value>,
    description: &str,
    requester: &str,
) -> Option<String> {
    if let Some(v) = params
        .get("user_name")
        .and_then(Value::as_str)
        .and_then(valid_account)
    {
        return Some(v);
    }
    if let Some(v) = LABELLED_ACCOUNT
        .captures_iter(description)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches(['.', ')', '"', '\'']))
        .find_map(valid_account)
    {
        return Some(v);
    }
    valid_account(requester)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub plan: ExecutionPlan,
    pub warnings: Vec<String>,
}

fn map_all(app: AppType, actions: &[ClassifierAction]) -> Vec<DownstreamAction> {
    actions.iter().map(|a| map_action(app, *a)).collect()
}

/// Last gate before any downstream mutation. Errors are returned as a list;
/// on any error no plan is produced.
pub fn authorize(
    result: &ClassificationResult,
    requester: &str,
    target: AppType,
    description: &str,
) -> Result<Authorization, Vec<String>> {
    if result.app_type() != target {
        return Err(vec![format!(
            "detected application {} does not match target {}",
            result.app_type().as_str(),
            target.as_str()
        )]);
    }

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if result.detected_actions().is_empty() {
        errors.push("no actions detected".to_string());
    }
    if requester.trim().is_empty() {
        errors.push("requester is blank".to_string());
    } else if requester.chars().count() > MAX_REQUESTER_LEN {
        errors.push(format!("requester exceeds {MAX_REQUESTER_LEN} characters"));
    }

    let secondary_app = target.other();
    let needs_account = target.requires_account_lookup()
        || (result.requires_secondary_app() && secondary_app.requires_account_lookup());
    let account_name = if needs_account {
        resolve_account_name(result.extracted_params(), description, requester)
    } else {
        None
    };
    if target.requires_account_lookup() && account_name.is_none() {
        errors.push(format!("{} requires an account name", target.as_str()));
    }

    let secondary = if result.requires_secondary_app() {
        if secondary_app.requires_account_lookup() && account_name.is_none() {
            errors.push(format!(
                "secondary application {} requires an account name",
                secondary_app.as_str()
            ));
        }
        Some(AppPlan {
            app: secondary_app,
            actions: map_all(secondary_app, result.secondary_app_actions()),
        })
    } else {
        None
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    if result.confidence() < LOW_CONFIDENCE_THRESHOLD {
        warnings.push(format!("low classifier confidence {:.2}", result.confidence()));
    }

    Ok(Authorization {
        plan: ExecutionPlan {
            user_id: requester.to_string(),
            account_name,
            primary: AppPlan {
                app: target,
                actions: map_all(target, result.detected_actions()),
            },
            secondary,
        },
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deskpilot_contracts::{ClassificationDraft, ClassificationError, ClassificationOrigin};
    use serde_json::json;

    fn classification(app: &str, secondary: Option<Vec<&str>>, params: Value) -> ClassificationResult {
        let draft = ClassificationDraft {
            app_type: app.to_string(),
            confidence: 0.9,
            detected_actions: vec!["change_password".to_string()],
            reasoning: "test".to_string(),
            extracted_params: params.as_object().cloned().unwrap_or_default(),
            requires_secondary_app: secondary.is_some(),
            secondary_app_actions: secondary
                .unwrap_or_default()
                .into_iter()
                .map(str::to_string)
                .collect(),
            raw_classification: "{}".to_string(),
        };
        ClassificationResult::new(draft, ClassificationOrigin::Model, Utc::now()).unwrap()
    }

    #[test]
    fn reconcile_is_idempotent_and_inverse() {
        let agree = reconcile(Category::Amerika, AppType::Amerika);
        assert!(agree.agrees);
        assert_eq!(agree.corrected, None);
        let fix = reconcile(Category::Dominio, AppType::Amerika);
        assert!(!fix.agrees);
        assert_eq!(fix.corrected, Some(Category::Amerika));
        assert_eq!(reconcile(fix.corrected.unwrap(), AppType::Amerika).corrected, None);
    }

    #[test]
    fn amerika_password_maps_to_generate() {
        let auth = authorize(&classification("amerika", None, json!({})), "jdoe", AppType::Amerika, "")
            .unwrap();
        assert_eq!(auth.plan.primary.actions, vec![DownstreamAction::GeneratePassword]);
        assert_eq!(auth.plan.account_name, None);
        assert!(auth.plan.secondary.is_none());
    }

    #[test]
    fn mismatched_target_is_hard_failure() {
        let errs = authorize(&classification("amerika", None, json!({})), "jdoe", AppType::Dominio, "")
            .unwrap_err();
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn secondary_dominio_reuses_resolved_account() {
        let auth = authorize(
            &classification("amerika", Some(vec!["unlock_account"]), json!({"user_name": "jperez"})),
            "jdoe",
            AppType::Amerika,
            "",
        )
        .unwrap();
        let secondary = auth.plan.secondary.unwrap();
        assert_eq!(secondary.app, AppType::Dominio);
        assert_eq!(secondary.actions, vec![DownstreamAction::UnlockAccount]);
        assert_eq!(auth.plan.account_name.as_deref(), Some("jperez"));
    }

    #[test]
    fn secondary_flag_without_actions_never_reaches_authorization() {
        let draft = ClassificationDraft {
            app_type: "amerika".to_string(),
            confidence: 0.9,
            detected_actions: vec!["change_password".to_string()],
            reasoning: "x".to_string(),
            requires_secondary_app: true,
            ..ClassificationDraft::default()
        };
        assert_eq!(
            ClassificationResult::new(draft, ClassificationOrigin::Model, Utc::now()),
            Err(ClassificationError::EmptySecondaryActions)
        );
    }

    #[test]
    fn account_resolution_priority() {
        let params = json!({"user_name": "from_ai"});
        assert_eq!(
            resolve_account_name(params.as_object().unwrap(), "usuario: from_text", "req").as_deref(),
            Some("from_ai")
        );
        let bad = json!({"user_name": "not valid!"});
        assert_eq!(
            resolve_account_name(bad.as_object().unwrap(), "Usuario: from_text.", "req").as_deref(),
            Some("from_text")
        );
        assert_eq!(
            resolve_account_name(&Map::new(), "nothing labelled", "req").as_deref(),
            Some("req")
        );
    }

    #[test]
    fn low_confidence_only_warns() {
        let draft = ClassificationDraft {
            app_type: "dominio".to_string(),
            confidence: 0.3,
            detected_actions: vec!["unlock_account".to_string()],
            reasoning: "x".to_string(),
            ..ClassificationDraft::default()
        };
        let result = ClassificationResult::new(draft, ClassificationOrigin::Model, Utc::now()).unwrap();
        let auth = authorize(&result, "jdoe", AppType::Dominio, "").unwrap();
        assert_eq!(auth.warnings.len(), 1);
        assert_eq!(auth.plan.account_name.as_deref(), Some("jdoe"));
    }

    #[test]
    fn overlong_requester_is_rejected() {
        let errs = authorize(
            &classification("amerika", None, json!({})),
            &"a".repeat(26),
            AppType::Amerika,
            "",
        )
        .unwrap_err();
        assert!(errs[0].contains("exceeds"));
    }
}
