use chrono::{DateTime, Utc};
use deskpilot_contracts::{Category, ClassificationResult, ProcessingStage};
use serde_json::{json, Map, Value};

use crate::authorize::Reconciliation;

/// Non-destructive merge: a null in `update` only lands when the key is new.
pub fn merge_audit(existing: &mut Map<String, Value>, update: Map<String, Value>) {
    for (key, value) in update {
        if !value.is_null() || !existing.contains_key(&key) {
            existing.insert(key, value);
        }
    }
}

pub fn progress_fields(stage: ProcessingStage, percent: u8, now: DateTime<Utc>) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("processing_stage".to_string(), json!(stage.as_str()));
    m.insert("progress_percent".to_string(), json!(percent));
    m.insert("updated_at".to_string(), json!(now.to_rfc3339()));
    m
}

/// Percent reported after `done` of `total` actions: 70 at the start of
/// execution, 90 once the last action returns.
pub fn execution_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return ProcessingStage::ExecutingActions.base_percent();
    }
    let done = done.min(total);
    70 + ((done * 20) / total) as u8
}

pub fn classification_fields(
    declared: Category,
    result: &ClassificationResult,
    reconciliation: &Reconciliation,
) -> Map<String, Value> {
    let corrected = reconciliation.corrected.unwrap_or(declared);
    let mut m = Map::new();
    m.insert("original_category".to_string(), json!(declared.code()));
    m.insert("corrected_category".to_string(), json!(corrected.code()));
    m.insert("category_corrected".to_string(), json!(!reconciliation.agrees));
    m.insert("detected_app_type".to_string(), json!(result.app_type()));
    m.insert("confidence".to_string(), json!(result.confidence()));
    m.insert("detected_actions".to_string(), json!(result.detected_actions()));
    m.insert("reasoning".to_string(), json!(result.reasoning()));
    m.insert("extracted_params".to_string(), Value::Object(result.extracted_params().clone()));
    m.insert(
        "requires_secondary_app".to_string(),
        json!(result.requires_secondary_app()),
    );
    m.insert(
        "secondary_app_actions".to_string(),
        if result.requires_secondary_app() {
            json!(result.secondary_app_actions())
        } else {
            Value::Null
        },
    );
    m.insert("raw_classification".to_string(), json!(result.raw_classification()));
    m.insert("classification_origin".to_string(), json!(result.origin()));
    m.insert(
        "classification_timestamp".to_string(),
        json!(result.classified_at().to_rfc3339()),
    );
    m
}
