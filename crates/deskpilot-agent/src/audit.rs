//! Append-only, hash-chained JSONL trail of terminal ticket outcomes.

use std::sync::Arc;

use chrono::Utc;
use deskpilot_kernel::jcs_sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuditRecord {
    pub audit_id: String,
    pub ticket_id: i64,
    pub stage: String,
    pub result: String,
    pub reason_code: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(ticket_id: i64, stage: &str, result: &str, reason_code: &str) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            ticket_id,
            stage: stage.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            detail: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    fn seal_hash(&self) -> Result<String, String> {
        let mut seeded = self.clone();
        seeded.record_hash.clear();
        let value = serde_json::to_value(&seeded).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

impl AuditJsonl {
    /// Opens `path` for appending and resumes the chain from its last line.
    pub async fn new(path: &str) -> Result<Self, String> {
        let last_hash = tokio::fs::read_to_string(path).await.ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|v| {
                    v.get("record_hash")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| format!("audit log {path}: {e}"))?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    /// Failures are logged, never propagated: the ticket outcome is already
    /// persisted by the time the trail is written.
    pub async fn append(&self, mut rec: AuditRecord) {
        // hold the chain head for the whole write so concurrent tickets serialize
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        rec.record_hash = match rec.seal_hash() {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(ticket_id = rec.ticket_id, error = %e, "audit record hash failed");
                return;
            }
        };
        let line = match serde_json::to_string(&rec) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(ticket_id = rec.ticket_id, error = %e, "audit record serialize failed");
                return;
            }
        };

        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        match written {
            Ok(()) => *last_hash = Some(rec.record_hash),
            Err(e) => tracing::error!(ticket_id = rec.ticket_id, error = %e, "audit append failed"),
        }
    }
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected_hash = rec
            .seal_hash()
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("deskpilot-{name}-{}.jsonl", uuid::Uuid::new_v4().as_simple()))
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    async fn chain_survives_reopen_and_verifies() {
        let path = temp_path("audit");
        {
            let audit = AuditJsonl::new(&path).await.unwrap();
            audit.append(AuditRecord::new(1, "completed", "resolved", "resolved")).await;
            audit
                .append(AuditRecord::new(2, "rejected", "rejected", "security_risk").with_detail(json!({"score": 12})))
                .await;
        }
        let audit = AuditJsonl::new(&path).await.unwrap();
        audit.append(AuditRecord::new(3, "ignored", "ignored", "fallback_unavailable")).await;

        assert_eq!(verify_audit_chain(&path).unwrap(), "audit chain verified: 3 records");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let path = temp_path("tamper");
        let audit = AuditJsonl::new(&path).await.unwrap();
        audit.append(AuditRecord::new(1, "completed", "resolved", "resolved")).await;
        audit.append(AuditRecord::new(2, "completed", "resolved", "resolved")).await;

        let text = std::fs::read_to_string(&path).unwrap().replace("\"ticket_id\":2", "\"ticket_id\":9");
        std::fs::write(&path, text).unwrap();
        let err = verify_audit_chain(&path).unwrap_err();
        assert!(err.contains("line 2 record_hash mismatch"));
        let _ = std::fs::remove_file(&path);
    }
}
