//! Decoding of change-feed notifications. Feeds wrap the inserted row in
//! different envelopes; each strategy below knows one envelope, and the first
//! one that yields a row wins.

use deskpilot_contracts::TicketRecord;
use serde_json::{Map, Value};

use crate::parse_rfc3339;

type Strategy = fn(&Value) -> Option<&Map<String, Value>>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("new", new_row),
    ("record", record_row),
    ("data.record", data_record_row),
    ("data.new", data_new_row),
    ("data", data_row),
    ("payload", bare_row),
];

fn new_row(v: &Value) -> Option<&Map<String, Value>> {
    row_at(v, &["new"])
}

fn record_row(v: &Value) -> Option<&Map<String, Value>> {
    row_at(v, &["record"])
}

fn data_record_row(v: &Value) -> Option<&Map<String, Value>> {
    row_at(v, &["data", "record"])
}

fn data_new_row(v: &Value) -> Option<&Map<String, Value>> {
    row_at(v, &["data", "new"])
}

fn data_row(v: &Value) -> Option<&Map<String, Value>> {
    row_at(v, &["data"])
}

fn bare_row(v: &Value) -> Option<&Map<String, Value>> {
    row_at(v, &[])
}

fn row_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Map<String, Value>> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_object().filter(|m| m.contains_key("id"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub strategy: &'static str,
    pub record: TicketRecord,
}

pub fn decode_ticket_event(payload: &Value) -> Option<DecodedEvent> {
    STRATEGIES.iter().find_map(|(name, strategy)| {
        strategy(payload).map(|row| DecodedEvent {
            strategy: *name,
            record: record_from_row(row),
        })
    })
}

fn int_field(row: &Map<String, Value>, key: &str) -> Option<i64> {
    match row.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn str_field(row: &Map<String, Value>, key: &str) -> Option<String> {
    row.get(key).and_then(Value::as_str).map(str::to_string)
}

fn record_from_row(row: &Map<String, Value>) -> TicketRecord {
    TicketRecord {
        id: int_field(row, "id"),
        category_code: int_field(row, "category_code"),
        state: str_field(row, "state"),
        requester: str_field(row, "requester"),
        description: str_field(row, "description"),
        created_at: row
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(parse_rfc3339),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> Value {
        json!({
            "id": 7,
            "category_code": 300,
            "state": "pending",
            "requester": "jdoe",
            "description": "unlock my domain account",
            "created_at": "2026-05-01T12:00:00Z"
        })
    }

    #[test]
    fn probes_known_envelopes_in_order() {
        let cases = [
            (json!({"new": row(), "record": {"id": 1}}), "new"),
            (json!({"record": row()}), "record"),
            (json!({"data": {"record": row()}}), "data.record"),
            (json!({"data": {"new": row()}}), "data.new"),
            (json!({"data": row()}), "data"),
            (row(), "payload"),
        ];
        for (payload, expected) in cases {
            let decoded = decode_ticket_event(&payload).unwrap();
            assert_eq!(decoded.strategy, expected);
            assert_eq!(decoded.record.id, Some(7));
            assert_eq!(decoded.record.category_code, Some(300));
        }
    }

    #[test]
    fn accepts_stringified_numbers() {
        let decoded = decode_ticket_event(&json!({"new": {"id": "12", "category_code": "400"}}))
            .unwrap();
        assert_eq!(decoded.record.id, Some(12));
        assert_eq!(decoded.record.category_code, Some(400));
        assert_eq!(decoded.record.description, None);
    }

    #[test]
    fn unusable_payloads_decode_to_none() {
        assert!(decode_ticket_event(&json!({"type": "heartbeat"})).is_none());
        assert!(decode_ticket_event(&json!([1, 2, 3])).is_none());
        assert!(decode_ticket_event(&json!({"data": {"old": row()}})).is_none());
    }
}
