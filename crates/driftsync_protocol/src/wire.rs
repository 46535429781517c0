//! Wire payload normalization.
//!
//! The wire shape for entities is a flat, explicitly-named field set
//! shared between local storage and the remote schema. Field-name casing
//! is normalized at the boundary: either convention is accepted inbound,
//! snake_case is always emitted outbound, so schema drift in either
//! direction does not break parsing.

use crate::record::EntityEnvelope;
use serde_json::Value;
use thiserror::Error;

/// Well-known push rejection reasons.
pub mod reject_reason {
    /// The remote already holds a newer version of the record.
    pub const STALE_VERSION: &str = "stale-version";
    /// The remote asks the client to slow down; retried after backoff.
    pub const RATE_LIMITED: &str = "rate-limited";
    /// The payload failed validation; not retried.
    pub const MALFORMED: &str = "malformed";
    /// The scope token does not grant this write; not retried.
    pub const PERMISSION_DENIED: &str = "permission-denied";
}

/// Error decoding a wire payload.
#[derive(Debug, Error)]
pub enum WireError {
    /// The payload was not a JSON object.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// The payload was an object but not a valid envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
}

/// Converts a camelCase identifier to snake_case.
///
/// Identifiers already in snake_case pass through unchanged.
fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Normalizes the top-level keys of a wire object to snake_case, in place.
///
/// Only the top level is rewritten: nested values belong to table-specific
/// payloads and are opaque to the engine.
pub fn normalize_keys(value: &mut Value) {
    if let Value::Object(map) = value {
        let keys: Vec<String> = map.keys().cloned().collect();
        for key in keys {
            let normalized = to_snake_case(&key);
            if normalized != key {
                if let Some(inner) = map.remove(&key) {
                    // An already-canonical duplicate wins over the variant
                    map.entry(normalized).or_insert(inner);
                }
            }
        }
    }
}

/// Decodes an entity envelope from a wire object of either casing.
pub fn envelope_from_wire(mut value: Value) -> Result<EntityEnvelope, WireError> {
    if !value.is_object() {
        return Err(WireError::NotAnObject(json_type(&value)));
    }
    normalize_keys(&mut value);
    Ok(serde_json::from_value(value)?)
}

/// Encodes an entity envelope in the canonical outbound convention.
pub fn envelope_to_wire(envelope: &EntityEnvelope) -> Value {
    // Struct fields and flattened payload keys are snake_case already;
    // serialization is the canonical form.
    serde_json::to_value(envelope).unwrap_or(Value::Null)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::{DeviceId, Hlc};
    use crate::record::WorkspaceId;
    use serde_json::{json, Map};
    use uuid::Uuid;

    fn device(byte: u8) -> DeviceId {
        DeviceId::from_uuid(Uuid::from_bytes([byte; 16]))
    }

    fn sample() -> EntityEnvelope {
        let mut fields = Map::new();
        fields.insert("title".into(), json!("hello"));
        EntityEnvelope::new(
            "r1",
            WorkspaceId::new("ws1"),
            2,
            Hlc::new(100, device(1)),
            Uuid::from_bytes([5; 16]),
            fields,
        )
    }

    #[test]
    fn snake_case_conversion() {
        assert_eq!(to_snake_case("workspaceId"), "workspace_id");
        assert_eq!(to_snake_case("updatedAtMs"), "updated_at_ms");
        assert_eq!(to_snake_case("workspace_id"), "workspace_id");
        assert_eq!(to_snake_case("id"), "id");
    }

    #[test]
    fn accepts_camel_case_inbound() {
        let envelope = sample();
        let canonical = envelope_to_wire(&envelope);

        // Rewrite the envelope keys the way a camelCase remote would
        let drifted = json!({
            "id": canonical["id"],
            "workspaceId": canonical["workspace_id"],
            "clock": canonical["clock"],
            "hlc": canonical["hlc"],
            "opId": canonical["op_id"],
            "deleted": canonical["deleted"],
            "updatedAtMs": canonical["updated_at_ms"],
            "title": canonical["title"],
        });

        let decoded = envelope_from_wire(drifted).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn accepts_canonical_inbound() {
        let envelope = sample();
        let decoded = envelope_from_wire(envelope_to_wire(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn emits_snake_case_outbound() {
        let wire = envelope_to_wire(&sample());
        let obj = wire.as_object().unwrap();
        assert!(obj.contains_key("workspace_id"));
        assert!(obj.contains_key("updated_at_ms"));
        assert!(!obj.contains_key("workspaceId"));
    }

    #[test]
    fn canonical_key_wins_over_duplicate_variant() {
        let mut value = json!({
            "workspace_id": "canonical",
            "workspaceId": "variant",
        });
        normalize_keys(&mut value);
        assert_eq!(value["workspace_id"], "canonical");
        assert!(value.get("workspaceId").is_none());
    }

    #[test]
    fn rejects_non_objects() {
        assert!(matches!(
            envelope_from_wire(json!([1, 2, 3])),
            Err(WireError::NotAnObject("array"))
        ));
        assert!(matches!(
            envelope_from_wire(json!({"id": "r1"})),
            Err(WireError::InvalidEnvelope(_))
        ));
    }
}
