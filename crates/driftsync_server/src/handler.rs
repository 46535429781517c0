//! JSON wire handlers for sync endpoints.
//!
//! The boundary a deployment binds to HTTP. Inbound operation payloads
//! are accepted in either field-name casing and normalized once here;
//! outbound payloads always use the canonical convention. Undecodable
//! operations are rejected individually, never dropped, so a partially
//! malformed batch still settles the valid operations.

use crate::error::ServerResult;
use crate::server::SyncServer;
use driftsync_protocol::{
    envelope_to_wire, normalize_keys, reject_reason, Cursor, PendingOperation, RejectedOp,
    SyncScope,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// JSON boundary over a [`SyncServer`].
pub struct WireHandler {
    server: Arc<SyncServer>,
}

impl WireHandler {
    /// Creates a handler over the given server.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }

    /// Handles a push of wire-encoded operations.
    pub fn handle_push(&self, scope: &SyncScope, ops: &[Value]) -> ServerResult<Value> {
        let mut decoded: Vec<PendingOperation> = Vec::new();
        let mut undecodable: Vec<RejectedOp> = Vec::new();

        for value in ops {
            match decode_operation(value.clone()) {
                Ok(op) => decoded.push(op),
                Err(op_id) => undecodable.push(RejectedOp {
                    op_id,
                    reason: reject_reason::MALFORMED.into(),
                }),
            }
        }

        let mut receipt = self.server.handle_push(scope, &decoded)?;
        receipt.rejected.extend(undecodable);

        Ok(json!({
            "acked": receipt.acked,
            "rejected": receipt
                .rejected
                .iter()
                .map(|r| json!({ "op_id": r.op_id, "reason": r.reason }))
                .collect::<Vec<Value>>(),
        }))
    }

    /// Handles a pull, emitting canonically-cased change entries.
    pub fn handle_pull(
        &self,
        scope: &SyncScope,
        cursor: Option<u64>,
        table_filter: Option<&[String]>,
    ) -> ServerResult<Value> {
        let batch = self
            .server
            .handle_pull(scope, cursor.map(Cursor::new), table_filter)?;

        let changes: Vec<Value> = batch
            .changes
            .iter()
            .map(|change| {
                json!({
                    "server_version": change.server_version,
                    "table": change.table,
                    "primary_key": change.primary_key,
                    "op_id": change.op_id,
                    "clock": change.clock,
                    "hlc": change.hlc,
                    "envelope": change
                        .envelope
                        .as_ref()
                        .map(envelope_to_wire)
                        .unwrap_or(Value::Null),
                })
            })
            .collect();

        Ok(json!({
            "changes": changes,
            "next_cursor": batch.next_cursor.position(),
            "has_more": batch.has_more,
        }))
    }
}

/// Decodes one wire operation, normalizing key casing at every level the
/// envelope contract covers.
///
/// On failure returns the operation's id when one was readable, so the
/// rejection can be addressed to it.
fn decode_operation(mut value: Value) -> Result<PendingOperation, Uuid> {
    normalize_keys(&mut value);
    if let Some(kind) = value.get_mut("kind") {
        normalize_keys(kind);
        if let Some(envelope) = kind.get_mut("envelope") {
            normalize_keys(envelope);
        }
    }

    let op_id = value
        .get("op_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or(Uuid::nil());

    serde_json::from_value(value).map_err(|_| op_id)
}
