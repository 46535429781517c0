//! Outbox command implementation.

use driftsync_protocol::OperationStatus;
use driftsync_store::{LocalStore, StoreConfig};
use std::path::Path;

/// Runs the outbox command.
pub fn run(path: &Path, failed_only: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = LocalStore::open(path, StoreConfig::new().create_if_missing(false))?;
    let ops = store.outbox_ops();

    let mut shown = 0usize;
    for op in &ops {
        if failed_only && op.status != OperationStatus::Failed {
            continue;
        }
        let kind = if op.is_delete() { "delete" } else { "upsert" };
        println!(
            "{} {kind:6} {}/{} status={:?} attempts={}",
            op.op_id, op.table, op.primary_key, op.status, op.attempts
        );
        shown += 1;
    }

    if shown == 0 {
        println!(
            "{}",
            if failed_only {
                "No failed operations"
            } else {
                "Outbox is empty"
            }
        );
    }
    Ok(())
}
