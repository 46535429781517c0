//! Status command implementation.

use driftsync_store::{LocalStore, StoreConfig};
use std::path::Path;

/// Runs the status command.
pub fn run(path: &Path, workspace: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let store = LocalStore::open(path, StoreConfig::new().create_if_missing(false))?;
    let stats = store.stats();

    println!("Store: {}", path.display());
    println!("  tables:       {}", stats.tables);
    println!("  records:      {}", stats.records);
    println!("  pending ops:  {}", stats.pending_ops);
    println!("  failed ops:   {}", stats.failed_ops);
    println!("  tombstones:   {}", stats.tombstones);

    for ws in store.workspaces() {
        if let Some(filter) = workspace {
            if ws.as_str() != filter {
                continue;
            }
        }
        println!("Workspace {ws}");
        for table in store.tables(&ws) {
            println!("  {table}: {} records", store.list(&ws, &table).len());
        }
        for (device, cursor) in store.known_cursors(&ws) {
            println!("  device {device} at {cursor}");
        }
    }

    Ok(())
}
