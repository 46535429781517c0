//! GC command implementation.

use driftsync_engine::TombstoneGc;
use driftsync_protocol::WorkspaceId;
use driftsync_store::{LocalStore, StoreConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Runs the gc command.
pub fn run(
    path: &Path,
    workspace: &str,
    retention_days: u64,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(LocalStore::open(
        path,
        StoreConfig::new().create_if_missing(false),
    )?);
    let workspace = WorkspaceId::new(workspace);
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    if dry_run {
        let retention_ms = retention.as_millis() as u64;
        let min_cursor = store
            .known_cursors(&workspace)
            .iter()
            .map(|(_, cursor)| cursor.position())
            .min()
            .unwrap_or(0);

        let mut purgeable = 0usize;
        for (_, tombstone) in store.tombstones(&workspace) {
            let old_enough = now_ms.saturating_sub(tombstone.deleted_at_ms) > retention_ms;
            let observed = tombstone
                .server_version
                .map(|version| version <= min_cursor)
                .unwrap_or(false);
            if old_enough && observed {
                purgeable += 1;
            }
        }
        println!("Would purge {purgeable} tombstone(s)");
        return Ok(());
    }

    let gc = TombstoneGc::new(Arc::clone(&store), retention);
    let outcome = gc.run(&workspace, now_ms);
    store.save()?;

    println!(
        "Purged {} tombstone(s), retained {}",
        outcome.purged, outcome.retained
    );
    Ok(())
}
