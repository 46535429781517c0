//! Device command implementation.

use driftsync_store::{LocalStore, StoreConfig};
use std::path::Path;

/// Runs the device command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = LocalStore::open(path, StoreConfig::new().create_if_missing(false))?;

    println!("Device ID: {}", store.device_id());
    println!("Last HLC:  {}", store.clock().last());
    Ok(())
}
