//! Device identity and clock state.

use crate::dir::StoreDir;
use crate::error::StoreResult;
use driftsync_protocol::{DeviceId, Hlc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Durable identity of this device.
///
/// Generated once when the store is first created and persisted for the
/// lifetime of the local database; it never changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable random device ID.
    pub device_id: DeviceId,
    /// When the identity was created, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Last issued HLC, persisted so restarts never reissue timestamps.
    pub last_hlc: Hlc,
}

impl DeviceIdentity {
    /// Generates a fresh identity.
    pub fn generate() -> Self {
        let device_id = DeviceId::generate();
        let created_at_ms = now_ms();
        Self {
            device_id,
            created_at_ms,
            last_hlc: Hlc::new(created_at_ms, device_id),
        }
    }

    /// Loads the identity from the store directory, creating it on first use.
    pub fn load_or_create(dir: &StoreDir) -> StoreResult<Self> {
        let path = dir.device_path();
        if path.exists() {
            let bytes = fs::read(&path)?;
            Ok(serde_json::from_slice(&bytes)?)
        } else {
            let identity = Self::generate();
            identity.save(dir)?;
            Ok(identity)
        }
    }

    /// Persists the identity (and clock state) to the store directory.
    pub fn save(&self, dir: &StoreDir) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fs::write(dir.device_path(), bytes)?;
        Ok(())
    }
}

/// Hybrid logical clock for this device.
///
/// Wraps the persisted [`Hlc`] state behind a lock so every issued
/// timestamp is strictly greater than the previous one, regardless of
/// wall-clock behavior.
#[derive(Debug)]
pub struct HlcClock {
    state: Mutex<Hlc>,
}

impl HlcClock {
    /// Creates a clock resuming from persisted state.
    pub fn new(last: Hlc) -> Self {
        Self {
            state: Mutex::new(last),
        }
    }

    /// Issues the next timestamp.
    pub fn tick(&self) -> Hlc {
        let mut state = self.state.lock();
        let next = state.tick_at(now_ms());
        *state = next;
        next
    }

    /// Merges an observed remote timestamp into the clock.
    ///
    /// Ensures subsequent local timestamps order after everything this
    /// device has seen.
    pub fn observe(&self, remote: &Hlc) {
        let mut state = self.state.lock();
        let next = state.observe_at(remote, now_ms());
        *state = next;
    }

    /// Returns the most recently issued timestamp.
    pub fn last(&self) -> Hlc {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn identity_persists_across_opens() {
        let tmp = TempDir::new().unwrap();
        let first_id;
        {
            let dir = StoreDir::open(tmp.path(), true).unwrap();
            let identity = DeviceIdentity::load_or_create(&dir).unwrap();
            first_id = identity.device_id;
        }
        {
            let dir = StoreDir::open(tmp.path(), true).unwrap();
            let identity = DeviceIdentity::load_or_create(&dir).unwrap();
            assert_eq!(identity.device_id, first_id);
        }
    }

    #[test]
    fn ticks_are_strictly_increasing() {
        let device = DeviceId::from_uuid(Uuid::from_bytes([1; 16]));
        let clock = HlcClock::new(Hlc::new(now_ms() + 60_000, device));

        // Wall clock is behind the stored state: counters must carry order
        let mut previous = clock.last();
        for _ in 0..100 {
            let next = clock.tick();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn observe_pushes_clock_forward() {
        let device = DeviceId::from_uuid(Uuid::from_bytes([1; 16]));
        let clock = HlcClock::new(Hlc::new(1, device));

        let remote = Hlc::new(now_ms() + 120_000, DeviceId::from_uuid(Uuid::from_bytes([2; 16])));
        clock.observe(&remote);

        let next = clock.tick();
        assert!(next > remote);
        assert_eq!(next.device_id, device);
    }
}
