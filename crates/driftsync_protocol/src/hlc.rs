//! Hybrid logical clock timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Stable identity of one device.
///
/// Device IDs are random values generated once per local database and
/// persisted for its lifetime. They never change, and they break ties in
/// the [`Hlc`] total order so two devices with identical wall clocks still
/// order deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Generates a fresh random device identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A hybrid logical clock timestamp.
///
/// Combines wall-clock milliseconds with a logical counter and the device
/// identity. Comparison is lexicographic over `(physical_ms, counter,
/// device_id)`, which makes the clock a total order across devices even
/// with skewed wall clocks.
///
/// The wire encoding is a fixed-width hex string whose byte order equals
/// the timestamp order, so an `Hlc` string doubles as a sortable order key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hlc {
    /// Wall-clock milliseconds since the Unix epoch.
    pub physical_ms: u64,
    /// Logical counter, reset whenever physical time advances.
    pub counter: u32,
    /// The device that produced this timestamp.
    pub device_id: DeviceId,
}

impl Hlc {
    /// Creates a timestamp at the given physical time with a zero counter.
    pub const fn new(physical_ms: u64, device_id: DeviceId) -> Self {
        Self {
            physical_ms,
            counter: 0,
            device_id,
        }
    }

    /// Returns the timestamp that follows `self` at the given wall time.
    ///
    /// If wall time moved past the previous physical component, the new
    /// timestamp adopts it and resets the counter. Otherwise physical time
    /// is held and the counter increments, preserving monotonicity under
    /// stalled or regressing wall clocks.
    pub fn tick_at(&self, now_ms: u64) -> Self {
        if now_ms > self.physical_ms {
            Self {
                physical_ms: now_ms,
                counter: 0,
                device_id: self.device_id,
            }
        } else {
            Self {
                physical_ms: self.physical_ms,
                counter: self.counter + 1,
                device_id: self.device_id,
            }
        }
    }

    /// Merges an observed remote timestamp at the given wall time.
    ///
    /// The result is strictly greater than both `self` and `remote`, so a
    /// write made after observing remote state is always ordered after it.
    pub fn observe_at(&self, remote: &Hlc, now_ms: u64) -> Self {
        let physical = now_ms.max(self.physical_ms).max(remote.physical_ms);
        let counter = if physical == self.physical_ms && physical == remote.physical_ms {
            self.counter.max(remote.counter) + 1
        } else if physical == self.physical_ms {
            self.counter + 1
        } else if physical == remote.physical_ms {
            remote.counter + 1
        } else {
            0
        };
        Self {
            physical_ms: physical,
            counter,
            device_id: self.device_id,
        }
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}-{:08x}-{}",
            self.physical_ms,
            self.counter,
            self.device_id.as_uuid().simple()
        )
    }
}

/// Error parsing an [`Hlc`] from its wire string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid HLC string: {0}")]
pub struct HlcParseError(String);

impl FromStr for Hlc {
    type Err = HlcParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let physical = parts
            .next()
            .and_then(|p| u64::from_str_radix(p, 16).ok())
            .ok_or_else(|| HlcParseError(s.to_string()))?;
        let counter = parts
            .next()
            .and_then(|p| u32::from_str_radix(p, 16).ok())
            .ok_or_else(|| HlcParseError(s.to_string()))?;
        let device = parts
            .next()
            .and_then(|p| Uuid::from_str(p).ok())
            .ok_or_else(|| HlcParseError(s.to_string()))?;

        Ok(Self {
            physical_ms: physical,
            counter,
            device_id: DeviceId::from_uuid(device),
        })
    }
}

impl Serialize for Hlc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
