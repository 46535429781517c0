//! Conflict resolution.
//!
//! Whole-record last-writer-wins: the resolver is a pure decision function
//! over version stamps. It never merges fields and never applies the
//! loser; callers emit a diagnostic event for discarded versions.

use crate::hlc::Hlc;
use crate::record::VersionStamp;

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The local version stays; the remote version is discarded.
    KeepLocal,
    /// The remote version replaces the local one.
    AcceptRemote,
}

/// Decides which of two versions of the same record wins.
///
/// Compares `clock` (higher wins), then `hlc` (higher wins), then `op_id`
/// lexicographically as a final deterministic tie-break. Deletions carry
/// stamps like any other write and participate in the same ordering.
///
/// Equal stamps mean the versions are the same write (an echo); the local
/// copy is kept so reapplication is a no-op.
pub fn resolve(local: VersionStamp, remote: VersionStamp) -> Resolution {
    if remote > local {
        Resolution::AcceptRemote
    } else {
        Resolution::KeepLocal
    }
}

/// Derives a stable ordering key for sibling records sharing a position.
///
/// Two devices inserting records at the same user-visible `index` must
/// converge to the same relative order everywhere. The key concatenates
/// the index with the write's causal timestamp, both in fixed-width forms
/// whose byte order equals their numeric order.
pub fn order_key(index: u64, hlc: &Hlc) -> String {
    format!("{index:016x}.{hlc}")
}
