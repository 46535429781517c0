//! # Driftsync Engine
//!
//! Local-first synchronization engine for Driftsync.
//!
//! This crate provides:
//! - An explicit per-workspace engine service with a
//!   construction/teardown lifecycle
//! - A coalescing, backpressured outbox policy over the store
//! - Idempotent batch push and strictly ordered at-most-once pull
//! - The pull transport duality (realtime subscription vs. polling)
//! - Circuit breaker, exponential backoff, and tombstone GC
//! - The pluggable provider abstraction (direct and gateway modes)
//! - A fire-and-forget observability hook surface
//!
//! ## Architecture
//!
//! A sync cycle is **pull-then-push**: remote changes resolve against
//! local state first, then the outbox drains in FIFO batches. The local
//! store stays readable and writable throughout; the engine never blocks
//! local work on remote health.
//!
//! ## Key Invariants
//!
//! - `op_id` is the idempotency key end to end
//! - Pulled changes apply in strictly increasing `server_version` order,
//!   each at most once
//! - The loser of a conflict is never applied
//! - The outbox never silently drops an operation
//! - Disposal cancels in-flight work before a new scope starts

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod breaker;
mod config;
mod engine;
mod error;
mod events;
mod gc;
mod outbox;
mod provider;
mod pull;
mod push;
mod transport;

pub use breaker::BreakerState;
pub use config::{BreakerConfig, EngineConfig, RetryConfig};
pub use engine::{SyncEngine, SyncReport, SyncState, SyncStats};
pub use error::{EngineError, EngineResult};
pub use events::{EventBus, EventHandler, SyncEvent};
pub use gc::{GcOutcome, TombstoneGc};
pub use provider::{
    ChangeCallback, Credential, DirectProvider, GatewayProvider, MockProvider, ProviderCapabilities,
    ProviderMode, Subscription, SyncConnection, SyncProvider, TokenBroker,
};
pub use pull::PullOutcome;
pub use push::PushOutcome;
pub use transport::{PollingTransport, RealtimeTransport, SyncTransport};
