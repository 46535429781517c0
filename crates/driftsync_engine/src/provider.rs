//! Sync provider abstraction.
//!
//! All higher-level components are written against [`SyncProvider`] only;
//! swapping providers never touches the outbox, resolver, or pull
//! manager. Two operating modes exist: *direct* (the client obtains a
//! short-lived credential from a token broker and talks to the backend
//! itself) and *gateway* (the client only ever talks to a same-origin
//! relay, which performs the direct call server-side).

use crate::error::{EngineError, EngineResult};
use driftsync_protocol::{ChangeBatch, Cursor, PendingOperation, PushReceipt, SyncScope};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// How a provider reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    /// Client holds a brokered credential and calls the backend directly.
    Direct,
    /// Client talks only to a same-origin relay; no backend credential
    /// ever reaches the client.
    Gateway,
}

/// What a provider can do beyond the baseline pull/push contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCapabilities {
    /// Whether the provider supports realtime change subscriptions.
    pub realtime: bool,
}

/// Callback invoked with each change batch from a subscription.
pub type ChangeCallback = Arc<dyn Fn(ChangeBatch) + Send + Sync>;

/// Handle for an active subscription; dropping it unsubscribes.
pub struct Subscription {
    disposer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps an unsubscribe action.
    pub fn new(disposer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disposer: Some(Box::new(disposer)),
        }
    }

    /// Explicitly tears the subscription down.
    pub fn dispose(mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.disposer.is_some())
            .finish()
    }
}

/// Pluggable backend binding.
pub trait SyncProvider: Send + Sync {
    /// Returns the provider's operating mode.
    fn mode(&self) -> ProviderMode;

    /// Returns what the provider can do.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Subscribes to the change stream; batches arrive via `on_change`.
    fn subscribe(&self, scope: &SyncScope, on_change: ChangeCallback)
        -> EngineResult<Subscription>;

    /// Pulls changes after `cursor`; `None` requests the complete current
    /// state (used by rescan).
    fn pull(
        &self,
        scope: &SyncScope,
        cursor: Option<Cursor>,
        table_filter: Option<&[String]>,
    ) -> EngineResult<ChangeBatch>;

    /// Pushes a batch of operations; `op_id` is the idempotency key.
    fn push(&self, scope: &SyncScope, ops: &[PendingOperation]) -> EngineResult<PushReceipt>;

    /// Releases provider resources.
    fn dispose(&self);
}

/// A short-lived backend credential issued by a token broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token for backend calls.
    pub token: String,
    /// Expiry, milliseconds since the Unix epoch.
    pub expires_at_ms: u64,
}

impl Credential {
    /// Returns true if the credential expires at or before `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

/// Exchanges an opaque scope token for a short-lived backend credential.
///
/// Authentication and workspace-membership resolution live behind this
/// trait; the engine only consumes the result.
pub trait TokenBroker: Send + Sync {
    /// Obtains a credential for the scope.
    fn credential(&self, scope: &SyncScope) -> EngineResult<Credential>;
}

/// Raw wire calls beneath a provider.
///
/// Implementations bind a concrete deployment (HTTP, loopback server,
/// in-memory test double). Direct mode passes the brokered credential;
/// gateway mode passes `None` and the relay authenticates server-side.
pub trait SyncConnection: Send + Sync {
    /// Pulls changes after `cursor`.
    fn pull(
        &self,
        scope: &SyncScope,
        cursor: Option<Cursor>,
        table_filter: Option<&[String]>,
        credential: Option<&Credential>,
    ) -> EngineResult<ChangeBatch>;

    /// Pushes a batch of operations.
    fn push(
        &self,
        scope: &SyncScope,
        ops: &[PendingOperation],
        credential: Option<&Credential>,
    ) -> EngineResult<PushReceipt>;

    /// Subscribes to the change stream, if supported.
    fn subscribe(
        &self,
        scope: &SyncScope,
        on_change: ChangeCallback,
        credential: Option<&Credential>,
    ) -> EngineResult<Subscription>;

    /// Whether the connection supports subscriptions.
    fn supports_realtime(&self) -> bool;
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Direct-mode provider: brokered credential, client-to-backend calls.
pub struct DirectProvider<C: SyncConnection> {
    connection: C,
    broker: Arc<dyn TokenBroker>,
    cached: Mutex<Option<Credential>>,
}

impl<C: SyncConnection> DirectProvider<C> {
    /// Creates a direct provider over a connection and broker.
    pub fn new(connection: C, broker: Arc<dyn TokenBroker>) -> Self {
        Self {
            connection,
            broker,
            cached: Mutex::new(None),
        }
    }

    /// Returns a fresh-enough credential, consulting the broker on expiry.
    fn credential(&self, scope: &SyncScope) -> EngineResult<Credential> {
        let mut cached = self.cached.lock();
        if let Some(credential) = cached.as_ref() {
            if !credential.is_expired(now_ms()) {
                return Ok(credential.clone());
            }
        }
        let fresh = self.broker.credential(scope)?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}

impl<C: SyncConnection> SyncProvider for DirectProvider<C> {
    fn mode(&self) -> ProviderMode {
        ProviderMode::Direct
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            realtime: self.connection.supports_realtime(),
        }
    }

    fn subscribe(
        &self,
        scope: &SyncScope,
        on_change: ChangeCallback,
    ) -> EngineResult<Subscription> {
        let credential = self.credential(scope)?;
        self.connection.subscribe(scope, on_change, Some(&credential))
    }

    fn pull(
        &self,
        scope: &SyncScope,
        cursor: Option<Cursor>,
        table_filter: Option<&[String]>,
    ) -> EngineResult<ChangeBatch> {
        let credential = self.credential(scope)?;
        self.connection
            .pull(scope, cursor, table_filter, Some(&credential))
    }

    fn push(&self, scope: &SyncScope, ops: &[PendingOperation]) -> EngineResult<PushReceipt> {
        let credential = self.credential(scope)?;
        self.connection.push(scope, ops, Some(&credential))
    }

    fn dispose(&self) {
        *self.cached.lock() = None;
    }
}

/// Gateway-mode provider: every call goes to a same-origin relay.
pub struct GatewayProvider<C: SyncConnection> {
    relay: C,
}

impl<C: SyncConnection> GatewayProvider<C> {
    /// Creates a gateway provider over a relay connection.
    pub fn new(relay: C) -> Self {
        Self { relay }
    }
}

impl<C: SyncConnection> SyncProvider for GatewayProvider<C> {
    fn mode(&self) -> ProviderMode {
        ProviderMode::Gateway
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            realtime: self.relay.supports_realtime(),
        }
    }

    fn subscribe(
        &self,
        scope: &SyncScope,
        on_change: ChangeCallback,
    ) -> EngineResult<Subscription> {
        self.relay.subscribe(scope, on_change, None)
    }

    fn pull(
        &self,
        scope: &SyncScope,
        cursor: Option<Cursor>,
        table_filter: Option<&[String]>,
    ) -> EngineResult<ChangeBatch> {
        self.relay.pull(scope, cursor, table_filter, None)
    }

    fn push(&self, scope: &SyncScope, ops: &[PendingOperation]) -> EngineResult<PushReceipt> {
        self.relay.push(scope, ops, None)
    }

    fn dispose(&self) {}
}

/// A scripted provider for tests.
#[derive(Default)]
pub struct MockProvider {
    pull_responses: Mutex<Vec<EngineResult<ChangeBatch>>>,
    push_responses: Mutex<Vec<EngineResult<PushReceipt>>>,
    pull_calls: Mutex<u32>,
    push_calls: Mutex<u32>,
}

impl MockProvider {
    /// Creates a mock with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a pull response.
    pub fn enqueue_pull(&self, response: EngineResult<ChangeBatch>) {
        self.pull_responses.lock().push(response);
    }

    /// Queues a push response.
    pub fn enqueue_push(&self, response: EngineResult<PushReceipt>) {
        self.push_responses.lock().push(response);
    }

    /// Number of pull calls made.
    pub fn pull_calls(&self) -> u32 {
        *self.pull_calls.lock()
    }

    /// Number of push calls made.
    pub fn push_calls(&self) -> u32 {
        *self.push_calls.lock()
    }
}

impl SyncProvider for MockProvider {
    fn mode(&self) -> ProviderMode {
        ProviderMode::Direct
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities { realtime: false }
    }

    fn subscribe(
        &self,
        _scope: &SyncScope,
        _on_change: ChangeCallback,
    ) -> EngineResult<Subscription> {
        Err(EngineError::transport_fatal("mock has no realtime support"))
    }

    fn pull(
        &self,
        _scope: &SyncScope,
        cursor: Option<Cursor>,
        _table_filter: Option<&[String]>,
    ) -> EngineResult<ChangeBatch> {
        *self.pull_calls.lock() += 1;
        let mut responses = self.pull_responses.lock();
        if responses.is_empty() {
            Ok(ChangeBatch::empty(cursor.unwrap_or(Cursor::ZERO)))
        } else {
            responses.remove(0)
        }
    }

    fn push(&self, _scope: &SyncScope, ops: &[PendingOperation]) -> EngineResult<PushReceipt> {
        *self.push_calls.lock() += 1;
        let mut responses = self.push_responses.lock();
        if responses.is_empty() {
            Ok(PushReceipt::all_acked(
                ops.iter().map(|op| op.op_id).collect(),
            ))
        } else {
            responses.remove(0)
        }
    }

    fn dispose(&self) {}
}
