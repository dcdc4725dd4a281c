//! Front door of the service: accepts requests, assigns dispatch ids, and
//! hands bound operations to the executor.
//!
//! Every accepted dispatch is tracked until its terminal event has been
//! delivered. Cancellation is addressed by dispatch id, so a late `cancel`
//! for a finished dispatch never reaches a newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use keyop_core::messages::{decode_request, decode_request_json};
use keyop_core::{
    CryptoInput, DispatchId, OperationResult, Request, RequestEnvelope, RequestKind,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cancel::CancellationToken;
use super::config::DispatcherConfig;
use super::domain::OperationDeps;
use super::executor::{OperationExecutor, ReleaseHook, Submission};
use super::lifecycle::{DispatcherState, Lifecycle};
use super::operation::DispatchError;
use super::progress::{ProgressChannel, ProgressReporter, ReplyTarget};
use super::registry::OperationRegistry;
use crate::traits::KeyRepository;

// ---------------------------------------------------------------------------
// DispatchHandle
// ---------------------------------------------------------------------------

/// Caller-side handle for one accepted dispatch.
///
/// Dropping the handle does not cancel the dispatch.
#[derive(Debug)]
pub struct DispatchHandle {
    id: DispatchId,
    kind: RequestKind,
    token: CancellationToken,
    progress: ProgressReporter,
    completion: JoinHandle<OperationResult>,
}

impl DispatchHandle {
    #[must_use]
    pub fn id(&self) -> DispatchId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Requests cancellation. Returns `true` only for the call that set the
    /// flag; the operation still decides at its next checkpoint.
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    /// True once the operation has entered its non-cancellable phase.
    #[must_use]
    pub fn is_cancel_prevented(&self) -> bool {
        self.progress.is_cancel_prevented()
    }

    /// Waits for the terminal result. `None` only if the runtime shut down
    /// underneath the dispatch.
    pub async fn wait(self) -> Option<OperationResult> {
        self.completion.await.ok()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InFlightEntry {
    kind: RequestKind,
    token: CancellationToken,
}

/// Accepts any number of concurrent dispatches, each with its own reply
/// target and cancellation token.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<OperationRegistry>,
    executor: OperationExecutor,
    repository: Arc<dyn KeyRepository>,
    lifecycle: Arc<Lifecycle>,
    in_flight: Arc<DashMap<DispatchId, InFlightEntry>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.lifecycle.state())
            .field("in_flight", &self.in_flight.len())
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: OperationRegistry,
        repository: Arc<dyn KeyRepository>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            executor: OperationExecutor::new(config.max_concurrent_operations),
            repository,
            lifecycle: Arc::new(Lifecycle::new()),
            in_flight: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Dispatcher over the built-in operations.
    #[must_use]
    pub fn with_builtin(repository: Arc<dyn KeyRepository>, deps: &OperationDeps) -> Self {
        Self::new(OperationRegistry::builtin(deps), repository, &deps.config)
    }

    /// Accepts `request` and starts it on the worker pool. Returns as soon as
    /// the work is queued; progress and the result go to `target`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShuttingDown` once shutdown has begun.
    pub fn dispatch(
        &self,
        request: Request,
        crypto: CryptoInput,
        target: Arc<dyn ReplyTarget>,
    ) -> Result<DispatchHandle, DispatchError> {
        // Count the dispatch before checking the state so a concurrent drain
        // either sees it or rejects it.
        let guard = self.lifecycle.in_flight_guard();
        if !self.lifecycle.is_accepting() {
            return Err(DispatchError::ShuttingDown);
        }

        let operation = self.registry.resolve(request);
        let kind = operation.kind();
        let id = DispatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        let channel = ProgressChannel::new(id, kind, target);
        let progress = channel.reporter();

        self.in_flight.insert(
            id,
            InFlightEntry {
                kind,
                token: token.clone(),
            },
        );
        let in_flight = Arc::clone(&self.in_flight);
        let on_release: ReleaseHook = Box::new(move || {
            in_flight.remove(&id);
            drop(guard);
        });

        debug!(dispatch_id = %id, operation = operation.name(), "dispatch accepted");
        let completion = self.executor.submit(Submission {
            dispatch_id: id,
            operation,
            crypto,
            channel,
            token: token.clone(),
            repository: Arc::clone(&self.repository),
            on_release: Some(on_release),
        });

        Ok(DispatchHandle {
            id,
            kind,
            token,
            progress,
            completion,
        })
    }

    /// # Errors
    ///
    /// See [`Dispatcher::dispatch`].
    pub fn dispatch_envelope(
        &self,
        envelope: RequestEnvelope,
        target: Arc<dyn ReplyTarget>,
    ) -> Result<DispatchHandle, DispatchError> {
        self.dispatch(envelope.request, envelope.crypto_input, target)
    }

    /// Decodes a MsgPack request envelope and dispatches it.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedRequest` or `MalformedRequest` without submitting
    /// any work if the bytes do not decode, otherwise as
    /// [`Dispatcher::dispatch`].
    pub fn dispatch_encoded(
        &self,
        bytes: &[u8],
        target: Arc<dyn ReplyTarget>,
    ) -> Result<DispatchHandle, DispatchError> {
        let envelope = decode_request(bytes).inspect_err(|e| warn!(error = %e, "rejected request"))?;
        self.dispatch_envelope(envelope, target)
    }

    /// JSON flavour of [`Dispatcher::dispatch_encoded`].
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch_encoded`].
    pub fn dispatch_json(
        &self,
        bytes: &[u8],
        target: Arc<dyn ReplyTarget>,
    ) -> Result<DispatchHandle, DispatchError> {
        let envelope =
            decode_request_json(bytes).inspect_err(|e| warn!(error = %e, "rejected request"))?;
        self.dispatch_envelope(envelope, target)
    }

    /// Requests cancellation of dispatch `id`. Unknown or finished ids are
    /// ignored. Returns `true` only if this call set the flag.
    pub fn cancel(&self, id: DispatchId) -> bool {
        match self.in_flight.get(&id) {
            Some(entry) => {
                let flipped = entry.token.cancel();
                if flipped {
                    debug!(dispatch_id = %id, operation = %entry.kind, "cancellation requested");
                }
                flipped
            }
            None => false,
        }
    }

    /// Requests cancellation of every dispatch in flight. Returns how many
    /// tokens this call set.
    pub fn cancel_all(&self) -> usize {
        self.in_flight()
            .into_iter()
            .filter(|id| self.cancel(*id))
            .count()
    }

    /// Ids of the dispatches whose terminal event has not been delivered yet.
    #[must_use]
    pub fn in_flight(&self) -> Vec<DispatchId> {
        let mut ids: Vec<DispatchId> = self.in_flight.iter().map(|e| *e.key()).collect();
        ids.sort_unstable_by_key(|id| id.0);
        ids
    }

    #[must_use]
    pub fn is_in_flight(&self, id: DispatchId) -> bool {
        self.in_flight.contains_key(&id)
    }

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn executor(&self) -> &OperationExecutor {
        &self.executor
    }

    #[must_use]
    pub fn repository(&self) -> &Arc<dyn KeyRepository> {
        &self.repository
    }

    /// Stops accepting dispatches and waits up to `grace` for in-flight ones.
    /// Anything still running after that is cancelled and given another
    /// `grace` period. Returns `true` if everything delivered its terminal
    /// event.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if self.lifecycle.begin_drain() {
            info!(in_flight = self.lifecycle.in_flight_count(), "dispatcher draining");
        }
        if self.lifecycle.wait_for_drain(grace).await {
            info!("dispatcher stopped");
            return true;
        }

        let stuck: Vec<CancellationToken> =
            self.in_flight.iter().map(|e| e.token.clone()).collect();
        warn!(count = stuck.len(), "grace period elapsed, cancelling in-flight dispatches");
        for token in stuck {
            token.cancel();
        }
        let drained = self.lifecycle.wait_for_drain(grace).await;
        if drained {
            info!("dispatcher stopped");
        } else {
            warn!(
                in_flight = self.lifecycle.in_flight_count(),
                "dispatcher stopped with dispatches still running"
            );
        }
        drained
    }
}

// ---------------------------------------------------------------------------
// ExclusiveDispatcher
// ---------------------------------------------------------------------------

/// Single-flight front end: at most one dispatch in flight at a time, and
/// `cancel` always targets the current one.
#[derive(Debug)]
pub struct ExclusiveDispatcher {
    inner: Dispatcher,
    current: Mutex<Option<DispatchId>>,
}

impl ExclusiveDispatcher {
    /// Wraps a dispatcher. The inner worker pool still bounds execution, but
    /// only one dispatch is ever submitted to it at a time.
    #[must_use]
    pub fn new(inner: Dispatcher) -> Self {
        Self {
            inner,
            current: Mutex::new(None),
        }
    }

    /// # Errors
    ///
    /// Returns `DispatchError::Busy` while the previous dispatch has not
    /// delivered its terminal event, otherwise as [`Dispatcher::dispatch`].
    pub fn dispatch(
        &self,
        request: Request,
        crypto: CryptoInput,
        target: Arc<dyn ReplyTarget>,
    ) -> Result<DispatchHandle, DispatchError> {
        let mut current = self.current.lock();
        if let Some(id) = *current {
            if self.inner.is_in_flight(id) {
                return Err(DispatchError::Busy { current: id });
            }
        }
        let handle = self.inner.dispatch(request, crypto, target)?;
        *current = Some(handle.id());
        Ok(handle)
    }

    /// # Errors
    ///
    /// See [`ExclusiveDispatcher::dispatch`] and [`Dispatcher::dispatch_encoded`].
    pub fn dispatch_encoded(
        &self,
        bytes: &[u8],
        target: Arc<dyn ReplyTarget>,
    ) -> Result<DispatchHandle, DispatchError> {
        let envelope = decode_request(bytes)?;
        self.dispatch(envelope.request, envelope.crypto_input, target)
    }

    /// Cancels the current dispatch. A no-op when idle.
    pub fn cancel(&self) -> bool {
        match *self.current.lock() {
            Some(id) => self.inner.cancel(id),
            None => false,
        }
    }

    /// The dispatch currently in flight, if any.
    #[must_use]
    pub fn current(&self) -> Option<DispatchId> {
        self.current.lock().filter(|id| self.inner.is_in_flight(*id))
    }

    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.shutdown(grace).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
