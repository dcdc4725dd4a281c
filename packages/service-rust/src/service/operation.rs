use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use keyop_core::{CryptoInput, DecodeError, DispatchId, OperationResult, RequestKind};

use super::cancel::{CancellationToken, Cancelled};
use super::progress::ProgressReporter;
use crate::traits::KeyRepository;

// ---------------------------------------------------------------------------
// Operation trait
// ---------------------------------------------------------------------------

/// One long-running operation, implemented once per request kind.
///
/// `P` is the parcel the request variant carries. Expected failures (bad
/// passphrase, missing key, network trouble) are returned as data inside the
/// `OperationResult`. An `Err` is reserved for faults: the executor turns it
/// into an `InternalError` result, except when its root cause is
/// [`Cancelled`], which becomes a `Cancelled` result.
#[async_trait]
pub trait Operation<P: Send + 'static>: Send + Sync {
    /// Short name used in logs and spans (e.g. `"import"`).
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        parcel: P,
        crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult>;
}

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// Everything an operation gets besides its parcel: progress reporting, its
/// dispatch's cancellation token, and the shared key repository.
#[derive(Clone)]
pub struct OperationContext {
    dispatch_id: DispatchId,
    kind: RequestKind,
    progress: ProgressReporter,
    token: CancellationToken,
    repository: Arc<dyn KeyRepository>,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("dispatch_id", &self.dispatch_id)
            .field("kind", &self.kind)
            .field("cancel_requested", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl OperationContext {
    #[must_use]
    pub fn new(
        dispatch_id: DispatchId,
        kind: RequestKind,
        progress: ProgressReporter,
        token: CancellationToken,
        repository: Arc<dyn KeyRepository>,
    ) -> Self {
        Self {
            dispatch_id,
            kind,
            progress,
            token,
            repository,
        }
    }

    #[must_use]
    pub fn dispatch_id(&self) -> DispatchId {
        self.dispatch_id
    }

    #[must_use]
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    #[must_use]
    pub fn repository(&self) -> &dyn KeyRepository {
        self.repository.as_ref()
    }

    #[must_use]
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn update(&self, message: &str, progress: u32, max: u32) {
        self.progress.update(Some(message), progress, max);
    }

    /// Marks the point of no return. From here on checkpoints always pass.
    pub fn prevent_cancel(&self) {
        self.progress.prevent_cancel();
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Polls the cancellation token.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if cancellation was requested and the operation has
    /// not yet called [`prevent_cancel`](Self::prevent_cancel).
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.progress.is_cancel_prevented() {
            return Ok(());
        }
        self.token.checkpoint()
    }

    /// Runs `fut` unless cancellation is requested first. Used around network
    /// calls so a cancel does not have to wait for a slow peer.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fires before `fut` completes. A
    /// future that is ready when the cancel is observed still yields its
    /// value, so completed side effects are never reported as cancelled.
    /// After `prevent_cancel` the future always runs to completion.
    pub async fn cancellable<F, T>(&self, fut: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T> + Send,
    {
        if self.progress.is_cancel_prevented() {
            return Ok(fut.await);
        }
        self.checkpoint()?;
        tokio::select! {
            biased;
            value = fut => Ok(value),
            () = self.token.cancelled() => Err(Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a dispatch is refused before any work is submitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The request names a kind this build does not know. Not retryable; the
    /// request producer and the dispatcher disagree on the request set.
    #[error("unrecognized request type: {type_name}")]
    UnrecognizedRequest { type_name: String },
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("dispatch {current} is still in flight")]
    Busy { current: DispatchId },
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl From<DecodeError> for DispatchError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnrecognizedRequest { type_name } => {
                Self::UnrecognizedRequest { type_name }
            }
            DecodeError::Malformed(reason) => Self::MalformedRequest(reason),
        }
    }
}
