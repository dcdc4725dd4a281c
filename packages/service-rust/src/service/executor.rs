//! Runs bound operations off the caller's task.
//!
//! Worker policy: a bounded pool. At most `capacity` operations run at once,
//! gated by a FIFO [`Semaphore`]; further submissions queue without bound and
//! start in submission order. Each admitted operation runs on its own tokio
//! task so a panic is caught at the join boundary and reported as an
//! `InternalError` result.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use keyop_core::{CryptoInput, DispatchId, OperationResult, RequestKind};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info_span, Instrument};

use super::cancel::{CancellationToken, Cancelled};
use super::operation::OperationContext;
use super::progress::ProgressChannel;
use super::registry::BoundOperation;
use crate::traits::KeyRepository;

/// Called once a dispatch is finished, just before its terminal event is
/// published.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Everything the executor needs to run one dispatch.
pub struct Submission {
    pub dispatch_id: DispatchId,
    pub operation: BoundOperation,
    pub crypto: CryptoInput,
    pub channel: ProgressChannel,
    pub token: CancellationToken,
    pub repository: Arc<dyn KeyRepository>,
    pub on_release: Option<ReleaseHook>,
}

#[derive(Debug, Default)]
struct Counters {
    running: AtomicUsize,
    queued: AtomicUsize,
}

/// Bounded worker pool for dispatched operations. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct OperationExecutor {
    permits: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl OperationExecutor {
    /// Creates a pool running at most `capacity` operations at once (min 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Operations currently holding a worker slot.
    #[must_use]
    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::Acquire)
    }

    /// Submissions waiting for a worker slot.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::Acquire)
    }

    /// Schedules `submission` and returns immediately.
    ///
    /// The returned handle resolves to the same result that was published as
    /// the terminal event. Callers may drop it.
    pub fn submit(&self, submission: Submission) -> JoinHandle<OperationResult> {
        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        let span = info_span!(
            "dispatch",
            dispatch_id = %submission.dispatch_id,
            operation = submission.operation.name(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        counters.queued.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(run_submission(submission, permits, counters).instrument(span))
    }
}

async fn run_submission(
    submission: Submission,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
) -> OperationResult {
    let Submission {
        dispatch_id,
        operation,
        crypto,
        channel,
        token,
        repository,
        on_release,
    } = submission;
    let kind = operation.kind();
    let name = operation.name();

    let permit = permits.acquire_owned().await;
    counters.queued.fetch_sub(1, Ordering::AcqRel);
    counters.running.fetch_add(1, Ordering::AcqRel);
    let start = Instant::now();

    let result = match permit {
        Err(_) => OperationResult::internal_error(kind, "worker pool closed"),
        Ok(_) if kind.is_cancellable() && token.is_cancelled() => {
            OperationResult::cancelled(kind)
        }
        Ok(_) => {
            let ctx = OperationContext::new(dispatch_id, kind, channel.reporter(), token, repository);
            let task = tokio::spawn(operation.run(crypto, ctx).in_current_span());
            match task.await {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => result_from_error(kind, &err),
                Err(join_err) => result_from_join_error(kind, join_err),
            }
        }
    };
    counters.running.fetch_sub(1, Ordering::AcqRel);
    drop(permit);

    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = start.elapsed().as_millis() as u64;
    let outcome = result.outcome_label();
    tracing::Span::current().record("duration_ms", duration_ms);
    tracing::Span::current().record("outcome", outcome);
    tracing::info!(
        dispatch_id = %dispatch_id,
        operation = name,
        duration_ms = duration_ms,
        outcome = outcome,
        "operation complete"
    );

    match on_release {
        Some(release) => channel.complete_and_retire(result.clone(), release),
        None => channel.complete(result.clone()),
    }
    result
}

/// Maps an operation's `Err` to a terminal result.
fn result_from_error(kind: RequestKind, err: &anyhow::Error) -> OperationResult {
    if err.chain().any(|cause| cause.is::<Cancelled>()) {
        return OperationResult::cancelled(kind);
    }
    error!(operation = %kind, error = %format!("{err:#}"), "operation failed unexpectedly");
    OperationResult::internal_error(kind, format!("{err:#}"))
}

fn result_from_join_error(kind: RequestKind, err: JoinError) -> OperationResult {
    if err.is_panic() {
        let message = panic_message(err.into_panic().as_ref());
        error!(operation = %kind, panic = %message, "operation panicked");
        OperationResult::internal_error(kind, format!("operation panicked: {message}"))
    } else {
        OperationResult::internal_error(kind, "operation task was aborted")
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
