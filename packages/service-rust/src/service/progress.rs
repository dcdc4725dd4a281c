//! Progress reporting back to the caller of a dispatch.
//!
//! Each dispatch owns one [`ProgressChannel`] bound to the caller's
//! [`ReplyTarget`]. The running operation publishes through cloneable
//! [`ProgressReporter`] handles; the executor calls
//! [`ProgressChannel::complete`] exactly once with the terminal result. All
//! events of a dispatch are published under one lock, so they reach the target
//! in publication order and nothing is published after the terminal event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use keyop_core::messages::encode_reply;
use keyop_core::{DispatchId, OperationResult, ProgressEvent, ReplyMessage, RequestKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// ReplyTarget
// ---------------------------------------------------------------------------

/// Failure to hand a message to the caller's reply destination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("reply destination disconnected")]
    Disconnected,
    #[error("reply encoding failed: {0}")]
    Encode(String),
}

/// Abstract "send message" capability pointing back at a caller.
///
/// Implementations must not block for long: they are called while the
/// dispatch's channel lock is held.
pub trait ReplyTarget: Send + Sync + 'static {
    /// Hands one message to the transport.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError` if the destination is gone or the message
    /// cannot be encoded.
    fn deliver(&self, message: ReplyMessage) -> Result<(), DeliveryError>;
}

/// In-process reply destination: the caller holds the receiver.
impl ReplyTarget for mpsc::UnboundedSender<ReplyMessage> {
    fn deliver(&self, message: ReplyMessage) -> Result<(), DeliveryError> {
        self.send(message).map_err(|_| DeliveryError::Disconnected)
    }
}

/// Reply destination that encodes each message as a named MsgPack frame, for
/// transports that move raw bytes between processes.
#[derive(Debug, Clone)]
pub struct EncodedReplyTarget {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl EncodedReplyTarget {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }
}

impl ReplyTarget for EncodedReplyTarget {
    fn deliver(&self, message: ReplyMessage) -> Result<(), DeliveryError> {
        let frame = encode_reply(&message).map_err(|e| DeliveryError::Encode(e.to_string()))?;
        self.tx
            .send(Bytes::from(frame))
            .map_err(|_| DeliveryError::Disconnected)
    }
}

/// Reply destination for dispatches nobody is waiting on (background jobs).
/// Progress goes to the debug log, the terminal result to the info log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReplyTarget;

impl ReplyTarget for LogReplyTarget {
    fn deliver(&self, message: ReplyMessage) -> Result<(), DeliveryError> {
        match &message.event {
            ProgressEvent::Okay { result } => info!(
                dispatch_id = %message.dispatch_id,
                operation = %result.kind,
                outcome = result.outcome_label(),
                "background dispatch finished"
            ),
            event => debug!(dispatch_id = %message.dispatch_id, ?event, "background progress"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProgressReporter / ProgressChannel
// ---------------------------------------------------------------------------

struct Shared {
    dispatch_id: DispatchId,
    kind: RequestKind,
    target: Arc<dyn ReplyTarget>,
    /// `true` once the terminal event has been published.
    closed: Mutex<bool>,
    cancel_prevented: AtomicBool,
}

impl Shared {
    /// Publishes a non-terminal event unless the channel is closed.
    fn publish(&self, event: ProgressEvent) {
        let closed = self.closed.lock();
        if *closed {
            debug!(dispatch_id = %self.dispatch_id, "dropping progress event after terminal result");
            return;
        }
        self.deliver(event);
    }

    /// Publishes the terminal event and closes the channel. `retire` runs
    /// under the channel lock before the event leaves, so whoever observes the
    /// terminal event also observes its effects. Returns `false` if the channel
    /// was already closed.
    fn close_with(
        &self,
        result: OperationResult,
        retire: Option<Box<dyn FnOnce() + Send>>,
    ) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;
        if let Some(retire) = retire {
            retire();
        }
        self.deliver(ProgressEvent::Okay {
            result: Box::new(result),
        });
        true
    }

    fn deliver(&self, event: ProgressEvent) {
        let message = ReplyMessage {
            dispatch_id: self.dispatch_id,
            event,
        };
        if let Err(e) = self.target.deliver(message) {
            warn!(
                dispatch_id = %self.dispatch_id,
                operation = %self.kind,
                error = %e,
                "failed to deliver progress message, is the caller still listening?"
            );
        }
    }
}

/// Progress publishing handle given to a running operation.
#[derive(Clone)]
pub struct ProgressReporter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("dispatch_id", &self.shared.dispatch_id)
            .field("kind", &self.shared.kind)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    /// Publishes a progress update with an optional status message.
    pub fn update(&self, message: Option<&str>, progress: u32, max: u32) {
        debug!(dispatch_id = %self.shared.dispatch_id, progress, max, "progress update");
        self.shared.publish(ProgressEvent::UpdateProgress {
            message: message.map(str::to_string),
            progress,
            max,
        });
    }

    pub fn set_progress(&self, progress: u32, max: u32) {
        self.update(None, progress, max);
    }

    /// Signals that the operation passed its point of no return. Only the
    /// first call publishes an event.
    pub fn prevent_cancel(&self) {
        if !self.shared.cancel_prevented.swap(true, Ordering::AcqRel) {
            self.shared.publish(ProgressEvent::PreventCancel);
        }
    }

    #[must_use]
    pub fn is_cancel_prevented(&self) -> bool {
        self.shared.cancel_prevented.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dispatch_id(&self) -> DispatchId {
        self.shared.dispatch_id
    }
}

/// Owner side of a dispatch's progress stream.
///
/// Dropping a channel that was never completed publishes an `InternalError`
/// terminal result so the caller is never left waiting.
pub struct ProgressChannel {
    reporter: ProgressReporter,
}

impl ProgressChannel {
    #[must_use]
    pub fn new(dispatch_id: DispatchId, kind: RequestKind, target: Arc<dyn ReplyTarget>) -> Self {
        Self {
            reporter: ProgressReporter {
                shared: Arc::new(Shared {
                    dispatch_id,
                    kind,
                    target,
                    closed: Mutex::new(false),
                    cancel_prevented: AtomicBool::new(false),
                }),
            },
        }
    }

    #[must_use]
    pub fn reporter(&self) -> ProgressReporter {
        self.reporter.clone()
    }

    /// Publishes the terminal result. Consumes the channel, so it can only
    /// happen once.
    pub fn complete(self, result: OperationResult) {
        self.reporter.shared.close_with(result, None);
    }

    /// Like [`complete`](Self::complete), but runs `retire` after the channel
    /// is closed and before the terminal event is handed to the target.
    pub fn complete_and_retire(self, result: OperationResult, retire: Box<dyn FnOnce() + Send>) {
        self.reporter.shared.close_with(result, Some(retire));
    }
}

impl Drop for ProgressChannel {
    fn drop(&mut self) {
        let shared = &self.reporter.shared;
        let abandoned = OperationResult::internal_error(
            shared.kind,
            "dispatch abandoned before completion",
        );
        if shared.close_with(abandoned, None) {
            warn!(dispatch_id = %shared.dispatch_id, "progress channel dropped without a result");
        }
    }
}
