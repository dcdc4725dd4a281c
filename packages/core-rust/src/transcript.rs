//! Caller-side bookkeeping for one dispatch's event stream.

use crate::messages::ProgressEvent;
use crate::result::OperationResult;

/// Protocol violations detected on an event stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    #[error("event received after the terminal result")]
    EventAfterTerminal,
}

/// Records the events of a single dispatch and enforces that the terminal
/// result is the last one.
#[derive(Debug, Default)]
pub struct DispatchTranscript {
    events: Vec<ProgressEvent>,
    cancel_prevented: bool,
    terminal: Option<usize>,
}

impl DispatchTranscript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    ///
    /// # Errors
    ///
    /// Returns `TranscriptError::EventAfterTerminal` if a terminal event was
    /// already recorded; the event is dropped.
    pub fn record(&mut self, event: ProgressEvent) -> Result<(), TranscriptError> {
        if self.terminal.is_some() {
            return Err(TranscriptError::EventAfterTerminal);
        }
        match &event {
            ProgressEvent::PreventCancel => self.cancel_prevented = true,
            ProgressEvent::Okay { .. } => self.terminal = Some(self.events.len()),
            ProgressEvent::UpdateProgress { .. } => {}
        }
        self.events.push(event);
        Ok(())
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.terminal.is_some()
    }

    /// Whether the caller should still offer a cancel affordance.
    #[must_use]
    pub fn can_cancel(&self) -> bool {
        !self.cancel_prevented && self.terminal.is_none()
    }

    #[must_use]
    pub fn result(&self) -> Option<&OperationResult> {
        self.terminal.and_then(|idx| self.events[idx].result())
    }

    /// Latest `(progress, max)` pair reported.
    #[must_use]
    pub fn last_progress(&self) -> Option<(u32, u32)> {
        self.events.iter().rev().find_map(|event| match event {
            ProgressEvent::UpdateProgress { progress, max, .. } => Some((*progress, *max)),
            _ => None,
        })
    }

    #[must_use]
    pub fn events(&self) -> &[ProgressEvent] {
        &self.events
    }
}
