//! Operation results: the single terminal outcome of every dispatch.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::request::RequestKind;
use crate::types::KeyId;

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Ok,
    Warn,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Ordered, human-readable record of what an operation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationLog(Vec<LogEntry>);

impl OperationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, level: LogLevel, message: impl Into<String>) {
        self.0.push(LogEntry {
            level,
            message: message.into(),
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.add(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.add(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.add(LogLevel::Error, message);
    }

    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.0
    }

    #[must_use]
    pub fn contains_level(&self, level: LogLevel) -> bool {
        self.0.iter().any(|entry| entry.level == level)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Reason an operation ran but could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    NotFound,
    BadPassphrase,
    NoSecretKey,
    KeyRevoked,
    InvalidInput,
    NetworkError,
    IoError,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailure {
    pub code: FailureCode,
    pub message: String,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Input the caller must supply before the operation can proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum RequiredInput {
    Passphrase {
        key_id: KeyId,
    },
    SecurityToken {
        key_id: KeyId,
    },
    BackupCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureStatus {
    /// Signed by a key present in the repository.
    Verified,
    /// Signed by a key the repository does not know.
    UnknownKey,
    /// Signed by a revoked key.
    RevokedKey,
}

/// A piece of a mixed input text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "part", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum InputPart {
    Text {
        text: String,
    },
    Decrypted {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<SignatureStatus>,
    },
    /// An armored block that could not (or need not) be decrypted.
    Armored {
        label: String,
        text: String,
    },
}

/// Success payloads, one shape per family of operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ResultPayload {
    /// The operation only changed repository state.
    Empty,
    KeySaved {
        master_key_id: KeyId,
    },
    Output {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Decrypted {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signer: Option<KeyId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<SignatureStatus>,
    },
    Deleted {
        deleted: Vec<KeyId>,
        missing: Vec<KeyId>,
    },
    Certified {
        certified: u32,
    },
    Imported {
        new: Vec<KeyId>,
        updated: Vec<KeyId>,
        unchanged: Vec<KeyId>,
        failed: u32,
    },
    Backup {
        count: u32,
        /// Armored data when written to memory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        armored: Option<String>,
    },
    IdentityVerified {
        identity: String,
    },
    InputParts {
        parts: Vec<InputPart>,
    },
    Benchmark {
        rounds: u32,
        bytes: u64,
        elapsed_ms: u64,
    },
    KeySync {
        refreshed: Vec<KeyId>,
        not_on_server: Vec<KeyId>,
        failed: u32,
    },
}

/// How the dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success { result: ResultPayload },
    Failure { failure: OperationFailure },
    InputRequired { required: RequiredInput },
    Cancelled,
    InternalError { message: String },
}

// ---------------------------------------------------------------------------
// OperationResult
// ---------------------------------------------------------------------------

/// Outcome of one dispatched operation plus its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub kind: RequestKind,
    pub outcome: Outcome,
    #[serde(default)]
    pub log: OperationLog,
}

impl OperationResult {
    #[must_use]
    pub fn success(kind: RequestKind, result: ResultPayload) -> Self {
        Self {
            kind,
            outcome: Outcome::Success { result },
            log: OperationLog::new(),
        }
    }

    #[must_use]
    pub fn failure(kind: RequestKind, code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            outcome: Outcome::Failure {
                failure: OperationFailure {
                    code,
                    message: message.into(),
                },
            },
            log: OperationLog::new(),
        }
    }

    #[must_use]
    pub fn input_required(kind: RequestKind, required: RequiredInput) -> Self {
        Self {
            kind,
            outcome: Outcome::InputRequired { required },
            log: OperationLog::new(),
        }
    }

    #[must_use]
    pub fn cancelled(kind: RequestKind) -> Self {
        Self {
            kind,
            outcome: Outcome::Cancelled,
            log: OperationLog::new(),
        }
    }

    #[must_use]
    pub fn internal_error(kind: RequestKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            outcome: Outcome::InternalError {
                message: message.into(),
            },
            log: OperationLog::new(),
        }
    }

    /// Attaches the log collected while the operation ran.
    #[must_use]
    pub fn with_log(mut self, log: OperationLog) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, Outcome::Cancelled)
    }

    #[must_use]
    pub fn is_internal_error(&self) -> bool {
        matches!(self.outcome, Outcome::InternalError { .. })
    }

    #[must_use]
    pub fn failure_code(&self) -> Option<FailureCode> {
        match &self.outcome {
            Outcome::Failure { failure } => Some(failure.code),
            _ => None,
        }
    }

    #[must_use]
    pub fn payload(&self) -> Option<&ResultPayload> {
        match &self.outcome {
            Outcome::Success { result } => Some(result),
            _ => None,
        }
    }

    /// Short label used in logs and span fields.
    #[must_use]
    pub fn outcome_label(&self) -> &'static str {
        match self.outcome {
            Outcome::Success { .. } => "ok",
            Outcome::Failure { .. } => "failure",
            Outcome::InputRequired { .. } => "input_required",
            Outcome::Cancelled => "cancelled",
            Outcome::InternalError { .. } => "internal_error",
        }
    }
}
