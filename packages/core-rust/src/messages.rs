//! Wire messages exchanged between callers and the dispatcher.
//!
//! Inbound: [`RequestEnvelope`] (request + unlock material).
//! Outbound: [`ReplyMessage`] carrying one [`ProgressEvent`], internally tagged
//! by `status` (`UPDATE_PROGRESS`, `PREVENT_CANCEL`, `OKAY`). Both directions
//! serialize as named MsgPack maps via `rmp_serde::to_vec_named()` or as JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto_input::CryptoInput;
use crate::request::{Request, RequestKind};
use crate::result::OperationResult;

/// Identifier the dispatcher assigns to each dispatch. Never reused within one
/// dispatcher instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchId(pub u64);

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d-{}", self.0)
    }
}

/// Status discriminant of a [`ProgressEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    UpdateProgress,
    PreventCancel,
    Okay,
}

/// One event on a dispatch's progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressEvent {
    UpdateProgress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        progress: u32,
        max: u32,
    },
    PreventCancel,
    /// Terminal event. Nothing follows it for the same dispatch.
    Okay { result: Box<OperationResult> },
}

impl ProgressEvent {
    #[must_use]
    pub fn status(&self) -> MessageStatus {
        match self {
            Self::UpdateProgress { .. } => MessageStatus::UpdateProgress,
            Self::PreventCancel => MessageStatus::PreventCancel,
            Self::Okay { .. } => MessageStatus::Okay,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Okay { .. })
    }

    #[must_use]
    pub fn result(&self) -> Option<&OperationResult> {
        match self {
            Self::Okay { result } => Some(result),
            _ => None,
        }
    }
}

/// A [`ProgressEvent`] addressed to the caller of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessage {
    pub dispatch_id: DispatchId,
    pub event: ProgressEvent,
}

/// Inbound request with its accompanying unlock material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request: Request,
    #[serde(default)]
    pub crypto_input: CryptoInput,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors from encoding outbound messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("msgpack encode failed: {0}")]
    MsgPack(#[from] rmp_serde::encode::Error),
    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from decoding an inbound [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The `type` discriminator names no known request kind.
    #[error("unrecognized request type: {type_name}")]
    UnrecognizedRequest { type_name: String },
    /// The envelope is not well-formed for its (known) request kind.
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Encodes a reply as a named MsgPack map.
///
/// # Errors
///
/// Returns `CodecError::MsgPack` if serialization fails.
pub fn encode_reply(message: &ReplyMessage) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decodes a reply previously produced by [`encode_reply`].
///
/// # Errors
///
/// Returns `DecodeError::Malformed` if the bytes are not a valid reply.
pub fn decode_reply(bytes: &[u8]) -> Result<ReplyMessage, DecodeError> {
    rmp_serde::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Encodes a request envelope as a named MsgPack map.
///
/// # Errors
///
/// Returns `CodecError::MsgPack` if serialization fails.
pub fn encode_request(envelope: &RequestEnvelope) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(envelope)?)
}

/// Decodes a MsgPack request envelope, separating unknown request kinds from
/// malformed payloads.
///
/// # Errors
///
/// - `DecodeError::UnrecognizedRequest` if `request.type` names no known kind
/// - `DecodeError::Malformed` for any other decoding problem
pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, DecodeError> {
    let value: rmpv::Value =
        rmp_serde::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let type_name = msgpack_request_type(&value)?;
    check_known(type_name)?;
    rmp_serde::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// JSON counterpart of [`decode_request`].
///
/// # Errors
///
/// Same classification as [`decode_request`].
pub fn decode_request_json(bytes: &[u8]) -> Result<RequestEnvelope, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let type_name = value
        .get("request")
        .and_then(|request| request.get("type"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing request.type".to_string()))?;
    check_known(type_name)?;
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn msgpack_request_type(value: &rmpv::Value) -> Result<&str, DecodeError> {
    fn field<'a>(map: &'a rmpv::Value, key: &str) -> Option<&'a rmpv::Value> {
        map.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
    field(value, "request")
        .and_then(|request| field(request, "type"))
        .and_then(rmpv::Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing request.type".to_string()))
}

fn check_known(type_name: &str) -> Result<RequestKind, DecodeError> {
    RequestKind::from_name(type_name).ok_or_else(|| DecodeError::UnrecognizedRequest {
        type_name: type_name.to_string(),
    })
}
