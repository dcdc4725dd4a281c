//! `keyop` core: request parcels, operation results, progress messages, and key records.

pub mod crypto_input;
pub mod key_metadata;
pub mod messages;
pub mod request;
pub mod result;
pub mod transcript;
pub mod types;

pub use crypto_input::{CryptoInput, Passphrase, SessionKey};
pub use key_metadata::KeyMetadata;
pub use messages::{
    CodecError, DecodeError, DispatchId, MessageStatus, ProgressEvent, ReplyMessage,
    RequestEnvelope,
};
pub use request::{Request, RequestKind};
pub use result::{
    FailureCode, InputPart, LogLevel, OperationFailure, OperationLog, OperationResult, Outcome,
    RequiredInput, ResultPayload, SignatureStatus,
};
pub use transcript::{DispatchTranscript, TranscriptError};
pub use types::{Certification, Fingerprint, KeyId, KeyRing, SecretKeyType, SubKey, UserId};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
