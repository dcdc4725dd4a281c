//! Unlock material that accompanies a request.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::KeyId;

/// A passphrase. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Passphrase(String);

impl Passphrase {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The secret as text, for handing to a crypto backend.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// A session key cached from an earlier decryption of the same message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub key_id: KeyId,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Auxiliary secret input for an operation. Never persisted by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<Passphrase>,
    /// Signature creation time to use instead of "now".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_time_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_keys: Vec<SessionKey>,
}

impl CryptoInput {
    #[must_use]
    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: Some(Passphrase::new(passphrase)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn session_key_for(&self, key_id: KeyId) -> Option<&SessionKey> {
        self.session_keys.iter().find(|sk| sk.key_id == key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_secrets() {
        let mut input = CryptoInput::with_passphrase("hunter2");
        input.session_keys.push(SessionKey {
            key_id: KeyId(7),
            key: vec![0x42; 16],
        });
        let printed = format!("{input:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("66, 66"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn session_key_lookup_by_id() {
        let input = CryptoInput {
            session_keys: vec![SessionKey {
                key_id: KeyId(9),
                key: vec![1, 2, 3],
            }],
            ..CryptoInput::default()
        };
        assert!(input.session_key_for(KeyId(9)).is_some());
        assert!(input.session_key_for(KeyId(8)).is_none());
    }
}
