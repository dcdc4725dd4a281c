use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 64-bit OpenPGP key id, displayed as 16 upper-case hex digits.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct KeyId(pub u64);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Error returned when parsing a [`KeyId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid key id: {0}")]
pub struct ParseKeyIdError(pub String);

impl FromStr for KeyId {
    type Err = ParseKeyIdError;

    /// Accepts hex with or without a `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() || digits.len() > 16 {
            return Err(ParseKeyIdError(s.to_string()));
        }
        u64::from_str_radix(digits, 16)
            .map(KeyId)
            .map_err(|_| ParseKeyIdError(s.to_string()))
    }
}

/// Full key fingerprint bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.0))
    }
}

/// How (and whether) the secret part of a key is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecretKeyType {
    /// Public key only.
    #[default]
    None,
    /// Secret key locked with a passphrase.
    Passphrase,
    /// Secret key stored with an empty passphrase.
    PassphraseEmpty,
    /// Secret operations are delegated to a security token.
    DivertToCard,
}

impl SecretKeyType {
    #[must_use]
    pub fn has_secret(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// A user id packet on a key ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserId {
    pub value: String,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub primary: bool,
}

impl UserId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            revoked: false,
            primary: false,
        }
    }
}

/// A subkey belonging to a master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubKey {
    pub key_id: KeyId,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub secret: SecretKeyType,
}

/// A certification made by `certifier` over one user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certification {
    pub certifier: KeyId,
    pub user_id: String,
    pub created_millis: u64,
}

/// A stored key ring.
///
/// Packet material is kept opaque: `public_material` and `secret_material` hold
/// the encoded key packets exactly as received and are only ever copied, never
/// interpreted, by the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRing {
    pub master_key_id: KeyId,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub user_ids: Vec<UserId>,
    #[serde(default)]
    pub subkeys: Vec<SubKey>,
    #[serde(default)]
    pub secret: SecretKeyType,
    /// SHA-256 digest binding the unlock passphrase to this key.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub passphrase_digest: Option<Vec<u8>>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub certifications: Vec<Certification>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub card_aid: Option<Vec<u8>>,
    #[serde(default, with = "serde_bytes")]
    pub public_material: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub secret_material: Option<Vec<u8>>,
}

impl KeyRing {
    /// Creates a public-only ring with no user ids.
    #[must_use]
    pub fn public(master_key_id: KeyId, fingerprint: Fingerprint) -> Self {
        Self {
            master_key_id,
            fingerprint,
            user_ids: Vec::new(),
            subkeys: Vec::new(),
            secret: SecretKeyType::None,
            passphrase_digest: None,
            revoked: false,
            certifications: Vec::new(),
            card_aid: None,
            public_material: Vec::new(),
            secret_material: None,
        }
    }

    /// The primary user id, falling back to the first non-revoked one.
    #[must_use]
    pub fn primary_user_id(&self) -> Option<&str> {
        self.user_ids
            .iter()
            .find(|uid| uid.primary && !uid.revoked)
            .or_else(|| self.user_ids.iter().find(|uid| !uid.revoked))
            .map(|uid| uid.value.as_str())
    }

    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.secret.has_secret()
    }

    /// Returns true if `key_id` is the master key or one of its subkeys.
    #[must_use]
    pub fn contains_key(&self, key_id: KeyId) -> bool {
        self.master_key_id == key_id || self.subkeys.iter().any(|sub| sub.key_id == key_id)
    }
}
