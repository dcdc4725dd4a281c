//! Request parcels and the closed set of request kinds.
//!
//! A [`Request`] is internally tagged on the wire (`"type": "IMPORT"`, ...)
//! with the parcel nested under `payload`, matching the MsgPack named-map
//! layout produced by `rmp_serde::to_vec_named()`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::crypto_input::Passphrase;
use crate::types::{Fingerprint, KeyId, KeyRing};

// ---------------------------------------------------------------------------
// Parcels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignEncryptParcel {
    #[serde(with = "serde_bytes")]
    pub input: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_key_id: Option<KeyId>,
    #[serde(default)]
    pub encryption_key_ids: Vec<KeyId>,
    #[serde(default)]
    pub armor: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptVerifyParcel {
    #[serde(with = "serde_bytes")]
    pub input: Vec<u8>,
    /// Restricts which secret keys may be used; `None` allows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_key_ids: Option<Vec<KeyId>>,
}

/// Edits to an existing key ring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveKeyringParcel {
    pub master_key_id: KeyId,
    #[serde(default)]
    pub add_user_ids: Vec<String>,
    #[serde(default)]
    pub revoke_user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_primary_user_id: Option<String>,
    #[serde(default)]
    pub revoke_subkeys: Vec<KeyId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeUnlockParcel {
    pub master_key_id: KeyId,
    pub new_passphrase: Passphrase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeKeyringParcel {
    pub master_key_id: KeyId,
    #[serde(default)]
    pub upload: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertifyAction {
    pub target_key_id: KeyId,
    /// User ids to certify; empty certifies every non-revoked user id.
    #[serde(default)]
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertifyActionsParcel {
    pub master_key_id: KeyId,
    pub actions: Vec<CertifyAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteKeyringParcel {
    pub master_key_ids: Vec<KeyId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteKeyringParcel {
    pub master_key_id: KeyId,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub card_aid: Option<Vec<u8>>,
    /// Subkeys to promote; empty promotes all of them.
    #[serde(default)]
    pub subkey_ids: Vec<KeyId>,
}

/// One key to import: either carried in full or fetched from the keyserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ImportEntry {
    Bundle {
        ring: Box<KeyRing>,
    },
    Keyserver {
        key_id: KeyId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_fingerprint: Option<Fingerprint>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportKeyringParcel {
    pub entries: Vec<ImportEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupOutput {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupKeyringParcel {
    /// Keys to export; `None` exports the whole repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key_ids: Option<Vec<KeyId>>,
    #[serde(default)]
    pub export_secret: bool,
    #[serde(default)]
    pub output: BackupOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadKeyringParcel {
    pub master_key_id: KeyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityVerificationParcel {
    pub master_key_id: KeyId,
    /// Location of the published identity proof.
    pub proof_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDataParcel {
    #[serde(with = "serde_bytes")]
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkParcel {
    /// Overrides the configured number of rounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySyncParcel {
    /// Refresh every key instead of only stale ones.
    #[serde(default)]
    pub refresh_all: bool,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Typed request variants accepted by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    SignEncrypt { payload: SignEncryptParcel },
    DecryptVerify { payload: DecryptVerifyParcel },
    EditKey { payload: SaveKeyringParcel },
    ChangeUnlock { payload: ChangeUnlockParcel },
    Revoke { payload: RevokeKeyringParcel },
    Certify { payload: CertifyActionsParcel },
    Delete { payload: DeleteKeyringParcel },
    Promote { payload: PromoteKeyringParcel },
    Import { payload: ImportKeyringParcel },
    Backup { payload: BackupKeyringParcel },
    Upload { payload: UploadKeyringParcel },
    VerifyExternalIdentity { payload: IdentityVerificationParcel },
    InputData { payload: InputDataParcel },
    Benchmark { payload: BenchmarkParcel },
    KeySync { payload: KeySyncParcel },
}

impl Request {
    /// Returns the payload-free discriminant of this request.
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::SignEncrypt { .. } => RequestKind::SignEncrypt,
            Self::DecryptVerify { .. } => RequestKind::DecryptVerify,
            Self::EditKey { .. } => RequestKind::EditKey,
            Self::ChangeUnlock { .. } => RequestKind::ChangeUnlock,
            Self::Revoke { .. } => RequestKind::Revoke,
            Self::Certify { .. } => RequestKind::Certify,
            Self::Delete { .. } => RequestKind::Delete,
            Self::Promote { .. } => RequestKind::Promote,
            Self::Import { .. } => RequestKind::Import,
            Self::Backup { .. } => RequestKind::Backup,
            Self::Upload { .. } => RequestKind::Upload,
            Self::VerifyExternalIdentity { .. } => RequestKind::VerifyExternalIdentity,
            Self::InputData { .. } => RequestKind::InputData,
            Self::Benchmark { .. } => RequestKind::Benchmark,
            Self::KeySync { .. } => RequestKind::KeySync,
        }
    }
}

/// Discriminant of [`Request`], also carried on every result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    SignEncrypt,
    DecryptVerify,
    EditKey,
    ChangeUnlock,
    Revoke,
    Certify,
    Delete,
    Promote,
    Import,
    Backup,
    Upload,
    VerifyExternalIdentity,
    InputData,
    Benchmark,
    KeySync,
}

impl RequestKind {
    pub const ALL: [RequestKind; 15] = [
        Self::SignEncrypt,
        Self::DecryptVerify,
        Self::EditKey,
        Self::ChangeUnlock,
        Self::Revoke,
        Self::Certify,
        Self::Delete,
        Self::Promote,
        Self::Import,
        Self::Backup,
        Self::Upload,
        Self::VerifyExternalIdentity,
        Self::InputData,
        Self::Benchmark,
        Self::KeySync,
    ];

    /// Wire discriminator, identical to the `type` tag of [`Request`].
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::SignEncrypt => "SIGN_ENCRYPT",
            Self::DecryptVerify => "DECRYPT_VERIFY",
            Self::EditKey => "EDIT_KEY",
            Self::ChangeUnlock => "CHANGE_UNLOCK",
            Self::Revoke => "REVOKE",
            Self::Certify => "CERTIFY",
            Self::Delete => "DELETE",
            Self::Promote => "PROMOTE",
            Self::Import => "IMPORT",
            Self::Backup => "BACKUP",
            Self::Upload => "UPLOAD",
            Self::VerifyExternalIdentity => "VERIFY_EXTERNAL_IDENTITY",
            Self::InputData => "INPUT_DATA",
            Self::Benchmark => "BENCHMARK",
            Self::KeySync => "KEY_SYNC",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether operations of this kind honor cancellation at checkpoints.
    #[must_use]
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::SignEncrypt
                | Self::EditKey
                | Self::Certify
                | Self::Promote
                | Self::Import
                | Self::Backup
                | Self::Upload
                | Self::KeySync
        )
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
