//! Built-in operation implementations, one per request kind.
//!
//! Operations are grouped by concern: local key edits (`keys`), moving keys
//! in and out of the repository (`transfer`), message cryptography
//! (`crypto`), and external identity proofs (`identity`). Shared unlock and
//! merge helpers live here.

pub mod armor;
pub mod crypto;
pub mod identity;
pub mod keys;
pub mod transfer;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use keyop_core::{
    CryptoInput, FailureCode, KeyId, KeyRing, OperationResult, Passphrase, RequestKind,
    RequiredInput, SecretKeyType,
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::config::DispatcherConfig;
use crate::traits::{
    CryptoEngine, CryptoError, Keyserver, NoCryptoEngine, NoKeyserver, NoProofVerifier,
    ProofVerifier,
};

// ---------------------------------------------------------------------------
// OperationDeps
// ---------------------------------------------------------------------------

/// External collaborators shared by the built-in operations.
#[derive(Clone)]
pub struct OperationDeps {
    pub keyserver: Arc<dyn Keyserver>,
    pub crypto: Arc<dyn CryptoEngine>,
    pub proofs: Arc<dyn ProofVerifier>,
    pub config: Arc<DispatcherConfig>,
}

impl Default for OperationDeps {
    fn default() -> Self {
        Self {
            keyserver: Arc::new(NoKeyserver),
            crypto: Arc::new(NoCryptoEngine),
            proofs: Arc::new(NoProofVerifier),
            config: Arc::new(DispatcherConfig::default()),
        }
    }
}

impl std::fmt::Debug for OperationDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDeps")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Unlock
// ---------------------------------------------------------------------------

/// SHA-256 over the big-endian master key id followed by the passphrase.
#[must_use]
pub fn passphrase_digest(master_key_id: KeyId, passphrase: &Passphrase) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(master_key_id.0.to_be_bytes());
    hasher.update(passphrase.as_bytes());
    hasher.finalize().to_vec()
}

/// Why a secret key could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Locked {
    NoSecret(KeyId),
    Needs(RequiredInput),
    BadPassphrase(KeyId),
}

impl Locked {
    pub(crate) fn into_result(self, kind: RequestKind) -> OperationResult {
        match self {
            Self::NoSecret(id) => OperationResult::failure(
                kind,
                FailureCode::NoSecretKey,
                format!("no secret key available for {id}"),
            ),
            Self::Needs(required) => OperationResult::input_required(kind, required),
            Self::BadPassphrase(id) => OperationResult::failure(
                kind,
                FailureCode::BadPassphrase,
                format!("wrong passphrase for {id}"),
            ),
        }
    }
}

/// Checks that `crypto` unlocks the secret part of `ring`.
pub(crate) fn unlock(ring: &KeyRing, crypto: &CryptoInput) -> Result<(), Locked> {
    let id = ring.master_key_id;
    match ring.secret {
        SecretKeyType::None => Err(Locked::NoSecret(id)),
        SecretKeyType::PassphraseEmpty => Ok(()),
        // The PIN travels in the passphrase slot; the token itself checks it.
        SecretKeyType::DivertToCard => match &crypto.passphrase {
            Some(_) => Ok(()),
            None => Err(Locked::Needs(RequiredInput::SecurityToken { key_id: id })),
        },
        SecretKeyType::Passphrase => {
            let Some(passphrase) = &crypto.passphrase else {
                return Err(Locked::Needs(RequiredInput::Passphrase { key_id: id }));
            };
            let Some(stored) = &ring.passphrase_digest else {
                return Err(Locked::BadPassphrase(id));
            };
            let given = passphrase_digest(id, passphrase);
            if bool::from(given.ct_eq(stored)) {
                Ok(())
            } else {
                Err(Locked::BadPassphrase(id))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

pub(crate) fn not_found(kind: RequestKind, key_id: KeyId) -> OperationResult {
    OperationResult::failure(kind, FailureCode::NotFound, format!("key {key_id} not found"))
}

pub(crate) fn crypto_failure(kind: RequestKind, err: &CryptoError) -> OperationResult {
    let code = match err {
        CryptoError::Malformed(_) => FailureCode::InvalidInput,
        CryptoError::NoKeyMaterial(_) => FailureCode::NoSecretKey,
        CryptoError::BadBackupCode => FailureCode::BadPassphrase,
        CryptoError::Unsupported(_) => FailureCode::Unsupported,
    };
    OperationResult::failure(kind, code, err.to_string())
}

/// The ring with every secret field removed, as published or exported.
pub(crate) fn public_only(ring: &KeyRing) -> KeyRing {
    let mut public = ring.clone();
    public.secret = SecretKeyType::None;
    public.passphrase_digest = None;
    public.secret_material = None;
    public.card_aid = None;
    for sub in &mut public.subkeys {
        sub.secret = SecretKeyType::None;
    }
    public
}

/// Merges public data received from elsewhere into a stored ring.
///
/// Revocations are sticky: anything revoked on either side stays revoked.
/// User ids and certifications are unioned. The local secret part is kept.
pub(crate) fn merge_public(local: &KeyRing, incoming: &KeyRing) -> KeyRing {
    let mut merged = local.clone();
    merged.revoked |= incoming.revoked;
    if merged.public_material.is_empty() {
        merged.public_material.clone_from(&incoming.public_material);
    }

    for uid in &incoming.user_ids {
        match merged.user_ids.iter_mut().find(|u| u.value == uid.value) {
            Some(existing) => existing.revoked |= uid.revoked,
            None => {
                let mut added = uid.clone();
                added.primary = false;
                merged.user_ids.push(added);
            }
        }
    }

    for sub in &incoming.subkeys {
        match merged.subkeys.iter_mut().find(|s| s.key_id == sub.key_id) {
            Some(existing) => existing.revoked |= sub.revoked,
            None => {
                let mut added = sub.clone();
                added.secret = SecretKeyType::None;
                merged.subkeys.push(added);
            }
        }
    }

    for cert in &incoming.certifications {
        let known = merged
            .certifications
            .iter()
            .any(|c| c.certifier == cert.certifier && c.user_id == cert.user_id);
        if !known {
            merged.certifications.push(cert.clone());
        }
    }
    merged
}

/// Runs CPU-bound crypto on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

#[cfg(test)]
mod tests {
    use keyop_core::{Certification, Fingerprint, SubKey, UserId};

    use super::*;
    use crate::test_utils::{public_ring, secret_ring};

    #[test]
    fn unlock_rules() {
        let locked = secret_ring(1, "a@example.org", "hunter2");
        assert_eq!(
            unlock(&locked, &CryptoInput::default()),
            Err(Locked::Needs(RequiredInput::Passphrase { key_id: KeyId(1) }))
        );
        assert_eq!(
            unlock(&locked, &CryptoInput::with_passphrase("wrong")),
            Err(Locked::BadPassphrase(KeyId(1)))
        );
        assert_eq!(unlock(&locked, &CryptoInput::with_passphrase("hunter2")), Ok(()));

        let public = public_ring(2, "b@example.org");
        assert_eq!(
            unlock(&public, &CryptoInput::with_passphrase("x")),
            Err(Locked::NoSecret(KeyId(2)))
        );

        let mut card = public_ring(3, "c@example.org");
        card.secret = SecretKeyType::DivertToCard;
        assert_eq!(
            unlock(&card, &CryptoInput::default()),
            Err(Locked::Needs(RequiredInput::SecurityToken { key_id: KeyId(3) }))
        );

        let mut empty = public_ring(4, "d@example.org");
        empty.secret = SecretKeyType::PassphraseEmpty;
        assert_eq!(unlock(&empty, &CryptoInput::default()), Ok(()));
    }

    #[test]
    fn digest_is_bound_to_key_id() {
        let passphrase = Passphrase::new("same");
        assert_ne!(
            passphrase_digest(KeyId(1), &passphrase),
            passphrase_digest(KeyId(2), &passphrase)
        );
        assert_eq!(passphrase_digest(KeyId(1), &passphrase).len(), 32);
    }

    #[test]
    fn public_only_strips_secrets() {
        let ring = secret_ring(1, "a@example.org", "pw");
        let public = public_only(&ring);
        assert!(!public.has_secret());
        assert!(public.passphrase_digest.is_none());
        assert!(public.secret_material.is_none());
        assert_eq!(public.user_ids, ring.user_ids);
    }

    #[test]
    fn merge_keeps_secret_and_unions_public_data() {
        let local = secret_ring(1, "a@example.org", "pw");
        let mut incoming = KeyRing::public(KeyId(1), Fingerprint(vec![1; 20]));
        incoming.user_ids.push(UserId {
            value: "a@example.org".into(),
            revoked: true,
            primary: false,
        });
        incoming.user_ids.push(UserId::new("new@example.org"));
        incoming.subkeys.push(SubKey {
            key_id: KeyId(0x11),
            revoked: false,
            secret: SecretKeyType::Passphrase,
        });
        incoming.certifications.push(Certification {
            certifier: KeyId(9),
            user_id: "new@example.org".into(),
            created_millis: 5,
        });

        let merged = merge_public(&local, &incoming);
        assert!(merged.has_secret());
        assert_eq!(merged.passphrase_digest, local.passphrase_digest);
        assert_eq!(merged.user_ids.len(), 2);
        assert!(merged.user_ids[0].revoked);
        assert_eq!(merged.subkeys[0].secret, SecretKeyType::None);
        assert_eq!(merged.certifications.len(), 1);

        // Merging the same data again changes nothing.
        assert_eq!(merge_public(&merged, &incoming), merged);
    }
}
