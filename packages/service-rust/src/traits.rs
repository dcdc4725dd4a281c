//! Collaborators the dispatch core consumes but does not implement.
//!
//! The key repository is the only one with a bundled implementation
//! (`storage::MemoryKeyRepository`); keyserver, crypto, and proof backends are
//! supplied by the embedding application.

use async_trait::async_trait;
use keyop_core::{KeyId, KeyMetadata, KeyRing, SessionKey};

// ---------------------------------------------------------------------------
// KeyRepository
// ---------------------------------------------------------------------------

/// What a save did to the stored ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    New,
    Updated,
    Unchanged,
}

/// Persisted key rings plus their per-key sync metadata.
///
/// Created once per dispatcher and shared by every operation. Implementations
/// are expected to synchronize internally.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Load a ring by its master key id.
    async fn get(&self, master_key_id: KeyId) -> anyhow::Result<Option<KeyRing>>;

    /// Load the ring owning `key_id` as master key or subkey.
    async fn find_by_key_id(&self, key_id: KeyId) -> anyhow::Result<Option<KeyRing>>;

    /// All stored master key ids, ascending.
    async fn list_ids(&self) -> anyhow::Result<Vec<KeyId>>;

    /// Insert or replace a ring. Metadata for a new ring starts unsynced.
    async fn save(&self, ring: KeyRing) -> anyhow::Result<SaveOutcome>;

    /// Remove a ring and its metadata. Returns `false` if it did not exist.
    async fn delete(&self, master_key_id: KeyId) -> anyhow::Result<bool>;

    async fn metadata(&self, master_key_id: KeyId) -> anyhow::Result<Option<KeyMetadata>>;

    /// Record a refresh of `master_key_id` at `now_millis`.
    async fn renew_metadata(
        &self,
        master_key_id: KeyId,
        seen_on_keyservers: bool,
        now_millis: u64,
    ) -> anyhow::Result<()>;

    /// Invalidate every refresh timestamp. Returns how many were cleared.
    async fn reset_all_metadata(&self) -> anyhow::Result<usize>;

    /// Keys never refreshed or last refreshed before `cutoff_millis`.
    async fn ids_last_updated_before(&self, cutoff_millis: u64) -> anyhow::Result<Vec<KeyId>>;
}

// ---------------------------------------------------------------------------
// Keyserver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyserverError {
    #[error("key {0} not found on keyserver")]
    NotFound(KeyId),
    #[error("keyserver unreachable: {0}")]
    Unreachable(String),
    #[error("keyserver rejected the request: {0}")]
    Rejected(String),
}

/// Public key directory.
#[async_trait]
pub trait Keyserver: Send + Sync {
    async fn fetch(&self, key_id: KeyId) -> Result<KeyRing, KeyserverError>;

    /// Publish the public part of `ring`.
    async fn upload(&self, ring: &KeyRing) -> Result<(), KeyserverError>;
}

/// Keyserver used when none is configured: every call is `Unreachable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeyserver;

#[async_trait]
impl Keyserver for NoKeyserver {
    async fn fetch(&self, _key_id: KeyId) -> Result<KeyRing, KeyserverError> {
        Err(KeyserverError::Unreachable("no keyserver configured".into()))
    }

    async fn upload(&self, _ring: &KeyRing) -> Result<(), KeyserverError> {
        Err(KeyserverError::Unreachable("no keyserver configured".into()))
    }
}

// ---------------------------------------------------------------------------
// CryptoEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("no usable key material for {0}")]
    NoKeyMaterial(KeyId),
    #[error("wrong backup code")]
    BadBackupCode,
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Plaintext recovered by [`CryptoEngine::decrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decryption {
    pub data: Vec<u8>,
    /// Key that signed the plaintext, if it was signed.
    pub signer: Option<KeyId>,
}

/// Packet-level cryptography. Calls are synchronous and CPU-bound; the
/// operations run them on the blocking pool.
///
/// Key lookup, revocation checks, and unlock are done by the caller before a
/// ring is handed over, so an engine can assume every ring it receives is
/// usable.
pub trait CryptoEngine: Send + Sync {
    /// Sign with `signer` (if any) and encrypt to `recipients` (if any).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError` if the key material cannot be used.
    fn sign_encrypt(
        &self,
        plaintext: &[u8],
        signer: Option<&KeyRing>,
        recipients: &[KeyRing],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Key ids a binary message is encrypted to.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Malformed` if the bytes are not a message.
    fn recipients(&self, message: &[u8]) -> Result<Vec<KeyId>, CryptoError>;

    /// Decrypt with an unlocked `key`, or with `session_key` when present.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError` if decryption fails.
    fn decrypt(
        &self,
        message: &[u8],
        key: &KeyRing,
        session_key: Option<&SessionKey>,
    ) -> Result<Decryption, CryptoError>;

    /// Symmetrically encrypt a secret export with a backup code.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError` if encryption fails.
    fn encrypt_with_code(&self, plaintext: &[u8], backup_code: &str) -> Result<Vec<u8>, CryptoError>;
}

/// Crypto engine used when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCryptoEngine;

impl CryptoEngine for NoCryptoEngine {
    fn sign_encrypt(
        &self,
        _plaintext: &[u8],
        _signer: Option<&KeyRing>,
        _recipients: &[KeyRing],
    ) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::Unsupported("no crypto engine configured".into()))
    }

    fn recipients(&self, _message: &[u8]) -> Result<Vec<KeyId>, CryptoError> {
        Err(CryptoError::Unsupported("no crypto engine configured".into()))
    }

    fn decrypt(
        &self,
        _message: &[u8],
        _key: &KeyRing,
        _session_key: Option<&SessionKey>,
    ) -> Result<Decryption, CryptoError> {
        Err(CryptoError::Unsupported("no crypto engine configured".into()))
    }

    fn encrypt_with_code(&self, _plaintext: &[u8], _backup_code: &str) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::Unsupported("no crypto engine configured".into()))
    }
}

// ---------------------------------------------------------------------------
// ProofVerifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("proof not found at {0}")]
    NotFound(String),
    #[error("failed to fetch proof: {0}")]
    Fetch(String),
}

/// Fetches a published identity proof (e.g. a post linking an account to a
/// fingerprint).
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn fetch_proof(&self, url: &str) -> Result<String, ProofError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProofVerifier;

#[async_trait]
impl ProofVerifier for NoProofVerifier {
    async fn fetch_proof(&self, _url: &str) -> Result<String, ProofError> {
        Err(ProofError::Fetch("no proof verifier configured".into()))
    }
}
