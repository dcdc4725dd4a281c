//! Shared fixtures for unit tests: sample requests, scripted operations, fake
//! collaborators, and a `TestBed` that wires them to a dispatcher.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use keyop_core::request::{
    BackupKeyringParcel, BackupOutput, BenchmarkParcel, CertifyAction, CertifyActionsParcel,
    ChangeUnlockParcel, DecryptVerifyParcel, DeleteKeyringParcel, IdentityVerificationParcel,
    ImportKeyringParcel, InputDataParcel, KeySyncParcel, PromoteKeyringParcel,
    RevokeKeyringParcel, SaveKeyringParcel, SignEncryptParcel, UploadKeyringParcel,
};
use keyop_core::{
    CryptoInput, DispatchTranscript, Fingerprint, KeyId, KeyMetadata, KeyRing, OperationResult,
    Passphrase, ReplyMessage, Request, RequestKind, ResultPayload, SecretKeyType, SessionKey,
    UserId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

use crate::service::domain::{passphrase_digest, OperationDeps};
use crate::service::{
    DispatchHandle, Dispatcher, DispatcherConfig, Operation, OperationContext,
};
use crate::storage::MemoryKeyRepository;
use crate::traits::{
    CryptoEngine, CryptoError, Decryption, KeyRepository, Keyserver, KeyserverError, ProofError,
    ProofVerifier, SaveOutcome,
};

// ---------------------------------------------------------------------------
// Requests and transcripts
// ---------------------------------------------------------------------------

/// A small, valid request of the given kind.
pub fn sample_request(kind: RequestKind) -> Request {
    let id = KeyId(1);
    match kind {
        RequestKind::SignEncrypt => Request::SignEncrypt {
            payload: SignEncryptParcel {
                input: b"hello".to_vec(),
                signature_key_id: None,
                encryption_key_ids: vec![id],
                armor: false,
            },
        },
        RequestKind::DecryptVerify => Request::DecryptVerify {
            payload: DecryptVerifyParcel {
                input: b"not a message".to_vec(),
                allowed_key_ids: None,
            },
        },
        RequestKind::EditKey => Request::EditKey {
            payload: SaveKeyringParcel {
                master_key_id: id,
                ..SaveKeyringParcel::default()
            },
        },
        RequestKind::ChangeUnlock => Request::ChangeUnlock {
            payload: ChangeUnlockParcel {
                master_key_id: id,
                new_passphrase: Passphrase::new("new"),
            },
        },
        RequestKind::Revoke => Request::Revoke {
            payload: RevokeKeyringParcel {
                master_key_id: id,
                upload: false,
            },
        },
        RequestKind::Certify => Request::Certify {
            payload: CertifyActionsParcel {
                master_key_id: id,
                actions: vec![CertifyAction {
                    target_key_id: KeyId(2),
                    user_ids: Vec::new(),
                }],
            },
        },
        RequestKind::Delete => Request::Delete {
            payload: DeleteKeyringParcel {
                master_key_ids: vec![id],
            },
        },
        RequestKind::Promote => Request::Promote {
            payload: PromoteKeyringParcel {
                master_key_id: id,
                card_aid: None,
                subkey_ids: Vec::new(),
            },
        },
        RequestKind::Import => Request::Import {
            payload: ImportKeyringParcel {
                entries: Vec::new(),
            },
        },
        RequestKind::Backup => Request::Backup {
            payload: BackupKeyringParcel {
                master_key_ids: None,
                export_secret: false,
                output: BackupOutput::Memory,
            },
        },
        RequestKind::Upload => Request::Upload {
            payload: UploadKeyringParcel { master_key_id: id },
        },
        RequestKind::VerifyExternalIdentity => Request::VerifyExternalIdentity {
            payload: IdentityVerificationParcel {
                master_key_id: id,
                proof_url: "https://example.org/proof".into(),
            },
        },
        RequestKind::InputData => Request::InputData {
            payload: InputDataParcel {
                input: b"plain text".to_vec(),
            },
        },
        RequestKind::Benchmark => Request::Benchmark {
            payload: BenchmarkParcel { rounds: Some(1) },
        },
        RequestKind::KeySync => Request::KeySync {
            payload: KeySyncParcel::default(),
        },
    }
}

/// Reads replies until the terminal event, failing the test if the protocol
/// is violated or the dispatch does not finish within five seconds.
pub async fn collect_transcript(rx: &mut mpsc::UnboundedReceiver<ReplyMessage>) -> DispatchTranscript {
    let mut transcript = DispatchTranscript::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = rx.recv().await {
            transcript.record(message.event).expect("protocol violation");
            if transcript.is_complete() {
                break;
            }
        }
    })
    .await
    .expect("dispatch did not complete in time");
    transcript
}

// ---------------------------------------------------------------------------
// Scripted operations
// ---------------------------------------------------------------------------

/// Behaviours for [`ScriptedOperation`].
pub enum Script {
    /// Report progress once, then succeed.
    Succeed,
    Panic,
    /// Return an unexpected error.
    Fault,
    /// Park until cancelled.
    UntilCancelled,
    /// Report progress, wait for the gate, then pass a checkpoint.
    Gate(Arc<Notify>),
    /// Enter the non-cancellable phase, wait for the gate, then pass a
    /// checkpoint.
    PreventCancelThen(Arc<Notify>),
}

/// Operation with fixed behaviour, usable for any parcel type.
pub struct ScriptedOperation {
    script: Script,
    runs: AtomicU32,
}

impl ScriptedOperation {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            runs: AtomicU32::new(0),
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: Send + 'static> Operation<P> for ScriptedOperation {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(
        &self,
        _parcel: P,
        _crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Succeed => ctx.update("working", 1, 1),
            Script::Panic => panic!("scripted panic"),
            Script::Fault => anyhow::bail!("scripted fault"),
            Script::UntilCancelled => {
                ctx.update("waiting for cancel", 0, 1);
                ctx.cancellable(std::future::pending::<()>()).await?;
            }
            Script::Gate(gate) => {
                ctx.update("waiting at gate", 0, 1);
                gate.notified().await;
                ctx.checkpoint()?;
            }
            Script::PreventCancelThen(gate) => {
                ctx.prevent_cancel();
                gate.notified().await;
                ctx.checkpoint()?;
            }
        }
        Ok(OperationResult::success(ctx.kind(), ResultPayload::Empty))
    }
}

// ---------------------------------------------------------------------------
// Key rings
// ---------------------------------------------------------------------------

pub fn fingerprint_of(id: u64) -> Fingerprint {
    let mut bytes = vec![0xAB; 12];
    bytes.extend_from_slice(&id.to_be_bytes());
    Fingerprint(bytes)
}

/// Public ring with one primary user id and no subkeys.
pub fn public_ring(id: u64, uid: &str) -> KeyRing {
    let mut ring = KeyRing::public(KeyId(id), fingerprint_of(id));
    ring.user_ids.push(UserId {
        value: uid.to_string(),
        revoked: false,
        primary: true,
    });
    ring.public_material = format!("public key {id:016X}").into_bytes();
    ring
}

/// Like [`public_ring`], with a secret key locked by `passphrase`.
pub fn secret_ring(id: u64, uid: &str, passphrase: &str) -> KeyRing {
    let mut ring = public_ring(id, uid);
    ring.secret = SecretKeyType::Passphrase;
    ring.passphrase_digest = Some(passphrase_digest(KeyId(id), &Passphrase::new(passphrase)));
    ring.secret_material = Some(format!("secret key {id:016X}").into_bytes());
    ring
}

// ---------------------------------------------------------------------------
// Fake collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeKeyserver {
    published: DashMap<KeyId, KeyRing>,
    uploaded: Mutex<Vec<KeyRing>>,
    offline: AtomicBool,
    delay: Mutex<Duration>,
    after_upload: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl FakeKeyserver {
    pub fn publish(&self, ring: KeyRing) {
        self.published.insert(ring.master_key_id, ring);
    }

    pub fn uploaded(&self) -> Vec<KeyRing> {
        self.uploaded.lock().clone()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Runs `hook` once the keyserver has stored an upload, then yields before
    /// answering, like a reply still on the wire.
    pub fn on_upload(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.after_upload.lock() = Some(Arc::new(hook));
    }

    fn check_online(&self) -> Result<(), KeyserverError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(KeyserverError::Unreachable("offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Keyserver for FakeKeyserver {
    async fn fetch(&self, key_id: KeyId) -> Result<KeyRing, KeyserverError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_online()?;
        self.published
            .iter()
            .find(|entry| entry.value().contains_key(key_id))
            .map(|entry| entry.value().clone())
            .ok_or(KeyserverError::NotFound(key_id))
    }

    async fn upload(&self, ring: &KeyRing) -> Result<(), KeyserverError> {
        self.check_online()?;
        self.uploaded.lock().push(ring.clone());
        self.published.insert(ring.master_key_id, ring.clone());
        let hook = self.after_upload.lock().clone();
        if let Some(hook) = hook {
            hook();
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

/// Toy message format: `FAKE` followed by a JSON envelope. Enough structure
/// to exercise recipient selection, unlock, and signature status.
pub struct FakeCrypto;

#[derive(Serialize, Deserialize)]
struct Sealed {
    recipients: Vec<KeyId>,
    signer: Option<KeyId>,
    code: Option<String>,
    data: Vec<u8>,
}

const FAKE_MAGIC: &[u8] = b"FAKE";

impl FakeCrypto {
    pub fn seal(recipients: &[KeyId], signer: Option<KeyId>, plaintext: &[u8]) -> Vec<u8> {
        Self::encode(&Sealed {
            recipients: recipients.to_vec(),
            signer,
            code: None,
            data: plaintext.to_vec(),
        })
    }

    fn encode(sealed: &Sealed) -> Vec<u8> {
        let mut out = FAKE_MAGIC.to_vec();
        out.extend(serde_json::to_vec(sealed).expect("serialize sealed message"));
        out
    }

    fn open(message: &[u8]) -> Result<Sealed, CryptoError> {
        let body = message
            .strip_prefix(FAKE_MAGIC)
            .ok_or_else(|| CryptoError::Malformed("missing magic".into()))?;
        serde_json::from_slice(body).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}

impl CryptoEngine for FakeCrypto {
    fn sign_encrypt(
        &self,
        plaintext: &[u8],
        signer: Option<&KeyRing>,
        recipients: &[KeyRing],
    ) -> Result<Vec<u8>, CryptoError> {
        let ids: Vec<KeyId> = recipients.iter().map(|r| r.master_key_id).collect();
        Ok(Self::seal(&ids, signer.map(|r| r.master_key_id), plaintext))
    }

    fn recipients(&self, message: &[u8]) -> Result<Vec<KeyId>, CryptoError> {
        Ok(Self::open(message)?.recipients)
    }

    fn decrypt(
        &self,
        message: &[u8],
        ring: &KeyRing,
        _session_key: Option<&SessionKey>,
    ) -> Result<Decryption, CryptoError> {
        let sealed = Self::open(message)?;
        if !sealed.recipients.iter().any(|id| ring.contains_key(*id)) {
            return Err(CryptoError::NoKeyMaterial(ring.master_key_id));
        }
        Ok(Decryption {
            data: sealed.data,
            signer: sealed.signer,
        })
    }

    fn encrypt_with_code(&self, plaintext: &[u8], backup_code: &str) -> Result<Vec<u8>, CryptoError> {
        Ok(Self::encode(&Sealed {
            recipients: Vec::new(),
            signer: None,
            code: Some(backup_code.to_string()),
            data: plaintext.to_vec(),
        }))
    }
}

#[derive(Default)]
pub struct FakeProofs {
    documents: DashMap<String, String>,
    offline: AtomicBool,
}

impl FakeProofs {
    pub fn publish(&self, url: &str, document: &str) {
        self.documents.insert(url.to_string(), document.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProofVerifier for FakeProofs {
    async fn fetch_proof(&self, url: &str) -> Result<String, ProofError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProofError::Fetch("offline".into()));
        }
        self.documents
            .get(url)
            .map(|doc| doc.value().clone())
            .ok_or_else(|| ProofError::NotFound(url.to_string()))
    }
}

/// Repository whose every call fails.
pub struct FaultyRepository;

#[async_trait]
impl KeyRepository for FaultyRepository {
    async fn get(&self, _id: KeyId) -> anyhow::Result<Option<KeyRing>> {
        anyhow::bail!("storage unavailable")
    }

    async fn find_by_key_id(&self, _id: KeyId) -> anyhow::Result<Option<KeyRing>> {
        anyhow::bail!("storage unavailable")
    }

    async fn list_ids(&self) -> anyhow::Result<Vec<KeyId>> {
        anyhow::bail!("storage unavailable")
    }

    async fn save(&self, _ring: KeyRing) -> anyhow::Result<SaveOutcome> {
        anyhow::bail!("storage unavailable")
    }

    async fn delete(&self, _id: KeyId) -> anyhow::Result<bool> {
        anyhow::bail!("storage unavailable")
    }

    async fn metadata(&self, _id: KeyId) -> anyhow::Result<Option<KeyMetadata>> {
        anyhow::bail!("storage unavailable")
    }

    async fn renew_metadata(&self, _id: KeyId, _seen: bool, _now: u64) -> anyhow::Result<()> {
        anyhow::bail!("storage unavailable")
    }

    async fn reset_all_metadata(&self) -> anyhow::Result<usize> {
        anyhow::bail!("storage unavailable")
    }

    async fn ids_last_updated_before(&self, _cutoff: u64) -> anyhow::Result<Vec<KeyId>> {
        anyhow::bail!("storage unavailable")
    }
}

// ---------------------------------------------------------------------------
// TestBed
// ---------------------------------------------------------------------------

/// In-memory repository plus fakes, behind a dispatcher over the built-in
/// operations.
pub struct TestBed {
    pub repository: Arc<MemoryKeyRepository>,
    pub keyserver: Arc<FakeKeyserver>,
    pub proofs: Arc<FakeProofs>,
    pub deps: OperationDeps,
    dispatcher: Dispatcher,
}

impl TestBed {
    pub fn new<const N: usize>(rings: [KeyRing; N]) -> Self {
        let repository = Arc::new(MemoryKeyRepository::from_rings(rings));
        let keyserver = Arc::new(FakeKeyserver::default());
        let proofs = Arc::new(FakeProofs::default());
        let deps = OperationDeps {
            keyserver: Arc::clone(&keyserver) as Arc<dyn Keyserver>,
            crypto: Arc::new(FakeCrypto),
            proofs: Arc::clone(&proofs) as Arc<dyn ProofVerifier>,
            config: Arc::new(DispatcherConfig {
                benchmark_block_size: 4096,
                ..DispatcherConfig::default()
            }),
        };
        let dispatcher =
            Dispatcher::with_builtin(Arc::clone(&repository) as Arc<dyn KeyRepository>, &deps);
        Self {
            repository,
            keyserver,
            proofs,
            deps,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn dispatch(
        &self,
        request: Request,
        crypto: CryptoInput,
    ) -> (DispatchHandle, mpsc::UnboundedReceiver<ReplyMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self
            .dispatcher
            .dispatch(request, crypto, Arc::new(tx))
            .expect("dispatch accepted");
        (handle, rx)
    }

    /// Dispatches `request` and returns its result after checking the reply
    /// stream.
    pub async fn run(&self, request: Request, crypto: CryptoInput) -> OperationResult {
        let (_handle, mut rx) = self.dispatch(request, crypto);
        collect_transcript(&mut rx)
            .await
            .result()
            .cloned()
            .expect("terminal result")
    }
}
