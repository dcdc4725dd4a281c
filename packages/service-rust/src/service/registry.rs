use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use keyop_core::request::{
    BackupKeyringParcel, BenchmarkParcel, CertifyActionsParcel, ChangeUnlockParcel,
    DecryptVerifyParcel, DeleteKeyringParcel, IdentityVerificationParcel, ImportKeyringParcel,
    InputDataParcel, KeySyncParcel, PromoteKeyringParcel, RevokeKeyringParcel, SaveKeyringParcel,
    SignEncryptParcel, UploadKeyringParcel,
};
use keyop_core::{CryptoInput, OperationResult, Request, RequestKind};

use super::domain::{crypto, identity, keys, transfer, OperationDeps};
use super::operation::{Operation, OperationContext};

type BoxedFuture = Pin<Box<dyn Future<Output = anyhow::Result<OperationResult>> + Send>>;

// ---------------------------------------------------------------------------
// BoundOperation
// ---------------------------------------------------------------------------

/// An operation paired with the parcel it will run on. Produced by
/// [`OperationRegistry::resolve`] and consumed by the executor.
pub struct BoundOperation {
    kind: RequestKind,
    name: &'static str,
    run: Box<dyn FnOnce(CryptoInput, OperationContext) -> BoxedFuture + Send>,
}

impl BoundOperation {
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Starts the operation. The returned future owns everything it needs.
    #[must_use]
    pub fn run(self, crypto: CryptoInput, ctx: OperationContext) -> BoxedFuture {
        (self.run)(crypto, ctx)
    }
}

impl std::fmt::Debug for BoundOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundOperation")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub(crate) fn bind<P: Send + 'static>(
    operation: &Arc<dyn Operation<P>>,
    kind: RequestKind,
    parcel: P,
) -> BoundOperation {
    let operation = Arc::clone(operation);
    BoundOperation {
        kind,
        name: operation.name(),
        run: Box::new(move |crypto, ctx| {
            Box::pin(async move { operation.execute(parcel, crypto, &ctx).await })
        }),
    }
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// One operation per request kind.
///
/// Every field is required, and [`resolve`](Self::resolve) matches the
/// request exhaustively, so a new `Request` variant without an entry here
/// does not compile. Tests swap single entries with struct update syntax:
///
/// ```ignore
/// let registry = OperationRegistry { import: Arc::new(FakeImport), ..OperationRegistry::builtin(&deps) };
/// ```
#[derive(Clone)]
pub struct OperationRegistry {
    pub sign_encrypt: Arc<dyn Operation<SignEncryptParcel>>,
    pub decrypt_verify: Arc<dyn Operation<DecryptVerifyParcel>>,
    pub edit_key: Arc<dyn Operation<SaveKeyringParcel>>,
    pub change_unlock: Arc<dyn Operation<ChangeUnlockParcel>>,
    pub revoke: Arc<dyn Operation<RevokeKeyringParcel>>,
    pub certify: Arc<dyn Operation<CertifyActionsParcel>>,
    pub delete: Arc<dyn Operation<DeleteKeyringParcel>>,
    pub promote: Arc<dyn Operation<PromoteKeyringParcel>>,
    pub import: Arc<dyn Operation<ImportKeyringParcel>>,
    pub backup: Arc<dyn Operation<BackupKeyringParcel>>,
    pub upload: Arc<dyn Operation<UploadKeyringParcel>>,
    pub verify_identity: Arc<dyn Operation<IdentityVerificationParcel>>,
    pub input_data: Arc<dyn Operation<InputDataParcel>>,
    pub benchmark: Arc<dyn Operation<BenchmarkParcel>>,
    pub key_sync: Arc<dyn Operation<KeySyncParcel>>,
}

impl OperationRegistry {
    /// Registry of the built-in operations wired to `deps`.
    #[must_use]
    pub fn builtin(deps: &OperationDeps) -> Self {
        Self {
            sign_encrypt: Arc::new(crypto::SignEncryptOperation::new(deps)),
            decrypt_verify: Arc::new(crypto::DecryptVerifyOperation::new(deps)),
            edit_key: Arc::new(keys::EditKeyOperation),
            change_unlock: Arc::new(keys::ChangeUnlockOperation),
            revoke: Arc::new(keys::RevokeOperation::new(deps)),
            certify: Arc::new(keys::CertifyOperation),
            delete: Arc::new(keys::DeleteOperation),
            promote: Arc::new(keys::PromoteOperation),
            import: Arc::new(transfer::ImportOperation::new(deps)),
            backup: Arc::new(transfer::BackupOperation::new(deps)),
            upload: Arc::new(transfer::UploadOperation::new(deps)),
            verify_identity: Arc::new(identity::VerifyIdentityOperation::new(deps)),
            input_data: Arc::new(crypto::InputDataOperation::new(deps)),
            benchmark: Arc::new(crypto::BenchmarkOperation::new(deps)),
            key_sync: Arc::new(transfer::KeySyncOperation::new(deps)),
        }
    }

    /// Selects the operation responsible for `request` and binds its parcel.
    #[must_use]
    pub fn resolve(&self, request: Request) -> BoundOperation {
        let kind = request.kind();
        match request {
            Request::SignEncrypt { payload } => bind(&self.sign_encrypt, kind, payload),
            Request::DecryptVerify { payload } => bind(&self.decrypt_verify, kind, payload),
            Request::EditKey { payload } => bind(&self.edit_key, kind, payload),
            Request::ChangeUnlock { payload } => bind(&self.change_unlock, kind, payload),
            Request::Revoke { payload } => bind(&self.revoke, kind, payload),
            Request::Certify { payload } => bind(&self.certify, kind, payload),
            Request::Delete { payload } => bind(&self.delete, kind, payload),
            Request::Promote { payload } => bind(&self.promote, kind, payload),
            Request::Import { payload } => bind(&self.import, kind, payload),
            Request::Backup { payload } => bind(&self.backup, kind, payload),
            Request::Upload { payload } => bind(&self.upload, kind, payload),
            Request::VerifyExternalIdentity { payload } => {
                bind(&self.verify_identity, kind, payload)
            }
            Request::InputData { payload } => bind(&self.input_data, kind, payload),
            Request::Benchmark { payload } => bind(&self.benchmark, kind, payload),
            Request::KeySync { payload } => bind(&self.key_sync, kind, payload),
        }
    }

    /// Name of the operation registered for `kind`.
    #[must_use]
    pub fn name_of(&self, kind: RequestKind) -> &'static str {
        match kind {
            RequestKind::SignEncrypt => self.sign_encrypt.name(),
            RequestKind::DecryptVerify => self.decrypt_verify.name(),
            RequestKind::EditKey => self.edit_key.name(),
            RequestKind::ChangeUnlock => self.change_unlock.name(),
            RequestKind::Revoke => self.revoke.name(),
            RequestKind::Certify => self.certify.name(),
            RequestKind::Delete => self.delete.name(),
            RequestKind::Promote => self.promote.name(),
            RequestKind::Import => self.import.name(),
            RequestKind::Backup => self.backup.name(),
            RequestKind::Upload => self.upload.name(),
            RequestKind::VerifyExternalIdentity => self.verify_identity.name(),
            RequestKind::InputData => self.input_data.name(),
            RequestKind::Benchmark => self.benchmark.name(),
            RequestKind::KeySync => self.key_sync.name(),
        }
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&'static str> = RequestKind::ALL.iter().map(|k| self.name_of(*k)).collect();
        f.debug_struct("OperationRegistry")
            .field("operations", &names)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
