//! Operations that move keys between the repository and the outside world:
//! import, backup, upload, and keyserver sync.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyop_core::request::{
    BackupKeyringParcel, BackupOutput, ImportEntry, ImportKeyringParcel, KeySyncParcel,
    UploadKeyringParcel,
};
use keyop_core::{
    CryptoInput, FailureCode, KeyRing, OperationLog, OperationResult, RequiredInput,
    ResultPayload,
};
use tracing::{debug, info, warn};

use super::armor::{armor, MESSAGE, PUBLIC_KEY_BLOCK};
use super::{blocking, crypto_failure, merge_public, not_found, now_millis, public_only, OperationDeps};
use crate::service::operation::{Operation, OperationContext};
use crate::traits::{CryptoEngine, Keyserver, KeyserverError, SaveOutcome};

fn progress_step(i: usize) -> u32 {
    u32::try_from(i).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

pub struct ImportOperation {
    keyserver: Arc<dyn Keyserver>,
}

impl ImportOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            keyserver: Arc::clone(&deps.keyserver),
        }
    }

    /// Resolves one entry to a ring, or logs why it could not be.
    async fn fetch_entry(
        &self,
        entry: ImportEntry,
        ctx: &OperationContext,
        log: &mut OperationLog,
    ) -> anyhow::Result<Option<(KeyRing, bool)>> {
        match entry {
            ImportEntry::Bundle { ring } => Ok(Some((*ring, false))),
            ImportEntry::Keyserver {
                key_id,
                expected_fingerprint,
            } => match ctx.cancellable(self.keyserver.fetch(key_id)).await? {
                Ok(ring) => {
                    if expected_fingerprint
                        .as_ref()
                        .is_some_and(|fp| *fp != ring.fingerprint)
                    {
                        log.error(format!("fingerprint of {key_id} does not match"));
                        return Ok(None);
                    }
                    Ok(Some((public_only(&ring), true)))
                }
                Err(e) => {
                    warn!(key = %key_id, error = %e, "keyserver fetch failed");
                    log.error(format!("could not fetch {key_id}: {e}"));
                    Ok(None)
                }
            },
        }
    }
}

#[async_trait]
impl Operation<ImportKeyringParcel> for ImportOperation {
    fn name(&self) -> &'static str {
        "import"
    }

    async fn execute(
        &self,
        parcel: ImportKeyringParcel,
        _crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        if parcel.entries.is_empty() {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::InvalidInput,
                "nothing to import",
            ));
        }

        let total = progress_step(parcel.entries.len());
        let mut log = OperationLog::new();
        let (mut new, mut updated, mut unchanged, mut failed) =
            (Vec::new(), Vec::new(), Vec::new(), 0u32);

        for (i, entry) in parcel.entries.into_iter().enumerate() {
            ctx.checkpoint()?;
            ctx.update("importing keys", progress_step(i), total);

            let Some((incoming, from_keyserver)) = self.fetch_entry(entry, ctx, &mut log).await?
            else {
                failed += 1;
                continue;
            };
            let id = incoming.master_key_id;
            let ring = match ctx.repository().get(id).await? {
                Some(local) => merge_public(&local, &incoming),
                None => incoming,
            };

            ctx.checkpoint()?;
            match ctx.repository().save(ring).await? {
                SaveOutcome::New => {
                    log.info(format!("imported new key {id}"));
                    new.push(id);
                }
                SaveOutcome::Updated => {
                    log.info(format!("updated key {id}"));
                    updated.push(id);
                }
                SaveOutcome::Unchanged => {
                    log.add(keyop_core::LogLevel::Debug, format!("key {id} unchanged"));
                    unchanged.push(id);
                }
            }
            if from_keyserver {
                ctx.repository().renew_metadata(id, true, now_millis()).await?;
            }
        }
        ctx.update("importing keys", total, total);

        if new.is_empty() && updated.is_empty() && unchanged.is_empty() {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::InvalidInput,
                format!("none of the {total} keys could be imported"),
            )
            .with_log(log));
        }
        info!(new = new.len(), updated = updated.len(), failed, "import finished");
        Ok(OperationResult::success(
            kind,
            ResultPayload::Imported {
                new,
                updated,
                unchanged,
                failed,
            },
        )
        .with_log(log))
    }
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

pub struct BackupOperation {
    crypto: Arc<dyn CryptoEngine>,
}

impl BackupOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            crypto: Arc::clone(&deps.crypto),
        }
    }
}

#[async_trait]
impl Operation<BackupKeyringParcel> for BackupOperation {
    fn name(&self) -> &'static str {
        "backup"
    }

    async fn execute(
        &self,
        parcel: BackupKeyringParcel,
        crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        ctx.checkpoint()?;

        let backup_code = if parcel.export_secret {
            match crypto.passphrase {
                Some(code) => Some(code),
                None => {
                    return Ok(OperationResult::input_required(kind, RequiredInput::BackupCode))
                }
            }
        } else {
            None
        };

        let ids = match parcel.master_key_ids {
            Some(ids) => ids,
            None => ctx.repository().list_ids().await?,
        };
        let total = progress_step(ids.len());
        let mut log = OperationLog::new();
        let mut rings = Vec::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            ctx.checkpoint()?;
            ctx.update("exporting keys", progress_step(i), total);
            let Some(ring) = ctx.repository().get(id).await? else {
                return Ok(not_found(kind, id).with_log(log));
            };
            rings.push(if backup_code.is_some() { ring } else { public_only(&ring) });
            log.info(format!("exported key {id}"));
        }
        if rings.is_empty() {
            return Ok(OperationResult::failure(kind, FailureCode::NotFound, "no keys to back up"));
        }
        let count = total;
        let encoded = rmp_serde::to_vec_named(&rings)?;

        let armored = match backup_code {
            Some(code) => {
                let engine = Arc::clone(&self.crypto);
                let sealed =
                    blocking(move || engine.encrypt_with_code(&encoded, code.expose())).await?;
                match sealed {
                    Ok(bytes) => armor(MESSAGE, &bytes),
                    Err(e) => return Ok(crypto_failure(kind, &e).with_log(log)),
                }
            }
            None => armor(PUBLIC_KEY_BLOCK, &encoded),
        };
        ctx.update("exporting keys", total, total);

        match parcel.output {
            BackupOutput::Memory => Ok(OperationResult::success(
                kind,
                ResultPayload::Backup {
                    count,
                    armored: Some(armored),
                },
            )
            .with_log(log)),
            BackupOutput::File { path } => {
                ctx.checkpoint()?;
                ctx.prevent_cancel();
                if let Err(e) = tokio::fs::write(&path, armored.as_bytes()).await {
                    warn!(path = %path.display(), error = %e, "backup write failed");
                    return Ok(OperationResult::failure(
                        kind,
                        FailureCode::IoError,
                        format!("could not write {}: {e}", path.display()),
                    )
                    .with_log(log));
                }
                log.info(format!("backup written to {}", path.display()));
                Ok(OperationResult::success(kind, ResultPayload::Backup { count, armored: None })
                    .with_log(log))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

pub struct UploadOperation {
    keyserver: Arc<dyn Keyserver>,
}

impl UploadOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            keyserver: Arc::clone(&deps.keyserver),
        }
    }
}

#[async_trait]
impl Operation<UploadKeyringParcel> for UploadOperation {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn execute(
        &self,
        parcel: UploadKeyringParcel,
        _crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        let id = parcel.master_key_id;
        let Some(ring) = ctx.repository().get(id).await? else {
            return Ok(not_found(kind, id));
        };

        ctx.update("uploading key", 0, 1);
        let public = public_only(&ring);
        if let Err(e) = ctx.cancellable(self.keyserver.upload(&public)).await? {
            warn!(key = %id, error = %e, "upload failed");
            return Ok(OperationResult::failure(
                kind,
                FailureCode::NetworkError,
                format!("upload of {id} failed: {e}"),
            ));
        }
        // The keyserver has the key now; nothing left to cancel.
        ctx.prevent_cancel();
        ctx.repository().renew_metadata(id, true, now_millis()).await?;
        ctx.update("uploading key", 1, 1);

        let mut log = OperationLog::new();
        log.info(format!("uploaded key {id}"));
        Ok(OperationResult::success(kind, ResultPayload::Empty).with_log(log))
    }
}

// ---------------------------------------------------------------------------
// Key sync
// ---------------------------------------------------------------------------

pub struct KeySyncOperation {
    keyserver: Arc<dyn Keyserver>,
    stale_after: Duration,
}

impl KeySyncOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            keyserver: Arc::clone(&deps.keyserver),
            stale_after: deps.config.key_stale_after,
        }
    }
}

#[async_trait]
impl Operation<KeySyncParcel> for KeySyncOperation {
    fn name(&self) -> &'static str {
        "key-sync"
    }

    async fn execute(
        &self,
        parcel: KeySyncParcel,
        _crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        ctx.checkpoint()?;
        let now = now_millis();
        let ids = if parcel.refresh_all {
            ctx.repository().list_ids().await?
        } else {
            let max_age = u64::try_from(self.stale_after.as_millis()).unwrap_or(u64::MAX);
            ctx.repository()
                .ids_last_updated_before(now.saturating_sub(max_age))
                .await?
        };
        debug!(keys = ids.len(), refresh_all = parcel.refresh_all, "key sync selected keys");

        let total = progress_step(ids.len());
        let mut log = OperationLog::new();
        let (mut refreshed, mut not_on_server, mut failed) = (Vec::new(), Vec::new(), 0u32);
        for (i, id) in ids.into_iter().enumerate() {
            ctx.checkpoint()?;
            ctx.update("refreshing keys", progress_step(i), total);
            let Some(local) = ctx.repository().get(id).await? else {
                continue;
            };
            match ctx.cancellable(self.keyserver.fetch(id)).await? {
                Ok(remote) if remote.fingerprint != local.fingerprint => {
                    log.error(format!("keyserver returned a different key for {id}"));
                    failed += 1;
                }
                Ok(remote) => {
                    ctx.repository().save(merge_public(&local, &remote)).await?;
                    ctx.repository().renew_metadata(id, true, now_millis()).await?;
                    refreshed.push(id);
                }
                Err(KeyserverError::NotFound(_)) => {
                    // Remember the miss so the key is not retried every run.
                    ctx.repository().renew_metadata(id, false, now_millis()).await?;
                    log.info(format!("key {id} is not on the keyserver"));
                    not_on_server.push(id);
                }
                Err(e) => {
                    log.warn(format!("could not refresh {id}: {e}"));
                    failed += 1;
                }
            }
        }
        ctx.update("refreshing keys", total, total);
        info!(
            refreshed = refreshed.len(),
            not_on_server = not_on_server.len(),
            failed,
            "key sync finished"
        );
        Ok(OperationResult::success(
            kind,
            ResultPayload::KeySync {
                refreshed,
                not_on_server,
                failed,
            },
        )
        .with_log(log))
    }
}
