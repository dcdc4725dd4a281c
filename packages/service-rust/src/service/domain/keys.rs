//! Operations that edit key rings already in the repository.

use std::sync::Arc;

use async_trait::async_trait;
use keyop_core::request::{
    CertifyActionsParcel, ChangeUnlockParcel, DeleteKeyringParcel, PromoteKeyringParcel,
    RevokeKeyringParcel, SaveKeyringParcel,
};
use keyop_core::{
    Certification, CryptoInput, FailureCode, OperationLog, OperationResult, ResultPayload,
    SecretKeyType, UserId,
};
use tracing::{debug, info, warn};

use super::{not_found, now_millis, passphrase_digest, public_only, unlock, OperationDeps};
use crate::service::operation::{Operation, OperationContext};
use crate::traits::Keyserver;

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

pub struct DeleteOperation;

#[async_trait]
impl Operation<DeleteKeyringParcel> for DeleteOperation {
    fn name(&self) -> &'static str {
        "delete"
    }

    async fn execute(
        &self,
        parcel: DeleteKeyringParcel,
        _crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        if parcel.master_key_ids.is_empty() {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::InvalidInput,
                "no keys to delete",
            ));
        }

        let total = u32::try_from(parcel.master_key_ids.len()).unwrap_or(u32::MAX);
        let mut log = OperationLog::new();
        let mut deleted = Vec::new();
        let mut missing = Vec::new();
        for (i, id) in parcel.master_key_ids.into_iter().enumerate() {
            ctx.update("deleting keys", u32::try_from(i).unwrap_or(u32::MAX), total);
            if ctx.repository().delete(id).await? {
                log.info(format!("deleted key {id}"));
                deleted.push(id);
            } else {
                log.warn(format!("key {id} not found"));
                missing.push(id);
            }
        }
        ctx.update("deleting keys", total, total);

        if deleted.is_empty() {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::NotFound,
                format!("none of the {total} keys exist"),
            )
            .with_log(log));
        }
        info!(deleted = deleted.len(), missing = missing.len(), "keys deleted");
        Ok(OperationResult::success(kind, ResultPayload::Deleted { deleted, missing }).with_log(log))
    }
}

// ---------------------------------------------------------------------------
// Edit
// ---------------------------------------------------------------------------

pub struct EditKeyOperation;

#[async_trait]
impl Operation<SaveKeyringParcel> for EditKeyOperation {
    fn name(&self) -> &'static str {
        "edit-key"
    }

    async fn execute(
        &self,
        parcel: SaveKeyringParcel,
        crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        ctx.checkpoint()?;
        let id = parcel.master_key_id;
        let Some(mut ring) = ctx.repository().get(id).await? else {
            return Ok(not_found(kind, id));
        };
        if ring.revoked {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::KeyRevoked,
                format!("key {id} is revoked"),
            ));
        }
        if let Err(locked) = unlock(&ring, &crypto) {
            return Ok(locked.into_result(kind));
        }

        let mut log = OperationLog::new();
        ctx.update("applying changes", 0, 4);

        for value in parcel.add_user_ids {
            let value = value.trim().to_string();
            if value.is_empty() {
                return Ok(invalid(kind, "user id must not be empty", log));
            }
            if ring.user_ids.iter().any(|uid| uid.value == value) {
                log.warn(format!("user id {value:?} already present"));
            } else {
                log.info(format!("added user id {value:?}"));
                ring.user_ids.push(UserId::new(value));
            }
        }
        ctx.checkpoint()?;
        ctx.update("applying changes", 1, 4);

        for value in parcel.revoke_user_ids {
            let Some(uid) = ring.user_ids.iter_mut().find(|uid| uid.value == value) else {
                return Ok(invalid(kind, &format!("no user id {value:?} to revoke"), log));
            };
            uid.revoked = true;
            uid.primary = false;
            log.info(format!("revoked user id {value:?}"));
        }
        ctx.update("applying changes", 2, 4);

        if let Some(primary) = parcel.change_primary_user_id {
            if !ring.user_ids.iter().any(|uid| uid.value == primary && !uid.revoked) {
                return Ok(invalid(kind, &format!("no usable user id {primary:?}"), log));
            }
            for uid in &mut ring.user_ids {
                uid.primary = uid.value == primary;
            }
            log.info(format!("primary user id is now {primary:?}"));
        }
        ctx.update("applying changes", 3, 4);

        for sub_id in parcel.revoke_subkeys {
            let Some(sub) = ring.subkeys.iter_mut().find(|sub| sub.key_id == sub_id) else {
                return Ok(invalid(kind, &format!("no subkey {sub_id}"), log));
            };
            sub.revoked = true;
            log.info(format!("revoked subkey {sub_id}"));
        }

        ctx.checkpoint()?;
        ctx.prevent_cancel();
        ctx.repository().save(ring).await?;
        ctx.update("applying changes", 4, 4);
        Ok(OperationResult::success(kind, ResultPayload::KeySaved { master_key_id: id }).with_log(log))
    }
}

fn invalid(kind: keyop_core::RequestKind, message: &str, log: OperationLog) -> OperationResult {
    OperationResult::failure(kind, FailureCode::InvalidInput, message).with_log(log)
}

// ---------------------------------------------------------------------------
// Change unlock
// ---------------------------------------------------------------------------

pub struct ChangeUnlockOperation;

#[async_trait]
impl Operation<ChangeUnlockParcel> for ChangeUnlockOperation {
    fn name(&self) -> &'static str {
        "change-unlock"
    }

    async fn execute(
        &self,
        parcel: ChangeUnlockParcel,
        crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        let id = parcel.master_key_id;
        let Some(mut ring) = ctx.repository().get(id).await? else {
            return Ok(not_found(kind, id));
        };
        if ring.secret == SecretKeyType::DivertToCard {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::Unsupported,
                "the passphrase of a security token key is changed on the token",
            ));
        }
        if let Err(locked) = unlock(&ring, &crypto) {
            return Ok(locked.into_result(kind));
        }

        let mut log = OperationLog::new();
        if parcel.new_passphrase.is_empty() {
            ring.secret = SecretKeyType::PassphraseEmpty;
            ring.passphrase_digest = None;
            log.warn("secret key is now stored without a passphrase");
        } else {
            ring.secret = SecretKeyType::Passphrase;
            ring.passphrase_digest = Some(passphrase_digest(id, &parcel.new_passphrase));
            log.info("passphrase changed");
        }
        ctx.repository().save(ring).await?;
        Ok(OperationResult::success(kind, ResultPayload::KeySaved { master_key_id: id }).with_log(log))
    }
}

// ---------------------------------------------------------------------------
// Revoke
// ---------------------------------------------------------------------------

pub struct RevokeOperation {
    keyserver: Arc<dyn Keyserver>,
}

impl RevokeOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            keyserver: Arc::clone(&deps.keyserver),
        }
    }
}

#[async_trait]
impl Operation<RevokeKeyringParcel> for RevokeOperation {
    fn name(&self) -> &'static str {
        "revoke"
    }

    async fn execute(
        &self,
        parcel: RevokeKeyringParcel,
        crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        let id = parcel.master_key_id;
        let Some(mut ring) = ctx.repository().get(id).await? else {
            return Ok(not_found(kind, id));
        };
        if let Err(locked) = unlock(&ring, &crypto) {
            return Ok(locked.into_result(kind));
        }

        let mut log = OperationLog::new();
        if ring.revoked {
            log.warn(format!("key {id} was already revoked"));
        } else {
            ring.revoked = true;
            ctx.repository().save(ring.clone()).await?;
            log.info(format!("revoked key {id}"));
        }

        if parcel.upload {
            ctx.update("uploading revocation", 0, 1);
            if let Err(e) = self.keyserver.upload(&public_only(&ring)).await {
                warn!(key = %id, error = %e, "revocation upload failed");
                log.error(format!("upload failed: {e}"));
                return Ok(OperationResult::failure(
                    kind,
                    FailureCode::NetworkError,
                    format!("key revoked locally, but the upload failed: {e}"),
                )
                .with_log(log));
            }
            ctx.repository().renew_metadata(id, true, now_millis()).await?;
            ctx.update("uploading revocation", 1, 1);
            log.info("revocation uploaded");
        }
        Ok(OperationResult::success(kind, ResultPayload::KeySaved { master_key_id: id }).with_log(log))
    }
}

// ---------------------------------------------------------------------------
// Certify
// ---------------------------------------------------------------------------

pub struct CertifyOperation;

#[async_trait]
impl Operation<CertifyActionsParcel> for CertifyOperation {
    fn name(&self) -> &'static str {
        "certify"
    }

    async fn execute(
        &self,
        parcel: CertifyActionsParcel,
        crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        ctx.checkpoint()?;
        let certifier_id = parcel.master_key_id;
        let Some(certifier) = ctx.repository().get(certifier_id).await? else {
            return Ok(not_found(kind, certifier_id));
        };
        if certifier.revoked {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::KeyRevoked,
                format!("certifying key {certifier_id} is revoked"),
            ));
        }
        if let Err(locked) = unlock(&certifier, &crypto) {
            return Ok(locked.into_result(kind));
        }

        let total = u32::try_from(parcel.actions.len()).unwrap_or(u32::MAX);
        let created_millis = crypto.signature_time_millis.unwrap_or_else(now_millis);
        let mut log = OperationLog::new();
        let mut certified = 0u32;
        let mut found_target = false;
        let mut pending = Vec::new();

        for (i, action) in parcel.actions.into_iter().enumerate() {
            ctx.checkpoint()?;
            ctx.update("certifying", u32::try_from(i).unwrap_or(u32::MAX), total);
            let target_id = action.target_key_id;
            let Some(mut target) = ctx.repository().get(target_id).await? else {
                log.warn(format!("target key {target_id} not found"));
                continue;
            };
            found_target = true;
            if target.revoked {
                log.warn(format!("target key {target_id} is revoked, skipped"));
                continue;
            }

            let chosen: Vec<String> = target
                .user_ids
                .iter()
                .filter(|uid| !uid.revoked)
                .filter(|uid| action.user_ids.is_empty() || action.user_ids.contains(&uid.value))
                .map(|uid| uid.value.clone())
                .collect();
            let mut added = 0u32;
            for user_id in chosen {
                let exists = target
                    .certifications
                    .iter()
                    .any(|c| c.certifier == certifier_id && c.user_id == user_id);
                if exists {
                    debug!(target = %target_id, user_id = %user_id, "already certified");
                    continue;
                }
                target.certifications.push(Certification {
                    certifier: certifier_id,
                    user_id,
                    created_millis,
                });
                added += 1;
            }
            if added > 0 {
                log.info(format!("certified {added} user ids on {target_id}"));
                certified += added;
                pending.push(target);
            }
        }

        if !found_target {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::NotFound,
                "no certification target found",
            )
            .with_log(log));
        }

        ctx.checkpoint()?;
        ctx.prevent_cancel();
        for target in pending {
            ctx.repository().save(target).await?;
        }
        ctx.update("certifying", total, total);
        Ok(OperationResult::success(kind, ResultPayload::Certified { certified }).with_log(log))
    }
}

// ---------------------------------------------------------------------------
// Promote
// ---------------------------------------------------------------------------

pub struct PromoteOperation;

#[async_trait]
impl Operation<PromoteKeyringParcel> for PromoteOperation {
    fn name(&self) -> &'static str {
        "promote"
    }

    async fn execute(
        &self,
        parcel: PromoteKeyringParcel,
        _crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        ctx.checkpoint()?;
        let id = parcel.master_key_id;
        let Some(mut ring) = ctx.repository().get(id).await? else {
            return Ok(not_found(kind, id));
        };
        if ring.has_secret() {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::InvalidInput,
                format!("key {id} already has a secret part"),
            ));
        }
        if let Some(unknown) = parcel
            .subkey_ids
            .iter()
            .find(|sub_id| !ring.subkeys.iter().any(|sub| sub.key_id == **sub_id))
        {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::InvalidInput,
                format!("key {id} has no subkey {unknown}"),
            ));
        }

        let mut log = OperationLog::new();
        ring.secret = SecretKeyType::DivertToCard;
        ring.card_aid = parcel.card_aid;
        for sub in &mut ring.subkeys {
            if parcel.subkey_ids.is_empty() || parcel.subkey_ids.contains(&sub.key_id) {
                sub.secret = SecretKeyType::DivertToCard;
                log.info(format!("subkey {} now diverts to the security token", sub.key_id));
            }
        }

        ctx.checkpoint()?;
        ctx.prevent_cancel();
        ctx.repository().save(ring).await?;
        log.info(format!("promoted key {id}"));
        Ok(OperationResult::success(kind, ResultPayload::KeySaved { master_key_id: id }).with_log(log))
    }
}

#[cfg(test)]
mod tests {
    use keyop_core::request::CertifyAction;
    use keyop_core::{KeyId, Request, RequiredInput, SubKey};

    use super::*;
    use crate::test_utils::{public_ring, secret_ring, TestBed};
    use crate::traits::KeyRepository;

    #[tokio::test]
    async fn delete_missing_key_is_not_found_failure() {
        let bed = TestBed::new([public_ring(1, "a@example.org")]);
        let result = bed
            .run(
                Request::Delete {
                    payload: DeleteKeyringParcel {
                        master_key_ids: vec![KeyId(0xDEAD)],
                    },
                },
                CryptoInput::default(),
            )
            .await;
        assert_eq!(result.failure_code(), Some(FailureCode::NotFound));
        assert!(!result.is_internal_error());
        assert_eq!(bed.repository.len(), 1);
    }

    #[tokio::test]
    async fn delete_reports_deleted_and_missing() {
        let bed = TestBed::new([public_ring(1, "a@example.org"), public_ring(2, "b@example.org")]);
        let result = bed
            .run(
                Request::Delete {
                    payload: DeleteKeyringParcel {
                        master_key_ids: vec![KeyId(1), KeyId(3)],
                    },
                },
                CryptoInput::default(),
            )
            .await;
        assert_eq!(
            result.payload(),
            Some(&ResultPayload::Deleted {
                deleted: vec![KeyId(1)],
                missing: vec![KeyId(3)],
            })
        );
        assert_eq!(bed.repository.len(), 1);
    }

    #[tokio::test]
    async fn edit_requires_passphrase_then_applies_changes() {
        let bed = TestBed::new([secret_ring(1, "a@example.org", "pw")]);
        let parcel = SaveKeyringParcel {
            master_key_id: KeyId(1),
            add_user_ids: vec!["second@example.org".into()],
            change_primary_user_id: Some("second@example.org".into()),
            ..SaveKeyringParcel::default()
        };

        let needs = bed
            .run(Request::EditKey { payload: parcel.clone() }, CryptoInput::default())
            .await;
        assert_eq!(
            needs.outcome,
            keyop_core::Outcome::InputRequired {
                required: RequiredInput::Passphrase { key_id: KeyId(1) }
            }
        );

        let wrong = bed
            .run(
                Request::EditKey { payload: parcel.clone() },
                CryptoInput::with_passphrase("nope"),
            )
            .await;
        assert_eq!(wrong.failure_code(), Some(FailureCode::BadPassphrase));

        let done = bed
            .run(Request::EditKey { payload: parcel }, CryptoInput::with_passphrase("pw"))
            .await;
        assert!(done.is_success());
        let ring = bed.repository.get(KeyId(1)).await.unwrap().unwrap();
        assert_eq!(ring.primary_user_id(), Some("second@example.org"));
        assert_eq!(ring.user_ids.len(), 2);
    }

    #[tokio::test]
    async fn edit_rejects_unknown_subkey() {
        let bed = TestBed::new([secret_ring(1, "a@example.org", "pw")]);
        let result = bed
            .run(
                Request::EditKey {
                    payload: SaveKeyringParcel {
                        master_key_id: KeyId(1),
                        revoke_subkeys: vec![KeyId(0x77)],
                        ..SaveKeyringParcel::default()
                    },
                },
                CryptoInput::with_passphrase("pw"),
            )
            .await;
        assert_eq!(result.failure_code(), Some(FailureCode::InvalidInput));
    }

    #[tokio::test]
    async fn change_unlock_replaces_digest() {
        let bed = TestBed::new([secret_ring(1, "a@example.org", "old")]);
        let result = bed
            .run(
                Request::ChangeUnlock {
                    payload: ChangeUnlockParcel {
                        master_key_id: KeyId(1),
                        new_passphrase: keyop_core::Passphrase::new("new"),
                    },
                },
                CryptoInput::with_passphrase("old"),
            )
            .await;
        assert!(result.is_success());

        let ring = bed.repository.get(KeyId(1)).await.unwrap().unwrap();
        assert!(unlock(&ring, &CryptoInput::with_passphrase("new")).is_ok());
        assert!(unlock(&ring, &CryptoInput::with_passphrase("old")).is_err());
    }

    #[tokio::test]
    async fn revoke_with_upload_marks_seen() {
        let bed = TestBed::new([secret_ring(1, "a@example.org", "pw")]);
        let result = bed
            .run(
                Request::Revoke {
                    payload: RevokeKeyringParcel {
                        master_key_id: KeyId(1),
                        upload: true,
                    },
                },
                CryptoInput::with_passphrase("pw"),
            )
            .await;
        assert!(result.is_success());
        assert!(bed.repository.get(KeyId(1)).await.unwrap().unwrap().revoked);

        let uploaded = bed.keyserver.uploaded();
        assert_eq!(uploaded.len(), 1);
        assert!(uploaded[0].revoked);
        assert!(!uploaded[0].has_secret());
        let meta = bed.repository.metadata(KeyId(1)).await.unwrap().unwrap();
        assert!(meta.seen_on_keyservers);
    }

    #[tokio::test]
    async fn revoke_upload_failure_is_network_error() {
        let bed = TestBed::new([secret_ring(1, "a@example.org", "pw")]);
        bed.keyserver.set_offline(true);
        let result = bed
            .run(
                Request::Revoke {
                    payload: RevokeKeyringParcel {
                        master_key_id: KeyId(1),
                        upload: true,
                    },
                },
                CryptoInput::with_passphrase("pw"),
            )
            .await;
        assert_eq!(result.failure_code(), Some(FailureCode::NetworkError));
        // The local revocation stands.
        assert!(bed.repository.get(KeyId(1)).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn certify_counts_new_certifications_only() {
        let mut target = public_ring(2, "b@example.org");
        target.user_ids.push(keyop_core::UserId::new("b2@example.org"));
        let bed = TestBed::new([secret_ring(1, "a@example.org", "pw"), target]);
        let request = Request::Certify {
            payload: CertifyActionsParcel {
                master_key_id: KeyId(1),
                actions: vec![
                    CertifyAction {
                        target_key_id: KeyId(2),
                        user_ids: Vec::new(),
                    },
                    CertifyAction {
                        target_key_id: KeyId(9),
                        user_ids: Vec::new(),
                    },
                ],
            },
        };

        let first = bed.run(request.clone(), CryptoInput::with_passphrase("pw")).await;
        assert_eq!(first.payload(), Some(&ResultPayload::Certified { certified: 2 }));
        let second = bed.run(request, CryptoInput::with_passphrase("pw")).await;
        assert_eq!(second.payload(), Some(&ResultPayload::Certified { certified: 0 }));

        let stored = bed.repository.get(KeyId(2)).await.unwrap().unwrap();
        assert_eq!(stored.certifications.len(), 2);
        assert!(stored.certifications.iter().all(|c| c.certifier == KeyId(1)));
    }

    #[tokio::test]
    async fn certify_without_targets_is_not_found() {
        let bed = TestBed::new([secret_ring(1, "a@example.org", "pw")]);
        let result = bed
            .run(
                Request::Certify {
                    payload: CertifyActionsParcel {
                        master_key_id: KeyId(1),
                        actions: vec![CertifyAction {
                            target_key_id: KeyId(5),
                            user_ids: Vec::new(),
                        }],
                    },
                },
                CryptoInput::with_passphrase("pw"),
            )
            .await;
        assert_eq!(result.failure_code(), Some(FailureCode::NotFound));
    }

    #[tokio::test]
    async fn promote_diverts_selected_subkeys() {
        let mut ring = public_ring(1, "a@example.org");
        for id in [0x10, 0x11] {
            ring.subkeys.push(SubKey {
                key_id: KeyId(id),
                revoked: false,
                secret: SecretKeyType::None,
            });
        }
        let bed = TestBed::new([ring]);
        let result = bed
            .run(
                Request::Promote {
                    payload: PromoteKeyringParcel {
                        master_key_id: KeyId(1),
                        card_aid: Some(vec![0xD2, 0x76]),
                        subkey_ids: vec![KeyId(0x11)],
                    },
                },
                CryptoInput::default(),
            )
            .await;
        assert!(result.is_success());

        let stored = bed.repository.get(KeyId(1)).await.unwrap().unwrap();
        assert_eq!(stored.secret, SecretKeyType::DivertToCard);
        assert_eq!(stored.subkeys[0].secret, SecretKeyType::None);
        assert_eq!(stored.subkeys[1].secret, SecretKeyType::DivertToCard);
        assert_eq!(stored.card_aid, Some(vec![0xD2, 0x76]));

        // A second promotion is refused.
        let again = bed
            .run(
                Request::Promote {
                    payload: PromoteKeyringParcel {
                        master_key_id: KeyId(1),
                        card_aid: None,
                        subkey_ids: Vec::new(),
                    },
                },
                CryptoInput::default(),
            )
            .await;
        assert_eq!(again.failure_code(), Some(FailureCode::InvalidInput));
    }
}
