//! External identity verification: a key is linked to an identity when the
//! proof document published at a URL names the key's fingerprint.

use std::sync::Arc;

use async_trait::async_trait;
use keyop_core::request::IdentityVerificationParcel;
use keyop_core::{CryptoInput, FailureCode, OperationLog, OperationResult, ResultPayload};
use regex::Regex;
use tracing::debug;

use super::{not_found, OperationDeps};
use crate::service::operation::{Operation, OperationContext};
use crate::traits::{ProofError, ProofVerifier};

const PROOF_URL: &str = r"^https?://([^/\s]+)(/\S*)?$";

pub struct VerifyIdentityOperation {
    proofs: Arc<dyn ProofVerifier>,
}

impl VerifyIdentityOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            proofs: Arc::clone(&deps.proofs),
        }
    }
}

/// Lowercases and drops whitespace and `:` separators, so fingerprints
/// printed in groups still match.
fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .flat_map(char::to_lowercase)
        .collect()
}

#[async_trait]
impl Operation<IdentityVerificationParcel> for VerifyIdentityOperation {
    fn name(&self) -> &'static str {
        "verify-identity"
    }

    async fn execute(
        &self,
        parcel: IdentityVerificationParcel,
        _crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        let Some(ring) = ctx.repository().get(parcel.master_key_id).await? else {
            return Ok(not_found(kind, parcel.master_key_id));
        };

        let url = Regex::new(PROOF_URL)?;
        let Some(caps) = url.captures(parcel.proof_url.trim()) else {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::InvalidInput,
                format!("not a proof url: {}", parcel.proof_url),
            ));
        };
        let host = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
        let path = caps.get(2).map_or("", |m| m.as_str().trim_end_matches('/'));
        let identity = format!("{host}{path}");

        ctx.update("fetching proof", 0, 1);
        let document = match self.proofs.fetch_proof(parcel.proof_url.trim()).await {
            Ok(document) => document,
            Err(ProofError::NotFound(url)) => {
                return Ok(OperationResult::failure(
                    kind,
                    FailureCode::NotFound,
                    format!("no proof published at {url}"),
                ))
            }
            Err(e @ ProofError::Fetch(_)) => {
                return Ok(OperationResult::failure(kind, FailureCode::NetworkError, e.to_string()))
            }
        };
        ctx.update("fetching proof", 1, 1);

        let fingerprint = ring.fingerprint.to_string().to_ascii_lowercase();
        debug!(%identity, %fingerprint, "checking proof document");
        if !normalize(&document).contains(&fingerprint) {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::InvalidInput,
                format!("proof at {identity} does not mention fingerprint {fingerprint}"),
            ));
        }

        let mut log = OperationLog::new();
        log.info(format!("{identity} is linked to {}", ring.master_key_id));
        Ok(OperationResult::success(kind, ResultPayload::IdentityVerified { identity }).with_log(log))
    }
}
