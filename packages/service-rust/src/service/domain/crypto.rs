//! Message-level operations: sign/encrypt, decrypt/verify, mixed input
//! parsing, and the hashing benchmark.
//!
//! Key lookup, revocation checks, and unlock happen here; packet bytes come
//! from the configured [`CryptoEngine`], always on the blocking pool.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use keyop_core::request::{
    BenchmarkParcel, DecryptVerifyParcel, InputDataParcel, SignEncryptParcel,
};
use keyop_core::{
    CryptoInput, FailureCode, InputPart, KeyId, KeyRing, OperationLog, OperationResult, Outcome,
    ResultPayload, SignatureStatus,
};
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::armor::{armor, dearmor, looks_armored, MESSAGE};
use super::{blocking, crypto_failure, not_found, unlock, OperationDeps};
use crate::service::operation::{Operation, OperationContext};
use crate::traits::CryptoEngine;

// ---------------------------------------------------------------------------
// Sign / encrypt
// ---------------------------------------------------------------------------

pub struct SignEncryptOperation {
    engine: Arc<dyn CryptoEngine>,
}

impl SignEncryptOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            engine: Arc::clone(&deps.crypto),
        }
    }
}

#[async_trait]
impl Operation<SignEncryptParcel> for SignEncryptOperation {
    fn name(&self) -> &'static str {
        "sign-encrypt"
    }

    async fn execute(
        &self,
        parcel: SignEncryptParcel,
        crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        ctx.checkpoint()?;
        if parcel.signature_key_id.is_none() && parcel.encryption_key_ids.is_empty() {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::InvalidInput,
                "nothing to do: no signing key and no recipients",
            ));
        }

        let mut log = OperationLog::new();
        let signer = match parcel.signature_key_id {
            Some(id) => {
                let Some(ring) = ctx.repository().find_by_key_id(id).await? else {
                    return Ok(not_found(kind, id));
                };
                if let Some(result) = revoked(kind, &ring) {
                    return Ok(result);
                }
                if let Err(locked) = unlock(&ring, &crypto) {
                    return Ok(locked.into_result(kind));
                }
                log.info(format!("signing with {}", ring.master_key_id));
                Some(ring)
            }
            None => None,
        };

        let mut recipients = Vec::with_capacity(parcel.encryption_key_ids.len());
        for id in parcel.encryption_key_ids {
            let Some(ring) = ctx.repository().find_by_key_id(id).await? else {
                return Ok(not_found(kind, id));
            };
            if let Some(result) = revoked(kind, &ring) {
                return Ok(result);
            }
            log.info(format!("encrypting to {}", ring.master_key_id));
            recipients.push(ring);
        }

        ctx.checkpoint()?;
        ctx.update("signing and encrypting", 0, 1);
        let engine = Arc::clone(&self.engine);
        let input = parcel.input;
        let output = blocking(move || engine.sign_encrypt(&input, signer.as_ref(), &recipients))
            .await?;
        let data = match output {
            Ok(bytes) if parcel.armor => armor(MESSAGE, &bytes).into_bytes(),
            Ok(bytes) => bytes,
            Err(e) => return Ok(crypto_failure(kind, &e).with_log(log)),
        };
        ctx.update("signing and encrypting", 1, 1);
        Ok(OperationResult::success(kind, ResultPayload::Output { data }).with_log(log))
    }
}

fn revoked(kind: keyop_core::RequestKind, ring: &KeyRing) -> Option<OperationResult> {
    ring.revoked.then(|| {
        OperationResult::failure(
            kind,
            FailureCode::KeyRevoked,
            format!("key {} is revoked", ring.master_key_id),
        )
    })
}

// ---------------------------------------------------------------------------
// Decrypt / verify
// ---------------------------------------------------------------------------

struct Plaintext {
    data: Vec<u8>,
    signer: Option<KeyId>,
    signature: Option<SignatureStatus>,
}

/// Result of trying to open one message.
enum Opened {
    Plain(Plaintext),
    /// Stop with this terminal result (missing key, input required, ...).
    Stop(OperationResult),
}

async fn open_message(
    engine: &Arc<dyn CryptoEngine>,
    message: &[u8],
    allowed: Option<&[KeyId]>,
    crypto: &CryptoInput,
    ctx: &OperationContext,
) -> anyhow::Result<Opened> {
    let kind = ctx.kind();
    let data = if looks_armored(message) {
        let text = String::from_utf8_lossy(message);
        match dearmor(&text) {
            Ok((_, data)) => data,
            Err(e) => {
                return Ok(Opened::Stop(OperationResult::failure(
                    kind,
                    FailureCode::InvalidInput,
                    e.to_string(),
                )))
            }
        }
    } else {
        message.to_vec()
    };

    let recipients = match engine.recipients(&data) {
        Ok(ids) => ids,
        Err(e) => return Ok(Opened::Stop(crypto_failure(kind, &e))),
    };
    let usable: Vec<KeyId> = recipients
        .into_iter()
        .filter(|id| allowed.is_none_or(|allowed| allowed.contains(id)))
        .collect();

    // Prefer a recipient we hold a cached session key for.
    let mut chosen = None;
    for id in &usable {
        let Some(ring) = ctx.repository().find_by_key_id(*id).await? else {
            continue;
        };
        if let Some(session) = crypto.session_key_for(*id) {
            chosen = Some((ring, Some(session.clone())));
            break;
        }
        if ring.has_secret() && chosen.is_none() {
            chosen = Some((ring, None));
        }
    }
    let Some((ring, session)) = chosen else {
        return Ok(Opened::Stop(OperationResult::failure(
            kind,
            FailureCode::NoSecretKey,
            "message is not encrypted to any available secret key",
        )));
    };
    if session.is_none() {
        if let Err(locked) = unlock(&ring, crypto) {
            return Ok(Opened::Stop(locked.into_result(kind)));
        }
    }
    debug!(key = %ring.master_key_id, cached_session = session.is_some(), "decrypting");

    let engine = Arc::clone(engine);
    let decrypted = blocking(move || engine.decrypt(&data, &ring, session.as_ref())).await?;
    let decrypted = match decrypted {
        Ok(decrypted) => decrypted,
        Err(e) => return Ok(Opened::Stop(crypto_failure(kind, &e))),
    };

    let signature = match decrypted.signer {
        None => None,
        Some(signer) => Some(match ctx.repository().find_by_key_id(signer).await? {
            Some(ring) if ring.revoked => SignatureStatus::RevokedKey,
            Some(_) => SignatureStatus::Verified,
            None => SignatureStatus::UnknownKey,
        }),
    };
    Ok(Opened::Plain(Plaintext {
        data: decrypted.data,
        signer: decrypted.signer,
        signature,
    }))
}

pub struct DecryptVerifyOperation {
    engine: Arc<dyn CryptoEngine>,
}

impl DecryptVerifyOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            engine: Arc::clone(&deps.crypto),
        }
    }
}

#[async_trait]
impl Operation<DecryptVerifyParcel> for DecryptVerifyOperation {
    fn name(&self) -> &'static str {
        "decrypt-verify"
    }

    async fn execute(
        &self,
        parcel: DecryptVerifyParcel,
        crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        ctx.update("decrypting", 0, 1);
        let opened = open_message(
            &self.engine,
            &parcel.input,
            parcel.allowed_key_ids.as_deref(),
            &crypto,
            ctx,
        )
        .await?;
        ctx.update("decrypting", 1, 1);
        Ok(match opened {
            Opened::Plain(plain) => OperationResult::success(
                kind,
                ResultPayload::Decrypted {
                    data: plain.data,
                    signer: plain.signer,
                    signature: plain.signature,
                },
            ),
            Opened::Stop(result) => result,
        })
    }
}

// ---------------------------------------------------------------------------
// Input data
// ---------------------------------------------------------------------------

const ARMOR_BLOCK: &str =
    r"(?s)-----BEGIN PGP ([A-Z ]+)-----\r?\n.*?-----END PGP ([A-Z ]+)-----\r?\n?";

/// Splits mixed text into plain and armored parts, decrypting embedded
/// messages.
pub struct InputDataOperation {
    engine: Arc<dyn CryptoEngine>,
}

impl InputDataOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            engine: Arc::clone(&deps.crypto),
        }
    }
}

fn push_text(parts: &mut Vec<InputPart>, text: &str) {
    if !text.trim().is_empty() {
        parts.push(InputPart::Text {
            text: text.to_string(),
        });
    }
}

#[async_trait]
impl Operation<InputDataParcel> for InputDataOperation {
    fn name(&self) -> &'static str {
        "input-data"
    }

    async fn execute(
        &self,
        parcel: InputDataParcel,
        crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let kind = ctx.kind();
        let Ok(text) = String::from_utf8(parcel.input) else {
            return Ok(OperationResult::failure(
                kind,
                FailureCode::InvalidInput,
                "input is not UTF-8 text",
            ));
        };
        let block = Regex::new(ARMOR_BLOCK)?;
        let blocks: Vec<_> = block.captures_iter(&text).collect();
        let total = u32::try_from(blocks.len()).unwrap_or(u32::MAX);

        let mut log = OperationLog::new();
        let mut parts = Vec::new();
        let mut cursor = 0;
        for (i, caps) in blocks.iter().enumerate() {
            ctx.update("processing input", u32::try_from(i).unwrap_or(u32::MAX), total);
            let (Some(whole), Some(label), Some(end_label)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            push_text(&mut parts, &text[cursor..whole.start()]);
            cursor = whole.end();

            let label = label.as_str();
            if label != end_label.as_str() {
                log.warn(format!("armor block {label:?} has a mismatched footer"));
                push_text(&mut parts, whole.as_str());
                continue;
            }
            if label != MESSAGE {
                parts.push(InputPart::Armored {
                    label: label.to_string(),
                    text: whole.as_str().to_string(),
                });
                continue;
            }

            match open_message(&self.engine, whole.as_str().as_bytes(), None, &crypto, ctx).await? {
                Opened::Plain(plain) => {
                    log.info("decrypted embedded message");
                    parts.push(InputPart::Decrypted {
                        data: plain.data,
                        signature: plain.signature,
                    });
                }
                Opened::Stop(result) if matches!(result.outcome, Outcome::InputRequired { .. }) => {
                    return Ok(result.with_log(log));
                }
                Opened::Stop(result) => {
                    let reason = match &result.outcome {
                        Outcome::Failure { failure } => failure.message.clone(),
                        _ => result.outcome_label().to_string(),
                    };
                    log.warn(format!("left message encrypted: {reason}"));
                    parts.push(InputPart::Armored {
                        label: label.to_string(),
                        text: whole.as_str().to_string(),
                    });
                }
            }
        }
        push_text(&mut parts, &text[cursor..]);
        ctx.update("processing input", total, total);

        Ok(OperationResult::success(kind, ResultPayload::InputParts { parts }).with_log(log))
    }
}

// ---------------------------------------------------------------------------
// Benchmark
// ---------------------------------------------------------------------------

/// Hashes `rounds` blocks of random data with SHA-256, chaining each digest
/// into the next round.
pub struct BenchmarkOperation {
    default_rounds: u32,
    block_size: usize,
}

impl BenchmarkOperation {
    #[must_use]
    pub fn new(deps: &OperationDeps) -> Self {
        Self {
            default_rounds: deps.config.benchmark_rounds,
            block_size: deps.config.benchmark_block_size,
        }
    }
}

#[async_trait]
impl Operation<BenchmarkParcel> for BenchmarkOperation {
    fn name(&self) -> &'static str {
        "benchmark"
    }

    async fn execute(
        &self,
        parcel: BenchmarkParcel,
        _crypto: CryptoInput,
        ctx: &OperationContext,
    ) -> anyhow::Result<OperationResult> {
        let rounds = parcel.rounds.unwrap_or(self.default_rounds).max(1);
        let block_size = self.block_size.max(1);
        let reporter = ctx.progress().clone();

        let elapsed = blocking(move || {
            let mut block = vec![0u8; block_size];
            rand::rng().fill(&mut block[..]);
            let mut digest = [0u8; 32];
            let start = Instant::now();
            for round in 0..rounds {
                let mut hasher = Sha256::new();
                hasher.update(digest);
                hasher.update(&block);
                digest.copy_from_slice(&hasher.finalize());
                reporter.update(Some("hashing"), round + 1, rounds);
            }
            start.elapsed()
        })
        .await?;

        let bytes = u64::from(rounds).saturating_mul(u64::try_from(block_size).unwrap_or(u64::MAX));
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        info!(rounds, bytes, elapsed_ms, "benchmark finished");

        let mut log = OperationLog::new();
        log.info(format!("hashed {bytes} bytes in {elapsed_ms} ms"));
        Ok(OperationResult::success(
            ctx.kind(),
            ResultPayload::Benchmark {
                rounds,
                bytes,
                elapsed_ms,
            },
        )
        .with_log(log))
    }
}
