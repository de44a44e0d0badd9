/// Job Manager - turns templates into jobs and validates submitted shares
///
/// Exactly one job is current at a time. Readers clone the `Arc<Job>` and
/// always see a fully built job; swaps happen under a short write lock.
/// Every job minted for the current tip stays valid for submits until the
/// tip changes.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::extranonce::ExtraNonceCounter;
use super::job::{Job, JobError};
use crate::algorithm::{hash_to_biguint, Algorithm};
use crate::blockchain::{BlockTemplate, GenerationBuilder, Recipient};
use crate::events::Observers;
use crate::metrics::prometheus as metrics;
use crate::shares::{
    PowRequest, PowVerifier, ShareError, ShareEvent, ShareOutcome, ShareSubmission,
};

/// Slack for float rounding when comparing share difficulty to the floor.
const DIFFICULTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub enum JobEvent {
    /// New chain tip; miners must drop old work.
    NewBlock(Arc<Job>),
    /// Same tip, refreshed contents under a new job id. Earlier jobs for
    /// the tip keep accepting shares.
    UpdatedBlock(Arc<Job>),
    Share(ShareEvent),
}

/// Where block rewards go.
#[derive(Debug, Clone, Default)]
pub struct PayoutScripts {
    pub pool_script: Vec<u8>,
    pub recipients: Vec<Recipient>,
}

/// Hex job ids in `1..=0xfffe`, wrapping.
struct JobCounter {
    counter: AtomicU64,
}

impl JobCounter {
    fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) % 0xfffe + 1;
        format!("{:x}", n)
    }
}

pub struct JobManager {
    algorithm: Algorithm,
    payout: PayoutScripts,
    builder: Arc<dyn GenerationBuilder>,
    verifier: Arc<dyn PowVerifier>,
    extra_nonce: ExtraNonceCounter,
    job_counter: JobCounter,
    current: RwLock<Option<Arc<Job>>>,
    valid_jobs: RwLock<HashMap<String, Arc<Job>>>,
    // Serializes template processing so two updates cannot interleave.
    update_lock: Mutex<()>,
    observers: Observers<JobEvent>,
}

impl JobManager {
    pub fn new(
        algorithm: Algorithm,
        payout: PayoutScripts,
        builder: Arc<dyn GenerationBuilder>,
        verifier: Arc<dyn PowVerifier>,
        extranonce_bytes: usize,
    ) -> Self {
        Self {
            algorithm,
            payout,
            builder,
            verifier,
            extra_nonce: ExtraNonceCounter::new(extranonce_bytes),
            job_counter: JobCounter::new(),
            current: RwLock::new(None),
            valid_jobs: RwLock::new(HashMap::new()),
            update_lock: Mutex::new(()),
            observers: Observers::new(),
        }
    }

    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.observers.register(callback);
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn extra_nonce_counter(&self) -> &ExtraNonceCounter {
        &self.extra_nonce
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.current.read().clone()
    }

    /// A job that still accepts shares: the current one or an earlier
    /// refresh of the same tip.
    pub fn valid_job(&self, job_id: &str) -> Option<Arc<Job>> {
        self.valid_jobs.read().get(job_id).cloned()
    }

    pub fn valid_job_count(&self) -> usize {
        self.valid_jobs.read().len()
    }

    /// True when `template` is on a different tip than the current job, or
    /// there is no current job.
    pub fn is_new_tip(&self, template: &BlockTemplate) -> bool {
        self.current
            .read()
            .as_ref()
            .map(|job| !job.template.same_tip(template))
            .unwrap_or(true)
    }

    /// Applies a fresh template. Returns `true` only for a new tip.
    pub fn process_template(&self, template: BlockTemplate) -> Result<bool, JobError> {
        let _guard = self.update_lock.lock();
        let current = self.current_job();

        match current {
            Some(job) if job.template.same_tip(&template) => {
                if job.template.transaction_ids() == template.transaction_ids() {
                    return Ok(false);
                }
                self.refresh(&job, template)?;
                Ok(false)
            }
            _ => {
                self.install_new_block(template)?;
                Ok(true)
            }
        }
    }

    /// Forced refresh of the current tip, used when jobs are rebroadcast.
    pub fn update_current_job(&self, template: BlockTemplate) -> Result<(), JobError> {
        let _guard = self.update_lock.lock();
        match self.current_job() {
            Some(job) if job.template.same_tip(&template) => self.refresh(&job, template),
            _ => self.install_new_block(template),
        }
    }

    fn install_new_block(&self, template: BlockTemplate) -> Result<(), JobError> {
        let generation = self.build_generation(&template);
        let job = Arc::new(Job::new(self.job_counter.next(), template, generation, self.algorithm)?);

        tracing::info!(
            "📋 New block template: height={}, job={}, txs={}, network_diff={:.4}",
            job.height(),
            job.job_id,
            job.template.transactions.len(),
            job.network_difficulty
        );
        metrics::set_template_height(job.height());
        metrics::inc_template_updates();

        {
            let mut valid = self.valid_jobs.write();
            valid.clear();
            valid.insert(job.job_id.clone(), job.clone());
        }
        *self.current.write() = Some(job.clone());
        self.observers.emit(&JobEvent::NewBlock(job));
        Ok(())
    }

    fn refresh(&self, job: &Job, template: BlockTemplate) -> Result<(), JobError> {
        let generation = self.build_generation(&template);
        let updated = Arc::new(Job::new(self.job_counter.next(), template, generation, self.algorithm)?);

        tracing::debug!(
            "Refreshed job {} -> {} at height {} ({} txs)",
            job.job_id,
            updated.job_id,
            updated.height(),
            updated.template.transactions.len()
        );
        metrics::inc_template_updates();

        self.valid_jobs.write().insert(updated.job_id.clone(), updated.clone());
        *self.current.write() = Some(updated.clone());
        self.observers.emit(&JobEvent::UpdatedBlock(updated));
        Ok(())
    }

    fn build_generation(&self, template: &BlockTemplate) -> crate::blockchain::GenerationTx {
        self.builder.build(
            template,
            template.coinbase_value,
            &self.payout.recipients,
            &self.payout.pool_script,
        )
    }

    /// Validates one submitted share and emits a `JobEvent::Share` for it.
    pub async fn process_share(&self, sub: ShareSubmission) -> ShareOutcome {
        let job = self.valid_job(&sub.job_id);
        let result = match &job {
            Some(job) => self.validate(job, &sub).await,
            None => Err(ShareError::JobNotFound),
        };
        let job = job.or_else(|| self.current_job());

        let (height, block_reward, block_diff) = job
            .as_ref()
            .map(|j| (j.height(), j.generation.reward_to_pool, j.network_difficulty))
            .unwrap_or((0, 0, 0.0));

        let (outcome, share_diff, block_hash) = match result {
            Ok(valid) => {
                metrics::inc_accepted();
                if valid.block_hex.is_some() {
                    metrics::inc_block_candidates();
                }
                (ShareOutcome::accepted(valid.block_hex), valid.share_diff, valid.block_hash)
            }
            Err(err) => {
                metrics::inc_rejected(err.reason());
                tracing::debug!(
                    "Share rejected: worker={} job={} reason={}",
                    sub.worker,
                    sub.job_id,
                    err.reason()
                );
                (ShareOutcome::rejected(err), 0.0, None)
            }
        };

        self.observers.emit(&JobEvent::Share(ShareEvent {
            job_id: sub.job_id,
            ip: sub.ip,
            port: sub.port,
            worker: sub.worker,
            height,
            block_reward,
            difficulty: sub.difficulty,
            share_diff,
            block_diff,
            block_hash,
            block_hex: outcome.block_hex.clone(),
            error: outcome.error,
            timestamp: chrono::Utc::now(),
        }));

        outcome
    }

    async fn validate(&self, job: &Job, sub: &ShareSubmission) -> Result<ValidShare, ShareError> {
        let nonce = sub.nonce.to_ascii_lowercase();
        if nonce.len() != 16
            || !is_hex(&nonce)
            || !nonce.starts_with(&sub.extra_nonce1.to_ascii_lowercase())
        {
            return Err(ShareError::InvalidNonce);
        }
        if sub.header_hash.len() != 64 || !is_hex(&sub.header_hash) {
            return Err(ShareError::InvalidHeader);
        }
        if sub.mix_hash.len() != 64 || !is_hex(&sub.mix_hash) {
            return Err(ShareError::InvalidMixHash);
        }

        if !sub.header_hash.eq_ignore_ascii_case(&job.header_hash) {
            return Err(ShareError::IncorrectHeaderHash);
        }

        if !job.register_submit(&sub.worker, &nonce) {
            return Err(ShareError::DuplicateShare);
        }

        let req = PowRequest {
            header_hash: job.header_hash.clone(),
            mix_hash: sub.mix_hash.to_ascii_lowercase(),
            nonce: nonce.clone(),
            height: job.height(),
            target: job.target_hex.clone(),
        };
        let pow = match self.verifier.verify(&req).await {
            Ok(pow) if pow.valid => pow,
            Ok(_) => return Err(ShareError::InvalidPow),
            Err(e) => {
                tracing::warn!("PoW verifier failed for job {}: {}", job.job_id, e);
                return Err(ShareError::InvalidPow);
            }
        };
        let digest = hash_to_biguint(&pow.digest).ok_or(ShareError::InvalidPow)?;

        let share_diff = self.algorithm.difficulty_for_hash(&digest);
        let floor = sub
            .previous_difficulty
            .map(|prev| prev.max(sub.difficulty))
            .unwrap_or(sub.difficulty);
        if share_diff * (1.0 + DIFFICULTY_EPSILON) < floor {
            return Err(ShareError::LowDifficulty);
        }

        if !pow.meets_network_target {
            return Ok(ValidShare {
                share_diff,
                block_hex: None,
                block_hash: None,
            });
        }

        match job.serialize_block(&nonce, &req.mix_hash) {
            Ok(block_hex) => {
                tracing::info!("💎 Block candidate at height {} from {}", job.height(), sub.worker);
                Ok(ValidShare {
                    share_diff,
                    block_hex: Some(block_hex),
                    block_hash: Some(format!("{:0>64}", digest.to_str_radix(16))),
                })
            }
            Err(e) => {
                tracing::error!("Failed to serialize block for job {}: {}", job.job_id, e);
                Err(ShareError::InvalidPow)
            }
        }
    }
}

struct ValidShare {
    share_diff: f64,
    block_hex: Option<String>,
    block_hash: Option<String>,
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}
