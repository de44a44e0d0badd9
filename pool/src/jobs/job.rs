use num_bigint::BigUint;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Instant;
use thiserror::Error;

use super::merkle::{merkle_branch, merkle_root_from_branch};
use crate::algorithm::{hash_to_biguint, Algorithm};
use crate::blockchain::{BlockTemplate, GenerationTx};
use crate::util::{reverse_hex, reversed, sha256d, var_int};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("Invalid template field {field}: {reason}")]
    InvalidTemplate { field: &'static str, reason: String },

    #[error("Invalid generation transaction: {0}")]
    InvalidGeneration(String),

    #[error("Invalid submit field {0}")]
    InvalidSubmit(&'static str),
}

fn field_err(field: &'static str) -> impl Fn(hex::FromHexError) -> JobError {
    move |e| JobError::InvalidTemplate {
        field,
        reason: e.to_string(),
    }
}

fn to_array32(bytes: &[u8], field: &'static str) -> Result<[u8; 32], JobError> {
    bytes.try_into().map_err(|_| JobError::InvalidTemplate {
        field,
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

/// Per-client job parameters minus the share target.
#[derive(Debug, Clone, PartialEq)]
pub struct JobParams {
    pub job_id: String,
    pub header_hash: String,
    pub seed_hash: String,
    pub height: u64,
    pub bits: String,
    pub clean_jobs: bool,
}

impl JobParams {
    /// `mining.notify` params: `[job_id, header_hash, seed_hash, target,
    /// clean_jobs, height, bits]`.
    pub fn notify_params(&self, share_target: &str) -> Value {
        json!([
            self.job_id,
            self.header_hash,
            self.seed_hash,
            share_target,
            self.clean_jobs,
            self.height,
            self.bits,
        ])
    }
}

/// A unit of work built from one block template.
#[derive(Debug)]
pub struct Job {
    pub job_id: String,
    pub template: BlockTemplate,
    pub generation: GenerationTx,
    pub merkle_branch: Vec<[u8; 32]>,
    pub merkle_root: [u8; 32],
    header: [u8; 80],
    /// Double-SHA256 of the header, display order.
    pub header_hash: String,
    pub seed_hash: String,
    pub target: BigUint,
    pub target_hex: String,
    pub network_difficulty: f64,
    pub created_at: Instant,
    submits: Mutex<HashSet<String>>,
}

impl Job {
    pub fn new(
        job_id: String,
        template: BlockTemplate,
        generation: GenerationTx,
        algorithm: Algorithm,
    ) -> Result<Self, JobError> {
        let tx_hashes = template
            .transactions
            .iter()
            .map(|tx| {
                let bytes = reverse_hex(tx.id()).map_err(field_err("transactions.txid"))?;
                to_array32(&bytes, "transactions.txid")
            })
            .collect::<Result<Vec<_>, _>>()?;
        let merkle_branch = merkle_branch(&tx_hashes);
        let merkle_root = merkle_root_from_branch(&generation.tx_hash, &merkle_branch);

        let prev = reverse_hex(&template.previous_block_hash).map_err(field_err("previousblockhash"))?;
        let prev = to_array32(&prev, "previousblockhash")?;
        let bits = reverse_hex(&template.bits).map_err(field_err("bits"))?;
        if bits.len() != 4 {
            return Err(JobError::InvalidTemplate {
                field: "bits",
                reason: format!("expected 4 bytes, got {}", bits.len()),
            });
        }

        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&template.version.to_le_bytes());
        header[4..36].copy_from_slice(&prev);
        header[36..68].copy_from_slice(&merkle_root);
        header[68..72].copy_from_slice(&template.cur_time.to_le_bytes());
        header[72..76].copy_from_slice(&bits);
        header[76..80].copy_from_slice(&(template.height as u32).to_le_bytes());
        let header_hash = hex::encode(reversed(&sha256d(&header)));

        let target = hash_to_biguint(&template.target).ok_or_else(|| JobError::InvalidTemplate {
            field: "target",
            reason: "not hex".to_string(),
        })?;
        let target_hex = format!("{:0>64}", target.to_str_radix(16));

        Ok(Self {
            network_difficulty: algorithm.difficulty_for_hash(&target),
            seed_hash: algorithm.seed_hash(template.height),
            job_id,
            template,
            generation,
            merkle_branch,
            merkle_root,
            header,
            header_hash,
            target,
            target_hex,
            created_at: Instant::now(),
            submits: Mutex::new(HashSet::new()),
        })
    }

    pub fn height(&self) -> u64 {
        self.template.height
    }

    pub fn header(&self) -> &[u8; 80] {
        &self.header
    }

    /// Records `(worker, nonce)`. Returns false when it was already seen.
    pub fn register_submit(&self, worker: &str, nonce: &str) -> bool {
        let key = format!("{}:{}", worker, nonce.to_ascii_lowercase());
        self.submits.lock().insert(key)
    }

    pub fn job_params(&self, clean_jobs: bool) -> JobParams {
        JobParams {
            job_id: self.job_id.clone(),
            header_hash: self.header_hash.clone(),
            seed_hash: self.seed_hash.clone(),
            height: self.template.height,
            bits: self.template.bits.clone(),
            clean_jobs,
        }
    }

    /// Full block: header, nonce (u64 LE), mix hash, then every transaction
    /// with the generation transaction first.
    pub fn serialize_block(&self, nonce: &str, mix_hash: &str) -> Result<String, JobError> {
        let nonce = u64::from_str_radix(nonce, 16).map_err(|_| JobError::InvalidSubmit("nonce"))?;
        let mix = reverse_hex(mix_hash).map_err(|_| JobError::InvalidSubmit("mix_hash"))?;
        let generation = self
            .generation
            .tx_bytes()
            .map_err(|e| JobError::InvalidGeneration(e.to_string()))?;

        let mut block = Vec::with_capacity(80 + 8 + 32 + 9 + generation.len());
        block.extend_from_slice(&self.header);
        block.extend_from_slice(&nonce.to_le_bytes());
        block.extend_from_slice(&mix);
        block.extend_from_slice(&var_int(self.template.transactions.len() as u64 + 1));
        block.extend_from_slice(&generation);
        let mut hex_block = hex::encode(block);
        for tx in &self.template.transactions {
            hex_block.push_str(&tx.data);
        }
        Ok(hex_block)
    }
}
