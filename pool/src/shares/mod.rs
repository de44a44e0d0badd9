/// Mining shares module
///
/// Share submissions, outcomes and the proof-of-work verifier boundary

pub mod verifier;

pub use verifier::{DaemonPowVerifier, PowDigest, PowRequest, PowVerifier, VerifyError};

use serde::Serialize;
use std::net::IpAddr;
use thiserror::Error;

/// Share rejection reasons with their Stratum error codes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShareError {
    #[error("job not found")]
    JobNotFound,
    #[error("incorrect size of nonce")]
    InvalidNonce,
    #[error("invalid header hash")]
    InvalidHeader,
    #[error("invalid mix hash")]
    InvalidMixHash,
    #[error("duplicate share")]
    DuplicateShare,
    #[error("incorrect header hash")]
    IncorrectHeaderHash,
    #[error("invalid proof of work")]
    InvalidPow,
    #[error("low difficulty share")]
    LowDifficulty,
    #[error("unauthorized worker")]
    Unauthorized,
    #[error("not subscribed")]
    NotSubscribed,
}

impl ShareError {
    pub fn code(&self) -> i32 {
        match self {
            ShareError::JobNotFound => 21,
            ShareError::DuplicateShare => 22,
            ShareError::LowDifficulty => 23,
            ShareError::Unauthorized => 24,
            ShareError::NotSubscribed => 25,
            ShareError::InvalidNonce
            | ShareError::InvalidHeader
            | ShareError::InvalidMixHash
            | ShareError::IncorrectHeaderHash
            | ShareError::InvalidPow => 20,
        }
    }

    /// Short machine-readable reason, used for metrics labels.
    pub fn reason(&self) -> &'static str {
        match self {
            ShareError::JobNotFound => "job-not-found",
            ShareError::InvalidNonce => "invalid-nonce",
            ShareError::InvalidHeader => "invalid-header",
            ShareError::InvalidMixHash => "invalid-mix-hash",
            ShareError::DuplicateShare => "duplicate-share",
            ShareError::IncorrectHeaderHash => "incorrect-header-hash",
            ShareError::InvalidPow => "invalid-pow",
            ShareError::LowDifficulty => "low-difficulty-share",
            ShareError::Unauthorized => "unauthorized-worker",
            ShareError::NotSubscribed => "not-subscribed",
        }
    }
}

/// A `mining.submit` after protocol parsing, with the submitting client's
/// context attached.
#[derive(Debug, Clone)]
pub struct ShareSubmission {
    pub job_id: String,
    pub nonce: String,
    pub header_hash: String,
    pub mix_hash: String,
    pub extra_nonce1: String,
    pub worker: String,
    pub ip: IpAddr,
    pub port: u16,
    pub difficulty: f64,
    pub previous_difficulty: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShareOutcome {
    pub accepted: bool,
    pub error: Option<ShareError>,
    /// Serialized block when the share also meets the network target.
    pub block_hex: Option<String>,
}

impl ShareOutcome {
    pub fn accepted(block_hex: Option<String>) -> Self {
        Self {
            accepted: true,
            error: None,
            block_hex,
        }
    }

    pub fn rejected(error: ShareError) -> Self {
        Self {
            accepted: false,
            error: Some(error),
            block_hex: None,
        }
    }
}

/// Emitted for every processed share, valid or not.
#[derive(Debug, Clone, Serialize)]
pub struct ShareEvent {
    pub job_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub worker: String,
    pub height: u64,
    pub block_reward: u64,
    pub difficulty: f64,
    pub share_diff: f64,
    pub block_diff: f64,
    pub block_hash: Option<String>,
    pub block_hex: Option<String>,
    pub error: Option<ShareError>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ShareEvent {
    pub fn is_valid_share(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_block_candidate(&self) -> bool {
        self.error.is_none() && self.block_hex.is_some()
    }
}
