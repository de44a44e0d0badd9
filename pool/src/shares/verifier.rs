/// Proof-of-work verification boundary
///
/// KawPoW digests are computed by the coin daemon; the pool only asks it
/// whether a (header, nonce, mix hash) triple is valid.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::blockchain::{DaemonInterface, RpcError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error("Verifier RPC failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Malformed verifier response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowRequest {
    pub header_hash: String,
    pub mix_hash: String,
    pub nonce: String,
    pub height: u64,
    /// Network target, 64 hex chars.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowDigest {
    /// Final KawPoW digest, big-endian hex.
    pub digest: String,
    /// The submitted mix hash matches the recomputed one.
    pub valid: bool,
    pub meets_network_target: bool,
}

#[async_trait]
pub trait PowVerifier: Send + Sync {
    async fn verify(&self, req: &PowRequest) -> Result<PowDigest, VerifyError>;
}

/// Delegates to the daemon's `getkawpowhash` RPC.
pub struct DaemonPowVerifier {
    daemon: Arc<DaemonInterface>,
}

impl DaemonPowVerifier {
    pub fn new(daemon: Arc<DaemonInterface>) -> Self {
        Self { daemon }
    }
}

#[async_trait]
impl PowVerifier for DaemonPowVerifier {
    async fn verify(&self, req: &PowRequest) -> Result<PowDigest, VerifyError> {
        let params = json!([req.header_hash, req.mix_hash, req.nonce, req.height, req.target]);
        let result = self.daemon.cmd_aggregate("getkawpowhash", params).await;
        let value = result.outcome?;
        parse_kawpow_hash(&value)
    }
}

/// Ravencoin reports booleans as `"true"`/`"false"` strings.
fn flag(value: &Value, key: &str) -> bool {
    match value.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn parse_kawpow_hash(value: &Value) -> Result<PowDigest, VerifyError> {
    let digest = value
        .get("digest")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::Malformed(value.to_string()))?;
    Ok(PowDigest {
        digest: digest.trim_start_matches("0x").to_string(),
        valid: flag(value, "result"),
        meets_network_target: flag(value, "meets_target"),
    })
}
