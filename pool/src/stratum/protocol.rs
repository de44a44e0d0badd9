/// Stratum protocol message types and serialization
///
/// Newline-delimited JSON in the KawPoW Stratum dialect: errors travel as
/// `[code, message, null]`, difficulty changes as `mining.set_target`.

use serde::de::Deserializer;
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::shares::ShareError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Line was not a JSON request.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Line exceeded the configured maximum length.
    #[error("Socket flooded: more than {0} bytes without a newline")]
    Flooded(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Array(Vec::new())
}

impl StratumRequest {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Positional string parameter, `None` when absent or not a string.
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params.get(index).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Value,
    pub result: Value,
    pub error: Option<StratumError>,
}

impl StratumResponse {
    /// Create success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    /// Create error response
    pub fn error(id: Value, error: StratumError) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

impl StratumError {
    pub const OTHER: i32 = 20;
    pub const JOB_NOT_FOUND: i32 = 21;
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;
    pub const UNAUTHORIZED: i32 = 24;
    pub const NOT_SUBSCRIBED: i32 = 25;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(Self::OTHER, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::UNAUTHORIZED, "Unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(Self::NOT_SUBSCRIBED, "Not subscribed")
    }
}

impl From<ShareError> for StratumError {
    fn from(err: ShareError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl Serialize for StratumError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        seq.serialize_element(&Value::Null)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for StratumError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Triple(i32, String, Value),
            Object { code: i32, message: String },
        }
        Ok(match Wire::deserialize(deserializer)? {
            Wire::Triple(code, message, _) => Self { code, message },
            Wire::Object { code, message } => Self { code, message },
        })
    }
}

/// Server-initiated message (`id` is always null).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumNotification {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl StratumNotification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            id: Value::Null,
            method: method.to_string(),
            params,
        }
    }

    pub fn notify(params: Value) -> Self {
        Self::new("mining.notify", params)
    }

    pub fn set_target(target_hex: &str) -> Self {
        Self::new("mining.set_target", json!([target_hex]))
    }
}

/// Parsed `mining.submit` params:
/// `[worker, job_id, nonce, header_hash, mix_hash]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub nonce: String,
    pub header_hash: String,
    pub mix_hash: String,
}

fn strip_hex_prefix(s: &str) -> String {
    s.strip_prefix("0x").unwrap_or(s).to_string()
}

impl SubmitParams {
    pub fn from_request(req: &StratumRequest) -> Result<Self, StratumError> {
        let field = |i: usize, name: &str| {
            req.param_str(i)
                .map(strip_hex_prefix)
                .ok_or_else(|| StratumError::other(format!("missing or invalid {}", name)))
        };
        Ok(Self {
            worker: field(0, "worker")?,
            job_id: field(1, "job id")?,
            nonce: field(2, "nonce")?,
            header_hash: field(3, "header hash")?,
            mix_hash: field(4, "mix hash")?,
        })
    }
}

/// Serializes a message as one protocol line.
pub fn to_line<T: Serialize>(msg: &T) -> String {
    let mut line = serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    line
}
