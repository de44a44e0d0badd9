/// Daemon Interface - JSON-RPC fan-out to one or more coin daemons
///
/// Every command goes to all endpoints concurrently; per-endpoint failures
/// are reported in-band so callers always get exactly one answer per daemon.

use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::config::DaemonConfig;
use crate::metrics::prometheus as metrics;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    /// Connection refused, DNS failure, reset.
    #[error("Connection failed: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unauthorized: check daemon rpc user and password")]
    Unauthorized,

    #[error("HTTP status {status}: {body}")]
    Http { status: u16, body: String },

    /// Body was not a JSON-RPC response.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Daemon answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("No response for request id {0}")]
    MissingResponse(u64),
}

impl RpcError {
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RpcError::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DaemonInitError {
    #[error("No daemons configured")]
    NoEndpoints,

    #[error("HTTP client setup failed: {0}")]
    Client(String),

    #[error("Daemons unreachable: {}", describe_failures(.0))]
    Unreachable(Vec<(usize, RpcError)>),
}

fn describe_failures(failures: &[(usize, RpcError)]) -> String {
    failures
        .iter()
        .map(|(index, err)| format!("#{} ({})", index, err))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One configured daemon. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonEndpoint {
    pub index: usize,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tls: bool,
}

impl DaemonEndpoint {
    pub fn from_config(index: usize, cfg: &DaemonConfig) -> Self {
        Self {
            index,
            host: cfg.host.clone(),
            port: cfg.port,
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            tls: cfg.tls,
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}/", scheme, self.host, self.port)
    }
}

/// Outcome of one command against one endpoint.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub index: usize,
    pub outcome: Result<Value, RpcError>,
    /// Raw response body, empty on transport failures.
    pub raw: String,
}

impl CommandResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.outcome.as_ref().err()
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: &'a Value,
    id: u64,
}

pub struct DaemonInterface {
    endpoints: Vec<DaemonEndpoint>,
    client: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl DaemonInterface {
    pub fn new(endpoints: Vec<DaemonEndpoint>, timeout: Duration) -> Result<Self, DaemonInitError> {
        if endpoints.is_empty() {
            return Err(DaemonInitError::NoEndpoints);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DaemonInitError::Client(e.to_string()))?;

        for ep in &endpoints {
            tracing::info!("Daemon #{} configured: {}", ep.index, ep.url());
        }

        Ok(Self {
            endpoints,
            client,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_config(daemons: &[DaemonConfig], timeout: Duration) -> Result<Self, DaemonInitError> {
        let endpoints = daemons
            .iter()
            .enumerate()
            .map(|(i, cfg)| DaemonEndpoint::from_config(i, cfg))
            .collect();
        Self::new(endpoints, timeout)
    }

    pub fn endpoints(&self) -> &[DaemonEndpoint] {
        &self.endpoints
    }

    /// Probes every endpoint once. No retry.
    pub async fn init(&self) -> Result<(), DaemonInitError> {
        let results = self.cmd("getpeerinfo", json!([])).await;
        let failures: Vec<(usize, RpcError)> = results
            .into_iter()
            .filter_map(|r| r.outcome.err().map(|e| (r.index, e)))
            .collect();

        if failures.is_empty() {
            tracing::info!("✅ All {} daemon(s) online", self.endpoints.len());
            Ok(())
        } else {
            for (index, err) in &failures {
                tracing::error!("Daemon #{} unreachable: {}", index, err);
            }
            Err(DaemonInitError::Unreachable(failures))
        }
    }

    pub async fn is_online(&self) -> bool {
        self.cmd("getinfo", json!([]))
            .await
            .iter()
            .all(CommandResult::is_ok)
    }

    /// Runs `method` against every endpoint concurrently. Results are in
    /// endpoint order regardless of completion order.
    pub async fn cmd(&self, method: &str, params: Value) -> Vec<CommandResult> {
        let calls = self
            .endpoints
            .iter()
            .map(|ep| self.call_endpoint(ep, method, &params));
        join_all(calls).await
    }

    /// Queries every endpoint and surfaces one result: the first successful
    /// one by index, otherwise endpoint 0's failure.
    pub async fn cmd_aggregate(&self, method: &str, params: Value) -> CommandResult {
        let mut results = self.cmd(method, params).await;
        match results.iter().position(CommandResult::is_ok) {
            Some(pos) => results.swap_remove(pos),
            None => results.swap_remove(0),
        }
    }

    /// Sends one JSON-RPC batch to the primary endpoint. Results come back in
    /// call order.
    pub async fn batch_cmd(&self, calls: &[(&str, Value)]) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let ep = &self.endpoints[0];
        let base_id = self.next_id.fetch_add(calls.len() as u64, Ordering::Relaxed);
        let body: Vec<RpcRequest<'_>> = calls
            .iter()
            .enumerate()
            .map(|(i, (method, params))| RpcRequest {
                method: *method,
                params,
                id: base_id + i as u64,
            })
            .collect();
        let body = serde_json::to_string(&body).map_err(|e| RpcError::InvalidResponse(e.to_string()))?;

        metrics::inc_rpc_requests();
        let (parsed, _raw) = match self.post(ep, body).await {
            Ok(v) => v,
            Err(e) => {
                metrics::inc_rpc_errors();
                tracing::warn!("Batch RPC to daemon #{} failed: {}", ep.index, e);
                return Err(e);
            }
        };

        let responses = parsed
            .as_array()
            .ok_or_else(|| RpcError::InvalidResponse("batch response is not an array".to_string()))?;
        let mut by_id: HashMap<u64, &Value> = HashMap::new();
        for resp in responses {
            if let Some(id) = resp.get("id").and_then(Value::as_u64) {
                by_id.insert(id, resp);
            }
        }

        Ok((0..calls.len())
            .map(|i| {
                let id = base_id + i as u64;
                match by_id.get(&id) {
                    Some(resp) => parse_rpc_response(resp),
                    None => Err(RpcError::MissingResponse(id)),
                }
            })
            .collect())
    }

    async fn call_endpoint(&self, ep: &DaemonEndpoint, method: &str, params: &Value) -> CommandResult {
        metrics::inc_rpc_requests();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = RpcRequest { method, params, id };

        let (outcome, raw) = match serde_json::to_string(&req) {
            Ok(body) => match self.post(ep, body).await {
                Ok((parsed, raw)) => (parse_rpc_response(&parsed), raw),
                Err(e) => (Err(e), String::new()),
            },
            Err(e) => (Err(RpcError::InvalidResponse(e.to_string())), String::new()),
        };

        if let Err(e) = &outcome {
            metrics::inc_rpc_errors();
            tracing::warn!("Daemon #{} {} failed: {}", ep.index, method, e);
        }

        CommandResult {
            index: ep.index,
            outcome,
            raw,
        }
    }

    async fn post(&self, ep: &DaemonEndpoint, body: String) -> Result<(Value, String), RpcError> {
        let request = self
            .client
            .post(ep.url())
            .basic_auth(&ep.user, Some(&ep.password))
            .header("Content-Type", "application/json")
            .body(body);

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| RpcError::Timeout(self.timeout))?
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout(self.timeout)
                } else {
                    RpcError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RpcError::Unauthorized);
        }

        let raw = tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| RpcError::Timeout(self.timeout))?
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        // Daemons answer RPC errors with HTTP 500 and a JSON body, so the body
        // wins over the status code whenever it parses.
        match parse_json_lenient(&raw) {
            Some(value) => Ok((value, raw)),
            None if !status.is_success() => Err(RpcError::Http {
                status: status.as_u16(),
                body: raw,
            }),
            None => Err(RpcError::InvalidResponse(raw)),
        }
    }
}

/// Parses a daemon body, tolerating the bare `-nan` some daemons emit.
fn parse_json_lenient(raw: &str) -> Option<Value> {
    serde_json::from_str(raw)
        .ok()
        .or_else(|| serde_json::from_str(&raw.replace(":-nan", ":0")).ok())
}

fn parse_rpc_response(resp: &Value) -> Result<Value, RpcError> {
    match resp.get("error") {
        Some(err) if !err.is_null() => Err(RpcError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
        }),
        _ => Ok(resp.get("result").cloned().unwrap_or(Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(index: usize, port: u16) -> DaemonEndpoint {
        DaemonEndpoint {
            index,
            host: "127.0.0.1".to_string(),
            port,
            user: "rpc".to_string(),
            password: "pass".to_string(),
            tls: false,
        }
    }

    #[test]
    fn empty_endpoint_list_is_rejected() {
        let res = DaemonInterface::new(Vec::new(), Duration::from_secs(1));
        assert!(matches!(res, Err(DaemonInitError::NoEndpoints)));
    }

    #[test]
    fn endpoint_url_respects_tls() {
        let mut ep = endpoint(0, 8766);
        assert_eq!(ep.url(), "http://127.0.0.1:8766/");
        ep.tls = true;
        assert_eq!(ep.url(), "https://127.0.0.1:8766/");
    }

    #[test]
    fn rpc_error_objects_become_rpc_errors() {
        let resp = json!({"result": null, "error": {"code": -10, "message": "Ravencoin is downloading blocks..."}, "id": 1});
        let err = parse_rpc_response(&resp).unwrap_err();
        assert_eq!(err.code(), Some(-10));
        assert!(err.message().contains("downloading"));

        let ok = parse_rpc_response(&json!({"result": 5, "error": null, "id": 2})).unwrap();
        assert_eq!(ok, json!(5));
    }

    #[test]
    fn lenient_parse_tolerates_negative_nan() {
        let raw = r#"{"result":{"difficulty":-nan,"blocks":1},"error":null,"id":1}"#;
        let parsed = parse_json_lenient(raw).unwrap();
        assert_eq!(parsed["result"]["difficulty"], json!(0));
        assert!(parse_json_lenient("not json").is_none());
    }

    #[test]
    fn unreachable_error_lists_every_endpoint() {
        let err = DaemonInitError::Unreachable(vec![
            (1, RpcError::Transport("refused".to_string())),
            (2, RpcError::Timeout(Duration::from_secs(1))),
        ]);
        let text = err.to_string();
        assert!(text.contains("#1"));
        assert!(text.contains("#2"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_in_band() {
        // Port 9 (discard) is closed on test hosts.
        let daemon = DaemonInterface::new(vec![endpoint(0, 9)], Duration::from_millis(500)).unwrap();
        let results = daemon.cmd("getinfo", json!([])).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 0);
        assert!(results[0].error().is_some());
        assert!(daemon.init().await.is_err());
    }
}
