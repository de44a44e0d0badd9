//! Shared fixtures for the integration suites: an axum-backed mock coin
//! daemon and block template builders.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kawpow_pool::blockchain::{BlockTemplate, DaemonEndpoint};

pub const PREV_A: &str = "00000000000000000000000000000000000000000000000000000000000000aa";
pub const PREV_B: &str = "00000000000000000000000000000000000000000000000000000000000000bb";

/// What the mock answers for one call: a result, or `(code, message)`.
pub type Reply = Result<Value, (i64, String)>;

type Handler = dyn Fn(&str, &Value) -> Reply + Send + Sync;

struct DaemonState {
    delay: Duration,
    unauthorized: bool,
    reverse_batches: bool,
    handler: Box<Handler>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl DaemonState {
    fn answer(&self, req: &Value) -> Value {
        let id = req.get("id").cloned().unwrap_or(Value::Null);
        let method = req.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = req.get("params").cloned().unwrap_or_else(|| json!([]));
        self.calls.lock().push((method.to_string(), params.clone()));
        match (self.handler)(method, &params) {
            Ok(result) => json!({"result": result, "error": null, "id": id}),
            Err((code, message)) => {
                json!({"result": null, "error": {"code": code, "message": message}, "id": id})
            }
        }
    }
}

async fn rpc(State(state): State<Arc<DaemonState>>, Json(body): Json<Value>) -> Response {
    tokio::time::sleep(state.delay).await;
    if state.unauthorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match body {
        Value::Array(reqs) => {
            let mut out: Vec<Value> = reqs.iter().map(|r| state.answer(r)).collect();
            if state.reverse_batches {
                out.reverse();
            }
            Json(Value::Array(out)).into_response()
        }
        single => Json(state.answer(&single)).into_response(),
    }
}

pub struct MockDaemon {
    pub addr: SocketAddr,
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockDaemon {
    pub fn endpoint(&self, index: usize) -> DaemonEndpoint {
        DaemonEndpoint {
            index,
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            user: "rpcuser".to_string(),
            password: "rpcpass".to_string(),
            tls: false,
        }
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

pub struct MockDaemonBuilder {
    delay: Duration,
    unauthorized: bool,
    reverse_batches: bool,
}

impl MockDaemonBuilder {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            unauthorized: false,
            reverse_batches: false,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unauthorized(mut self) -> Self {
        self.unauthorized = true;
        self
    }

    pub fn reverse_batches(mut self) -> Self {
        self.reverse_batches = true;
        self
    }

    pub async fn spawn<F>(self, handler: F) -> MockDaemon
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(DaemonState {
            delay: self.delay,
            unauthorized: self.unauthorized,
            reverse_batches: self.reverse_batches,
            handler: Box::new(handler),
            calls: calls.clone(),
        });
        let app = Router::new().route("/", post(rpc)).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockDaemon { addr, calls }
    }
}

pub fn template_json(height: u64, prev: &str, txids: &[&str]) -> Value {
    let txs: Vec<Value> = txids
        .iter()
        .map(|tag| {
            let id = format!("{:0>64}", tag);
            json!({"data": format!("0100000000{}", tag), "txid": id, "hash": id, "fee": 1000})
        })
        .collect();
    json!({
        "version": 0x20000000u32,
        "height": height,
        "previousblockhash": prev,
        "transactions": txs,
        "coinbasevalue": 500_000_000_000u64,
        "target": "00000000ffff0000000000000000000000000000000000000000000000000000",
        "bits": "1d00ffff",
        "curtime": 1_700_000_000u32,
    })
}

pub fn template(height: u64, prev: &str, txids: &[&str]) -> BlockTemplate {
    BlockTemplate::from_rpc_response(&template_json(height, prev, txids)).unwrap()
}

/// Polls `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
