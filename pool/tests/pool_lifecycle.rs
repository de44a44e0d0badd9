/// Pool Lifecycle Tests
///
/// Staged startup, block submission and template refresh end to end
/// against a mock daemon.

mod common;

use common::{template_json, wait_for, MockDaemon, MockDaemonBuilder, Reply, PREV_A, PREV_B};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use kawpow_pool::algorithm::Algorithm;
use kawpow_pool::events::{LogSeverity, PoolEvent};
use kawpow_pool::config::VarDiffConfig;
use kawpow_pool::pool::RewardType;
use kawpow_pool::{Pool, PoolConfig, PoolOptions};

const POOL_SCRIPT: &str = "76a914000000000000000000000000000000000000000088ac";

/// Knobs the mock daemon reads on every call.
#[derive(Default)]
struct ChainState {
    syncing_polls: AtomicUsize,
    advanced: AtomicBool,
    no_submitblock: AtomicBool,
    invalid_address: AtomicBool,
    reject_blocks: AtomicBool,
    proof_of_stake: AtomicBool,
    wallet_address: AtomicBool,
    templates_served: AtomicU32,
}

fn daemon_handler(state: Arc<ChainState>) -> impl Fn(&str, &Value) -> Reply + Send + Sync + 'static {
    move |method: &str, params: &Value| match method {
        "getpeerinfo" => Ok(json!([{"startingheight": 100}])),
        "validateaddress" => {
            let mut result = json!({
                "isvalid": !state.invalid_address.load(Ordering::SeqCst),
                "scriptPubKey": POOL_SCRIPT,
            });
            if state.wallet_address.load(Ordering::SeqCst) {
                result["pubkey"] = json!("02".to_string() + &"11".repeat(32));
            }
            Ok(result)
        }
        "getdifficulty" if state.proof_of_stake.load(Ordering::SeqCst) => {
            Ok(json!({"proof-of-work": 1.0, "proof-of-stake": 0.25}))
        }
        "getdifficulty" => Ok(json!(1.0)),
        "getinfo" => Ok(json!({"blocks": 90, "testnet": false, "protocolversion": 70028})),
        "getmininginfo" => Ok(json!({"difficulty": 1.0, "networkhashps": 1000.0, "chain": "main"})),
        "submitblock" if state.no_submitblock.load(Ordering::SeqCst) => {
            Err((-32601, "Method not found".to_string()))
        }
        "submitblock" if params[0] == json!("dummy") => Err((-22, "Block decode failed".to_string())),
        "submitblock" if state.reject_blocks.load(Ordering::SeqCst) => Ok(json!("rejected")),
        "submitblock" => Ok(Value::Null),
        "getblocktemplate" if params[0].get("mode").is_some() => Ok(Value::Null),
        "getblocktemplate" => {
            let pending = state.syncing_polls.load(Ordering::SeqCst);
            if pending > 0 {
                state.syncing_polls.store(pending - 1, Ordering::SeqCst);
                return Err((-10, "Ravencoin is downloading blocks...".to_string()));
            }
            let mut template = if state.advanced.load(Ordering::SeqCst) {
                template_json(101, PREV_B, &[])
            } else {
                template_json(100, PREV_A, &["aa"])
            };
            // Every template is minted a second later than the previous one.
            let served = state.templates_served.fetch_add(1, Ordering::SeqCst);
            template["curtime"] = json!(1_700_000_000u32 + served);
            Ok(template)
        }
        "getkawpowhash" => Ok(json!({
            "digest": Algorithm::KawPow.target_hex_for_difficulty(5000.0),
            "mix_hash": params[1],
            "result": "true",
            "meets_target": "true",
        })),
        "getblock" => Ok(json!({"confirmations": 0, "tx": ["c0ffee"]})),
        other => Err((-32601, format!("Method not found: {}", other))),
    }
}

fn pool_config(daemon: &MockDaemon) -> PoolConfig {
    pool_config_for(&[daemon])
}

fn pool_config_for(daemons: &[&MockDaemon]) -> PoolConfig {
    let endpoints: Vec<String> = daemons
        .iter()
        .map(|d| format!(r#"{{"host": "127.0.0.1", "port": {}, "user": "u", "password": "p"}}"#, d.addr.port()))
        .collect();
    PoolConfig::from_json(&format!(
        r#"{{
            "address": "RPoolAddressForTests",
            "daemons": [{}],
            "ports": {{"0": {{"diff": 8}}}},
            "listen_host": "127.0.0.1",
            "block_refresh_interval": 0,
            "sync_poll_interval": 100,
            "banning": {{"enabled": false}}
        }}"#,
        endpoints.join(", ")
    ))
    .unwrap()
}

async fn mock(state: Arc<ChainState>) -> MockDaemon {
    MockDaemonBuilder::new().spawn(daemon_handler(state)).await
}

fn collect(pool: &Pool) -> Arc<Mutex<Vec<PoolEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    pool.on_event(move |e| sink.lock().push(e.clone()));
    events
}

async fn read_json(reader: &mut BufReader<OwnedReadHalf>) -> Value {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(3), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

/// A subscribed and authorized miner connection.
struct TestMiner {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    en1: String,
    notify: Value,
}

impl TestMiner {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, mut writer) = stream.into_split();
        let mut reader = BufReader::new(r);

        writer.write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n").await.unwrap();
        let sub = read_json(&mut reader).await;
        let en1 = sub["result"][1].as_str().unwrap().to_string();
        let _set_target = read_json(&mut reader).await;
        let notify = read_json(&mut reader).await;

        let mut miner = Self {
            reader,
            writer,
            en1,
            notify,
        };
        let auth = miner.call(2, "mining.authorize", json!(["RWorker.rig1", "x"])).await;
        assert_eq!(auth["result"], json!(true));
        miner
    }

    /// Sends a request and returns its response, skipping notifications.
    async fn call(&mut self, id: u64, method: &str, params: Value) -> Value {
        let line = json!({"id": id, "method": method, "params": params}).to_string() + "\n";
        self.writer.write_all(line.as_bytes()).await.unwrap();
        loop {
            let msg = read_json(&mut self.reader).await;
            if msg["id"] == json!(id) {
                return msg;
            }
        }
    }

    async fn submit(&mut self, id: u64, notify: &Value, counter: u64) -> Value {
        let params = json!([
            "RWorker.rig1",
            notify["params"][0],
            format!("{}{:012x}", self.en1, counter),
            notify["params"][1],
            "cd".repeat(32),
        ]);
        self.call(id, "mining.submit", params).await
    }
}

/// Subscribes, authorizes and submits one share; the mock verifier marks
/// every share as meeting the network target. Returns the notify message.
async fn submit_block_candidate(addr: SocketAddr) -> Value {
    let mut miner = TestMiner::connect(addr).await;
    let notify = miner.notify.clone();
    assert_eq!(miner.submit(3, &notify, 7).await["result"], json!(true));
    notify
}

// ═══════════════════════════════════════════════════════════════════════════
// 1. Startup stages
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_staged_startup_detects_coin_data() {
    let state = Arc::new(ChainState::default());
    let daemon = mock(state).await;

    let pool = Pool::setup(pool_config(&daemon), PoolOptions::default()).await.unwrap();
    let events = collect(&pool);
    let addrs = pool.start().await.unwrap();
    assert_eq!(addrs.len(), 1);

    let rt = pool.runtime();
    assert!(rt.has_submit_method);
    assert!(!rt.testnet);
    assert_eq!(rt.protocol_version, Some(70028));
    assert_eq!(hex::encode(&rt.pool_script), POOL_SCRIPT);
    assert_eq!(pool.job_manager().current_job().unwrap().height(), 100);

    let events = events.lock();
    assert!(events.iter().any(|e| matches!(e, PoolEvent::Started)));
    assert!(events
        .iter()
        .any(|e| matches!(e, PoolEvent::Log(l) if l.severity == LogSeverity::Special)));
    pool.stop();
}

#[tokio::test]
async fn test_legacy_submit_mode_detected() {
    let state = Arc::new(ChainState::default());
    state.no_submitblock.store(true, Ordering::SeqCst);
    let daemon = mock(state).await;

    let pool = Pool::setup(pool_config(&daemon), PoolOptions::default()).await.unwrap();
    assert!(!pool.runtime().has_submit_method);

    assert!(pool.submit_block("00ff").await);
    let submits = daemon.calls_to("getblocktemplate");
    assert!(submits
        .iter()
        .any(|p| p[0]["mode"] == json!("submit") && p[0]["data"] == json!("00ff")));
}

#[tokio::test]
async fn test_invalid_pool_address_aborts_startup() {
    let state = Arc::new(ChainState::default());
    state.invalid_address.store(true, Ordering::SeqCst);
    let daemon = mock(state).await;

    let err = Pool::setup(pool_config(&daemon), PoolOptions::default())
        .await
        .err()
        .expect("setup must fail");
    assert!(format!("{:#}", err).contains("not valid"));
}

#[tokio::test]
async fn test_proof_of_stake_requires_wallet_address() {
    let state = Arc::new(ChainState::default());
    state.proof_of_stake.store(true, Ordering::SeqCst);
    let daemon = mock(state.clone()).await;

    let err = Pool::setup(pool_config(&daemon), PoolOptions::default())
        .await
        .err()
        .expect("setup must fail without a wallet address");
    assert!(format!("{:#}", err).contains("POS"));

    state.wallet_address.store(true, Ordering::SeqCst);
    let pool = Pool::setup(pool_config(&daemon), PoolOptions::default()).await.unwrap();
    assert_eq!(pool.runtime().reward_type, RewardType::Pos);
}

#[tokio::test]
async fn test_startup_waits_for_daemon_sync() {
    let state = Arc::new(ChainState::default());
    state.syncing_polls.store(2, Ordering::SeqCst);
    let daemon = mock(state.clone()).await;

    let pool = Pool::setup(pool_config(&daemon), PoolOptions::default()).await.unwrap();
    assert_eq!(state.syncing_polls.load(Ordering::SeqCst), 0);
    assert!(daemon.calls_to("getblocktemplate").len() >= 3);
    pool.start().await.unwrap();
    pool.stop();
}

// ═══════════════════════════════════════════════════════════════════════════
// 2. Block candidates and template refresh
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_block_candidate_is_submitted_and_confirmed() {
    let state = Arc::new(ChainState::default());
    let daemon = mock(state).await;
    let pool = Pool::setup(pool_config(&daemon), PoolOptions::default()).await.unwrap();
    let events = collect(&pool);
    let addrs = pool.start().await.unwrap();

    let notify = submit_block_candidate(addrs[0]).await;

    let found = wait_for(Duration::from_secs(3), || {
        events.lock().iter().any(|e| {
            matches!(e, PoolEvent::Share { block_accepted: true, tx_hash: Some(tx), .. } if tx == "c0ffee")
        })
    })
    .await;
    assert!(found);

    let submitted: Vec<Value> = daemon
        .calls_to("submitblock")
        .into_iter()
        .filter(|p| p[0] != json!("dummy"))
        .collect();
    assert_eq!(submitted.len(), 1);
    let header = notify["params"][1].as_str().unwrap();
    assert!(!header.is_empty());
    assert_eq!(daemon.calls_to("getblock").len(), 1);
    pool.stop();
}

#[tokio::test]
async fn test_block_rejected_by_one_daemon_is_not_confirmed() {
    let good = mock(Arc::new(ChainState::default())).await;
    let rejecting = Arc::new(ChainState::default());
    rejecting.reject_blocks.store(true, Ordering::SeqCst);
    let bad = mock(rejecting).await;

    let pool = Pool::setup(pool_config_for(&[&good, &bad]), PoolOptions::default())
        .await
        .unwrap();
    let events = collect(&pool);
    let addrs = pool.start().await.unwrap();

    submit_block_candidate(addrs[0]).await;

    let reported = wait_for(Duration::from_secs(3), || {
        events.lock().iter().any(|e| matches!(e, PoolEvent::Share { block_accepted: false, .. }))
    })
    .await;
    assert!(reported);

    let events = events.lock();
    assert!(events.iter().any(|e| matches!(
        e,
        PoolEvent::Log(log) if log.severity == LogSeverity::Error && log.text.contains("Daemon instance 1")
    )));
    assert!(!events.iter().any(|e| matches!(e, PoolEvent::Share { block_accepted: true, .. })));
    assert_eq!(good.calls_to("submitblock").iter().filter(|p| p[0] != json!("dummy")).count(), 1);
    assert_eq!(bad.calls_to("submitblock").len(), 1);
    assert!(good.calls_to("getblock").is_empty());
    assert!(bad.calls_to("getblock").is_empty());
    drop(events);
    pool.stop();
}

#[tokio::test]
async fn test_block_notify_refreshes_only_on_new_hash() {
    let state = Arc::new(ChainState::default());
    let daemon = mock(state.clone()).await;
    let pool = Pool::setup(pool_config(&daemon), PoolOptions::default()).await.unwrap();
    pool.start().await.unwrap();

    assert!(!pool.process_block_notify(PREV_A, "test").await.unwrap());

    state.advanced.store(true, Ordering::SeqCst);
    assert!(pool.process_block_notify("ff".repeat(32).as_str(), "test").await.unwrap());
    let job = pool.job_manager().current_job().unwrap();
    assert_eq!(job.height(), 101);
    assert_eq!(job.template.previous_block_hash, PREV_B);
    pool.stop();
}

// ═══════════════════════════════════════════════════════════════════════════
// 3. Rebroadcast, miner handover, runtime VarDiff
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_rebroadcast_refreshes_job_and_keeps_earlier_work_valid() {
    let daemon = mock(Arc::new(ChainState::default())).await;
    let mut config = pool_config(&daemon);
    config.job_rebroadcast_timeout = 1;
    let pool = Pool::setup(config, PoolOptions::default()).await.unwrap();
    let addrs = pool.start().await.unwrap();

    let mut miner = TestMiner::connect(addrs[0]).await;
    let first = miner.notify.clone();

    let refreshed = read_json(&mut miner.reader).await;
    assert_eq!(refreshed["method"], "mining.notify");
    assert_eq!(refreshed["params"][4], json!(false));
    assert_ne!(refreshed["params"][0], first["params"][0]);
    assert_ne!(refreshed["params"][1], first["params"][1]);
    assert_eq!(refreshed["params"][5], first["params"][5]);

    // Work from before the refresh is still accepted, as is the new job.
    assert_eq!(miner.submit(3, &first, 1).await["result"], json!(true));
    assert_eq!(miner.submit(4, &refreshed, 2).await["result"], json!(true));
    pool.stop();
}

#[tokio::test]
async fn test_miners_move_between_pools() {
    let daemon = mock(Arc::new(ChainState::default())).await;
    let from = Pool::setup(pool_config(&daemon), PoolOptions::default()).await.unwrap();
    let to = Pool::setup(pool_config(&daemon), PoolOptions::default()).await.unwrap();
    let from_addrs = from.start().await.unwrap();
    to.start().await.unwrap();

    let mut miner = TestMiner::connect(from_addrs[0]).await;
    assert_eq!(from.server().client_count().await, 1);

    assert!(from.relinquish_miners(|c| c.worker.as_deref() == Some("someone.else")).await.is_empty());
    let moved = from
        .relinquish_miners(|c| c.worker.as_deref() == Some("RWorker.rig1") && c.uptime < Duration::from_secs(60))
        .await;
    assert_eq!(moved.len(), 1);
    assert_eq!(from.server().client_count().await, 0);

    to.attach_miners(moved).await;
    assert_eq!(to.server().client_count().await, 1);

    let notify = read_json(&mut miner.reader).await;
    assert_eq!(notify["method"], "mining.notify");
    let job = to.job_manager().current_job().unwrap();
    assert_eq!(notify["params"][1], json!(job.header_hash));

    // Shares now land on the adopting pool's job.
    assert_eq!(miner.submit(3, &notify, 5).await["result"], json!(true));
    let nonce = format!("{}{:012x}", miner.en1, 5);
    assert!(!job.register_submit("RWorker.rig1", &nonce));

    from.stop();
    to.stop();
}

#[tokio::test]
async fn test_set_var_diff_replaces_port_policy() {
    let daemon = mock(Arc::new(ChainState::default())).await;
    let pool = Pool::setup(pool_config(&daemon), PoolOptions::default()).await.unwrap();
    let addrs = pool.start().await.unwrap();
    let policy = VarDiffConfig {
        min_diff: 8.0,
        max_diff: 32.0,
        target_time: 10.0,
        retarget_time: 1.0,
        variance_percent: 30.0,
        x2_mode: false,
    };

    assert!(pool.set_var_diff(4444, policy).await.is_err());
    assert!(pool
        .set_var_diff(0, VarDiffConfig { min_diff: 0.0, ..policy })
        .await
        .is_err());

    let events = collect(&pool);
    let mut miner = TestMiner::connect(addrs[0]).await;
    let notify = miner.notify.clone();
    pool.set_var_diff(0, policy).await.unwrap();

    assert_eq!(miner.submit(3, &notify, 1).await["result"], json!(true));
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(miner.submit(4, &notify, 2).await["result"], json!(true));

    let retargeted = wait_for(Duration::from_secs(3), || {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, PoolEvent::DifficultyUpdate { difficulty, .. } if *difficulty == 32.0))
    })
    .await;
    assert!(retargeted);
    pool.stop();
}
