/// Pool orchestrator
///
/// Wires the daemon interface, job manager and stratum server together and
/// runs the staged startup. Component events are funneled through one
/// channel into a single event loop, so observers never block the emitter.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::algorithm::Algorithm;
use crate::blockchain::{
    BlockTemplate, DaemonInterface, GenerationBuilder, Recipient, StandardGenerationBuilder,
};
use crate::config::{PoolConfig, VarDiffConfig};
use crate::events::{emit_log, LogSeverity, Observers, PoolEvent};
use crate::jobs::{JobEvent, JobManager, PayoutScripts};
use crate::metrics::prometheus as metrics;
use crate::shares::{DaemonPowVerifier, PowVerifier, ShareEvent};
use crate::stratum::{
    AcceptAll, Authorizer, ClientHandle, ClientSnapshot, ServerConfig, ServerEvent, StratumServer,
};

/// Daemon error code while the chain is still downloading.
const RPC_IN_INITIAL_DOWNLOAD: i64 = -10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardType {
    Pow,
    Pos,
}

/// Chain facts discovered at startup.
#[derive(Debug, Clone)]
pub struct PoolRuntime {
    pub pool_script: Vec<u8>,
    pub recipients: Vec<Recipient>,
    pub fee_percent: f64,
    /// False when blocks must go through `getblocktemplate` submit mode.
    pub has_submit_method: bool,
    pub reward_type: RewardType,
    pub testnet: bool,
    pub protocol_version: Option<u64>,
    pub network_difficulty: f64,
    pub network_hashrate: f64,
}

/// Pluggable collaborators. Defaults: accept every worker, verify through
/// the daemon, standard generation transaction.
pub struct PoolOptions {
    pub authorizer: Arc<dyn Authorizer>,
    pub verifier: Option<Arc<dyn PowVerifier>>,
    pub generation: Option<Arc<dyn GenerationBuilder>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            authorizer: Arc::new(AcceptAll),
            verifier: None,
            generation: None,
        }
    }
}

enum Signal {
    Job(JobEvent),
    Server(ServerEvent),
}

pub struct Pool {
    config: Arc<PoolConfig>,
    algorithm: Algorithm,
    daemon: Arc<DaemonInterface>,
    runtime: RwLock<PoolRuntime>,
    job_manager: Arc<JobManager>,
    server: Arc<StratumServer>,
    observers: Observers<PoolEvent>,
    last_submitted_block: Mutex<Option<String>>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn getblocktemplate_params() -> Value {
    json!([{ "capabilities": ["coinbasetxn", "workid", "coinbase/append"], "rules": ["segwit"] }])
}

impl Pool {
    /// Stages 1-4: daemons, coin data, recipients, sync. Nothing listens yet;
    /// register observers, then call [`Pool::start`].
    pub async fn setup(config: PoolConfig, options: PoolOptions) -> Result<Arc<Self>> {
        config.validate().context("invalid pool configuration")?;
        let config = Arc::new(config);
        let algorithm = config.algorithm()?;

        let daemon = Arc::new(Self::setup_daemon_interface(&config).await?);
        let mut runtime = Self::detect_coin_data(&daemon, &config).await?;
        runtime.recipients = Self::setup_recipients(&daemon, &config).await?;
        runtime.fee_percent = runtime.recipients.iter().map(|r| r.percent).sum();
        Self::wait_until_synced(&daemon, &config).await?;

        let verifier = options
            .verifier
            .unwrap_or_else(|| Arc::new(DaemonPowVerifier::new(daemon.clone())));
        let generation = options
            .generation
            .unwrap_or_else(|| Arc::new(StandardGenerationBuilder::new(&config.coinbase_tag)));
        let payout = PayoutScripts {
            pool_script: runtime.pool_script.clone(),
            recipients: runtime.recipients.clone(),
        };
        let job_manager = Arc::new(JobManager::new(
            algorithm,
            payout,
            generation,
            verifier,
            config.extranonce_bytes,
        ));
        let server = Arc::new(StratumServer::new(
            ServerConfig::from(&*config),
            job_manager.clone(),
            options.authorizer,
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let job_tx = tx.clone();
        job_manager.on_event(move |e| {
            let _ = job_tx.send(Signal::Job(e.clone()));
        });
        server.on_event(move |e| {
            let _ = tx.send(Signal::Server(e.clone()));
        });

        Ok(Arc::new(Self {
            config,
            algorithm,
            daemon,
            runtime: RwLock::new(runtime),
            job_manager,
            server,
            observers: Observers::new(),
            last_submitted_block: Mutex::new(None),
            signals: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Stages 5-8: first job, polling, stratum, banner. Returns the bound
    /// stratum addresses.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<SocketAddr>> {
        let rx = self
            .signals
            .lock()
            .take()
            .ok_or_else(|| anyhow!("pool already started"))?;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(Self::event_loop(weak, rx));
        self.tasks.lock().push(task);

        self.get_first_job().await?;
        self.setup_block_polling();
        let addrs = self.start_stratum_server().await?;
        self.output_pool_info(&addrs);
        self.observers.emit(&PoolEvent::Started);
        Ok(addrs)
    }

    pub fn stop(&self) {
        self.server.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.observers.register(callback);
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn runtime(&self) -> PoolRuntime {
        self.runtime.read().clone()
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.job_manager
    }

    pub fn server(&self) -> &Arc<StratumServer> {
        &self.server
    }

    pub fn daemon(&self) -> &Arc<DaemonInterface> {
        &self.daemon
    }

    /// Detaches the clients matching `filter` so another pool can take
    /// them over with [`Pool::attach_miners`]. Connections stay open.
    pub async fn relinquish_miners<F>(&self, filter: F) -> Vec<ClientHandle>
    where
        F: Fn(&ClientSnapshot) -> bool,
    {
        let mut relinquished = Vec::new();
        for handle in self.server.stratum_clients().await {
            let snapshot = handle.snapshot().await;
            if !filter(&snapshot) {
                continue;
            }
            if let Some(handle) = self.server.remove_client(&snapshot.client_id).await {
                tracing::debug!(
                    "Relinquished {} after {}s",
                    snapshot.worker.as_deref().unwrap_or(&snapshot.client_id),
                    snapshot.uptime.as_secs()
                );
                relinquished.push(handle);
            }
        }
        relinquished
    }

    /// Adopts clients from another pool and sends them the current job.
    pub async fn attach_miners(&self, miners: Vec<ClientHandle>) {
        for miner in miners {
            self.server.add_client(miner).await;
        }
        if let Some(job) = self.job_manager.current_job() {
            self.server.broadcast_mining_jobs(&job.job_params(true)).await;
        }
    }

    /// Replaces the VarDiff policy of a configured port at runtime.
    pub async fn set_var_diff(&self, port: u16, cfg: VarDiffConfig) -> Result<()> {
        self.server.set_var_diff(port, cfg).await
    }

    fn log(&self, severity: LogSeverity, text: impl Into<String>) {
        let event = emit_log(severity, "pool", text);
        self.observers.emit(&PoolEvent::Log(event));
    }

    // ---- stage 1 ----

    async fn setup_daemon_interface(config: &PoolConfig) -> Result<DaemonInterface> {
        let daemon = DaemonInterface::from_config(&config.daemons, Duration::from_millis(config.rpc_timeout))
            .context("daemon interface setup failed")?;
        daemon.init().await.context("failed to connect to daemon(s)")?;
        Ok(daemon)
    }

    // ---- stage 2 ----

    async fn detect_coin_data(daemon: &DaemonInterface, config: &PoolConfig) -> Result<PoolRuntime> {
        let calls = [
            ("validateaddress", json!([config.address])),
            ("getdifficulty", json!([])),
            ("getinfo", json!([])),
            ("getmininginfo", json!([])),
            ("submitblock", json!(["dummy"])),
        ];
        let mut results = daemon
            .batch_cmd(&calls)
            .await
            .context("init batch RPC call failed")?
            .into_iter();
        let mut next = |name: &str| {
            results
                .next()
                .ok_or_else(|| anyhow!("missing {} in init batch", name))
        };

        let address = next("validateaddress")?.context("validateaddress failed")?;
        let difficulty = next("getdifficulty")?.context("getdifficulty failed")?;
        let info = next("getinfo")?.context("getinfo failed")?;
        let mining = next("getmininginfo")?.context("getmininginfo failed")?;
        let submit = next("submitblock")?;

        if !address.get("isvalid").and_then(Value::as_bool).unwrap_or(false) {
            bail!("daemon reports pool address {} is not valid", config.address);
        }
        let pool_script = script_from_validation(&address)
            .ok_or_else(|| anyhow!("daemon returned no scriptPubKey for {}", config.address))?;

        let reward_type = if difficulty.get("proof-of-stake").is_some() {
            RewardType::Pos
        } else {
            RewardType::Pow
        };
        if reward_type == RewardType::Pos && address.get("pubkey").is_none() {
            bail!("the address provided is not from the daemon wallet, this is required for POS coins");
        }

        let has_submit_method = match submit {
            Err(e) if e.message().contains("Method not found") => false,
            Err(e) if e.code() == Some(-1) || e.message().contains("decode failed") => true,
            Ok(_) => true,
            Err(e) => bail!("could not detect block submission RPC method: {}", e),
        };

        let testnet = info.get("testnet").and_then(Value::as_bool).unwrap_or(false)
            || mining.get("chain").and_then(Value::as_str) == Some("test");

        Ok(PoolRuntime {
            pool_script,
            recipients: Vec::new(),
            fee_percent: 0.0,
            has_submit_method,
            reward_type,
            testnet,
            protocol_version: info.get("protocolversion").and_then(Value::as_u64),
            network_difficulty: mining.get("difficulty").and_then(Value::as_f64).unwrap_or(0.0),
            network_hashrate: mining.get("networkhashps").and_then(Value::as_f64).unwrap_or(0.0),
        })
    }

    // ---- stage 3 ----

    async fn setup_recipients(daemon: &DaemonInterface, config: &PoolConfig) -> Result<Vec<Recipient>> {
        let mut entries: Vec<(&String, &f64)> = config.reward_recipients.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut recipients = Vec::with_capacity(entries.len());
        for (address, percent) in entries {
            let result = daemon.cmd_aggregate("validateaddress", json!([address])).await;
            let script = match &result.outcome {
                Ok(v) => script_from_validation(v),
                Err(e) => bail!("validateaddress for recipient {} failed: {}", address, e),
            }
            .ok_or_else(|| anyhow!("recipient address {} is not valid", address))?;
            recipients.push(Recipient {
                address: address.clone(),
                percent: *percent,
                script,
            });
        }
        if recipients.is_empty() {
            tracing::warn!("⚠️ No reward recipients configured, the pool keeps the full reward");
        }
        Ok(recipients)
    }

    // ---- stage 4 ----

    async fn wait_until_synced(daemon: &DaemonInterface, config: &PoolConfig) -> Result<()> {
        let poll = Duration::from_millis(config.sync_poll_interval.max(100));
        let mut reported = false;
        loop {
            let results = daemon.cmd("getblocktemplate", getblocktemplate_params()).await;
            let syncing = results
                .iter()
                .any(|r| r.error().and_then(|e| e.code()) == Some(RPC_IN_INITIAL_DOWNLOAD));
            if !syncing {
                return Ok(());
            }
            if !reported {
                tracing::error!("⏳ Daemon is still syncing with the network, the pool will start once synced");
                reported = true;
            }
            Self::report_sync_progress(daemon).await;
            tokio::time::sleep(poll).await;
        }
    }

    async fn report_sync_progress(daemon: &DaemonInterface) {
        let blocks = daemon
            .cmd_aggregate("getinfo", json!([]))
            .await
            .result()
            .and_then(|v| v.get("blocks"))
            .and_then(Value::as_u64);
        let peer_height = daemon
            .cmd_aggregate("getpeerinfo", json!([]))
            .await
            .result()
            .and_then(Value::as_array)
            .and_then(|peers| {
                peers
                    .iter()
                    .filter_map(|p| p.get("startingheight").and_then(Value::as_u64))
                    .max()
            });
        if let (Some(blocks), Some(total)) = (blocks, peer_height) {
            if total > 0 {
                let percent = (blocks as f64 / total as f64 * 100.0).min(100.0);
                tracing::warn!("⏳ Downloaded {:.2}% of blockchain from peers ({} / {})", percent, blocks, total);
            }
        }
    }

    // ---- stage 5 ----

    async fn get_first_job(&self) -> Result<()> {
        self.get_block_template().await.context("error with getblocktemplate on creating first job")?;
        let network_diff = self
            .job_manager
            .current_job()
            .map(|job| job.network_difficulty)
            .unwrap_or(0.0);
        self.runtime.write().network_difficulty = network_diff;

        for (port, port_cfg) in &self.config.ports {
            let diff = port_cfg.initial_difficulty();
            if network_diff > 0.0 && diff > network_diff {
                self.log(
                    LogSeverity::Warning,
                    format!(
                        "Network difficulty of {} is lower than the difficulty on port {} of {}",
                        network_diff, port, diff
                    ),
                );
            }
        }
        Ok(())
    }

    /// Fetches a template and hands it to the job manager. Returns `true`
    /// when it started a new block.
    pub async fn get_block_template(&self) -> Result<bool> {
        let template = self.fetch_template().await?;
        Ok(self.job_manager.process_template(template)?)
    }

    async fn fetch_template(&self) -> Result<BlockTemplate> {
        let result = self
            .daemon
            .cmd_aggregate("getblocktemplate", getblocktemplate_params())
            .await;
        let value = match result.outcome {
            Ok(v) => v,
            Err(e) => {
                metrics::inc_template_fetch_errors();
                bail!("getblocktemplate failed on daemon #{}: {}", result.index, e);
            }
        };
        BlockTemplate::from_rpc_response(&value).map_err(|e| {
            metrics::inc_template_fetch_errors();
            anyhow!("malformed block template: {}", e)
        })
    }

    // ---- stage 6 ----

    fn setup_block_polling(self: &Arc<Self>) {
        if self.config.block_refresh_interval == 0 {
            self.log(LogSeverity::Debug, "Block template polling has been disabled");
            return;
        }
        let interval = Duration::from_millis(self.config.block_refresh_interval);
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                match pool.get_block_template().await {
                    Ok(true) => pool.log(LogSeverity::Debug, "Block notification via RPC polling"),
                    Ok(false) => {}
                    Err(e) => pool.log(LogSeverity::Error, format!("Block polling failed: {:#}", e)),
                }
            }
        });
        self.tasks.lock().push(task);
    }

    // ---- stage 7 ----

    async fn start_stratum_server(&self) -> Result<Vec<SocketAddr>> {
        let addrs = self.server.clone().start().await.context("stratum server failed to start")?;
        if let Some(job) = self.job_manager.current_job() {
            self.server.broadcast_mining_jobs(&job.job_params(true)).await;
        }
        Ok(addrs)
    }

    // ---- stage 8 ----

    fn output_pool_info(&self, addrs: &[SocketAddr]) {
        if !self.config.is_primary() {
            self.log(
                LogSeverity::Special,
                format!("Stratum instance {} started on {:?}", self.config.instance_id, addrs),
            );
            return;
        }

        let runtime = self.runtime.read().clone();
        let height = self.job_manager.current_job().map(|j| j.height()).unwrap_or(0);
        let ports: Vec<String> = self.config.ports.keys().map(u16::to_string).collect();
        let daemons: Vec<String> = self
            .daemon
            .endpoints()
            .iter()
            .map(|e| format!("{}:{}", e.host, e.port))
            .collect();
        let polling = if self.config.block_refresh_interval > 0 {
            format!("{} ms", self.config.block_refresh_interval)
        } else {
            "disabled".to_string()
        };
        let banner = [
            format!("Stratum Pool Server Started for {} [{}] {{{}}}", self.config.coin.name, self.config.coin.symbol, self.algorithm),
            format!("Network Connected:\t{}", if runtime.testnet { "Testnet" } else { "Mainnet" }),
            format!("Detected Reward Type:\t{:?}", runtime.reward_type),
            format!("Current Block Height:\t{}", height),
            format!("Network Difficulty:\t{}", runtime.network_difficulty),
            format!("Network Hash Rate:\t{:.2} H/s", runtime.network_hashrate),
            format!("Stratum Port(s):\t{}", ports.join(", ")),
            format!("Daemon Endpoint(s):\t{}", daemons.join(", ")),
            format!("Pool Fee Percent:\t{}%", runtime.fee_percent),
            format!("Block Polling Every:\t{}", polling),
        ];
        self.log(LogSeverity::Special, banner.join("\n\t\t\t\t\t\t"));
    }

    // ---- runtime ----

    async fn event_loop(pool: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = rx.recv().await {
            let Some(pool) = pool.upgrade() else {
                break;
            };
            match signal {
                Signal::Job(event) => pool.on_job_event(event).await,
                Signal::Server(event) => pool.on_server_event(event).await,
            }
        }
    }

    async fn on_job_event(self: &Arc<Self>, event: JobEvent) {
        match event {
            JobEvent::NewBlock(job) => {
                self.log(
                    LogSeverity::Debug,
                    format!("Established new job {} for height {}", job.job_id, job.height()),
                );
                self.runtime.write().network_difficulty = job.network_difficulty;
                self.server.broadcast_mining_jobs(&job.job_params(true)).await;
            }
            JobEvent::UpdatedBlock(job) => {
                self.server.broadcast_mining_jobs(&job.job_params(false)).await;
            }
            JobEvent::Share(share) => self.on_share(share),
        }
    }

    fn on_share(self: &Arc<Self>, share: ShareEvent) {
        let Some(block_hex) = share.block_hex.clone().filter(|_| share.is_block_candidate()) else {
            self.observers.emit(&PoolEvent::Share {
                share,
                block_accepted: false,
                tx_hash: None,
            });
            return;
        };

        {
            let mut last = self.last_submitted_block.lock();
            if last.as_deref() == Some(block_hex.as_str()) {
                self.log(LogSeverity::Warning, "Ignored duplicate submit block");
                return;
            }
            *last = Some(block_hex.clone());
        }

        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            let submitted = pool.submit_block(&block_hex).await;
            let (accepted, tx_hash) = match (&share.block_hash, submitted) {
                (Some(hash), true) => pool.check_block_accepted(hash).await,
                _ => (false, None),
            };

            let mut share = share;
            if accepted {
                metrics::inc_blocks_accepted();
                pool.log(
                    LogSeverity::Special,
                    format!(
                        "Block {} found at height {} by {}",
                        share.block_hash.as_deref().unwrap_or("-"),
                        share.height,
                        share.worker
                    ),
                );
            } else if !pool.config.emit_invalid_block_hashes {
                share.block_hash = None;
            }

            pool.observers.emit(&PoolEvent::Share {
                share,
                block_accepted: accepted,
                tx_hash,
            });

            if let Err(e) = pool.get_block_template().await {
                pool.log(LogSeverity::Error, format!("Template refresh after block submit failed: {:#}", e));
            }
        });
        self.tasks.lock().retain(|t| !t.is_finished());
        self.tasks.lock().push(task);
    }

    /// Sends a block to every daemon. Returns false if any endpoint
    /// reported an error or rejected it.
    pub async fn submit_block(&self, block_hex: &str) -> bool {
        let has_submit_method = self.runtime.read().has_submit_method;
        let (method, params) = if has_submit_method {
            ("submitblock", json!([block_hex]))
        } else {
            ("getblocktemplate", json!([{ "mode": "submit", "data": block_hex }]))
        };

        let mut ok = true;
        for result in self.daemon.cmd(method, params).await {
            match &result.outcome {
                Err(e) => {
                    self.log(
                        LogSeverity::Error,
                        format!("RPC error with daemon instance {} when submitting block with {}: {}", result.index, method, e),
                    );
                    ok = false;
                }
                Ok(Value::String(reason)) if reason.contains("rejected") || reason.contains("invalid") => {
                    self.log(
                        LogSeverity::Error,
                        format!("Daemon instance {} rejected a supposedly valid block: {}", result.index, reason),
                    );
                    ok = false;
                }
                Ok(_) => {}
            }
        }

        if ok {
            self.log(LogSeverity::Debug, format!("Submitted block using {} successfully", method));
        } else {
            metrics::inc_block_submit_rejected();
        }
        ok
    }

    /// Asks the daemons for `block_hash`. Accepted when any knows it with a
    /// non-negative confirmation count; also returns the coinbase txid.
    pub async fn check_block_accepted(&self, block_hash: &str) -> (bool, Option<String>) {
        let results = self.daemon.cmd("getblock", json!([block_hash])).await;
        for block in results.iter().filter_map(|r| r.result()) {
            let confirmed = block
                .get("confirmations")
                .and_then(Value::as_i64)
                .map(|c| c >= 0)
                .unwrap_or(false);
            if confirmed {
                let tx = block
                    .get("tx")
                    .and_then(Value::as_array)
                    .and_then(|txs| txs.first())
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return (true, tx);
            }
        }
        (false, None)
    }

    /// External new-block hint (blocknotify, p2p). Refreshes the template
    /// unless the hash is already the current job's parent.
    pub async fn process_block_notify(&self, block_hash: &str, source: &str) -> Result<bool> {
        self.log(LogSeverity::Debug, format!("Block notification via {}", source));
        let current_prev = self
            .job_manager
            .current_job()
            .map(|job| job.template.previous_block_hash.clone());
        if current_prev.as_deref() == Some(block_hash) {
            return Ok(false);
        }
        self.get_block_template()
            .await
            .with_context(|| format!("block notify from {} failed to refresh the template", source))
    }

    async fn on_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::BroadcastTimeout => {
                self.log(
                    LogSeverity::Debug,
                    format!("No new blocks for {} seconds, updating transactions and rebroadcasting work", self.config.job_rebroadcast_timeout),
                );
                if let Err(e) = self.refresh_for_rebroadcast().await {
                    self.log(LogSeverity::Error, format!("Rebroadcast refresh failed: {:#}", e));
                }
            }
            ServerEvent::DifficultyChanged { worker, difficulty, .. } => {
                self.observers.emit(&PoolEvent::DifficultyUpdate { worker, difficulty });
            }
            ServerEvent::TriggerBan { ip, worker } => {
                self.log(
                    LogSeverity::Warning,
                    format!("Banned {} ({}) for submitting too many invalid shares", ip, worker.as_deref().unwrap_or("-")),
                );
                self.observers.emit(&PoolEvent::BanIp { ip, worker });
            }
            ServerEvent::BootedBannedWorker { ip, worker } => {
                self.log(
                    LogSeverity::Warning,
                    format!("Booted worker {} who was connected from banned IP {}", worker.as_deref().unwrap_or("-"), ip),
                );
            }
            ServerEvent::KickedBannedIp { ip, remaining } => {
                self.log(
                    LogSeverity::Debug,
                    format!("Rejected incoming connection from {} banned for {} more seconds", ip, remaining.as_secs()),
                );
            }
            ServerEvent::ForgaveBannedIp { ip } => {
                self.log(LogSeverity::Debug, format!("Forgave banned IP {}", ip));
            }
            ServerEvent::MalformedMessage { ip, message } => {
                self.log(LogSeverity::Warning, format!("Malformed message from {}: {}", ip, message));
            }
            ServerEvent::SocketFlooded { ip } => {
                self.log(LogSeverity::Warning, format!("Detected socket flooding from {}", ip));
            }
            ServerEvent::SocketTimeout { ip, reason } => {
                self.log(LogSeverity::Debug, format!("Connected timed out for {}: {}", ip, reason));
            }
            ServerEvent::UnknownMethod { ip, method } => {
                self.log(LogSeverity::Debug, format!("Unknown stratum method from {}: {}", ip, method));
            }
            ServerEvent::TcpProxyError { ip, line } => {
                self.log(
                    LogSeverity::Error,
                    format!("Client IP detection failed for {}, tcpProxyProtocol is enabled yet did not receive proxy protocol message: {}", ip, line),
                );
            }
            ServerEvent::ClientConnected { .. } | ServerEvent::ClientDisconnected { .. } => {}
        }
    }

    /// Same tip: forced refresh so the job is re-sent. New tip: normal
    /// processing, which broadcasts as a new block.
    async fn refresh_for_rebroadcast(&self) -> Result<()> {
        let template = self.fetch_template().await?;
        if self.job_manager.is_new_tip(&template) {
            self.job_manager.process_template(template)?;
        } else {
            self.job_manager.update_current_job(template)?;
        }
        Ok(())
    }
}

fn script_from_validation(result: &Value) -> Option<Vec<u8>> {
    if !result.get("isvalid").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    result
        .get("scriptPubKey")
        .and_then(Value::as_str)
        .and_then(|s| hex::decode(s).ok())
}
