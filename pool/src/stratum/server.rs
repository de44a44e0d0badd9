/// Stratum Server - async TCP front end for KawPoW miners
///
/// Handles:
/// - One listener per configured port (SO_REUSEADDR)
/// - PROXY protocol headers and the IP ban table
/// - subscribe / authorize / submit and job broadcast
/// - VarDiff retargets staged per client, applied with the next job

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::banning::{BanStatus, BanTable};
use super::client::{ClientState, StratumClient};
use super::protocol::{StratumError, StratumRequest, StratumResponse, SubmitParams};
use super::proxy::parse_proxy_line;
use crate::config::{BanningConfig, PoolConfig, PortConfig};
use crate::events::Observers;
use crate::jobs::{JobManager, JobParams, SubscriptionCounter};
use crate::metrics::prometheus as metrics;
use crate::shares::ShareSubmission;
use crate::vardiff::{VarDiff, VarDiffConfig};

/// Credential check for `mining.authorize`.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, worker: &str, password: &str, ip: IpAddr, port: u16) -> bool;
}

/// Accepts every worker.
pub struct AcceptAll;

#[async_trait]
impl Authorizer for AcceptAll {
    async fn authorize(&self, _worker: &str, _password: &str, _ip: IpAddr, _port: u16) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected {
        client_id: String,
        ip: IpAddr,
        port: u16,
    },
    ClientDisconnected {
        client_id: String,
        ip: IpAddr,
        worker: Option<String>,
    },
    KickedBannedIp {
        ip: IpAddr,
        remaining: Duration,
    },
    ForgaveBannedIp {
        ip: IpAddr,
    },
    MalformedMessage {
        ip: IpAddr,
        message: String,
    },
    SocketFlooded {
        ip: IpAddr,
    },
    SocketTimeout {
        ip: IpAddr,
        reason: String,
    },
    UnknownMethod {
        ip: IpAddr,
        method: String,
    },
    TcpProxyError {
        ip: IpAddr,
        line: String,
    },
    TriggerBan {
        ip: IpAddr,
        worker: Option<String>,
    },
    /// Another connection from a freshly banned address was closed.
    BootedBannedWorker {
        ip: IpAddr,
        worker: Option<String>,
    },
    /// A VarDiff retarget was staged for the client's next job.
    DifficultyChanged {
        client_id: String,
        worker: Option<String>,
        difficulty: f64,
    },
    BroadcastTimeout,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_host: String,
    pub ports: BTreeMap<u16, PortConfig>,
    pub connection_timeout: Duration,
    pub job_rebroadcast_timeout: Duration,
    pub tcp_proxy_protocol: bool,
    pub max_line_bytes: usize,
    pub banning: BanningConfig,
}

impl From<&PoolConfig> for ServerConfig {
    fn from(cfg: &PoolConfig) -> Self {
        Self {
            listen_host: cfg.listen_host.clone(),
            ports: cfg.ports.clone(),
            connection_timeout: Duration::from_secs(cfg.connection_timeout),
            job_rebroadcast_timeout: Duration::from_secs(cfg.job_rebroadcast_timeout),
            tcp_proxy_protocol: cfg.tcp_proxy_protocol,
            max_line_bytes: cfg.max_line_bytes,
            banning: cfg.banning.clone(),
        }
    }
}

/// A connected miner. Cloning shares the same connection.
#[derive(Clone)]
pub struct ClientHandle {
    client: Arc<RwLock<StratumClient>>,
    kick: Arc<Notify>,
    owner: Arc<parking_lot::Mutex<Weak<StratumServer>>>,
    attached: Arc<Notify>,
}

/// Point-in-time view of a client, for handover filters.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub subscription_id: Option<String>,
    pub worker: Option<String>,
    pub ip: IpAddr,
    pub port: u16,
    pub state: ClientState,
    pub difficulty: f64,
    pub uptime: Duration,
}

impl ClientHandle {
    fn owner(&self) -> Option<Arc<StratumServer>> {
        self.owner.lock().upgrade()
    }

    pub async fn snapshot(&self) -> ClientSnapshot {
        let c = self.client.read().await;
        ClientSnapshot {
            client_id: c.id.clone(),
            subscription_id: c.subscription_id.clone(),
            worker: c.worker.clone(),
            ip: c.ip,
            port: c.local_port,
            state: c.state,
            difficulty: c.difficulty,
            uptime: c.uptime(),
        }
    }
}

enum Inbound {
    Line(String),
    Closed,
    Flooded,
}

/// Reads one newline-terminated line of at most `max` bytes.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Inbound>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader).take(max as u64 + 1).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Inbound::Closed);
    }
    if buf.last() != Some(&b'\n') && buf.len() > max {
        return Ok(Inbound::Flooded);
    }
    Ok(Inbound::Line(String::from_utf8_lossy(buf).into_owned()))
}

pub struct StratumServer {
    config: ServerConfig,
    job_manager: Arc<JobManager>,
    authorizer: Arc<dyn Authorizer>,
    clients: Arc<RwLock<HashMap<String, ClientHandle>>>,
    vardiff: parking_lot::RwLock<HashMap<u16, VarDiff>>,
    ban_table: BanTable,
    subscriptions: SubscriptionCounter,
    last_broadcast: parking_lot::Mutex<Instant>,
    observers: Observers<ServerEvent>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StratumServer {
    pub fn new(config: ServerConfig, job_manager: Arc<JobManager>, authorizer: Arc<dyn Authorizer>) -> Self {
        tracing::info!(
            "🌐 Creating Stratum server on {} ports {:?}",
            config.listen_host,
            config.ports.keys().collect::<Vec<_>>()
        );

        let vardiff: HashMap<u16, VarDiff> = config
            .ports
            .iter()
            .filter_map(|(port, p)| p.var_diff.map(|v| (*port, VarDiff::new(v))))
            .collect();

        Self {
            ban_table: BanTable::new(Duration::from_secs(config.banning.time)),
            config,
            job_manager,
            authorizer,
            clients: Arc::new(RwLock::new(HashMap::new())),
            vardiff: parking_lot::RwLock::new(vardiff),
            subscriptions: SubscriptionCounter::new(),
            last_broadcast: parking_lot::Mutex::new(Instant::now()),
            observers: Observers::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.observers.register(callback);
    }

    pub fn ban_table(&self) -> &BanTable {
        &self.ban_table
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Binds every configured port and spawns the accept loops and timers.
    /// Returns the bound addresses in port order.
    pub async fn start(self: Arc<Self>) -> Result<Vec<SocketAddr>> {
        let host: IpAddr = self
            .config
            .listen_host
            .parse()
            .map_err(|e| anyhow!("Invalid listen host '{}': {}", self.config.listen_host, e))?;

        let mut bound = Vec::new();
        for &port in self.config.ports.keys() {
            let listener = Self::bind(SocketAddr::new(host, port))?;
            let local = listener.local_addr()?;
            tracing::info!("✅ Stratum server listening on {} (SO_REUSEADDR)", local);
            bound.push(local);

            let server = Arc::clone(&self);
            let task = tokio::spawn(async move { server.accept_loop(listener, port).await });
            self.tasks.lock().push(task);
        }

        let server = Arc::clone(&self);
        let task = tokio::spawn(async move { server.rebroadcast_timer().await });
        self.tasks.lock().push(task);

        if self.config.banning.enabled {
            let server = Arc::clone(&self);
            let task = tokio::spawn(async move { server.ban_purger().await });
            self.tasks.lock().push(task);
        }

        Ok(bound)
    }

    /// Stops accepting and cancels the timers. Open connections drain on
    /// their own.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(addr))?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, port: u16) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("🔌 New connection from {} on port {}", peer_addr, port);
                    let _ = socket.set_nodelay(true);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, peer_addr, port).await {
                            tracing::error!("Connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection on port {}: {}", port, e);
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer_addr: SocketAddr, port: u16) -> Result<()> {
        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(512);
        let max_line = self.config.max_line_bytes;
        let mut ip = peer_addr.ip();
        let mut pending: Option<String> = None;

        if self.config.tcp_proxy_protocol {
            let first = tokio::time::timeout(
                self.config.connection_timeout,
                read_line_bounded(&mut reader, &mut buf, max_line),
            )
            .await;
            let Some(line) = self.inbound_line(ip, first) else {
                return Ok(());
            };
            match parse_proxy_line(&line) {
                Some(real) => ip = real,
                None => {
                    tracing::warn!("⚠️ Expected PROXY header from {}, got: {}", peer_addr, line.trim());
                    self.observers.emit(&ServerEvent::TcpProxyError {
                        ip,
                        line: line.trim().to_string(),
                    });
                    pending = Some(line);
                }
            }
        }

        if self.config.banning.enabled {
            match self.ban_table.check(ip) {
                BanStatus::Banned { remaining } => {
                    tracing::info!("🚫 Kicked banned IP {} ({}s remaining)", ip, remaining.as_secs());
                    metrics::inc_kicked();
                    self.observers.emit(&ServerEvent::KickedBannedIp { ip, remaining });
                    return Ok(());
                }
                BanStatus::Forgiven => {
                    tracing::info!("🕊️ Forgave banned IP {}", ip);
                    self.observers.emit(&ServerEvent::ForgaveBannedIp { ip });
                }
                BanStatus::Clear => {}
            }
        }

        let client_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let port_cfg = self.config.ports.get(&port).cloned().unwrap_or_default();
        let vardiff = self.vardiff.read().get(&port).map(VarDiff::manage);
        let mut client = StratumClient::new(
            client_id.clone(),
            peer_addr,
            port,
            self.job_manager.algorithm(),
            port_cfg.initial_difficulty(),
            vardiff,
            self.config.banning.enabled.then(|| self.config.banning.clone()),
            tx,
        );
        client.ip = ip;

        let handle = ClientHandle {
            client: Arc::new(RwLock::new(client)),
            kick: Arc::new(Notify::new()),
            owner: Arc::new(parking_lot::Mutex::new(Arc::downgrade(&self))),
            attached: Arc::new(Notify::new()),
        };
        self.clients.write().await.insert(client_id.clone(), handle.clone());
        metrics::inc_connections();
        self.observers.emit(&ServerEvent::ClientConnected {
            client_id: client_id.clone(),
            ip,
            port,
        });

        // Writer task: a slow socket only ever stalls its own queue.
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
            let _ = writer.shutdown().await;
        });

        // The socket stays read by this task; requests go to whichever
        // server currently owns the client.
        loop {
            let line = match pending.take() {
                Some(line) => line,
                None => {
                    let read = tokio::select! {
                        _ = handle.kick.notified() => break,
                        r = tokio::time::timeout(
                            self.config.connection_timeout,
                            read_line_bounded(&mut reader, &mut buf, max_line),
                        ) => r,
                    };
                    match self.inbound_line(ip, read) {
                        Some(line) => line,
                        None => break,
                    }
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request = match StratumRequest::parse(trimmed) {
                Ok(req) => req,
                Err(e) => {
                    tracing::warn!("Malformed message from {}: {}", ip, e);
                    self.observers.emit(&ServerEvent::MalformedMessage {
                        ip,
                        message: trimmed.to_string(),
                    });
                    break;
                }
            };

            let Some(owner) = self.wait_for_owner(&handle, ip).await else {
                break;
            };
            handle.client.write().await.touch();
            owner.handle_request(&handle, request).await;
        }

        metrics::dec_connections();
        let owner = handle.owner();
        let worker = {
            let mut c = handle.client.write().await;
            if let (Some(owner), Some(en1)) = (&owner, c.extra_nonce1.take()) {
                owner.job_manager.extra_nonce_counter().release(&en1);
            }
            if c.state != ClientState::Banned {
                c.state = ClientState::Disconnected;
            }
            c.worker.clone()
        };
        let owner = owner.unwrap_or(self);
        owner.clients.write().await.remove(&client_id);
        tracing::debug!("👋 Client {} disconnected", client_id);
        owner.observers.emit(&ServerEvent::ClientDisconnected { client_id, ip, worker });
        Ok(())
    }

    /// Yields the line, or reports why the read ends the connection.
    fn inbound_line(
        &self,
        ip: IpAddr,
        read: Result<std::io::Result<Inbound>, tokio::time::error::Elapsed>,
    ) -> Option<String> {
        match read {
            Err(_) => {
                tracing::warn!("⏱️ Connection timeout: {}", ip);
                self.observers.emit(&ServerEvent::SocketTimeout {
                    ip,
                    reason: format!(
                        "last submitted a share was {} seconds ago",
                        self.config.connection_timeout.as_secs()
                    ),
                });
                None
            }
            Ok(Err(e)) => {
                tracing::debug!("Read error from {}: {}", ip, e);
                None
            }
            Ok(Ok(Inbound::Closed)) => {
                tracing::debug!("📥 Connection closed by client: {}", ip);
                None
            }
            Ok(Ok(Inbound::Flooded)) => {
                tracing::warn!("🌊 Socket flooded by {}", ip);
                self.observers.emit(&ServerEvent::SocketFlooded { ip });
                None
            }
            Ok(Ok(Inbound::Line(line))) => Some(line),
        }
    }

    /// Current owner of a client. A relinquished client waits up to the
    /// connection timeout to be attached elsewhere.
    async fn wait_for_owner(&self, handle: &ClientHandle, ip: IpAddr) -> Option<Arc<StratumServer>> {
        if let Some(owner) = handle.owner() {
            return Some(owner);
        }
        let _ = tokio::time::timeout(self.config.connection_timeout, handle.attached.notified()).await;
        let owner = handle.owner();
        if owner.is_none() {
            tracing::warn!("⏱️ Relinquished client {} was never attached", ip);
            self.observers.emit(&ServerEvent::SocketTimeout {
                ip,
                reason: "relinquished and never attached".to_string(),
            });
        }
        owner
    }

    /// Every client currently owned by this server.
    pub async fn stratum_clients(&self) -> Vec<ClientHandle> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Detaches a client for handover to another server. Its connection
    /// stays open; requests wait until it is attached again.
    pub async fn remove_client(&self, client_id: &str) -> Option<ClientHandle> {
        let handle = self.clients.write().await.remove(client_id)?;
        *handle.owner.lock() = Weak::new();
        if let Some(en1) = handle.client.read().await.extra_nonce1.as_deref() {
            self.job_manager.extra_nonce_counter().release(en1);
        }
        Some(handle)
    }

    /// Takes ownership of a client relinquished by another server. The
    /// client keeps its extraNonce1 and subscription.
    pub async fn add_client(self: &Arc<Self>, handle: ClientHandle) {
        let (client_id, label) = {
            let c = handle.client.read().await;
            if let Some(en1) = c.extra_nonce1.as_deref() {
                if !self.job_manager.extra_nonce_counter().reserve(en1) {
                    tracing::warn!("⚠️ Attached client {} shares extranonce {} with a live client", c.label(), en1);
                }
            }
            (c.id.clone(), c.label())
        };
        *handle.owner.lock() = Arc::downgrade(self);
        self.clients.write().await.insert(client_id, handle.clone());
        handle.attached.notify_one();
        tracing::info!("🤝 Attached client {}", label);
    }

    /// Replaces the VarDiff controller of `port`. Connected clients on the
    /// port restart their retarget window under the new policy.
    pub async fn set_var_diff(&self, port: u16, cfg: VarDiffConfig) -> Result<()> {
        if !self.config.ports.contains_key(&port) {
            bail!("port {} is not configured", port);
        }
        cfg.validate().map_err(|reason| anyhow!("invalid vardiff for port {}: {}", port, reason))?;
        self.vardiff.write().insert(port, VarDiff::new(cfg));

        for h in self.stratum_clients().await {
            let mut c = h.client.write().await;
            if c.local_port == port {
                c.vardiff = self.vardiff.read().get(&port).map(VarDiff::manage);
            }
        }
        tracing::info!("🎚️ VarDiff replaced on port {}", port);
        Ok(())
    }

    async fn handle_request(&self, handle: &ClientHandle, req: StratumRequest) {
        match req.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(handle, req).await,
            "mining.authorize" => self.handle_authorize(handle, req).await,
            "mining.submit" => self.handle_submit(handle, req).await,
            "mining.get_transactions" => {
                let c = handle.client.read().await;
                c.send_json(&StratumResponse::success(req.id, json!([])));
            }
            "mining.extranonce.subscribe" => {
                let c = handle.client.read().await;
                c.send_json(&StratumResponse::success(req.id, Value::Bool(false)));
            }
            other => {
                let c = handle.client.read().await;
                tracing::warn!("❓ Unknown stratum method from {}: {}", c.ip, other);
                self.observers.emit(&ServerEvent::UnknownMethod {
                    ip: c.ip,
                    method: other.to_string(),
                });
                c.send_json(&StratumResponse::error(
                    req.id,
                    StratumError::other(format!("Unknown method: {}", other)),
                ));
            }
        }
    }

    async fn handle_subscribe(&self, handle: &ClientHandle, req: StratumRequest) {
        let counter = self.job_manager.extra_nonce_counter();
        let mut c = handle.client.write().await;
        if let Some(old) = c.extra_nonce1.take() {
            counter.release(&old);
        }

        let extra_nonce1 = match counter.next() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Cannot subscribe {}: {}", c.ip, e);
                c.send_json(&StratumResponse::error(req.id, StratumError::other(e.to_string())));
                return;
            }
        };
        let subscription_id = self.subscriptions.next();
        c.mark_subscribed(subscription_id.clone(), extra_nonce1.clone());
        c.send_json(&StratumResponse::success(req.id, json!([subscription_id, extra_nonce1])));

        let initial = c.difficulty;
        c.send_difficulty(initial);
        if let Some(job) = self.job_manager.current_job() {
            c.send_mining_job(&job.job_params(true));
        }
        tracing::debug!("📝 {} subscribed with extranonce {}", c.ip, extra_nonce1);
    }

    async fn handle_authorize(&self, handle: &ClientHandle, req: StratumRequest) {
        let worker = req.param_str(0).unwrap_or_default().trim().to_string();
        let password = req.param_str(1).unwrap_or_default().to_string();
        let (ip, port) = {
            let c = handle.client.read().await;
            (c.ip, c.local_port)
        };

        let authorized = !worker.is_empty() && self.authorizer.authorize(&worker, &password, ip, port).await;

        let mut c = handle.client.write().await;
        if authorized {
            tracing::info!("✅ Authorized worker {} from {}", worker, ip);
            c.mark_authorized(worker);
            c.send_json(&StratumResponse::success(req.id, Value::Bool(true)));
        } else {
            tracing::warn!("🔒 Rejected worker '{}' from {}", worker, ip);
            c.send_json(&StratumResponse {
                id: req.id,
                result: Value::Bool(false),
                error: Some(StratumError::unauthorized()),
            });
        }
    }

    async fn handle_submit(&self, handle: &ClientHandle, req: StratumRequest) {
        let prepared = {
            let c = handle.client.read().await;
            if !c.is_authorized() {
                Err(StratumError::unauthorized())
            } else if !c.is_subscribed() {
                Err(StratumError::not_subscribed())
            } else {
                SubmitParams::from_request(&req).map(|p| ShareSubmission {
                    job_id: p.job_id,
                    nonce: p.nonce,
                    header_hash: p.header_hash,
                    mix_hash: p.mix_hash,
                    extra_nonce1: c.extra_nonce1.clone().unwrap_or_default(),
                    worker: c.worker.clone().unwrap_or(p.worker),
                    ip: c.ip,
                    port: c.local_port,
                    difficulty: c.difficulty,
                    previous_difficulty: c.previous_difficulty,
                })
            }
        };

        let (accepted, error) = match prepared {
            Err(e) => (false, Some(e)),
            Ok(submission) => {
                // No client lock is held across verification.
                let outcome = self.job_manager.process_share(submission).await;
                (outcome.accepted, outcome.error.map(StratumError::from))
            }
        };

        let ban = {
            let mut c = handle.client.write().await;
            c.send_json(&StratumResponse {
                id: req.id,
                result: Value::Bool(accepted),
                error,
            });

            if accepted {
                if let Some(next) = c.observe_accepted_share(Instant::now()) {
                    tracing::debug!("🎚️ VarDiff retarget for {}: {} -> {}", c.label(), c.difficulty, next);
                    metrics::inc_vardiff_retarget();
                    self.observers.emit(&ServerEvent::DifficultyChanged {
                        client_id: c.id.clone(),
                        worker: c.worker.clone(),
                        difficulty: next,
                    });
                }
            }

            c.consider_ban(accepted).then(|| (c.ip, c.worker.clone()))
        };

        if let Some((ip, worker)) = ban {
            self.trigger_ban(ip, worker).await;
        }
    }

    /// Bans `ip` and closes every connection from it.
    async fn trigger_ban(&self, ip: IpAddr, worker: Option<String>) {
        tracing::warn!("🔨 Banning {} ({}) for too many invalid shares", ip, worker.as_deref().unwrap_or("-"));
        self.ban_table.ban(ip);
        metrics::inc_bans();
        self.observers.emit(&ServerEvent::TriggerBan {
            ip,
            worker: worker.clone(),
        });

        let handles: Vec<ClientHandle> = {
            let clients = self.clients.read().await;
            clients.values().cloned().collect()
        };
        for h in handles {
            let other = {
                let c = h.client.read().await;
                (c.ip == ip).then(|| c.worker.clone())
            };
            let Some(other_worker) = other else {
                continue;
            };
            if other_worker != worker {
                self.observers.emit(&ServerEvent::BootedBannedWorker {
                    ip,
                    worker: other_worker,
                });
            }
            h.kick.notify_one();
        }
    }

    /// Sends a job to every subscribed client. Stale clients are
    /// disconnected instead.
    pub async fn broadcast_mining_jobs(&self, params: &JobParams) {
        *self.last_broadcast.lock() = Instant::now();

        // Clone handles out of the lock so no map lock is held while sending
        let handles: Vec<ClientHandle> = {
            let clients = self.clients.read().await;
            clients.values().cloned().collect()
        };

        let mut sent = 0;
        for h in &handles {
            let mut c = h.client.write().await;
            if c.is_stale(self.config.connection_timeout) {
                tracing::warn!("⏱️ Dropping stale client {}", c.label());
                self.observers.emit(&ServerEvent::SocketTimeout {
                    ip: c.ip,
                    reason: "inactive at job broadcast".to_string(),
                });
                h.kick.notify_one();
                continue;
            }
            if !c.is_subscribed() {
                continue;
            }
            c.send_mining_job(params);
            sent += 1;
        }

        metrics::inc_job_broadcasts();
        tracing::info!("📢 Broadcasted job {} (height {}) to {} miners", params.job_id, params.height, sent);
    }

    async fn rebroadcast_timer(self: Arc<Self>) {
        let timeout = self.config.job_rebroadcast_timeout;
        loop {
            let deadline = *self.last_broadcast.lock() + timeout;
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;

            let due = {
                let mut last = self.last_broadcast.lock();
                if last.elapsed() >= timeout {
                    *last = Instant::now();
                    true
                } else {
                    false
                }
            };
            if due {
                tracing::debug!("⏰ No job broadcast for {}s", timeout.as_secs());
                self.observers.emit(&ServerEvent::BroadcastTimeout);
            }
        }
    }

    async fn ban_purger(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.banning.purge_interval.max(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = self.ban_table.purge_expired();
            if purged > 0 {
                tracing::info!("🧹 Purged {} expired bans", purged);
            }
        }
    }
}
