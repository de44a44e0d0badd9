/// Per-connection Stratum client state
///
/// Tracks:
/// - Subscription and authorization state
/// - Current, previous and staged difficulty
/// - VarDiff window and ban heuristic counters
/// - Outbound writer channel

use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::protocol::{to_line, StratumNotification};
use crate::algorithm::Algorithm;
use crate::config::BanningConfig;
use crate::jobs::JobParams;
use crate::vardiff::DifficultyState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientState {
    /// Initial state after connection
    Connected,
    /// After `mining.subscribe`
    Subscribed,
    /// After a successful `mining.authorize`
    Authorized,
    /// Authorized and has been sent work
    Active,
    Disconnected,
    Banned,
}

pub struct StratumClient {
    pub id: String,
    pub remote_addr: SocketAddr,
    /// Client address, taken from the PROXY header when one was sent.
    pub ip: IpAddr,
    pub local_port: u16,
    pub state: ClientState,
    pub subscription_id: Option<String>,
    pub extra_nonce1: Option<String>,
    pub worker: Option<String>,
    pub difficulty: f64,
    pub previous_difficulty: Option<f64>,
    pending_difficulty: Option<f64>,
    jobs_sent: u64,
    pub vardiff: Option<DifficultyState>,
    valid_shares: u64,
    invalid_shares: u64,
    banning: Option<BanningConfig>,
    algorithm: Algorithm,
    last_activity: Instant,
    connected_at: Instant,
    outbound: mpsc::UnboundedSender<String>,
}

impl StratumClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        remote_addr: SocketAddr,
        local_port: u16,
        algorithm: Algorithm,
        initial_difficulty: f64,
        vardiff: Option<DifficultyState>,
        banning: Option<BanningConfig>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote_addr,
            ip: remote_addr.ip(),
            local_port,
            state: ClientState::Connected,
            subscription_id: None,
            extra_nonce1: None,
            worker: None,
            difficulty: initial_difficulty,
            previous_difficulty: None,
            pending_difficulty: None,
            jobs_sent: 0,
            vardiff,
            valid_shares: 0,
            invalid_shares: 0,
            banning,
            algorithm,
            last_activity: now,
            connected_at: now,
            outbound,
        }
    }

    /// Queues a line for the writer task. False once the writer is gone.
    pub fn send_line(&self, line: String) -> bool {
        self.outbound.send(line).is_ok()
    }

    pub fn send_json<T: Serialize>(&self, msg: &T) -> bool {
        self.send_line(to_line(msg))
    }

    pub fn mark_subscribed(&mut self, subscription_id: String, extra_nonce1: String) {
        self.subscription_id = Some(subscription_id);
        self.extra_nonce1 = Some(extra_nonce1);
        if self.state == ClientState::Connected {
            self.state = ClientState::Subscribed;
        }
    }

    pub fn mark_authorized(&mut self, worker: String) {
        self.worker = Some(worker);
        if matches!(self.state, ClientState::Connected | ClientState::Subscribed) {
            self.state = if self.jobs_sent > 0 {
                ClientState::Active
            } else {
                ClientState::Authorized
            };
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.extra_nonce1.is_some()
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self.state, ClientState::Authorized | ClientState::Active)
    }

    /// Sets and announces a difficulty immediately. Returns false when it is
    /// unchanged.
    pub fn send_difficulty(&mut self, difficulty: f64) -> bool {
        if difficulty == self.difficulty && self.previous_difficulty.is_some() {
            return false;
        }
        self.previous_difficulty = Some(self.difficulty);
        self.difficulty = difficulty;
        let target = self.algorithm.target_hex_for_difficulty(difficulty);
        self.send_json(&StratumNotification::set_target(&target))
    }

    /// Stages a difficulty to be applied with the next job.
    pub fn enqueue_next_difficulty(&mut self, difficulty: f64) {
        self.pending_difficulty = Some(difficulty);
    }

    pub fn pending_difficulty(&self) -> Option<f64> {
        self.pending_difficulty
    }

    /// Applies any staged difficulty, then sends the job with this client's
    /// share target. Returns the newly applied difficulty, if any.
    pub fn send_mining_job(&mut self, params: &JobParams) -> Option<f64> {
        let applied = self.pending_difficulty.take().filter(|&d| self.send_difficulty(d));
        let target = self.algorithm.target_hex_for_difficulty(self.difficulty);
        self.send_json(&StratumNotification::notify(params.notify_params(&target)));
        self.jobs_sent += 1;
        if self.state == ClientState::Authorized {
            self.state = ClientState::Active;
        }
        applied
    }

    /// Feeds an accepted share to VarDiff; a retarget is staged, not sent.
    pub fn observe_accepted_share(&mut self, now: Instant) -> Option<f64> {
        let next = self.vardiff.as_mut()?.on_share(now, self.difficulty)?;
        self.enqueue_next_difficulty(next);
        Some(next)
    }

    /// Ban heuristic. Returns true when the client should be banned.
    pub fn consider_ban(&mut self, valid: bool) -> bool {
        let Some(cfg) = &self.banning else {
            return false;
        };
        if !cfg.enabled {
            return false;
        }
        if valid {
            self.valid_shares += 1;
        } else {
            self.invalid_shares += 1;
        }
        let total = self.valid_shares + self.invalid_shares;
        if total < cfg.check_threshold {
            return false;
        }
        let percent_bad = self.invalid_shares as f64 / total as f64 * 100.0;
        if percent_bad < cfg.invalid_percent {
            self.valid_shares = 0;
            self.invalid_shares = 0;
            false
        } else {
            self.state = ClientState::Banned;
            true
        }
    }

    pub fn share_counts(&self) -> (u64, u64) {
        (self.valid_shares, self.invalid_shares)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Check if connection is stale (inactive for too long)
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn label(&self) -> String {
        match &self.worker {
            Some(w) => format!("{} [{}]", w, self.ip),
            None => format!("(unauthorized) [{}]", self.ip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vardiff::{VarDiff, VarDiffConfig};
    use serde_json::Value;
    use std::net::Ipv4Addr;

    fn client(banning: Option<BanningConfig>) -> (StratumClient, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
        let c = StratumClient::new(
            "c1".to_string(),
            addr,
            3333,
            Algorithm::KawPow,
            8.0,
            Some(VarDiff::new(VarDiffConfig::default()).manage()),
            banning,
            tx,
        );
        (c, rx)
    }

    fn params() -> JobParams {
        JobParams {
            job_id: "1".to_string(),
            header_hash: "aa".repeat(32),
            seed_hash: "00".repeat(32),
            height: 10,
            bits: "1d00ffff".to_string(),
            clean_jobs: true,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[test]
    fn state_machine_progresses_to_active() {
        let (mut c, _rx) = client(None);
        assert_eq!(c.state, ClientState::Connected);
        c.mark_subscribed("sub".to_string(), "abcd".to_string());
        assert_eq!(c.state, ClientState::Subscribed);
        c.mark_authorized("RWorker".to_string());
        assert!(c.is_authorized());
        c.send_mining_job(&params());
        assert_eq!(c.state, ClientState::Active);
    }

    #[test]
    fn authorizing_after_first_job_goes_straight_to_active() {
        let (mut c, _rx) = client(None);
        c.mark_subscribed("sub".to_string(), "abcd".to_string());
        c.send_mining_job(&params());
        assert_eq!(c.state, ClientState::Subscribed);
        c.mark_authorized("RWorker".to_string());
        assert_eq!(c.state, ClientState::Active);
    }

    #[test]
    fn staged_difficulty_applies_with_next_job() {
        let (mut c, mut rx) = client(None);
        assert!(c.send_difficulty(8.0));
        drain(&mut rx);

        c.enqueue_next_difficulty(16.0);
        assert_eq!(c.difficulty, 8.0);
        assert!(drain(&mut rx).is_empty());

        assert_eq!(c.send_mining_job(&params()), Some(16.0));
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["method"], "mining.set_target");
        assert_eq!(msgs[1]["method"], "mining.notify");
        let target = Algorithm::KawPow.target_hex_for_difficulty(16.0);
        assert_eq!(msgs[1]["params"][3], Value::String(target));
        assert_eq!(c.difficulty, 16.0);
        assert_eq!(c.previous_difficulty, Some(8.0));
        assert_eq!(c.pending_difficulty(), None);
    }

    #[test]
    fn ban_heuristic_triggers_on_invalid_ratio() {
        let cfg = BanningConfig {
            enabled: true,
            time: 600,
            invalid_percent: 50.0,
            check_threshold: 4,
            purge_interval: 300,
        };
        let (mut c, _rx) = client(Some(cfg.clone()));
        assert!(!c.consider_ban(true));
        assert!(!c.consider_ban(true));
        assert!(!c.consider_ban(true));
        // 1/4 invalid: below threshold, counters reset.
        assert!(!c.consider_ban(false));
        assert_eq!(c.share_counts(), (0, 0));

        let (mut c, _rx) = client(Some(cfg));
        assert!(!c.consider_ban(false));
        assert!(!c.consider_ban(true));
        assert!(!c.consider_ban(false));
        assert!(c.consider_ban(true));
        assert_eq!(c.state, ClientState::Banned);
    }

    #[test]
    fn banning_disabled_never_bans() {
        let (mut c, _rx) = client(None);
        for _ in 0..1000 {
            assert!(!c.consider_ban(false));
        }
    }
}
