use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    Clear,
    Banned { remaining: Duration },
    /// The ban had expired and was lifted by this check.
    Forgiven,
}

/// Banned IPs with the instant each ban started.
pub struct BanTable {
    ban_time: Duration,
    entries: Mutex<HashMap<IpAddr, Instant>>,
}

impl BanTable {
    pub fn new(ban_time: Duration) -> Self {
        Self {
            ban_time,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ban(&self, ip: IpAddr) {
        self.ban_at(ip, Instant::now());
    }

    pub fn ban_at(&self, ip: IpAddr, at: Instant) {
        self.entries.lock().insert(ip, at);
    }

    pub fn check(&self, ip: IpAddr) -> BanStatus {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> BanStatus {
        let mut entries = self.entries.lock();
        let Some(&banned_at) = entries.get(&ip) else {
            return BanStatus::Clear;
        };
        let elapsed = now.saturating_duration_since(banned_at);
        if elapsed < self.ban_time {
            BanStatus::Banned {
                remaining: self.ban_time - elapsed,
            }
        } else {
            entries.remove(&ip);
            BanStatus::Forgiven
        }
    }

    pub fn forgive(&self, ip: IpAddr) {
        self.entries.lock().remove(&ip);
    }

    /// Drops expired bans, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, banned_at| now.saturating_duration_since(*banned_at) < self.ban_time);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
