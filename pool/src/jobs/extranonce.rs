use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtraNonceError {
    #[error("All {0} extranonce values are in use")]
    Exhausted(u64),
}

struct CounterState {
    next: u64,
    live: HashSet<u64>,
}

/// Hands out fixed-width extraNonce1 values, unique among live subscribers.
pub struct ExtraNonceCounter {
    width: usize,
    space: u64,
    state: Mutex<CounterState>,
}

impl ExtraNonceCounter {
    /// `width` is in bytes and clamped to 1..=4.
    pub fn new(width: usize) -> Self {
        let width = width.clamp(1, 4);
        let space = 1u64 << (8 * width);
        let start = rand::thread_rng().gen_range(0..space);
        Self {
            width,
            space,
            state: Mutex::new(CounterState {
                next: start,
                live: HashSet::new(),
            }),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Next free value as `2 * width` lowercase hex chars. Wraps on overflow.
    pub fn next(&self) -> Result<String, ExtraNonceError> {
        let mut state = self.state.lock();
        if state.live.len() as u64 >= self.space {
            return Err(ExtraNonceError::Exhausted(self.space));
        }
        loop {
            let candidate = state.next;
            state.next = (state.next + 1) % self.space;
            if state.live.insert(candidate) {
                return Ok(format!("{:0width$x}", candidate, width = self.width * 2));
            }
        }
    }

    /// Marks a value issued elsewhere as live, for clients handed over from
    /// another pool. False when it was already live or is out of range.
    pub fn reserve(&self, value: &str) -> bool {
        match u64::from_str_radix(value, 16) {
            Ok(v) if value.len() == self.width * 2 && v < self.space => self.state.lock().live.insert(v),
            _ => false,
        }
    }

    /// Returns a value to the pool once its subscriber disconnects.
    pub fn release(&self, value: &str) {
        if let Ok(v) = u64::from_str_radix(value, 16) {
            self.state.lock().live.remove(&v);
        }
    }
}

/// Monotonic subscription ids.
pub struct SubscriptionCounter {
    count: AtomicU32,
}

impl SubscriptionCounter {
    const PADDING: &'static str = "deadbeefcafebabe";

    pub fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        format!("{}{:08x}", Self::PADDING, n)
    }
}

impl Default for SubscriptionCounter {
    fn default() -> Self {
        Self::new()
    }
}
