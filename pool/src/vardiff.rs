use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-port variable difficulty policy. Times are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarDiffConfig {
    pub min_diff: f64,
    pub max_diff: f64,
    /// Desired average time between accepted shares.
    pub target_time: f64,
    /// How often to retarget.
    pub retarget_time: f64,
    /// Tolerated deviation from `target_time`, in percent.
    pub variance_percent: f64,
    /// Only ever double or halve instead of scaling by the measured ratio.
    #[serde(default)]
    pub x2_mode: bool,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            min_diff: 8.0,
            max_diff: 512.0,
            target_time: 15.0,
            retarget_time: 90.0,
            variance_percent: 30.0,
            x2_mode: false,
        }
    }
}

impl VarDiffConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.min_diff > 0.0) {
            return Err(format!("min_diff must be positive, got {}", self.min_diff));
        }
        if self.max_diff < self.min_diff {
            return Err(format!(
                "max_diff {} is below min_diff {}",
                self.max_diff, self.min_diff
            ));
        }
        if !(self.target_time > 0.0) || !(self.retarget_time > 0.0) {
            return Err("target_time and retarget_time must be positive".to_string());
        }
        if !(0.0..100.0).contains(&self.variance_percent) {
            return Err(format!(
                "variance_percent must be in [0, 100), got {}",
                self.variance_percent
            ));
        }
        Ok(())
    }

    /// Ring buffer capacity: four samples per expected share in a retarget window.
    pub fn buffer_size(&self) -> usize {
        ((self.retarget_time / self.target_time * 4.0) as usize).max(1)
    }

    fn variance(&self) -> f64 {
        self.target_time * (self.variance_percent / 100.0)
    }

    fn t_min(&self) -> f64 {
        self.target_time - self.variance()
    }

    fn t_max(&self) -> f64 {
        self.target_time + self.variance()
    }
}

/// Difficulty controller for one listening port.
#[derive(Debug, Clone)]
pub struct VarDiff {
    cfg: VarDiffConfig,
}

impl VarDiff {
    pub fn new(cfg: VarDiffConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.cfg
    }

    /// Fresh per-client state bound to this port's policy.
    pub fn manage(&self) -> DifficultyState {
        DifficultyState::new(self.cfg)
    }
}

#[derive(Debug, Clone)]
pub struct DifficultyState {
    cfg: VarDiffConfig,
    samples: VecDeque<f64>,
    last_ts: Option<Instant>,
    last_retarget: Option<Instant>,
}

impl DifficultyState {
    pub fn new(cfg: VarDiffConfig) -> Self {
        Self {
            cfg,
            samples: VecDeque::with_capacity(cfg.buffer_size()),
            last_ts: None,
            last_retarget: None,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Record an accepted share and optionally retarget difficulty.
    ///
    /// Returns `Some(new_difficulty)` when the average interval left the
    /// tolerance band and the clamped proposal differs from `current_difficulty`.
    pub fn on_share(&mut self, now: Instant, current_difficulty: f64) -> Option<f64> {
        let (last_ts, last_retarget) = match (self.last_ts, self.last_retarget) {
            (Some(ts), Some(rtc)) => (ts, rtc),
            _ => {
                // Half a window of credit so the first retarget comes sooner.
                let half = Duration::from_secs_f64(self.cfg.retarget_time / 2.0);
                self.last_retarget = Some(now.checked_sub(half).unwrap_or(now));
                self.last_ts = Some(now);
                return None;
            }
        };

        let since_last = now.saturating_duration_since(last_ts).as_secs_f64();
        self.push_sample(since_last);
        self.last_ts = Some(now);

        if now.saturating_duration_since(last_retarget).as_secs_f64() < self.cfg.retarget_time {
            return None;
        }
        self.last_retarget = Some(now);

        let avg = self.average();
        let mut ratio = self.cfg.target_time / avg.max(f64::MIN_POSITIVE);

        if avg > self.cfg.t_max() && current_difficulty > self.cfg.min_diff {
            if self.cfg.x2_mode {
                ratio = 0.5;
            }
            if ratio * current_difficulty < self.cfg.min_diff {
                ratio = self.cfg.min_diff / current_difficulty;
            }
        } else if avg < self.cfg.t_min() {
            if self.cfg.x2_mode {
                ratio = 2.0;
            }
            if ratio * current_difficulty > self.cfg.max_diff {
                ratio = self.cfg.max_diff / current_difficulty;
            }
        } else {
            return None;
        }

        self.samples.clear();

        let next = round_to_8(current_difficulty * ratio);
        if !next.is_finite() || next <= 0.0 || next == current_difficulty {
            return None;
        }
        Some(next)
    }

    fn push_sample(&mut self, secs: f64) {
        if self.samples.len() == self.cfg.buffer_size() {
            self.samples.pop_front();
        }
        self.samples.push_back(secs);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

fn round_to_8(v: f64) -> f64 {
    (v * 1e8).round() / 1e8
}
