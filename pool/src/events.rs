/// Observer plumbing and the pool's severity-tagged log channel

use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;

use crate::shares::ShareEvent;

/// Callback type for component events
pub type EventCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registered observers of one component. Callbacks run synchronously on the
/// emitting task and must not block.
pub struct Observers<E> {
    callbacks: RwLock<Vec<EventCallback<E>>>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn emit(&self, event: &E) {
        // Snapshot so a callback may register further observers.
        let callbacks = self.callbacks.read().clone();
        for cb in callbacks.iter() {
            cb(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Debug,
    Warning,
    Error,
    /// Operator-facing notices such as the startup banner or found blocks.
    Special,
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub severity: LogSeverity,
    pub component: String,
    pub text: String,
}

/// Writes a severity-tagged message to `tracing` and returns it as an event
/// for pool observers.
pub fn emit_log(severity: LogSeverity, component: &str, text: impl Into<String>) -> LogEvent {
    let text = text.into();
    match severity {
        LogSeverity::Debug => tracing::debug!(component, "{}", text),
        LogSeverity::Warning => tracing::warn!(component, "{}", text),
        LogSeverity::Error => tracing::error!(component, "{}", text),
        LogSeverity::Special => tracing::info!(component, special = true, "{}", text),
    }
    LogEvent {
        severity,
        component: component.to_string(),
        text,
    }
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    Started,
    /// A processed share; `block_accepted` is set once a candidate block was
    /// confirmed by a daemon, with the coinbase txid when it reported one.
    Share {
        share: ShareEvent,
        block_accepted: bool,
        tx_hash: Option<String>,
    },
    DifficultyUpdate {
        worker: Option<String>,
        difficulty: f64,
    },
    BanIp {
        ip: IpAddr,
        worker: Option<String>,
    },
    Log(LogEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn observers_receive_every_event() {
        let observers: Observers<u32> = Observers::new();
        let sum = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let sum = sum.clone();
            observers.register(move |v| {
                sum.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }

        observers.emit(&3);
        observers.emit(&4);
        assert_eq!(observers.len(), 2);
        assert_eq!(sum.load(Ordering::SeqCst), 14);
    }

    #[test]
    fn emit_log_keeps_severity_and_text() {
        let ev = emit_log(LogSeverity::Special, "pool", "block found");
        assert_eq!(ev.severity, LogSeverity::Special);
        assert_eq!(ev.component, "pool");
        assert_eq!(ev.text, "block found");
    }
}
