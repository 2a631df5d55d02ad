//! Observability for send operations.
//!
//! Metrics go through the [`MetricsSink`] trait; [`MailMetrics`] is the
//! in-process default. Logging uses `tracing`, and [`init_logging`] installs a
//! subscriber from [`LoggingConfig`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::{MailError, MailResult};

/// Receives send outcomes.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// A message was delivered.
    fn record_message_sent(&self);

    /// A message failed; `reason` is an error kind name or `rate_limited`.
    fn record_message_failed(&self, reason: &str);

    /// Token retrieval or the AUTH handshake failed.
    fn record_auth_failure(&self);

    /// Wall time of one logical send, retries included.
    fn record_send_duration(&self, duration: Duration);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_message_sent(&self) {}
    fn record_message_failed(&self, _reason: &str) {}
    fn record_auth_failure(&self) {}
    fn record_send_duration(&self, _duration: Duration) {}
}

/// In-process metrics collector.
#[derive(Debug, Default)]
pub struct MailMetrics {
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    auth_failures: AtomicU64,
    sends_timed: AtomicU64,
    total_send_micros: AtomicU64,
    max_send_micros: AtomicU64,
    failure_reasons: Mutex<BTreeMap<String, u64>>,
}

impl MailMetrics {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let sends_timed = self.sends_timed.load(Ordering::Relaxed);
        let total = self.total_send_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            failure_reasons: self
                .failure_reasons
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            average_send_ms: if sends_timed == 0 {
                0.0
            } else {
                total as f64 / sends_timed as f64 / 1000.0
            },
            max_send_ms: self.max_send_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    /// Resets all counters.
    pub fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_failed.store(0, Ordering::Relaxed);
        self.auth_failures.store(0, Ordering::Relaxed);
        self.sends_timed.store(0, Ordering::Relaxed);
        self.total_send_micros.store(0, Ordering::Relaxed);
        self.max_send_micros.store(0, Ordering::Relaxed);
        self.failure_reasons
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl MetricsSink for MailMetrics {
    fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_message_failed(&self, reason: &str) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
        *self
            .failure_reasons
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_send_duration(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sends_timed.fetch_add(1, Ordering::Relaxed);
        self.total_send_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_send_micros.fetch_max(micros, Ordering::Relaxed);
    }
}

/// Metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Delivered messages.
    pub messages_sent: u64,
    /// Failed messages.
    pub messages_failed: u64,
    /// Authentication failures.
    pub auth_failures: u64,
    /// Failures per reason.
    pub failure_reasons: BTreeMap<String, u64>,
    /// Mean send duration in milliseconds.
    pub average_send_ms: f64,
    /// Longest send duration in milliseconds.
    pub max_send_ms: f64,
}

impl MetricsSnapshot {
    /// Fraction of messages delivered; 1.0 before any send.
    pub fn success_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_failed;
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }

    /// Failures recorded for `reason`.
    pub fn failures_for(&self, reason: &str) -> u64 {
        self.failure_reasons.get(reason).copied().unwrap_or(0)
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::trace!(timer = self.name, duration_ms = elapsed.as_millis() as u64, "Timer stopped");
        elapsed
    }
}

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` directives take precedence over `config.level`. Fails if a
/// global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> MailResult<()> {
    config.validate()?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_ascii_lowercase()))
        .map_err(|e| MailError::configuration("invalid log filter").with_cause(e))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Text => registry.with(tracing_fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(tracing_fmt::layer().json().with_current_span(false))
            .try_init(),
    };
    installed.map_err(|e| MailError::configuration("logging already initialized").with_cause(e))
}
