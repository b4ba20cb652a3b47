//! Logging
//!
//! Process-wide `tracing` setup plus the session-scoped logger handle. The
//! session never reaches for a global logger: it is handed a [`SessionLog`]
//! and subscribes a [`LoggerObserver`] built from it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;

use crate::events::{Observer, SessionEvent};

/// Sink for the human-readable session lines.
pub trait SessionLog: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Production logger: forwards to `tracing` under the `tapline::session` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl SessionLog for TracingLog {
    fn info(&self, message: &str) {
        tracing::info!(target: "tapline::session", "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "tapline::session", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "tapline::session", "{}", message);
    }
}

/// Captures lines in memory. Used by tests and embedders that render logs
/// themselves.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn push(&self, level: &str, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format!("{level} {message}"));
        }
    }
}

impl SessionLog for MemoryLog {
    fn info(&self, message: &str) {
        self.push("INFO", message);
    }

    fn warn(&self, message: &str) {
        self.push("WARN", message);
    }

    fn error(&self, message: &str) {
        self.push("ERROR", message);
    }
}

/// Bus subscriber that reports lifecycle events and, when enabled, one line
/// per transaction.
pub struct LoggerObserver {
    log: Arc<dyn SessionLog>,
    log_transactions: bool,
}

impl LoggerObserver {
    pub fn new(log: Arc<dyn SessionLog>, log_transactions: bool) -> Self {
        Self {
            log,
            log_transactions,
        }
    }
}

impl Observer for LoggerObserver {
    fn name(&self) -> &str {
        "logger"
    }

    fn on_event(&self, event: &SessionEvent) -> anyhow::Result<()> {
        match event {
            SessionEvent::TransactionObserved(tx) => {
                if self.log_transactions {
                    self.log.info(&tx.summary_line());
                }
            }
            SessionEvent::SessionStarted(info) => {
                if let Some(addr) = info.proxy {
                    self.log.info(&format!("proxy listening on {addr}"));
                }
                if let Some(addr) = info.relay_server {
                    self.log.info(&format!("relay server listening on {addr}"));
                }
                if let Some(target) = &info.relay_target {
                    self.log.info(&format!("relay client connected to {target}"));
                }
            }
            SessionEvent::SessionStopped => self.log.info("session stopped"),
            SessionEvent::SessionFailed { cause } => {
                self.log.error(&format!("session failed: {cause}"))
            }
            SessionEvent::EndpointFailed { endpoint, cause } => {
                self.log.warn(&format!("{endpoint} failed: {cause}"))
            }
        }
        Ok(())
    }
}

/// Options for the process-wide subscriber.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Overrides `RUST_LOG` when set
    pub level: Option<LevelFilter>,
    /// Write to a daily rolling file in this directory instead of stderr
    pub log_dir: Option<PathBuf>,
}

/// Install the global `tracing` subscriber.
///
/// Returns the appender guard when logging to a file; keep it alive for as
/// long as log lines should be flushed.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = config.level.unwrap_or_else(resolve_log_level);

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                anyhow::anyhow!("Failed to create log directory {}: {}", dir.display(), e)
            })?;
            let file_appender = tracing_appender::rolling::daily(dir, "tapline");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(non_blocking)
                .try_init();
            Ok(Some(guard))
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .try_init();
            Ok(None)
        }
    }
}

fn resolve_log_level() -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(val) => parse_level(&val).unwrap_or(LevelFilter::INFO),
        Err(_) => LevelFilter::INFO,
    }
}

pub fn parse_level(value: &str) -> Option<LevelFilter> {
    match value.to_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}
