//! Observability utilities.
//!
//! Besides the process-wide subscriber this installs a [`LogRing`] layer: the
//! most recent N log records, readable through a [`LogReader`] by observers
//! such as a dashboard. Readers cannot write.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<LogReader> = OnceLock::new();

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `WARDEN_LOG_FORMAT=json` or `json_logs`. Filter comes from `RUST_LOG`,
/// falling back to the configured level. Returns the reader for the log
/// ring; later calls return the same reader and ignore `config`.
pub fn init_tracing(config: &ObservabilityConfig) -> LogReader {
    TRACING_INIT
        .get_or_init(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
            let json = config.json_logs
                || std::env::var("WARDEN_LOG_FORMAT")
                    .map(|v| v.eq_ignore_ascii_case("json"))
                    .unwrap_or(false);

            let ring = LogRing::new(config.log_ring_capacity);
            let reader = ring.reader();

            let result = if json {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(ring)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .try_init()
            } else {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(ring)
                    .with(fmt::layer().compact().with_writer(std::io::stderr))
                    .try_init()
            };

            if let Err(err) = result {
                eprintln!("tracing init skipped: {err}");
            }
            reader
        })
        .clone()
}

// =============================================================================
// Log ring
// =============================================================================

/// One captured log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Structured fields other than `message`, as `key=value`.
    pub fields: String,
}

#[derive(Debug)]
struct RingBuffer {
    records: VecDeque<LogRecord>,
    capacity: usize,
}

/// `tracing` layer keeping the most recent `capacity` records.
#[derive(Debug, Clone)]
pub struct LogRing {
    buffer: Arc<Mutex<RingBuffer>>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Arc::new(Mutex::new(RingBuffer {
                records: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    pub fn reader(&self) -> LogReader {
        LogReader {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: String,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_field(field, format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            self.push_field(field, format_args!("{value:?}"));
        }
    }
}

impl RecordVisitor {
    fn push_field(&mut self, field: &Field, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", field.name(), value);
    }
}

impl<S: Subscriber> Layer<S> for LogRing {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();

        let record = LogRecord {
            timestamp: Utc::now(),
            level: level_name(meta.level()).to_string(),
            target: meta.target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        };

        let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        if buffer.records.len() >= buffer.capacity {
            buffer.records.pop_front();
        }
        buffer.records.push_back(record);
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARN",
        Level::ERROR => "ERROR",
    }
}

/// Read-only view of a [`LogRing`].
#[derive(Debug, Clone)]
pub struct LogReader {
    buffer: Arc<Mutex<RingBuffer>>,
}

impl LogReader {
    /// All retained records, oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        let buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        buffer.records.iter().cloned().collect()
    }

    /// The newest `n` records, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogRecord> {
        let buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        let skip = buffer.records.len().saturating_sub(n);
        buffer.records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner()).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ring_keeps_most_recent() {
        let ring = LogRing::new(3);
        let reader = ring.reader();
        let subscriber = tracing_subscriber::registry().with(ring);

        tracing::subscriber::with_default(subscriber, || {
            for i in 0..5 {
                tracing::info!(n = i, "record {i}");
            }
            tracing::warn!("last");
        });

        let records = reader.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "record 3");
        assert_eq!(records[0].fields, "n=3");
        assert_eq!(records[2].level, "WARN");
        assert_eq!(reader.tail(1)[0].message, "last");
    }
}
