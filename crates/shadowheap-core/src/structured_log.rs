//! Structured JSONL event log.
//!
//! Provides:
//! - [`LogEntry`]: one JSON record with required and optional fields.
//! - [`EventLog`]: writes entries that pass its level threshold to a sink.
//! - [`LogBuffer`]: in-memory sink for tests.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Threshold selected by the `verbosity` option.
    #[must_use]
    pub const fn from_verbosity(verbosity: u32) -> Self {
        match verbosity {
            0 => Self::Warn,
            1 => Self::Info,
            _ => Self::Debug,
        }
    }
}

/// Canonical log record.
///
/// Required fields: `timestamp`, `level`, `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<u32>,
    /// Address the event is about, rendered as `0x...`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            level,
            event: event.into(),
            tid: None,
            addr: None,
            size: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_tid(mut self, tid: u32) -> Self {
        self.tid = Some(tid);
        self
    }

    #[must_use]
    pub fn with_addr(mut self, addr: usize) -> Self {
        self.addr = Some(format!("{addr:#x}"));
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Shared byte buffer usable as a log sink.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    /// Every complete line written so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.bytes.lock())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Lines parsed back into entries; unparsable lines are skipped.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lines()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Entries whose `event` equals `event`.
    #[must_use]
    pub fn events(&self, event: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.event == event)
            .collect()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Level-filtered JSONL writer shared by every thread.
pub struct EventLog {
    threshold: LogLevel,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl EventLog {
    #[must_use]
    pub fn new(threshold: LogLevel, sink: Box<dyn Write + Send>) -> Self {
        Self {
            threshold,
            sink: Mutex::new(sink),
        }
    }

    #[must_use]
    pub fn stderr(threshold: LogLevel) -> Self {
        Self::new(threshold, Box::new(std::io::stderr()))
    }

    /// Log writing into a fresh [`LogBuffer`].
    #[must_use]
    pub fn memory(threshold: LogLevel) -> (Self, LogBuffer) {
        let buffer = LogBuffer::default();
        (Self::new(threshold, Box::new(buffer.clone())), buffer)
    }

    #[must_use]
    pub const fn threshold(&self) -> LogLevel {
        self.threshold
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.threshold
    }

    /// Writes `entry` when its level passes the threshold.
    pub fn emit(&self, entry: &LogEntry) -> std::io::Result<()> {
        if !self.enabled(entry.level) {
            return Ok(());
        }
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        let mut sink = self.sink.lock();
        writeln!(sink, "{line}")?;
        sink.flush()
    }
}

/// Current time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
#[must_use]
pub fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}
