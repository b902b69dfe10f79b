pub mod logger;

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::logger::{ChannelAuditSink, spawn_audit_logger};

/// Kind of admission event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    Allow,
    Reject,
    Reset,
    KillSwitchOn,
    Error,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Reject => "REJECT",
            Self::Reset => "RESET",
            Self::KillSwitchOn => "KILL_SWITCH_ON",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit line. Never read back by the gate itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub symbol: String,
    pub event: AuditEvent,
    pub call_count_snapshot: u32,
    pub reason: String,
}

/// Destination for audit records.
///
/// Recording is infallible from the caller's point of view: a sink that cannot
/// persist a record logs the failure and moves on, so auditing never blocks
/// admission.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

// ---------------------------------------------------------------------------
// JSONL file sink
// ---------------------------------------------------------------------------

/// Appends one JSON object per line to a file.
///
/// Each record is written with a single `write_all` on an `O_APPEND` handle,
/// so lines from concurrent processes do not interleave.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: AuditRecord) {
        if let Err(e) = self.append(&record) {
            tracing::error!(
                path = %self.path.display(),
                event = %record.event,
                error = %e,
                "Failed to append audit record"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Keeps records in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(event: AuditEvent, count: u32) -> AuditRecord {
        AuditRecord {
            timestamp: Utc::now(),
            request_id: "req-1".to_string(),
            symbol: "AAPL".to_string(),
            event,
            call_count_snapshot: count,
            reason: "OK".to_string(),
        }
    }

    #[test]
    fn test_event_serializes_screaming_snake() {
        let json = serde_json::to_string(&AuditEvent::KillSwitchOn).unwrap();
        assert_eq!(json, "\"KILL_SWITCH_ON\"");
        assert_eq!(AuditEvent::KillSwitchOn.as_str(), "KILL_SWITCH_ON");
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("logs/audit.jsonl"));

        sink.record(make_record(AuditEvent::Allow, 1));
        sink.record(make_record(AuditEvent::Reject, 1));

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let records: Vec<AuditRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, AuditEvent::Allow);
        assert_eq!(records[1].event, AuditEvent::Reject);
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemoryAuditSink::new();
        sink.record(make_record(AuditEvent::Reset, 0));
        sink.record(make_record(AuditEvent::Allow, 1));
        assert_eq!(sink.events(), vec![AuditEvent::Reset, AuditEvent::Allow]);
    }
}
