use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::cache::fs;
use crate::error::GateError;

/// Health of the daily budget. Ordered: a day only ever moves up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Green,
    Yellow,
    Red,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted admission record for one budget scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionState {
    pub date: NaiveDate,
    pub call_count: u32,
    pub cost_total: f64,
    pub consecutive_errors: u32,
    pub kill_switch: bool,
    pub status: Status,
    /// Daily call cap in force for this day.
    pub call_cap: u32,
    /// Daily cost cap in force for this day. `0` disables cost gating.
    pub cost_cap: f64,
}

impl AdmissionState {
    /// Fresh-day default.
    pub fn fresh(date: NaiveDate, call_cap: u32, cost_cap: f64) -> Self {
        Self {
            date,
            call_count: 0,
            cost_total: 0.0,
            consecutive_errors: 0,
            kill_switch: false,
            status: Status::Green,
            call_cap,
            cost_cap,
        }
    }

    /// Move status up to `to`. Never moves it down.
    pub fn escalate(&mut self, to: Status) {
        self.status = self.status.max(to);
    }

    /// Set the kill switch. Keeps `kill_switch => RED`.
    pub fn latch(&mut self) {
        self.kill_switch = true;
        self.status = Status::Red;
    }
}

/// Result of reading the state file.
#[derive(Debug)]
pub enum LoadedState {
    Missing,
    Loaded(AdmissionState),
    Corrupt(String),
}

/// On-disk home of an [`AdmissionState`] record.
///
/// Callers mutating the record must hold the admission lock. Saves go
/// through an atomic rename, so lock-free readers still see whole records.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<LoadedState, GateError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadedState::Missing),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Ok(LoadedState::Corrupt(e.to_string()));
            }
            Err(e) => return Err(GateError::io(&self.path, e)),
        };

        if content.trim().is_empty() {
            return Ok(LoadedState::Corrupt("empty state file".to_string()));
        }

        match serde_json::from_str::<AdmissionState>(&content) {
            Ok(state) => Ok(LoadedState::Loaded(state)),
            Err(e) => Ok(LoadedState::Corrupt(e.to_string())),
        }
    }

    /// Persist `state` atomically.
    ///
    /// Non-finite cost fields are refused: JSON has no encoding for them and
    /// the record would read back as corrupt.
    pub fn save(&self, state: &AdmissionState) -> Result<(), GateError> {
        if !state.cost_total.is_finite() || !state.cost_cap.is_finite() {
            return Err(GateError::State(format!(
                "refusing to persist non-finite cost (total {}, cap {})",
                state.cost_total, state.cost_cap
            )));
        }
        let content = serde_json::to_vec_pretty(state)?;
        fs::write_atomic(&self.path, &content)
            .map_err(|e| GateError::State(format!("Failed to persist admission state: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
