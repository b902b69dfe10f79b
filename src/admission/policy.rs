//! Composable admission policies.
//!
//! Each policy looks at the shared [`AdmissionState`] and may demand that the
//! day be latched. The controller combines them by logical OR: any latch
//! decision from any policy sets the kill switch.

use std::fmt;

use crate::admission::state::{AdmissionState, Status};

/// Why a call was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    KillSwitchActive,
    DailyCapExceeded,
    CostCapExceeded,
    ErrorBudgetExhausted,
}

impl DenyReason {
    /// Reason returned to the caller.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KillSwitchActive => "KILL_SWITCH_ACTIVE",
            Self::DailyCapExceeded => "DAILY_CAP_EXCEEDED",
            Self::CostCapExceeded => "COST_CAP_EXCEEDED",
            Self::ErrorBudgetExhausted => "ERROR_BUDGET_EXHAUSTED",
        }
    }

    /// Reason written on the `KILL_SWITCH_ON` audit record.
    pub fn latch_reason(&self) -> &'static str {
        match self {
            Self::DailyCapExceeded => "CAP_EXCEEDED",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request inputs a policy may consult.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyContext {
    /// Replaces the stored call cap for this check only.
    pub quota_override: Option<u32>,
}

/// Outcome of a pre-call policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Latch(DenyReason),
}

/// Status a policy demands after usage feedback, with the reason to record
/// if it demands RED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    pub status: Status,
    pub reason: Option<DenyReason>,
}

impl Assessment {
    pub const GREEN: Self = Self {
        status: Status::Green,
        reason: None,
    };
}

/// A single gating rule over the daily admission state.
pub trait AdmissionPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Decide whether the next call may proceed.
    fn check(&self, state: &AdmissionState, ctx: &PolicyContext) -> Verdict;

    /// Status this policy demands given the state after a success or failure
    /// has been applied.
    fn assess(&self, _state: &AdmissionState) -> Assessment {
        Assessment::GREEN
    }
}

// ---------------------------------------------------------------------------
// Quota
// ---------------------------------------------------------------------------

/// Caps the number of admitted calls per day.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaPolicy;

impl AdmissionPolicy for QuotaPolicy {
    fn name(&self) -> &'static str {
        "quota"
    }

    fn check(&self, state: &AdmissionState, ctx: &PolicyContext) -> Verdict {
        let cap = ctx.quota_override.unwrap_or(state.call_cap);
        if state.call_count >= cap {
            Verdict::Latch(DenyReason::DailyCapExceeded)
        } else {
            Verdict::Pass
        }
    }
}

// ---------------------------------------------------------------------------
// Cost
// ---------------------------------------------------------------------------

/// Caps cumulative spend per day and warns ahead of the cap.
#[derive(Debug, Clone, Copy)]
pub struct CostPolicy {
    /// Fraction of the cost cap at which status turns YELLOW.
    pub warn_fraction: f64,
}

impl CostPolicy {
    pub fn new(warn_fraction: f64) -> Self {
        Self { warn_fraction }
    }
}

impl AdmissionPolicy for CostPolicy {
    fn name(&self) -> &'static str {
        "cost"
    }

    fn check(&self, state: &AdmissionState, _ctx: &PolicyContext) -> Verdict {
        if state.cost_cap > 0.0 && state.cost_total >= state.cost_cap {
            Verdict::Latch(DenyReason::CostCapExceeded)
        } else {
            Verdict::Pass
        }
    }

    fn assess(&self, state: &AdmissionState) -> Assessment {
        if state.cost_cap <= 0.0 {
            return Assessment::GREEN;
        }
        if state.cost_total >= state.cost_cap {
            Assessment {
                status: Status::Red,
                reason: Some(DenyReason::CostCapExceeded),
            }
        } else if state.cost_total >= self.warn_fraction * state.cost_cap {
            Assessment {
                status: Status::Yellow,
                reason: None,
            }
        } else {
            Assessment::GREEN
        }
    }
}

// ---------------------------------------------------------------------------
// Consecutive errors
// ---------------------------------------------------------------------------

/// Stops calling after too many failures in a row. `0` disables it.
#[derive(Debug, Clone, Copy)]
pub struct ErrorBudgetPolicy {
    pub max_consecutive_errors: u32,
}

impl ErrorBudgetPolicy {
    pub fn new(max_consecutive_errors: u32) -> Self {
        Self {
            max_consecutive_errors,
        }
    }

    fn exhausted(&self, state: &AdmissionState) -> bool {
        self.max_consecutive_errors > 0 && state.consecutive_errors >= self.max_consecutive_errors
    }
}

impl AdmissionPolicy for ErrorBudgetPolicy {
    fn name(&self) -> &'static str {
        "error_budget"
    }

    fn check(&self, state: &AdmissionState, _ctx: &PolicyContext) -> Verdict {
        if self.exhausted(state) {
            Verdict::Latch(DenyReason::ErrorBudgetExhausted)
        } else {
            Verdict::Pass
        }
    }

    fn assess(&self, state: &AdmissionState) -> Assessment {
        if self.exhausted(state) {
            Assessment {
                status: Status::Red,
                reason: Some(DenyReason::ErrorBudgetExhausted),
            }
        } else {
            Assessment::GREEN
        }
    }
}

// ---------------------------------------------------------------------------
// Combination
// ---------------------------------------------------------------------------

/// First latch demanded by any policy, in policy order.
pub fn first_latch(
    policies: &[Box<dyn AdmissionPolicy>],
    state: &AdmissionState,
    ctx: &PolicyContext,
) -> Option<DenyReason> {
    policies.iter().find_map(|p| match p.check(state, ctx) {
        Verdict::Latch(reason) => Some(reason),
        Verdict::Pass => None,
    })
}

/// Highest status demanded by any policy. Ties keep the first reason.
pub fn combined_assessment(
    policies: &[Box<dyn AdmissionPolicy>],
    state: &AdmissionState,
) -> Assessment {
    policies
        .iter()
        .map(|p| p.assess(state))
        .fold(Assessment::GREEN, |acc, a| if a.status > acc.status { a } else { acc })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
