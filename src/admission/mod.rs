pub mod cost;
pub mod policy;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditRecord, AuditSink};
use crate::clock::Clock;
use crate::error::GateError;
use crate::lock::AdvisoryLock;

pub use self::cost::{CostRates, Usage};
pub use self::policy::{
    AdmissionPolicy, CostPolicy, DenyReason, ErrorBudgetPolicy, PolicyContext, QuotaPolicy,
};
pub use self::state::{AdmissionState, LoadedState, StateFile, Status};

/// Reason carried by an allowed decision.
pub const ALLOWED: &str = "OK";

/// Request id stamped on audit records produced by usage feedback, which is
/// not tied to a single admitted request.
const FEEDBACK_REQUEST_ID: &str = "feedback";

/// Symbol stamped on audit records that concern the whole budget.
const ALL_SYMBOLS: &str = "*";

/// Daily limits and pacing for one budget scope.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionLimits {
    pub call_cap: u32,
    /// `0` disables cost gating.
    pub cost_cap: f64,
    pub warn_fraction: f64,
    /// `0` disables the consecutive-error latch.
    pub max_consecutive_errors: u32,
    pub min_interval: Duration,
    pub rates: CostRates,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            call_cap: 100,
            cost_cap: 0.0,
            warn_fraction: 0.8,
            max_consecutive_errors: 5,
            min_interval: Duration::from_millis(500),
            rates: CostRates::default(),
        }
    }
}

/// Verdict of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: String,
    /// Call count after this check.
    pub call_count: u32,
    pub status: Status,
}

impl AdmissionDecision {
    /// A grant that did not come from a controller.
    pub fn granted() -> Self {
        Self {
            allowed: true,
            reason: ALLOWED.to_string(),
            call_count: 0,
            status: Status::Green,
        }
    }

    /// A denial that did not come from a controller.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            call_count: 0,
            status: Status::Red,
        }
    }

    fn deny(reason: DenyReason, state: &AdmissionState) -> Self {
        Self {
            allowed: false,
            reason: reason.as_str().to_string(),
            call_count: state.call_count,
            status: state.status,
        }
    }
}

/// The standard policy set: quota, cost, consecutive errors.
pub fn default_policies(limits: &AdmissionLimits) -> Vec<Box<dyn AdmissionPolicy>> {
    vec![
        Box::new(QuotaPolicy),
        Box::new(CostPolicy::new(limits.warn_fraction)),
        Box::new(ErrorBudgetPolicy::new(limits.max_consecutive_errors)),
    ]
}

// ---------------------------------------------------------------------------
// AdmissionController
// ---------------------------------------------------------------------------

/// Per-day quota/cost/error-budget governor shared by every process that
/// points at the same state file and lock.
///
/// Every mutation runs load → evaluate → persist while holding the advisory
/// lock, so concurrent checks can never both admit the last slot.
pub struct AdmissionController {
    state_file: StateFile,
    lock: Arc<dyn AdvisoryLock>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    limits: AdmissionLimits,
    policies: Vec<Box<dyn AdmissionPolicy>>,
}

impl AdmissionController {
    pub fn new(
        state_path: impl Into<PathBuf>,
        lock: Arc<dyn AdvisoryLock>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        limits: AdmissionLimits,
    ) -> Self {
        let policies = default_policies(&limits);
        Self {
            state_file: StateFile::new(state_path),
            lock,
            audit,
            clock,
            limits,
            policies,
        }
    }

    /// Replace the policy set.
    pub fn with_policies(mut self, policies: Vec<Box<dyn AdmissionPolicy>>) -> Self {
        self.policies = policies;
        self
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    pub fn state_file(&self) -> &StateFile {
        &self.state_file
    }

    /// Decide whether one more call may go out, and count it if so.
    ///
    /// `quota_override` replaces the stored call cap for this check.
    /// `date_override` stands in for "today" when deciding on rollover.
    ///
    /// Any date other than the stored one starts a fresh record, backwards as
    /// well as forwards. A check dated tomorrow followed by a plain check today
    /// therefore discards tomorrow's record and reopens today, even if today
    /// had latched. Callers that override dates own that ordering.
    pub fn check(
        &self,
        symbol: &str,
        request_id: &str,
        quota_override: Option<u32>,
        date_override: Option<NaiveDate>,
    ) -> Result<AdmissionDecision, GateError> {
        let _guard = self.lock.acquire()?;

        let day = date_override.unwrap_or_else(|| self.clock.today());
        let mut state = self.load_for_day(day, request_id, symbol)?;

        if state.kill_switch {
            let reason = DenyReason::KillSwitchActive;
            self.record(request_id, symbol, AuditEvent::Reject, state.call_count, reason.as_str());
            debug!(symbol = %symbol, request_id = %request_id, "Kill switch active, rejecting");
            return Ok(AdmissionDecision::deny(reason, &state));
        }

        let ctx = PolicyContext { quota_override };
        if let Some(reason) = policy::first_latch(&self.policies, &state, &ctx) {
            state.latch();
            self.state_file.save(&state)?;
            self.record(
                request_id,
                symbol,
                AuditEvent::KillSwitchOn,
                state.call_count,
                reason.latch_reason(),
            );
            warn!(
                symbol = %symbol,
                request_id = %request_id,
                call_count = state.call_count,
                reason = %reason,
                "Kill switch latched"
            );
            return Ok(AdmissionDecision::deny(reason, &state));
        }

        state.call_count += 1;
        self.state_file.save(&state)?;
        self.record(request_id, symbol, AuditEvent::Allow, state.call_count, ALLOWED);
        debug!(
            symbol = %symbol,
            request_id = %request_id,
            call_count = state.call_count,
            "Call admitted"
        );

        Ok(AdmissionDecision {
            allowed: true,
            reason: ALLOWED.to_string(),
            call_count: state.call_count,
            status: state.status,
        })
    }

    /// Account for a completed call: add its cost and clear the error streak.
    ///
    /// A cost that would leave the daily total non-finite is refused and the
    /// stored record is left untouched.
    pub fn record_success(
        &self,
        input_units: u64,
        output_units: u64,
    ) -> Result<AdmissionState, GateError> {
        let _guard = self.lock.acquire()?;

        let mut state = self.load_for_day(self.clock.today(), FEEDBACK_REQUEST_ID, ALL_SYMBOLS)?;
        let delta = self.limits.rates.cost(input_units, output_units);
        let cost_total = state.cost_total + delta;
        if !cost_total.is_finite() {
            warn!(delta, cost_total = state.cost_total, "Refusing non-finite call cost");
            return Err(GateError::State(format!(
                "call cost {delta} would make the daily cost total non-finite"
            )));
        }
        state.cost_total = cost_total;
        state.consecutive_errors = 0;
        self.reassess(&mut state);

        self.state_file.save(&state)?;
        Ok(state)
    }

    /// Account for a failed call.
    pub fn record_failure(&self) -> Result<AdmissionState, GateError> {
        let _guard = self.lock.acquire()?;

        let mut state = self.load_for_day(self.clock.today(), FEEDBACK_REQUEST_ID, ALL_SYMBOLS)?;
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        debug!(consecutive_errors = state.consecutive_errors, "Recorded call failure");
        self.reassess(&mut state);

        self.state_file.save(&state)?;
        Ok(state)
    }

    /// Minimum spacing between calls; doubled while the day is YELLOW.
    pub fn throttle_delay(&self) -> Duration {
        let base = self.limits.min_interval;
        match self.current_state() {
            Ok(state) if state.status == Status::Yellow => base.saturating_mul(2),
            Ok(_) => base,
            Err(e) => {
                warn!(error = %e, "Failed to read admission state for throttling");
                base
            }
        }
    }

    /// Sleep on the calling thread for [`throttle_delay`](Self::throttle_delay).
    pub fn throttle(&self) {
        let delay = self.throttle_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// Current state as of today, for reporting.
    ///
    /// Read without the lock and never persisted: a missing, stale or corrupt
    /// record is reported as today's fresh default.
    pub fn snapshot(&self) -> Result<AdmissionState, GateError> {
        self.current_state()
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn fresh(&self, day: NaiveDate) -> AdmissionState {
        AdmissionState::fresh(day, self.limits.call_cap, self.limits.cost_cap)
    }

    fn current_state(&self) -> Result<AdmissionState, GateError> {
        let today = self.clock.today();
        Ok(match self.state_file.load()? {
            LoadedState::Loaded(state) if state.date == today => state,
            _ => self.fresh(today),
        })
    }

    /// Load the record for `day`, replacing it wholesale if it is missing,
    /// corrupt or belongs to another day. Caller holds the lock.
    fn load_for_day(
        &self,
        day: NaiveDate,
        request_id: &str,
        symbol: &str,
    ) -> Result<AdmissionState, GateError> {
        match self.state_file.load()? {
            LoadedState::Loaded(state) if state.date == day => Ok(state),
            LoadedState::Loaded(state) => {
                info!(from = %state.date, to = %day, "Admission day rollover");
                self.record(request_id, symbol, AuditEvent::Reset, 0, "DAY_ROLLOVER");
                Ok(self.fresh(day))
            }
            LoadedState::Missing => {
                debug!(path = %self.state_file.path().display(), "Creating admission state");
                Ok(self.fresh(day))
            }
            LoadedState::Corrupt(reason) => {
                warn!(
                    path = %self.state_file.path().display(),
                    reason = %reason,
                    "Admission state unreadable, rebuilding fresh-day default"
                );
                self.record(request_id, symbol, AuditEvent::Error, 0, "STATE_CORRUPTED");
                Ok(self.fresh(day))
            }
        }
    }

    /// Apply every policy's assessment; latch if any demands RED.
    fn reassess(&self, state: &mut AdmissionState) {
        let assessment = policy::combined_assessment(&self.policies, state);
        let before = state.status;
        state.escalate(assessment.status);

        if assessment.status == Status::Red && !state.kill_switch {
            state.latch();
            let reason = assessment
                .reason
                .map(|r| r.latch_reason())
                .unwrap_or("POLICY_LATCH");
            self.record(
                FEEDBACK_REQUEST_ID,
                ALL_SYMBOLS,
                AuditEvent::KillSwitchOn,
                state.call_count,
                reason,
            );
            warn!(
                reason,
                cost_total = state.cost_total,
                consecutive_errors = state.consecutive_errors,
                "Kill switch latched"
            );
        } else if state.status != before {
            info!(from = %before, to = %state.status, cost_total = state.cost_total, "Admission status raised");
        }
    }

    fn record(
        &self,
        request_id: &str,
        symbol: &str,
        event: AuditEvent,
        call_count_snapshot: u32,
        reason: &str,
    ) {
        self.audit.record(AuditRecord {
            timestamp: self.clock.now(),
            request_id: request_id.to_string(),
            symbol: symbol.to_string(),
            event,
            call_count_snapshot,
            reason: reason.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use crate::lock::ProcessLock;
    use chrono::{TimeDelta, TimeZone, Utc};

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        audit: Arc<MemoryAuditSink>,
        controller: AdmissionController,
    }

    fn fixture(limits: AdmissionLimits) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
        ));
        let audit = Arc::new(MemoryAuditSink::new());
        let controller = AdmissionController::new(
            dir.path().join("admission.json"),
            Arc::new(ProcessLock::new(None)),
            audit.clone(),
            clock.clone(),
            limits,
        );
        Fixture {
            _dir: dir,
            clock,
            audit,
            controller,
        }
    }

    fn limits(call_cap: u32) -> AdmissionLimits {
        AdmissionLimits {
            call_cap,
            cost_cap: 1.0,
            warn_fraction: 0.5,
            max_consecutive_errors: 3,
            min_interval: Duration::from_millis(100),
            rates: CostRates::new(1.0, 1.0),
        }
    }

    fn next_day(f: &Fixture) -> NaiveDate {
        f.clock.today().succ_opt().unwrap()
    }

    #[test]
    fn test_cap_of_three_then_next_day() {
        let f = fixture(limits(3));
        let c = &f.controller;

        for expected in 1..=3 {
            let d = c.check("X", &format!("r{expected}"), None, None).unwrap();
            assert!(d.allowed);
            assert_eq!(d.call_count, expected);
            assert_eq!(d.reason, ALLOWED);
        }

        let d = c.check("X", "r4", None, None).unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reason, "DAILY_CAP_EXCEEDED");
        let state = c.snapshot().unwrap();
        assert!(state.kill_switch);
        assert_eq!(state.status, Status::Red);

        let d = c.check("X", "r5", None, Some(next_day(&f))).unwrap();
        assert!(d.allowed);
        assert_eq!(d.call_count, 1);
    }

    #[test]
    fn test_latched_day_rejects_with_kill_switch_reason() {
        let f = fixture(limits(1));
        let c = &f.controller;
        assert!(c.check("X", "r1", None, None).unwrap().allowed);
        assert_eq!(c.check("X", "r2", None, None).unwrap().reason, "DAILY_CAP_EXCEEDED");

        let d = c.check("X", "r3", Some(50), None).unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reason, "KILL_SWITCH_ACTIVE");

        assert_eq!(
            f.audit.events(),
            vec![AuditEvent::Allow, AuditEvent::KillSwitchOn, AuditEvent::Reject]
        );
        let latch = &f.audit.records()[1];
        assert_eq!(latch.reason, "CAP_EXCEEDED");
    }

    #[test]
    fn test_quota_override_replaces_stored_cap() {
        let f = fixture(limits(1));
        let c = &f.controller;
        assert!(c.check("X", "r1", Some(2), None).unwrap().allowed);
        assert!(c.check("X", "r2", Some(2), None).unwrap().allowed);
        assert!(!c.check("X", "r3", Some(2), None).unwrap().allowed);
    }

    #[test]
    fn test_rollover_resets_everything() {
        let f = fixture(limits(2));
        let c = &f.controller;
        c.check("X", "r1", None, None).unwrap();
        c.check("X", "r2", None, None).unwrap();
        c.check("X", "r3", None, None).unwrap();
        c.record_failure().unwrap();
        assert!(c.snapshot().unwrap().kill_switch);

        f.clock.advance(TimeDelta::days(1));
        let d = c.check("X", "r4", None, None).unwrap();
        assert!(d.allowed);

        let state = c.snapshot().unwrap();
        assert_eq!(state.date, f.clock.today());
        assert_eq!(state.call_count, 1);
        assert_eq!(state.consecutive_errors, 0);
        assert!(!state.kill_switch);
        assert_eq!(state.status, Status::Green);
        assert!(f.audit.events().contains(&AuditEvent::Reset));
    }

    #[test]
    fn test_backward_date_also_starts_fresh_record() {
        let f = fixture(limits(1));
        let c = &f.controller;
        let today = f.clock.today();
        let tomorrow = next_day(&f);

        assert!(c.check("X", "r1", None, None).unwrap().allowed);
        assert!(!c.check("X", "r2", None, None).unwrap().allowed);
        assert!(c.check("X", "r3", None, Some(tomorrow)).unwrap().allowed);

        let d = c.check("X", "r4", None, Some(today)).unwrap();
        assert!(d.allowed);
        assert_eq!(d.call_count, 1);
        let resets = f
            .audit
            .events()
            .iter()
            .filter(|e| **e == AuditEvent::Reset)
            .count();
        assert_eq!(resets, 2);
    }

    #[test]
    fn test_non_finite_cost_never_resets_quota() {
        let mut l = limits(2);
        l.cost_cap = 0.0;
        l.rates = CostRates::new(f64::INFINITY, 0.0);
        let f = fixture(l);
        let c = &f.controller;

        let mut allowed = 0;
        for i in 0..6 {
            if c.check("X", &format!("r{i}"), None, None).unwrap().allowed {
                allowed += 1;
                assert!(matches!(c.record_success(1000, 0), Err(GateError::State(_))));
            }
        }
        assert_eq!(allowed, 2);

        let raw = std::fs::read_to_string(c.state_file().path()).unwrap();
        assert!(!raw.contains("null"));
        match c.state_file().load().unwrap() {
            LoadedState::Loaded(state) => {
                assert_eq!(state.call_count, 2);
                assert_eq!(state.cost_total, 0.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cost_drives_yellow_then_red() {
        let f = fixture(limits(100));
        let c = &f.controller;

        // 0.3 USD
        let s = c.record_success(300_000, 0).unwrap();
        assert_eq!(s.status, Status::Green);

        // 0.6 USD >= 0.5 * 1.0
        let s = c.record_success(300_000, 0).unwrap();
        assert_eq!(s.status, Status::Yellow);
        assert_eq!(c.throttle_delay(), Duration::from_millis(200));

        // 1.05 USD >= 1.0
        let s = c.record_success(0, 450_000).unwrap();
        assert_eq!(s.status, Status::Red);
        assert!(s.kill_switch);

        let d = c.check("X", "r1", None, None).unwrap();
        assert_eq!(d.reason, "KILL_SWITCH_ACTIVE");

        let latch = f
            .audit
            .records()
            .into_iter()
            .find(|r| r.event == AuditEvent::KillSwitchOn)
            .unwrap();
        assert_eq!(latch.reason, "COST_CAP_EXCEEDED");
    }

    #[test]
    fn test_consecutive_failures_latch() {
        let f = fixture(limits(100));
        let c = &f.controller;

        c.record_failure().unwrap();
        c.record_failure().unwrap();
        // A success clears the streak.
        c.record_success(1, 1).unwrap();
        c.record_failure().unwrap();
        c.record_failure().unwrap();
        assert!(!c.snapshot().unwrap().kill_switch);

        let s = c.record_failure().unwrap();
        assert!(s.kill_switch);
        assert_eq!(s.status, Status::Red);
        assert!(!c.check("X", "r", None, None).unwrap().allowed);
    }

    #[test]
    fn test_throttle_delay_base() {
        let f = fixture(limits(10));
        assert_eq!(f.controller.throttle_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_corrupt_state_rebuilt_and_audited() {
        let f = fixture(limits(5));
        std::fs::write(f.controller.state_file().path(), "garbage").unwrap();

        let d = f.controller.check("X", "r1", None, None).unwrap();
        assert!(d.allowed);
        assert_eq!(d.call_count, 1);

        let error = &f.audit.records()[0];
        assert_eq!(error.event, AuditEvent::Error);
        assert_eq!(error.reason, "STATE_CORRUPTED");
        assert!(matches!(
            f.controller.state_file().load().unwrap(),
            LoadedState::Loaded(_)
        ));
    }

    #[test]
    fn test_snapshot_does_not_persist() {
        let f = fixture(limits(5));
        let state = f.controller.snapshot().unwrap();
        assert_eq!(state.call_count, 0);
        assert!(!f.controller.state_file().path().exists());
    }

    #[derive(Debug, Clone)]
    enum Feedback {
        Success(u64, u64),
        Failure,
        Check,
    }

    fn feedback() -> impl proptest::strategy::Strategy<Value = Feedback> {
        use proptest::prelude::*;
        prop_oneof![
            (0u64..400_000, 0u64..400_000).prop_map(|(i, o)| Feedback::Success(i, o)),
            Just(Feedback::Failure),
            Just(Feedback::Check),
        ]
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

        #[test]
        fn prop_status_never_regresses_within_a_day(
            ops in proptest::collection::vec(feedback(), 1..40)
        ) {
            let f = fixture(limits(20));
            let c = &f.controller;
            let mut last = Status::Green;

            for op in ops {
                match op {
                    Feedback::Success(i, o) => { c.record_success(i, o).unwrap(); }
                    Feedback::Failure => { c.record_failure().unwrap(); }
                    Feedback::Check => { c.check("X", "r", None, None).unwrap(); }
                }
                let state = c.snapshot().unwrap();
                proptest::prop_assert!(state.status >= last);
                if state.kill_switch {
                    proptest::prop_assert_eq!(state.status, Status::Red);
                }
                last = state.status;
            }
        }
    }

    #[test]
    fn test_custom_policy_set() {
        let f = fixture(limits(1));
        let c = f.controller.with_policies(vec![Box::new(ErrorBudgetPolicy::new(1))]);
        // No quota policy: the cap is not enforced.
        for i in 0..5 {
            assert!(c.check("X", &format!("r{i}"), None, None).unwrap().allowed);
        }
    }
}
