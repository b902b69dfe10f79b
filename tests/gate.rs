mod common;

use std::cell::Cell;

use chrono::TimeDelta;
use serde_json::json;
use tollgate::Gate;
use tollgate::admission::{AdmissionDecision, Status, Usage};
use tollgate::audit::{AuditEvent, AuditRecord};
use tollgate::clock::Clock;
use tollgate::config::AuditBackend;
use tollgate::coordinator::{CacheRequest, Computed, ResolveError};

fn request(symbol: &str) -> CacheRequest {
    CacheRequest::new("anthropic", "claude", symbol, format!("Analyze {symbol}"))
}

#[test]
fn test_ghost_mode_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let h = common::harness(&common::config_in(dir.path(), 1));
    let req = request("AAPL");

    let first = h.gate.check_access("AAPL", "r1", None, None).unwrap();
    assert!(first.allowed);
    let payload = h
        .gate
        .resolve_request(&req, &first, || {
            Ok::<_, String>(Computed::new(json!({"verdict": "buy"}), Usage::new(1200, 300)))
        })
        .unwrap();

    let second = h.gate.check_access("AAPL", "r2", None, None).unwrap();
    assert!(!second.allowed);
    assert_eq!(second.reason, "DAILY_CAP_EXCEEDED");

    let called = Cell::new(false);
    let ghost = h
        .gate
        .resolve_request(&req, &second, || {
            called.set(true);
            Ok::<_, String>(json!({"verdict": "sell"}))
        })
        .unwrap();
    assert_eq!(ghost, payload);
    assert!(!called.get());

    // A different symbol has nothing cached: the denial stands.
    let err = h
        .gate
        .resolve_request(&request("MSFT"), &second, || Ok::<_, String>(json!(null)))
        .unwrap_err();
    assert!(matches!(err, ResolveError::AdmissionDenied { ref reason } if reason == "DAILY_CAP_EXCEEDED"));
}

#[test]
fn test_ttl_boundary_with_denial() {
    let dir = tempfile::tempdir().unwrap();
    let h = common::harness(&common::config_in(dir.path(), 10));
    let req = request("NVDA");

    h.gate
        .resolve_request(&req, &AdmissionDecision::granted(), || {
            Ok::<_, String>(json!("cached"))
        })
        .unwrap();

    h.clock.advance(TimeDelta::seconds(3599));
    let hit = h
        .gate
        .resolve_request(&req, &AdmissionDecision::denied("KILL_SWITCH_ACTIVE"), || {
            Ok::<_, String>(json!("fresh"))
        })
        .unwrap();
    assert_eq!(hit, json!("cached"));

    h.clock.advance(TimeDelta::seconds(1));
    let err = h
        .gate
        .resolve_request(&req, &AdmissionDecision::denied("KILL_SWITCH_ACTIVE"), || {
            Ok::<_, String>(json!("fresh"))
        })
        .unwrap_err();
    assert!(err.is_denied());
}

#[test]
fn test_cap_example_with_next_day_override() {
    let dir = tempfile::tempdir().unwrap();
    let h = common::harness(&common::config_in(dir.path(), 3));

    let counts: Vec<u32> = (1..=3)
        .map(|i| {
            let d = h.gate.check_access("X", &format!("r{i}"), None, None).unwrap();
            assert!(d.allowed);
            d.call_count
        })
        .collect();
    assert_eq!(counts, vec![1, 2, 3]);

    let fourth = h.gate.check_access("X", "r4", None, None).unwrap();
    assert!(!fourth.allowed);
    assert_eq!(fourth.reason, "DAILY_CAP_EXCEEDED");
    assert!(h.gate.controller().snapshot().unwrap().kill_switch);

    let tomorrow = h.clock.today().succ_opt().unwrap();
    let fifth = h.gate.check_access("X", "r5", None, Some(tomorrow)).unwrap();
    assert!(fifth.allowed);
    assert_eq!(fifth.call_count, 1);
}

#[test]
fn test_rollover_clears_latched_day() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config_in(dir.path(), 100);
    config.admission.daily_cost_cap = 0.01;
    let h = common::harness(&config);

    let state = h.gate.record_success(1_000, 1_000).unwrap();
    assert_eq!(state.status, Status::Red);
    assert_eq!(
        h.gate.check_access("X", "r1", None, None).unwrap().reason,
        "KILL_SWITCH_ACTIVE"
    );

    h.clock.advance(TimeDelta::days(1));
    let d = h.gate.check_access("X", "r2", None, None).unwrap();
    assert!(d.allowed);
    assert_eq!(d.status, Status::Green);

    let events = h.audit.events();
    assert_eq!(
        events,
        vec![
            AuditEvent::KillSwitchOn,
            AuditEvent::Reject,
            AuditEvent::Reset,
            AuditEvent::Allow
        ]
    );
}

#[test]
fn test_upstream_failures_trip_error_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config_in(dir.path(), 100);
    config.admission.max_consecutive_errors = 2;
    let h = common::harness(&config);

    for i in 0..2 {
        let req = request(&format!("SYM{i}"));
        let d = h.gate.check_access(&req.symbol, &format!("r{i}"), None, None).unwrap();
        let err = h
            .gate
            .resolve_request(&req, &d, || Err::<serde_json::Value, _>("timeout"))
            .unwrap_err();
        assert_eq!(err.into_upstream(), Some("timeout"));
    }

    let d = h.gate.check_access("SYM9", "r9", None, None).unwrap();
    assert!(!d.allowed);
    assert_eq!(d.reason, "KILL_SWITCH_ACTIVE");
    let latch = h
        .audit
        .records()
        .into_iter()
        .find(|r| r.event == AuditEvent::KillSwitchOn)
        .unwrap();
    assert_eq!(latch.reason, "ERROR_BUDGET_EXHAUSTED");
}

#[test]
fn test_open_with_jsonl_audit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config_in(dir.path(), 1);
    config.audit.backend = AuditBackend::Jsonl;

    let gate = Gate::open(&config).unwrap();
    gate.check_access("AAPL", "r1", None, None).unwrap();
    gate.check_access("AAPL", "r2", None, None).unwrap();
    assert!(gate.into_audit_task().is_none());

    let content = std::fs::read_to_string(&config.audit.jsonl_path).unwrap();
    let records: Vec<AuditRecord> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let events: Vec<_> = records.iter().map(|r| r.event).collect();
    assert_eq!(events, vec![AuditEvent::Allow, AuditEvent::KillSwitchOn]);
    assert_eq!(records[1].reason, "CAP_EXCEEDED");
}

#[test]
fn test_open_sqlite_without_runtime_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config_in(dir.path(), 1);
    config.audit.backend = AuditBackend::Sqlite;
    assert!(Gate::open(&config).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_open_with_sqlite_audit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config_in(dir.path(), 2);
    config.audit.backend = AuditBackend::Sqlite;

    let gate = Gate::open(&config).unwrap();
    for i in 0..3 {
        gate.check_access("AAPL", &format!("r{i}"), None, None).unwrap();
    }
    let task = gate.into_audit_task().unwrap();
    task.await.unwrap();

    let db = tollgate::db::Database::open(&config.audit.db_path).unwrap();
    // ALLOW, ALLOW, KILL_SWITCH_ON
    assert_eq!(db.audit_count().unwrap(), 3);
}
