#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tollgate::Gate;
use tollgate::audit::MemoryAuditSink;
use tollgate::clock::ManualClock;
use tollgate::config::{AuditBackend, Config};

/// Config with every persisted path under `root`.
pub fn config_in(root: &Path, call_cap: u32) -> Config {
    let mut config = Config::default();
    config.cache.dir = root.join("cache");
    config.cache.ttl_secs = 3600;
    config.admission.state_path = root.join("admission.json");
    config.admission.lock_path = root.join("admission.lock");
    config.admission.daily_call_cap = call_cap;
    config.admission.lock_timeout_ms = 10_000;
    config.admission.min_interval_ms = 0;
    config.audit.backend = AuditBackend::Memory;
    config.audit.jsonl_path = root.join("audit.jsonl");
    config.audit.db_path = root.join("tollgate.db");
    config
}

pub struct Harness {
    pub gate: Gate,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
}

pub fn harness(config: &Config) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 5, 20, 14, 0, 0).unwrap(),
    ));
    let audit = Arc::new(MemoryAuditSink::new());
    let gate = Gate::new(config, audit.clone(), clock.clone());
    Harness { gate, clock, audit }
}
