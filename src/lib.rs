//! Admission-and-cache gate for rate-limited inference calls.
//!
//! [`Gate`] wires a [`CacheStore`], an [`AdmissionController`] and a
//! [`RequestCoordinator`] together from one [`Config`].

pub mod admission;
pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod lock;

use std::sync::Arc;

use serde_json::Value;

use crate::admission::{AdmissionController, AdmissionDecision, AdmissionState};
use crate::audit::{AuditSink, ChannelAuditSink, JsonlAuditSink, MemoryAuditSink};
use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::config::{AuditBackend, Config};
use crate::coordinator::{CacheRequest, Computed, RequestCoordinator, ResolveError};
use crate::db::Database;
use crate::error::GateError;
use crate::lock::FileLock;

/// Everything a caller needs to gate and cache calls against one budget
/// scope.
pub struct Gate {
    coordinator: RequestCoordinator,
    controller: Arc<AdmissionController>,
    audit_task: Option<tokio::task::JoinHandle<()>>,
}

impl Gate {
    /// Build a gate with the audit sink named by `config.audit`.
    ///
    /// The SQLite backend spawns its batch writer on the current tokio
    /// runtime and fails without one.
    pub fn open(config: &Config) -> Result<Self, GateError> {
        let (audit, audit_task) = audit_sink(config)?;
        let mut gate = Self::new(config, audit, Arc::new(SystemClock));
        gate.audit_task = audit_task;
        Ok(gate)
    }

    /// Build a gate around an explicit audit sink and clock.
    pub fn new(config: &Config, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        let lock = Arc::new(FileLock::new(
            &config.admission.lock_path,
            config.lock_timeout(),
        ));
        let controller = Arc::new(AdmissionController::new(
            &config.admission.state_path,
            lock,
            audit,
            clock.clone(),
            config.limits(),
        ));
        let cache = CacheStore::new(&config.cache.dir, config.cache.ttl_secs, clock);
        let coordinator = RequestCoordinator::new(cache).with_controller(controller.clone());

        Self {
            coordinator,
            controller,
            audit_task: None,
        }
    }

    /// Ask whether one more call may go out; counts it if so.
    pub fn check_access(
        &self,
        symbol: &str,
        request_id: &str,
        quota_override: Option<u32>,
        date_override: Option<chrono::NaiveDate>,
    ) -> Result<AdmissionDecision, GateError> {
        self.controller
            .check(symbol, request_id, quota_override, date_override)
    }

    /// Serve `request` from the cache, or run `compute` if `decision` allows.
    pub fn resolve_request<F, T, E>(
        &self,
        request: &CacheRequest,
        decision: &AdmissionDecision,
        compute: F,
    ) -> Result<Value, ResolveError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        T: Into<Computed>,
    {
        self.coordinator.resolve(request, decision, compute)
    }

    pub fn record_success(
        &self,
        input_units: u64,
        output_units: u64,
    ) -> Result<AdmissionState, GateError> {
        self.controller.record_success(input_units, output_units)
    }

    pub fn record_failure(&self) -> Result<AdmissionState, GateError> {
        self.controller.record_failure()
    }

    /// Block for the current inter-call spacing.
    pub fn throttle(&self) {
        self.controller.throttle();
    }

    pub fn cache(&self) -> &CacheStore {
        self.coordinator.cache()
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    /// Drop the gate and hand back the audit writer task, if any.
    ///
    /// The task finishes once every clone of the audit sink is gone and its
    /// buffer is flushed.
    pub fn into_audit_task(self) -> Option<tokio::task::JoinHandle<()>> {
        let Self {
            coordinator,
            controller,
            audit_task,
        } = self;
        drop(coordinator);
        drop(controller);
        audit_task
    }
}

/// Build the audit sink selected by configuration.
pub fn audit_sink(
    config: &Config,
) -> Result<(Arc<dyn AuditSink>, Option<tokio::task::JoinHandle<()>>), GateError> {
    match config.audit.backend {
        AuditBackend::Jsonl => Ok((
            Arc::new(JsonlAuditSink::new(&config.audit.jsonl_path)),
            None,
        )),
        AuditBackend::Memory => Ok((Arc::new(MemoryAuditSink::new()), None)),
        AuditBackend::Sqlite => {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(GateError::InvalidConfig(
                    "the sqlite audit backend needs a running tokio runtime".to_string(),
                ));
            }
            let db = Database::open(&config.audit.db_path)
                .map_err(|e| GateError::Database(e.to_string()))?;
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let handle = audit::spawn_audit_logger(db, rx);
            tracing::debug!(path = %config.audit.db_path.display(), "Audit logger spawned");
            Ok((Arc::new(ChannelAuditSink::new(tx)), Some(handle)))
        }
    }
}
