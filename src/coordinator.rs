//! Get-or-compute orchestration over the cache and the admission controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, AdmissionDecision, Usage};
use crate::cache::CacheStore;

/// One logical "analyze X" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRequest {
    pub provider: String,
    pub model: String,
    pub symbol: String,
    pub prompt: String,
}

impl CacheRequest {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        symbol: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            symbol: symbol.into(),
            prompt: prompt.into(),
        }
    }
}

/// Result of a caller-supplied compute function, with the usage it incurred.
#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    pub payload: Value,
    pub usage: Usage,
}

impl Computed {
    pub fn new(payload: Value, usage: Usage) -> Self {
        Self { payload, usage }
    }
}

impl From<Value> for Computed {
    fn from(payload: Value) -> Self {
        Self {
            payload,
            usage: Usage::default(),
        }
    }
}

/// Why `resolve` produced no payload.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError<E> {
    /// Nothing fresh in the cache and the decision denied a new call.
    #[error("Admission denied: {reason}")]
    AdmissionDenied { reason: String },

    /// The compute function failed; its error is passed through as-is.
    #[error("Upstream call failed: {0}")]
    Upstream(E),
}

impl<E> ResolveError<E> {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::AdmissionDenied { .. })
    }

    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Upstream(e) => Some(e),
            Self::AdmissionDenied { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CoordinatorStats {
    hits: AtomicU64,
    ghost_hits: AtomicU64,
    misses: AtomicU64,
    denials: AtomicU64,
    computed: AtomicU64,
    upstream_failures: AtomicU64,
    write_failures: AtomicU64,
}

impl CoordinatorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            ghost_hits: self.ghost_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of coordinator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatsSnapshot {
    pub hits: u64,
    /// Hits served while the decision denied new calls.
    pub ghost_hits: u64,
    pub misses: u64,
    pub denials: u64,
    pub computed: u64,
    pub upstream_failures: u64,
    pub write_failures: u64,
}

// ---------------------------------------------------------------------------
// RequestCoordinator
// ---------------------------------------------------------------------------

/// Serves a request from the cache when possible and otherwise calls the
/// supplied compute function, if the admission decision allows it.
///
/// A fresh cached answer always wins over a denial ("Ghost Mode"). No retries
/// happen here.
pub struct RequestCoordinator {
    cache: CacheStore,
    controller: Option<Arc<AdmissionController>>,
    stats: CoordinatorStats,
}

impl RequestCoordinator {
    pub fn new(cache: CacheStore) -> Self {
        Self {
            cache,
            controller: None,
            stats: CoordinatorStats::default(),
        }
    }

    /// Feed compute outcomes back into `controller`.
    pub fn with_controller(mut self, controller: Arc<AdmissionController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn controller(&self) -> Option<&Arc<AdmissionController>> {
        self.controller.as_ref()
    }

    pub fn resolve<F, T, E>(
        &self,
        request: &CacheRequest,
        decision: &AdmissionDecision,
        compute: F,
    ) -> Result<Value, ResolveError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        T: Into<Computed>,
    {
        if let Some(entry) = self.cache.get(
            &request.provider,
            &request.model,
            &request.symbol,
            &request.prompt,
        ) {
            CoordinatorStats::bump(&self.stats.hits);
            if !decision.allowed {
                CoordinatorStats::bump(&self.stats.ghost_hits);
                info!(
                    symbol = %request.symbol,
                    reason = %decision.reason,
                    "Serving cached result while admission is denied"
                );
            }
            return Ok(entry.payload);
        }

        CoordinatorStats::bump(&self.stats.misses);

        if !decision.allowed {
            CoordinatorStats::bump(&self.stats.denials);
            debug!(symbol = %request.symbol, reason = %decision.reason, "Cache miss and admission denied");
            return Err(ResolveError::AdmissionDenied {
                reason: decision.reason.clone(),
            });
        }

        let computed = match compute() {
            Ok(value) => value.into(),
            Err(e) => {
                CoordinatorStats::bump(&self.stats.upstream_failures);
                warn!(symbol = %request.symbol, "Upstream call failed");
                if let Some(controller) = &self.controller
                    && let Err(fe) = controller.record_failure()
                {
                    warn!(error = %fe, "Failed to record upstream failure");
                }
                return Err(ResolveError::Upstream(e));
            }
        };
        CoordinatorStats::bump(&self.stats.computed);

        let Computed { payload, usage } = computed;
        if let Err(e) = self.cache.put(
            &request.provider,
            &request.model,
            &request.symbol,
            &request.prompt,
            payload.clone(),
        ) {
            CoordinatorStats::bump(&self.stats.write_failures);
            warn!(symbol = %request.symbol, error = %e, "Failed to cache computed result");
        }

        if let Some(controller) = &self.controller
            && let Err(e) = controller.record_success(usage.input_units, usage.output_units)
        {
            warn!(error = %e, "Failed to record call usage");
        }

        Ok(payload)
    }

    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.stats.snapshot()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionLimits;
    use crate::audit::MemoryAuditSink;
    use crate::clock::{Clock, ManualClock};
    use crate::lock::ProcessLock;
    use chrono::{TimeDelta, TimeZone, Utc};
    use serde_json::json;
    use std::cell::Cell;
    use std::time::Duration;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap(),
        ))
    }

    fn request() -> CacheRequest {
        CacheRequest::new("anthropic", "claude", "AAPL", "Analyze AAPL")
    }

    fn denied() -> AdmissionDecision {
        AdmissionDecision::denied("DAILY_CAP_EXCEEDED")
    }

    #[test]
    fn test_ghost_mode_serves_cache_when_denied() {
        let dir = tempfile::tempdir().unwrap();
        let coord = RequestCoordinator::new(CacheStore::new(dir.path(), 3600, clock()));
        let req = request();

        let first = coord
            .resolve(&req, &AdmissionDecision::granted(), || {
                Ok::<_, String>(json!({"verdict": "buy"}))
            })
            .unwrap();

        let called = Cell::new(false);
        let second = coord
            .resolve(&req, &denied(), || {
                called.set(true);
                Ok::<_, String>(json!({"verdict": "sell"}))
            })
            .unwrap();

        assert_eq!(first, second);
        assert!(!called.get());
        let stats = coord.stats();
        assert_eq!(stats.ghost_hits, 1);
        assert_eq!(stats.computed, 1);
    }

    #[test]
    fn test_expired_and_denied_is_admission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let coord = RequestCoordinator::new(CacheStore::new(dir.path(), 60, clock.clone()));
        let req = request();

        coord
            .resolve(&req, &AdmissionDecision::granted(), || Ok::<_, String>(json!(1)))
            .unwrap();
        clock.advance(TimeDelta::seconds(61));

        let err = coord
            .resolve(&req, &denied(), || -> Result<Value, String> {
                panic!("compute must not run when denied")
            })
            .unwrap_err();
        assert!(err.is_denied());
        assert_eq!(err.to_string(), "Admission denied: DAILY_CAP_EXCEEDED");
    }

    #[test]
    fn test_hit_skips_compute_even_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let coord = RequestCoordinator::new(CacheStore::new(dir.path(), 3600, clock()));
        let req = request();
        coord
            .resolve(&req, &AdmissionDecision::granted(), || Ok::<_, String>(json!("a")))
            .unwrap();

        let calls = Cell::new(0);
        let out = coord
            .resolve(&req, &AdmissionDecision::granted(), || {
                calls.set(calls.get() + 1);
                Ok::<_, String>(json!("b"))
            })
            .unwrap();
        assert_eq!(out, json!("a"));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_upstream_error_propagates_and_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let controller = Arc::new(AdmissionController::new(
            dir.path().join("state.json"),
            Arc::new(ProcessLock::new(Some(Duration::from_secs(1)))),
            Arc::new(MemoryAuditSink::new()),
            clock.clone(),
            AdmissionLimits::default(),
        ));
        let coord = RequestCoordinator::new(CacheStore::new(dir.path().join("cache"), 3600, clock))
            .with_controller(controller.clone());

        let err = coord
            .resolve(&request(), &AdmissionDecision::granted(), || {
                Err::<Value, _>("503 from upstream".to_string())
            })
            .unwrap_err();

        assert_eq!(err.into_upstream().as_deref(), Some("503 from upstream"));
        assert_eq!(controller.snapshot().unwrap().consecutive_errors, 1);
        assert_eq!(coord.stats().upstream_failures, 1);
        assert!(coord.cache().get("anthropic", "claude", "AAPL", "Analyze AAPL").is_none());
    }

    #[test]
    fn test_success_feeds_usage_back() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let controller = Arc::new(AdmissionController::new(
            dir.path().join("state.json"),
            Arc::new(ProcessLock::new(None)),
            Arc::new(MemoryAuditSink::new()),
            clock.clone(),
            AdmissionLimits::default(),
        ));
        controller.record_failure().unwrap();

        let coord = RequestCoordinator::new(CacheStore::new(dir.path().join("cache"), 3600, clock.clone()))
            .with_controller(controller.clone());
        coord
            .resolve(&request(), &AdmissionDecision::granted(), || {
                Ok::<_, String>(Computed::new(json!({"ok": true}), Usage::new(1_000_000, 0)))
            })
            .unwrap();

        let state = controller.snapshot().unwrap();
        assert_eq!(state.consecutive_errors, 0);
        assert!((state.cost_total - 3.0).abs() < 1e-9);
        assert_eq!(state.date, clock.today());
    }

    #[test]
    fn test_cache_write_failure_does_not_fail_request() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the cache directory should be.
        let blocker = dir.path().join("cache");
        std::fs::write(&blocker, b"").unwrap();
        let coord = RequestCoordinator::new(CacheStore::new(&blocker, 3600, clock()));

        let out = coord
            .resolve(&request(), &AdmissionDecision::granted(), || Ok::<_, String>(json!(7)))
            .unwrap();
        assert_eq!(out, json!(7));
        assert_eq!(coord.stats().write_failures, 1);
    }
}
