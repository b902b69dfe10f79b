pub(crate) mod fs;
pub mod key;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tracing::{debug, info, warn};

use crate::clock::Clock;

pub use self::types::{CacheEntry, CacheError, CacheStats, CacheStatsSnapshot, SweepReport};

/// Day-bucket directory name format.
const BUCKET_FORMAT: &str = "%Y-%m-%d";

const SECS_PER_DAY: u64 = 86_400;

// ---------------------------------------------------------------------------
// CacheStore -- content-addressed, day-bucketed file cache
// ---------------------------------------------------------------------------

/// Persistent TTL cache for prior call results.
///
/// Layout: `{dir}/{YYYY-MM-DD}/{sha256}.json`. Entries land in the bucket of
/// the day they were written; lookups probe the existing buckets within the
/// span the TTL can reach.
///
/// Reads take a shared file lock. Writes never lock: they go through a temp
/// file and an atomic rename, so readers never wait on writers.
pub struct CacheStore {
    dir: PathBuf,
    ttl_secs: u64,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>, ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            ttl_secs,
            clock,
            stats: CacheStats::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Look up a fresh entry.
    ///
    /// Unreadable or mismatched entries are logged and treated as absent.
    /// Every expired copy met on the way to a fresh one (or to a miss) is
    /// deleted best-effort.
    pub fn get(
        &self,
        provider: &str,
        model: &str,
        symbol: &str,
        prompt: &str,
    ) -> Option<CacheEntry> {
        let key = key::cache_key(provider, model, symbol, prompt);
        let now = self.clock.now();

        let mut found = None;
        for bucket in self.probe_buckets(now.date_naive()) {
            let path = self.entry_path(bucket, &key);
            let Some(entry) = self.load_entry(&path, &key, provider, model, symbol) else {
                continue;
            };

            if entry.is_fresh(now) {
                debug!(key = %key, symbol = %symbol, bucket = %bucket, "Cache hit");
                self.stats.record_hit();
                found = Some(entry);
                break;
            }

            debug!(key = %key, created_at = %entry.created_at, "Cache entry expired");
            self.stats.record_expired();
            if let Err(e) = fs::remove_if_exists(&path) {
                warn!(path = %path.display(), error = %e, "Failed to delete expired cache entry");
            }
        }

        if found.is_none() {
            self.stats.record_miss();
        }
        found
    }

    /// Write a new entry for the given inputs, replacing any previous one in
    /// today's bucket.
    pub fn put(
        &self,
        provider: &str,
        model: &str,
        symbol: &str,
        prompt: &str,
        payload: serde_json::Value,
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry {
            key: key::cache_key(provider, model, symbol, prompt),
            created_at: self.clock.now(),
            ttl_seconds: self.ttl_secs,
            provider: provider.to_string(),
            model: model.to_string(),
            symbol: symbol.to_string(),
            payload,
        };

        let path = self.entry_path(entry.created_at.date_naive(), &entry.key);
        let bytes = serde_json::to_vec(&entry)?;
        fs::write_atomic(&path, &bytes)?;

        self.stats.record_write();
        debug!(key = %entry.key, symbol = %symbol, path = %path.display(), "Cache entry written");
        Ok(entry)
    }

    /// Remove day buckets older than `retain_days` days before today.
    ///
    /// `retain_days = 0` keeps only today's bucket. Directories whose name is
    /// not a date are left alone.
    pub fn sweep(&self, retain_days: u32) -> Result<SweepReport, CacheError> {
        let today = self.clock.today();
        let cutoff = today
            .checked_sub_days(Days::new(u64::from(retain_days)))
            .unwrap_or(NaiveDate::MIN);

        let mut report = SweepReport::default();
        let dir_entries = match std::fs::read_dir(&self.dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(CacheError::io(&self.dir, e)),
        };

        for dir_entry in dir_entries {
            let dir_entry = dir_entry.map_err(|e| CacheError::io(&self.dir, e))?;
            let name = dir_entry.file_name();
            let Ok(bucket) = NaiveDate::parse_from_str(&name.to_string_lossy(), BUCKET_FORMAT)
            else {
                continue;
            };

            if bucket >= cutoff {
                report.kept_buckets += 1;
                continue;
            }

            match std::fs::remove_dir_all(dir_entry.path()) {
                Ok(()) => report.removed_buckets.push(bucket),
                Err(e) => {
                    warn!(bucket = %bucket, error = %e, "Failed to remove cache bucket");
                    report.failed_buckets += 1;
                }
            }
        }

        report.removed_buckets.sort();
        info!(
            removed = report.removed_buckets.len(),
            kept = report.kept_buckets,
            failed = report.failed_buckets,
            "Cache sweep finished"
        );
        Ok(report)
    }

    /// Get cache statistics snapshot.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn entry_path(&self, bucket: NaiveDate, key: &str) -> PathBuf {
        self.dir
            .join(bucket.format(BUCKET_FORMAT).to_string())
            .join(format!("{key}.json"))
    }

    /// Existing buckets that may hold a fresh entry, newest first.
    ///
    /// Lists the cache directory instead of walking every date in the span,
    /// so a long TTL costs no more than the buckets actually on disk.
    fn probe_buckets(&self, today: NaiveDate) -> Vec<NaiveDate> {
        let span = self.ttl_secs / SECS_PER_DAY + 1;
        let oldest = today
            .checked_sub_days(Days::new(span))
            .unwrap_or(NaiveDate::MIN);

        let dir_entries = match std::fs::read_dir(&self.dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list cache buckets");
                return Vec::new();
            }
        };

        let mut buckets: Vec<NaiveDate> = dir_entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                NaiveDate::parse_from_str(&entry.file_name().to_string_lossy(), BUCKET_FORMAT).ok()
            })
            .filter(|bucket| (oldest..=today).contains(bucket))
            .collect();
        buckets.sort_unstable_by(|a, b| b.cmp(a));
        buckets
    }

    fn load_entry(
        &self,
        path: &Path,
        key: &str,
        provider: &str,
        model: &str,
        symbol: &str,
    ) -> Option<CacheEntry> {
        let content = match fs::read_shared(path) {
            Ok(Some(c)) => c,
            Ok(None) => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cache entry, treating as miss");
                self.stats.record_corrupt();
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache entry, treating as miss");
                self.stats.record_corrupt();
                return None;
            }
        };

        if entry.key != key
            || entry.provider != provider
            || entry.model != model
            || entry.symbol != symbol
        {
            warn!(
                path = %path.display(),
                stored_key = %entry.key,
                "Cache entry does not match its slot, treating as miss"
            );
            self.stats.record_corrupt();
            return None;
        }

        Some(entry)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
