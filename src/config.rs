use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::admission::{AdmissionLimits, CostRates};
use crate::error::GateError;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
///
/// `tollgate config` uses this to show where an effective value came from.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "cache.ttl_secs") is overridden by an env var.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Get all overrides as a map of setting key -> env var name.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Day buckets older than this are removed by `sweep`.
    #[serde(default = "default_retain_days")]
    pub retain_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: default_ttl_secs(),
            retain_days: default_retain_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
    #[serde(default = "default_daily_call_cap")]
    pub daily_call_cap: u32,
    /// USD. `0` disables cost gating.
    #[serde(default)]
    pub daily_cost_cap: f64,
    /// Fraction of `daily_cost_cap` at which the day turns YELLOW.
    #[serde(default = "default_warn_fraction")]
    pub warn_fraction: f64,
    /// `0` disables the consecutive-error latch.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// `0` waits forever.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default)]
    pub rates: CostRates,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            lock_path: default_lock_path(),
            daily_call_cap: default_daily_call_cap(),
            daily_cost_cap: 0.0,
            warn_fraction: default_warn_fraction(),
            max_consecutive_errors: default_max_consecutive_errors(),
            min_interval_ms: default_min_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            rates: CostRates::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditBackend {
    #[default]
    Jsonl,
    Sqlite,
    Memory,
}

impl std::fmt::Display for AuditBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jsonl => write!(f, "jsonl"),
            Self::Sqlite => write!(f, "sqlite"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for AuditBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jsonl" | "file" => Ok(Self::Jsonl),
            "sqlite" | "db" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            _ => Err(format!("Unknown audit backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub backend: AuditBackend,
    #[serde(default = "default_audit_jsonl_path")]
    pub jsonl_path: PathBuf,
    #[serde(default = "default_audit_db_path")]
    pub db_path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            backend: AuditBackend::default(),
            jsonl_path: default_audit_jsonl_path(),
            db_path: default_audit_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value functions for serde.
fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tollgate"))
        .unwrap_or_else(|| PathBuf::from(".tollgate"))
}
fn default_cache_dir() -> PathBuf {
    data_dir().join("cache")
}
const fn default_ttl_secs() -> u64 {
    6 * 60 * 60
}
const fn default_retain_days() -> u32 {
    7
}
fn default_state_path() -> PathBuf {
    data_dir().join("admission.json")
}
fn default_lock_path() -> PathBuf {
    data_dir().join("admission.lock")
}
const fn default_daily_call_cap() -> u32 {
    100
}
const fn default_warn_fraction() -> f64 {
    0.8
}
const fn default_max_consecutive_errors() -> u32 {
    5
}
const fn default_min_interval_ms() -> u64 {
    500
}
const fn default_lock_timeout_ms() -> u64 {
    30_000
}
fn default_audit_jsonl_path() -> PathBuf {
    data_dir().join("audit.jsonl")
}
fn default_audit_db_path() -> PathBuf {
    data_dir().join("tollgate.db")
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `TOLLGATE_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default config file location: `$XDG_CONFIG_HOME/tollgate/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("tollgate").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("tollgate.toml"))
    }

    /// Save the current (file-level) configuration to a TOML file.
    /// This serializes the config without env overrides applied.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {e}"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings no gate can run with.
    pub fn validate(&self) -> Result<(), GateError> {
        let a = &self.admission;
        if !(a.warn_fraction > 0.0 && a.warn_fraction <= 1.0) {
            return Err(GateError::InvalidConfig(format!(
                "admission.warn_fraction must be in (0, 1], got {}",
                a.warn_fraction
            )));
        }
        if a.daily_cost_cap < 0.0 || !a.daily_cost_cap.is_finite() {
            return Err(GateError::InvalidConfig(format!(
                "admission.daily_cost_cap must be a non-negative number, got {}",
                a.daily_cost_cap
            )));
        }
        a.rates.validate()?;
        if self.cache.ttl_secs == 0 {
            return Err(GateError::InvalidConfig(
                "cache.ttl_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Admission limits as seeded into each day's record.
    pub fn limits(&self) -> AdmissionLimits {
        let a = &self.admission;
        AdmissionLimits {
            call_cap: a.daily_call_cap,
            cost_cap: a.daily_cost_cap,
            warn_fraction: a.warn_fraction,
            max_consecutive_errors: a.max_consecutive_errors,
            min_interval: Duration::from_millis(a.min_interval_ms),
            rates: a.rates,
        }
    }

    /// Bound on lock acquisition; `None` waits forever.
    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.admission.lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Every supported setting has a corresponding `TOLLGATE_*` env var. When
    /// set, the env var value replaces the file/default value and the setting
    /// key is recorded in `env_overrides`.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        // -- Helpers (macros for concise per-field overrides) --

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    match val.parse() {
                        Ok(parsed) => {
                            $field = parsed;
                            ov.record($key, $env);
                        }
                        Err(_) => {
                            tracing::warn!(env = $env, value = %val, "Ignoring unparseable override");
                        }
                    }
                }
            };
        }
        macro_rules! env_path {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = PathBuf::from(val);
                    ov.record($key, $env);
                }
            };
        }

        // -- Cache --
        env_path!("cache.dir", "TOLLGATE_CACHE_DIR", self.cache.dir);
        env_parse!("cache.ttl_secs", "TOLLGATE_CACHE_TTL_SECS", self.cache.ttl_secs);
        env_parse!(
            "cache.retain_days",
            "TOLLGATE_CACHE_RETAIN_DAYS",
            self.cache.retain_days
        );

        // -- Admission --
        env_path!(
            "admission.state_path",
            "TOLLGATE_STATE_PATH",
            self.admission.state_path
        );
        env_path!(
            "admission.lock_path",
            "TOLLGATE_LOCK_PATH",
            self.admission.lock_path
        );
        env_parse!(
            "admission.daily_call_cap",
            "TOLLGATE_DAILY_CALL_CAP",
            self.admission.daily_call_cap
        );
        env_parse!(
            "admission.daily_cost_cap",
            "TOLLGATE_DAILY_COST_CAP",
            self.admission.daily_cost_cap
        );
        env_parse!(
            "admission.warn_fraction",
            "TOLLGATE_WARN_FRACTION",
            self.admission.warn_fraction
        );
        env_parse!(
            "admission.max_consecutive_errors",
            "TOLLGATE_MAX_CONSECUTIVE_ERRORS",
            self.admission.max_consecutive_errors
        );
        env_parse!(
            "admission.min_interval_ms",
            "TOLLGATE_MIN_INTERVAL_MS",
            self.admission.min_interval_ms
        );
        env_parse!(
            "admission.lock_timeout_ms",
            "TOLLGATE_LOCK_TIMEOUT_MS",
            self.admission.lock_timeout_ms
        );
        env_parse!(
            "admission.rates.input_per_million",
            "TOLLGATE_INPUT_PER_MILLION",
            self.admission.rates.input_per_million
        );
        env_parse!(
            "admission.rates.output_per_million",
            "TOLLGATE_OUTPUT_PER_MILLION",
            self.admission.rates.output_per_million
        );

        // -- Audit --
        env_parse!("audit.backend", "TOLLGATE_AUDIT_BACKEND", self.audit.backend);
        env_path!(
            "audit.jsonl_path",
            "TOLLGATE_AUDIT_JSONL_PATH",
            self.audit.jsonl_path
        );
        env_path!("audit.db_path", "TOLLGATE_AUDIT_DB_PATH", self.audit.db_path);

        // -- Logging --
        env_str!("logging.level", "TOLLGATE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "TOLLGATE_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            admission: AdmissionConfig::default(),
            audit: AuditConfig::default(),
            logging: LoggingConfig::default(),
            env_overrides: EnvOverrides::default(),
        }
    }
}

// XDG base directories
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share"))
            })
    }

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
