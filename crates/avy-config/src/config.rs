use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current schema version for orchestrator.toml
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Top-level configuration for the orchestration core.
///
/// Every section has usable defaults; a missing file is equivalent to
/// `OrchestratorConfig::default()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub resources: ResourcePoolConfig,
    #[serde(default)]
    pub identities: IdentityPoolConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            engine: EngineConfig::default(),
            resources: ResourcePoolConfig::default(),
            identities: IdentityPoolConfig::default(),
            sessions: SessionConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// Job engine sizing and retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent workers pulling from the job queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Default retry limit for workflows that do not override it.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base retry delay in milliseconds; attempt N waits `N * this`.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How often the schedule ticker checks for due jobs.
    #[serde(default = "default_ticker_interval_ms")]
    pub ticker_interval_ms: u64,
}

fn default_worker_count() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_ticker_interval_ms() -> u64 {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            ticker_interval_ms: default_ticker_interval_ms(),
        }
    }
}

/// Health-check policy for the resource pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePoolConfig {
    /// Interval between health sweeps, in seconds.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Per-probe timeout in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// URL fetched through the resource to test reachability.
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    /// Consecutive failures after which a bound resource triggers a
    /// rotation request instead of serving further traffic.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Treat TLS/certificate errors on the tunnel as a healthy probe.
    ///
    /// Intercepting proxies routinely present their own certificates, so
    /// the lenient default mirrors field behavior. Set to `false` to count
    /// them as failures. This can mask real outages; it is a policy knob,
    /// not a recommendation.
    #[serde(default = "default_true")]
    pub tls_errors_are_healthy: bool,
    /// Timezone assumed when geolocation lookup fails.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// ip-api style geolocation endpoint. `None` disables lookups and
    /// every resource keeps its supplier country hint.
    #[serde(default = "default_geo_endpoint")]
    pub geo_endpoint: Option<String>,
}

fn default_health_interval_secs() -> u64 {
    60
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_probe_url() -> String {
    "http://www.gstatic.com/generate_204".to_string()
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_true() -> bool {
    true
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_geo_endpoint() -> Option<String> {
    Some("http://ip-api.com/json".to_string())
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_url: default_probe_url(),
            failure_threshold: default_failure_threshold(),
            tls_errors_are_healthy: true,
            default_timezone: default_timezone(),
            geo_endpoint: default_geo_endpoint(),
        }
    }
}

/// One row of the geographic weight table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryWeight {
    pub country: String,
    pub weight: u32,
}

/// Identity pool weighting and category evolution thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityPoolConfig {
    /// Weight table for the geographic draw. The dominant entry also
    /// absorbs any integer-division remainder when distributing counts.
    #[serde(default = "default_country_weights")]
    pub country_weights: Vec<CountryWeight>,
    #[serde(default)]
    pub evolution: EvolutionThresholds,
}

fn default_country_weights() -> Vec<CountryWeight> {
    [
        ("us", 60),
        ("gb", 15),
        ("ca", 10),
        ("au", 8),
        ("de", 5),
        ("fr", 2),
    ]
    .into_iter()
    .map(|(country, weight)| CountryWeight {
        country: country.to_string(),
        weight,
    })
    .collect()
}

impl Default for IdentityPoolConfig {
    fn default() -> Self {
        Self {
            country_weights: default_country_weights(),
            evolution: EvolutionThresholds::default(),
        }
    }
}

/// Per-category thresholds for the evolution rule. Both the visit count
/// and the success rate must be met to advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionThresholds {
    #[serde(default = "default_returning_min_visits")]
    pub returning_min_visits: u64,
    #[serde(default = "default_returning_min_success_rate")]
    pub returning_min_success_rate: f64,
    #[serde(default = "default_loyal_min_visits")]
    pub loyal_min_visits: u64,
    #[serde(default = "default_loyal_min_success_rate")]
    pub loyal_min_success_rate: f64,
}

fn default_returning_min_visits() -> u64 {
    10
}
fn default_returning_min_success_rate() -> f64 {
    0.7
}
fn default_loyal_min_visits() -> u64 {
    50
}
fn default_loyal_min_success_rate() -> f64 {
    0.85
}

impl Default for EvolutionThresholds {
    fn default() -> Self {
        Self {
            returning_min_visits: default_returning_min_visits(),
            returning_min_success_rate: default_returning_min_success_rate(),
            loyal_min_visits: default_loyal_min_visits(),
            loyal_min_success_rate: default_loyal_min_success_rate(),
        }
    }
}

/// Session budgets and sweep cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Duration budget per session, in seconds.
    #[serde(default = "default_session_duration_secs")]
    pub max_duration_secs: u64,
    /// Visit budget per session.
    #[serde(default = "default_session_max_visits")]
    pub max_visits: u32,
    /// Interval between termination sweeps, in seconds.
    #[serde(default = "default_session_sweep_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum sessions per isolation group.
    #[serde(default = "default_group_capacity")]
    pub group_capacity: usize,
}

fn default_session_duration_secs() -> u64 {
    1_800
}
fn default_session_max_visits() -> u32 {
    20
}
fn default_session_sweep_secs() -> u64 {
    30
}
fn default_group_capacity() -> usize {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_session_duration_secs(),
            max_visits: default_session_max_visits(),
            sweep_interval_secs: default_session_sweep_secs(),
            group_capacity: default_group_capacity(),
        }
    }
}

/// Batch orchestration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Units per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Batch count above which a launch is delegated to the engine as a
    /// single background job.
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,
    /// Fixed delay between synchronous batches, in milliseconds.
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    /// Poll interval while waiting on a batch job, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall wait budget per batch, in seconds.
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
}

fn default_batch_size() -> u32 {
    50
}
fn default_large_threshold() -> u32 {
    10
}
fn default_inter_batch_delay_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_batch_timeout_secs() -> u64 {
    300
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            large_threshold: default_large_threshold(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_timeout_secs: default_batch_timeout_secs(),
        }
    }
}

impl OrchestratorConfig {
    /// Load `orchestrator.toml` from `dir`, or `None` if absent.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join("orchestrator.toml");
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Write `orchestrator.toml` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        let path = dir.join("orchestrator.toml");
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.engine.worker_count == 0 {
            bail!("engine.worker_count must be at least 1");
        }
        if self.identities.country_weights.is_empty() {
            bail!("identities.country_weights must not be empty");
        }
        if self.identities.country_weights.iter().any(|w| w.weight == 0) {
            bail!("identities.country_weights entries must have weight > 0");
        }
        for (label, rate) in [
            (
                "returning_min_success_rate",
                self.identities.evolution.returning_min_success_rate,
            ),
            (
                "loyal_min_success_rate",
                self.identities.evolution.loyal_min_success_rate,
            ),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("identities.evolution.{} must be within [0, 1]", label);
            }
        }
        if self.batch.batch_size == 0 {
            bail!("batch.batch_size must be at least 1");
        }
        if self.sessions.max_visits == 0 {
            bail!("sessions.max_visits must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_default_weights_sum_to_100() {
        let config = OrchestratorConfig::default();
        let total: u32 = config
            .identities
            .country_weights
            .iter()
            .map(|w| w.weight)
            .sum();
        assert_eq!(total, 100);
        assert_eq!(config.identities.country_weights[0].country, "us");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.engine.worker_count = 8;
        config.batch.large_threshold = 20;
        config.save(temp.path()).unwrap();

        let loaded = OrchestratorConfig::load(temp.path()).unwrap().unwrap();
        assert_eq!(loaded.engine.worker_count, 8);
        assert_eq!(loaded.batch.large_threshold, 20);
        assert_eq!(loaded.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let temp = tempdir().unwrap();
        assert!(OrchestratorConfig::load(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_empty_toml_gets_defaults() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("orchestrator.toml"), "").unwrap();
        let loaded = OrchestratorConfig::load(temp.path()).unwrap().unwrap();
        assert_eq!(loaded.engine.worker_count, 4);
        assert!(loaded.resources.tls_errors_are_healthy);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = OrchestratorConfig::default();
        config.engine.worker_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worker_count"));
    }

    #[test]
    fn test_validate_rejects_empty_weights() {
        let mut config = OrchestratorConfig::default();
        config.identities.country_weights.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_rate() {
        let mut config = OrchestratorConfig::default();
        config.identities.evolution.loyal_min_success_rate = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loyal_min_success_rate"));
    }

    #[test]
    fn test_partial_toml_overrides_one_section() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("orchestrator.toml"),
            "[sessions]\nmax_visits = 3\n",
        )
        .unwrap();
        let loaded = OrchestratorConfig::load(temp.path()).unwrap().unwrap();
        assert_eq!(loaded.sessions.max_visits, 3);
        // Untouched sections keep defaults.
        assert_eq!(loaded.batch.batch_size, 50);
    }
}
