//! Configuration types for sollol.
//!
//! Config is loaded once at startup from a TOML file and validated before
//! the gateway opens any ports — invalid configs are rejected with a clear
//! error rather than silently falling back to defaults, the same contract
//! the teacher crate's `Config::load` uses.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//! admin_port  = 8081
//!
//! [[backends]]
//! host = "10.0.0.11"
//! port = 11434
//! declared_tier = "high"
//! has_gpu = true
//! gpu_memory_total_mb = 24000
//!
//! [queue]
//! max_queue_size = 1000
//!
//! [dispatcher]
//! max_retries = 3
//! per_backend_concurrency = 8
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::DeclaredTier;

/// Top-level sollol configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// The fleet of upstream Ollama-compatible backends.
    #[serde(default)]
    pub backends: Vec<BackendEntryConfig>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for b in &self.backends {
            anyhow::ensure!(
                seen.insert((b.host.clone(), b.port)),
                "duplicate backend `{}:{}`",
                b.host,
                b.port
            );
            anyhow::ensure!(b.cpu_capacity > 0.0, "backend `{}:{}` must have cpu_capacity > 0", b.host, b.port);
        }

        anyhow::ensure!(self.queue.max_queue_size > 0, "queue.max_queue_size must be > 0");
        anyhow::ensure!(
            self.queue.age_boost_cap <= 9,
            "queue.age_boost_cap must be <= 9 (priority 1 + cap must stay within [1,10])"
        );
        anyhow::ensure!(
            self.dispatcher.per_backend_concurrency > 0,
            "dispatcher.per_backend_concurrency must be > 0"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.metrics.sampling_rate_info),
            "metrics.sampling_rate_info must be in [0,1]"
        );

        Ok(())
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the agent-facing client API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Log level override (also controlled by `RUST_LOG`).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Environment variable whose value is the Bearer token required for
    /// admin API requests. Leave unset to disable admin authentication
    /// (only recommended when the admin port is firewalled).
    #[serde(default)]
    pub admin_token_env: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            log_level: None,
            admin_token_env: None,
        }
    }
}

/// One configured upstream backend (spec §6 `backends` list).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEntryConfig {
    pub host: String,
    pub port: u16,

    #[serde(default)]
    pub declared_tier: DeclaredTier,

    #[serde(default)]
    pub has_gpu: bool,

    #[serde(default)]
    pub gpu_memory_total_mb: u64,

    #[serde(default = "defaults::cpu_capacity")]
    pub cpu_capacity: f64,
}

/// Admission layer tunables (spec §4.6 / §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "defaults::max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "defaults::age_boost_step_ms")]
    pub age_boost_step_ms: u64,

    /// Capped at 9 so a priority-1 entry can still reach effective priority
    /// 10 (see DESIGN.md for why this departs from spec's illustrative
    /// "+5" example).
    #[serde(default = "defaults::age_boost_cap")]
    pub age_boost_cap: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: defaults::max_queue_size(),
            age_boost_step_ms: defaults::age_boost_step_ms(),
            age_boost_cap: defaults::age_boost_cap(),
        }
    }
}

/// Dispatcher/worker-pool tunables (spec §4.7/§4.8/§6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    #[serde(default = "defaults::per_backend_concurrency")]
    pub per_backend_concurrency: usize,

    #[serde(default = "defaults::chat_timeout_ms")]
    pub chat_timeout_ms: u64,

    #[serde(default = "defaults::embed_timeout_ms")]
    pub embed_timeout_ms: u64,

    #[serde(default)]
    pub hedging_enabled: bool,

    #[serde(default = "defaults::hedging_delay_ms")]
    pub hedging_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            per_backend_concurrency: defaults::per_backend_concurrency(),
            chat_timeout_ms: defaults::chat_timeout_ms(),
            embed_timeout_ms: defaults::embed_timeout_ms(),
            hedging_enabled: false,
            hedging_delay_ms: defaults::hedging_delay_ms(),
        }
    }
}

/// Health-probe tunables (spec §4.2/§6): interval tiers, probe timeout, and
/// the exclusion backoff schedule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "defaults::very_stable_interval_ms")]
    pub very_stable_interval_ms: u64,
    #[serde(default = "defaults::stable_interval_ms")]
    pub stable_interval_ms: u64,
    #[serde(default = "defaults::degraded_interval_ms")]
    pub degraded_interval_ms: u64,
    #[serde(default = "defaults::unstable_interval_ms")]
    pub unstable_interval_ms: u64,
    #[serde(default = "defaults::probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "defaults::exclusion_backoff_schedule_ms")]
    pub exclusion_backoff_schedule_ms: Vec<u64>,
    #[serde(default = "defaults::failure_streak_threshold")]
    pub failure_streak_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            very_stable_interval_ms: defaults::very_stable_interval_ms(),
            stable_interval_ms: defaults::stable_interval_ms(),
            degraded_interval_ms: defaults::degraded_interval_ms(),
            unstable_interval_ms: defaults::unstable_interval_ms(),
            probe_timeout_ms: defaults::probe_timeout_ms(),
            exclusion_backoff_schedule_ms: defaults::exclusion_backoff_schedule_ms(),
            failure_streak_threshold: defaults::failure_streak_threshold(),
        }
    }
}

/// Metrics recorder tunables (spec §4.3/§6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "defaults::sampling_rate_info")]
    pub sampling_rate_info: f64,
    #[serde(default = "defaults::ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "defaults::outcome_window")]
    pub outcome_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sampling_rate_info: defaults::sampling_rate_info(),
            ring_capacity: defaults::ring_capacity(),
            outcome_window: defaults::outcome_window(),
        }
    }
}

/// Request analyzer tunables (spec §4.4).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzerConfig {
    /// Requests estimated above this many tokens require a GPU backend
    /// regardless of task type.
    #[serde(default = "defaults::gpu_token_threshold")]
    pub gpu_token_threshold: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self { gpu_token_threshold: defaults::gpu_token_threshold() }
    }
}

/// Scorer weight overrides (spec §4.5, §9 open question 2 — the formula's
/// constants are not canonical in the source; these are the defaults this
/// crate proposes, overridable per deployment).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringConfig {
    #[serde(default = "defaults::baseline_score")]
    pub baseline_score: f64,
    #[serde(default = "defaults::gpu_bonus_match")]
    pub gpu_bonus_match: f64,
    #[serde(default = "defaults::gpu_bonus_mismatch")]
    pub gpu_bonus_mismatch: f64,
    #[serde(default = "defaults::priority_boost_high")]
    pub priority_boost_high: f64,
    #[serde(default = "defaults::priority_damp_low")]
    pub priority_damp_low: f64,
    #[serde(default = "defaults::specialization_bonus")]
    pub specialization_bonus: f64,
    #[serde(default = "defaults::specialization_margin_pp")]
    pub specialization_margin_pp: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            baseline_score: defaults::baseline_score(),
            gpu_bonus_match: defaults::gpu_bonus_match(),
            gpu_bonus_mismatch: defaults::gpu_bonus_mismatch(),
            priority_boost_high: defaults::priority_boost_high(),
            priority_damp_low: defaults::priority_damp_low(),
            specialization_bonus: defaults::specialization_bonus(),
            specialization_margin_pp: defaults::specialization_margin_pp(),
        }
    }
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn cpu_capacity() -> f64 { 1.0 }

    pub fn max_queue_size() -> usize { 1000 }
    pub fn age_boost_step_ms() -> u64 { 2_000 }
    pub fn age_boost_cap() -> u8 { 9 }

    pub fn max_retries() -> u32 { 3 }
    pub fn per_backend_concurrency() -> usize { 8 }
    pub fn chat_timeout_ms() -> u64 { 300_000 }
    pub fn embed_timeout_ms() -> u64 { 60_000 }
    pub fn hedging_delay_ms() -> u64 { 500 }

    pub fn very_stable_interval_ms() -> u64 { 60_000 }
    pub fn stable_interval_ms() -> u64 { 30_000 }
    pub fn degraded_interval_ms() -> u64 { 15_000 }
    pub fn unstable_interval_ms() -> u64 { 5_000 }
    pub fn probe_timeout_ms() -> u64 { 2_000 }
    pub fn exclusion_backoff_schedule_ms() -> Vec<u64> { vec![5_000, 30_000, 120_000, 300_000] }
    pub fn failure_streak_threshold() -> u32 { 3 }

    pub fn sampling_rate_info() -> f64 { 0.1 }
    pub fn ring_capacity() -> usize { 1000 }
    pub fn outcome_window() -> usize { 100 }

    pub fn gpu_token_threshold() -> u32 { 1_500 }

    pub fn baseline_score() -> f64 { 100.0 }
    pub fn gpu_bonus_match() -> f64 { 1.5 }
    pub fn gpu_bonus_mismatch() -> f64 { 0.5 }
    pub fn priority_boost_high() -> f64 { 1.25 }
    pub fn priority_damp_low() -> f64 { 0.8 }
    pub fn specialization_bonus() -> f64 { 1.25 }
    pub fn specialization_margin_pp() -> f64 { 0.05 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [[backends]]
            host = "localhost"
            port = 11434
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn defaults_are_applied_when_sections_are_minimal() {
        let config = minimal_config();
        assert_eq!(config.gateway.client_port, 8080);
        assert_eq!(config.gateway.admin_port, 8081);
        assert_eq!(config.queue.max_queue_size, 1000);
        assert_eq!(config.dispatcher.max_retries, 3);
        assert_eq!(config.dispatcher.per_backend_concurrency, 8);
        assert_eq!(config.health.failure_streak_threshold, 3);
    }

    #[test]
    fn validate_rejects_duplicate_backends() {
        let mut config = minimal_config();
        config.backends.push(BackendEntryConfig {
            host: "localhost".into(),
            port: 11434,
            declared_tier: DeclaredTier::Standard,
            has_gpu: false,
            gpu_memory_total_mb: 0,
            cpu_capacity: 1.0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_queue_capacity() {
        let mut config = minimal_config();
        config.queue.max_queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_age_boost_cap_above_nine() {
        let mut config = minimal_config();
        config.queue.age_boost_cap = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_sampling_rate() {
        let mut config = minimal_config();
        config.metrics.sampling_rate_info = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn declared_tier_defaults_to_standard() {
        let config = minimal_config();
        assert_eq!(config.backends[0].declared_tier, DeclaredTier::Standard);
    }
}
