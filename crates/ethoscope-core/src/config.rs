//! Configuration management for Ethoscope
//!
//! This module provides the startup configuration surface: pipeline cadences,
//! per-collector resilience settings, scoring thresholds and the six component
//! weights. Everything is defaulted so a missing file yields a runnable setup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{ComponentName, EthoscopeError, Result};

/// Tolerance used when checking that the component weights sum to 1.0
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Top-level Ethoscope configuration
///
/// Loaded from `ethoscope.toml` (or the path given with `--config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthoscopeConfig {
    /// Scheduling loop settings
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Health scoring settings
    #[serde(default)]
    pub scoring: ScoringSettings,

    /// Collector registry, keyed by collector id
    #[serde(default = "default_collectors")]
    pub collectors: BTreeMap<String, CollectorSettings>,

    /// Storage sink settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Environment variable names used to inject endpoints
    #[serde(default)]
    pub sources: SourceSettings,
}

/// Scheduling loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Seconds between collection cycles
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,

    /// Seconds between scoring cycles
    #[serde(default = "default_scoring_interval")]
    pub scoring_interval_secs: u64,

    /// Deadline for a single collector within one cycle
    #[serde(default = "default_collector_timeout")]
    pub collector_timeout_secs: u64,

    /// How long in-flight collectors may run after shutdown begins
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Consecutive storage failures before raising an operational alert
    #[serde(default = "default_storage_alert_threshold")]
    pub storage_alert_threshold: u32,

    /// Attempts per batch when persisting to storage
    #[serde(default = "default_persist_retries")]
    pub persist_retries: usize,
}

/// Scoring thresholds and weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringSettings {
    #[serde(default = "default_z_score_threshold")]
    pub z_score_threshold: f64,

    #[serde(default = "default_iqr_multiplier")]
    pub iqr_multiplier: f64,

    /// Baseline samples required before a series is checked for anomalies
    #[serde(default = "default_min_anomaly_samples")]
    pub min_anomaly_samples: usize,

    #[serde(default)]
    pub weights: ComponentWeights,
}

/// Fixed weights of the six health components
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentWeights {
    pub gas_efficiency: f64,
    pub network_stability: f64,
    pub mev_fairness: f64,
    pub block_production: f64,
    pub mempool_health: f64,
    pub validator_performance: f64,
}

/// Which collector variant a registry entry builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    Mainnet,
    MevRelay,
    L2,
}

impl std::fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::MevRelay => write!(f, "mev_relay"),
            Self::L2 => write!(f, "l2"),
        }
    }
}

/// What to do when the rate limiter says "not yet"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Sleep until a slot frees up
    #[default]
    Wait,
    /// Skip the call for this cycle
    Skip,
}

/// At most `calls` calls per rolling `period_secs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub calls: u32,
    pub period_secs: u64,
    #[serde(default)]
    pub policy: RateLimitPolicy,
}

/// A MEV-Boost relay endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    pub name: String,
    pub url: String,
}

/// An L2 network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2NetworkSettings {
    pub name: String,
    pub chain_id: u64,
    /// optimistic_rollup, zk_rollup or sidechain
    pub rollup_type: String,
    pub rpc_url: String,
}

/// Per-collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    pub kind: CollectorKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSON-RPC endpoint (mainnet)
    #[serde(default)]
    pub rpc_url: Option<String>,

    /// Relays to poll (mev_relay)
    #[serde(default)]
    pub relays: Vec<RelaySettings>,

    /// Networks to poll (l2)
    #[serde(default)]
    pub networks: Vec<L2NetworkSettings>,

    /// ETH/USD reference used for L2 transaction cost estimates
    #[serde(default = "default_eth_usd_price")]
    pub eth_usd_price: f64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    #[serde(default = "default_rate_limit")]
    pub rate_limit: RateLimitSettings,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Storage sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Environment variables consulted at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Overrides `collectors.mainnet.rpc_url` when set
    #[serde(default = "default_rpc_url_env")]
    pub rpc_url_env: String,
}

// Default value providers
fn default_true() -> bool {
    true
}

fn default_collection_interval() -> u64 {
    12
}

fn default_scoring_interval() -> u64 {
    60
}

fn default_collector_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_storage_alert_threshold() -> u32 {
    3
}

fn default_persist_retries() -> usize {
    3
}

fn default_z_score_threshold() -> f64 {
    3.0
}

fn default_iqr_multiplier() -> f64 {
    1.5
}

fn default_min_anomaly_samples() -> usize {
    20
}

fn default_eth_usd_price() -> f64 {
    2000.0
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_rate_limit() -> RateLimitSettings {
    RateLimitSettings {
        calls: 10,
        period_secs: 1,
        policy: RateLimitPolicy::Wait,
    }
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    5
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_rpc_url_env() -> String {
    "ALCHEMY_API_URL".to_string()
}

fn default_relays() -> Vec<RelaySettings> {
    [
        ("flashbots", "https://boost-relay.flashbots.net"),
        ("bloxroute_max", "https://bloxroute.max-profit.blxrbdn.com"),
        ("agnostic", "https://agnostic-relay.net"),
    ]
    .into_iter()
    .map(|(name, url)| RelaySettings {
        name: name.to_string(),
        url: url.to_string(),
    })
    .collect()
}

fn default_l2_networks() -> Vec<L2NetworkSettings> {
    [
        ("arbitrum", 42161, "optimistic_rollup", "https://arb1.arbitrum.io/rpc"),
        ("optimism", 10, "optimistic_rollup", "https://mainnet.optimism.io"),
        ("base", 8453, "optimistic_rollup", "https://mainnet.base.org"),
        ("polygon", 137, "sidechain", "https://polygon-rpc.com"),
        ("zksync", 324, "zk_rollup", "https://mainnet.era.zksync.io"),
        ("scroll", 534352, "zk_rollup", "https://rpc.scroll.io"),
    ]
    .into_iter()
    .map(|(name, chain_id, rollup_type, rpc_url)| L2NetworkSettings {
        name: name.to_string(),
        chain_id,
        rollup_type: rollup_type.to_string(),
        rpc_url: rpc_url.to_string(),
    })
    .collect()
}

fn default_collectors() -> BTreeMap<String, CollectorSettings> {
    let mut collectors = BTreeMap::new();

    collectors.insert(
        "mainnet".to_string(),
        CollectorSettings {
            rpc_url: Some("http://127.0.0.1:8545".to_string()),
            cache_ttl_secs: 15,
            ..CollectorSettings::new(CollectorKind::Mainnet)
        },
    );

    collectors.insert(
        "mev_relay".to_string(),
        CollectorSettings {
            relays: default_relays(),
            // Applied per relay
            rate_limit: RateLimitSettings {
                calls: 2,
                period_secs: 12,
                policy: RateLimitPolicy::Skip,
            },
            cache_ttl_secs: 60,
            ..CollectorSettings::new(CollectorKind::MevRelay)
        },
    );

    collectors.insert(
        "l2".to_string(),
        CollectorSettings {
            networks: default_l2_networks(),
            // Applied per network
            rate_limit: RateLimitSettings {
                calls: 5,
                period_secs: 1,
                policy: RateLimitPolicy::Wait,
            },
            ..CollectorSettings::new(CollectorKind::L2)
        },
    );

    collectors
}

impl EthoscopeConfig {
    /// Load, apply environment overrides and validate
    ///
    /// Any error returned here is a configuration fault and must prevent startup.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path` or use defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            debug!("Loaded config from {:?}", path);
            Self::from_toml_str(&content)
        } else {
            info!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let config = Self::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| EthoscopeError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Replace endpoint settings with values from the environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(&self.sources.rpc_url_env) {
            if !url.trim().is_empty() {
                for settings in self.collectors.values_mut() {
                    if settings.kind == CollectorKind::Mainnet {
                        settings.rpc_url = Some(url.trim().to_string());
                    }
                }
                debug!("Mainnet RPC URL taken from ${}", self.sources.rpc_url_env);
            }
        }
    }

    /// Check startup invariants
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.scoring.validate()?;

        for (id, settings) in &self.collectors {
            settings
                .validate()
                .map_err(|e| EthoscopeError::Config(format!("collectors.{}: {}", id, e)))?;
        }

        Ok(())
    }

    /// Collectors that are switched on, in id order
    pub fn enabled_collectors(&self) -> impl Iterator<Item = (&String, &CollectorSettings)> {
        self.collectors.iter().filter(|(_, s)| s.enabled)
    }
}

impl PipelineSettings {
    fn validate(&self) -> Result<()> {
        if self.collection_interval_secs == 0 {
            return Err(EthoscopeError::Config(
                "pipeline.collection_interval_secs must be > 0".to_string(),
            ));
        }
        if self.scoring_interval_secs < self.collection_interval_secs {
            return Err(EthoscopeError::Config(format!(
                "pipeline.scoring_interval_secs ({}) must not be shorter than the collection interval ({})",
                self.scoring_interval_secs, self.collection_interval_secs
            )));
        }
        if self.collector_timeout_secs == 0 {
            return Err(EthoscopeError::Config(
                "pipeline.collector_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.persist_retries == 0 {
            return Err(EthoscopeError::Config(
                "pipeline.persist_retries must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl ScoringSettings {
    fn validate(&self) -> Result<()> {
        if !(self.z_score_threshold > 0.0) {
            return Err(EthoscopeError::Config(
                "scoring.z_score_threshold must be > 0".to_string(),
            ));
        }
        if !(self.iqr_multiplier > 0.0) {
            return Err(EthoscopeError::Config(
                "scoring.iqr_multiplier must be > 0".to_string(),
            ));
        }
        self.weights.validate()
    }
}

impl ComponentWeights {
    /// Weight of one component
    pub fn get(&self, name: ComponentName) -> f64 {
        match name {
            ComponentName::GasEfficiency => self.gas_efficiency,
            ComponentName::NetworkStability => self.network_stability,
            ComponentName::MevFairness => self.mev_fairness,
            ComponentName::BlockProduction => self.block_production,
            ComponentName::MempoolHealth => self.mempool_health,
            ComponentName::ValidatorPerformance => self.validator_performance,
        }
    }

    pub fn sum(&self) -> f64 {
        ComponentName::ALL.iter().map(|n| self.get(*n)).sum()
    }

    /// Every weight in (0, 1] and the total equal to 1.0; never renormalized
    pub fn validate(&self) -> Result<()> {
        for name in ComponentName::ALL {
            let weight = self.get(name);
            if !(weight > 0.0 && weight <= 1.0) {
                return Err(EthoscopeError::Config(format!(
                    "scoring.weights.{} must be in (0, 1], got {}",
                    name, weight
                )));
            }
        }

        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(EthoscopeError::InvalidWeights { sum });
        }
        Ok(())
    }
}

impl CollectorSettings {
    pub fn new(kind: CollectorKind) -> Self {
        Self {
            kind,
            enabled: true,
            rpc_url: None,
            relays: Vec::new(),
            networks: Vec::new(),
            eth_usd_price: default_eth_usd_price(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            rate_limit: default_rate_limit(),
            cache_ttl_secs: default_cache_ttl(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be >= 1".to_string());
        }
        if self.rate_limit.calls == 0 || self.rate_limit.period_secs == 0 {
            return Err("rate_limit.calls and rate_limit.period_secs must be >= 1".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be > 0".to_string());
        }
        if !self.enabled {
            return Ok(());
        }

        match self.kind {
            CollectorKind::Mainnet => {
                if self.rpc_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err("mainnet collector needs rpc_url".to_string());
                }
            }
            CollectorKind::MevRelay => {
                if self.relays.is_empty() {
                    return Err("mev_relay collector needs at least one relay".to_string());
                }
            }
            CollectorKind::L2 => {
                if self.networks.is_empty() {
                    return Err("l2 collector needs at least one network".to_string());
                }
                if !(self.eth_usd_price > 0.0) {
                    return Err("eth_usd_price must be > 0".to_string());
                }
            }
        }
        Ok(())
    }
}

impl Default for EthoscopeConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineSettings::default(),
            scoring: ScoringSettings::default(),
            collectors: default_collectors(),
            storage: StorageSettings::default(),
            sources: SourceSettings::default(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            collection_interval_secs: default_collection_interval(),
            scoring_interval_secs: default_scoring_interval(),
            collector_timeout_secs: default_collector_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            storage_alert_threshold: default_storage_alert_threshold(),
            persist_retries: default_persist_retries(),
        }
    }
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            z_score_threshold: default_z_score_threshold(),
            iqr_multiplier: default_iqr_multiplier(),
            min_anomaly_samples: default_min_anomaly_samples(),
            weights: ComponentWeights::default(),
        }
    }
}

impl Default for ComponentWeights {
    fn default() -> Self {
        Self {
            gas_efficiency: 0.25,
            network_stability: 0.20,
            mev_fairness: 0.15,
            block_production: 0.15,
            mempool_health: 0.15,
            validator_performance: 0.10,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            rpc_url_env: default_rpc_url_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = EthoscopeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline.collection_interval_secs, 12);
        assert_eq!(config.pipeline.scoring_interval_secs, 60);
        assert_eq!(config.scoring.z_score_threshold, 3.0);
        assert_eq!(config.scoring.iqr_multiplier, 1.5);
        assert_eq!(config.collectors.len(), 3);
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let weights = ComponentWeights::default();
        assert!((weights.sum() - 1.0).abs() < WEIGHT_TOLERANCE);
        assert_eq!(weights.get(ComponentName::GasEfficiency), 0.25);
        assert_eq!(weights.get(ComponentName::ValidatorPerformance), 0.10);
    }

    #[test]
    fn test_bad_weights_fail_instead_of_renormalizing() {
        let toml = r#"
            [scoring.weights]
            gas_efficiency = 0.30
            network_stability = 0.20
            mev_fairness = 0.15
            block_production = 0.15
            mempool_health = 0.15
            validator_performance = 0.10
        "#;
        let config = EthoscopeConfig::from_toml_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration_fault());
        match err {
            EthoscopeError::InvalidWeights { sum } => assert!((sum - 1.05).abs() < 1e-9),
            other => panic!("unexpected error: {other}"),
        }
        // Weights are left exactly as configured
        assert_eq!(config.scoring.weights.gas_efficiency, 0.30);
    }

    #[test]
    fn test_zero_weight_rejected() {
        let weights = ComponentWeights {
            validator_performance: 0.0,
            gas_efficiency: 0.35,
            ..ComponentWeights::default()
        };
        assert!(matches!(
            weights.validate(),
            Err(EthoscopeError::Config(_))
        ));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml = r#"
            [pipeline]
            collection_interval_secs = 6
            scoring_interval_secs = 30

            [collectors.mainnet]
            kind = "mainnet"
            rpc_url = "https://eth.example"
            failure_threshold = 3
        "#;
        let config = EthoscopeConfig::from_toml_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.pipeline.collection_interval_secs, 6);
        assert_eq!(config.pipeline.collector_timeout_secs, 10);
        assert_eq!(config.collectors.len(), 1);

        let mainnet = &config.collectors["mainnet"];
        assert_eq!(mainnet.failure_threshold, 3);
        assert_eq!(mainnet.recovery_timeout_secs, 60);
        assert_eq!(mainnet.rate_limit.policy, RateLimitPolicy::Wait);
    }

    #[test]
    fn test_scoring_faster_than_collection_rejected() {
        let mut config = EthoscopeConfig::default();
        config.pipeline.scoring_interval_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_mev_collector_needs_relays() {
        let toml = r#"
            [collectors.mev]
            kind = "mev_relay"
        "#;
        let config = EthoscopeConfig::from_toml_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("collectors.mev"));
    }

    #[test]
    fn test_disabled_collector_skips_endpoint_checks() {
        let toml = r#"
            [collectors.mainnet]
            kind = "mainnet"
            enabled = false
        "#;
        let config = EthoscopeConfig::from_toml_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.enabled_collectors().count(), 0);
    }

    #[test]
    fn test_write_default_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ethoscope.toml");

        EthoscopeConfig::write_default(&path).unwrap();
        let loaded = EthoscopeConfig::load_or_default(&path).unwrap();

        loaded.validate().unwrap();
        assert_eq!(loaded.collectors["mev_relay"].relays.len(), 3);
        assert_eq!(loaded.collectors["l2"].networks.len(), 6);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = EthoscopeConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("data"));
    }
}
