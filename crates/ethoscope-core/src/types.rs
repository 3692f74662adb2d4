//! Core type definitions for Ethoscope

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single field value inside a metric record
///
/// Untagged so stored records read back as plain JSON objects.
/// Integers are tried before floats so block numbers stay integral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value (integers widen, text and bools do not convert)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        i64::try_from(v)
            .map(Self::Int)
            .unwrap_or(Self::Float(v as f64))
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        Self::from(v as u64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Record fields; ordered so that serialization is byte-stable
pub type Fields = BTreeMap<String, FieldValue>;

/// Output buckets of the metric processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Block,
    Gas,
    Mempool,
    Mev,
    MevBoostStats,
    L2Network,
    L2TransactionCosts,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        Self::Block,
        Self::Gas,
        Self::Mempool,
        Self::Mev,
        Self::MevBoostStats,
        Self::L2Network,
        Self::L2TransactionCosts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Gas => "gas",
            Self::Mempool => "mempool",
            Self::Mev => "mev",
            Self::MevBoostStats => "mev_boost_stats",
            Self::L2Network => "l2_network",
            Self::L2TransactionCosts => "l2_transaction_costs",
        }
    }

    /// Map a declared kind (as emitted by a collector) onto an output bucket
    ///
    /// Returns `None` for kinds the processor does not know; those records are dropped.
    pub fn categorize(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_lowercase().as_str() {
            "block" | "blocks" => Some(Self::Block),
            "gas" | "gas_price" => Some(Self::Gas),
            "mempool" => Some(Self::Mempool),
            "mev" => Some(Self::Mev),
            "mev_boost_stats" => Some(Self::MevBoostStats),
            "l2_network" | "l2" => Some(Self::L2Network),
            "l2_transaction_costs" | "l2_costs" => Some(Self::L2TransactionCosts),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::categorize(s).ok_or_else(|| format!("Invalid metric kind: {}", s))
    }
}

/// A record as produced by a collector, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetricRecord {
    /// Collector (and sub-source) that produced the record, e.g. `mev_relay/flashbots`
    pub source_id: String,
    /// Declared kind; categorized by the processor
    pub metric_kind: String,
    /// When the collector observed the value
    pub captured_at: DateTime<Utc>,
    /// Provider-specific fields
    pub fields: Fields,
}

impl RawMetricRecord {
    pub fn new(
        source_id: impl Into<String>,
        metric_kind: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            metric_kind: metric_kind.into(),
            captured_at,
            fields: Fields::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Insert only when a value is present
    pub fn with_optional_field<V: Into<FieldValue>>(
        mut self,
        name: impl Into<String>,
        value: Option<V>,
    ) -> Self {
        if let Some(v) = value {
            self.fields.insert(name.into(), v.into());
        }
        self
    }

    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }
}

/// A record that passed validation and carries its output bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRecord {
    pub source_id: String,
    pub metric_kind: MetricKind,
    pub captured_at: DateTime<Utc>,
    pub fields: Fields,
}

impl ValidatedRecord {
    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }

    pub fn field_i64(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(FieldValue::as_i64)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_str)
    }
}

/// All validated records of one kind from one orchestration tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMetricBatch {
    pub metric_kind: MetricKind,
    pub records: Vec<ValidatedRecord>,
}

impl ProcessedMetricBatch {
    pub fn new(metric_kind: MetricKind) -> Self {
        Self {
            metric_kind,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Closed time interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The span ending at `end`
    pub fn trailing(end: DateTime<Utc>, span: Duration) -> Self {
        Self {
            start: end - span,
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// The six weighted components of the health score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentName {
    GasEfficiency,
    NetworkStability,
    MevFairness,
    BlockProduction,
    MempoolHealth,
    ValidatorPerformance,
}

impl ComponentName {
    pub const ALL: [ComponentName; 6] = [
        Self::GasEfficiency,
        Self::NetworkStability,
        Self::MevFairness,
        Self::BlockProduction,
        Self::MempoolHealth,
        Self::ValidatorPerformance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GasEfficiency => "gas_efficiency",
            Self::NetworkStability => "network_stability",
            Self::MevFairness => "mev_fairness",
            Self::BlockProduction => "block_production",
            Self::MempoolHealth => "mempool_health",
            Self::ValidatorPerformance => "validator_performance",
        }
    }
}

impl std::fmt::Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One weighted sub-score of the overall health score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub name: ComponentName,
    /// Score in [0, 100]
    pub value: f64,
    /// Weight in (0, 1]
    pub weight: f64,
    /// False when the component fell back to a neutral score for lack of data
    pub has_data: bool,
}

impl ComponentScore {
    pub fn weighted(&self) -> f64 {
        self.value * self.weight
    }
}

/// Outlier detection method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyMethod {
    ZScore,
    Iqr,
}

impl std::fmt::Display for AnomalyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZScore => write!(f, "z_score"),
            Self::Iqr => write!(f, "iqr"),
        }
    }
}

/// Anomaly severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A single statistical outlier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub metric_kind: MetricKind,
    /// Series within the kind, e.g. `gas_price_gwei` or `block_interval_secs`
    pub series: String,
    pub method: AnomalyMethod,
    pub observed_value: f64,
    /// The z-score for [`AnomalyMethod::ZScore`], the violated fence for [`AnomalyMethod::Iqr`]
    pub bound_or_score: f64,
    pub severity: Severity,
    pub observed_at: DateTime<Utc>,
}

/// Human-readable health label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Excellent
        } else if score >= 75.0 {
            Self::Good
        } else if score >= 60.0 {
            Self::Fair
        } else if score >= 40.0 {
            Self::Poor
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Excellent => write!(f, "Excellent"),
            Self::Good => write!(f, "Good"),
            Self::Fair => write!(f, "Fair"),
            Self::Poor => write!(f, "Poor"),
            Self::Critical => write!(f, "Critical"),
        }
    }
}

/// Output of one scoring cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkHealthScoreRecord {
    pub timestamp: DateTime<Utc>,
    /// Weighted sum of the components, clamped to [0, 100]
    pub overall_score: f64,
    pub components: Vec<ComponentScore>,
    pub anomalies: Vec<AnomalyFlag>,
    pub health_status: HealthStatus,
    /// Fraction of components backed by data, in [0, 1]
    pub confidence: f64,
}

impl NetworkHealthScoreRecord {
    pub fn component(&self, name: ComponentName) -> Option<&ComponentScore> {
        self.components.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_accepts_aliases() {
        assert_eq!(MetricKind::categorize("gas"), Some(MetricKind::Gas));
        assert_eq!(MetricKind::categorize("Gas_Price"), Some(MetricKind::Gas));
        assert_eq!(MetricKind::categorize("l2"), Some(MetricKind::L2Network));
        assert_eq!(
            MetricKind::categorize("l2_costs"),
            Some(MetricKind::L2TransactionCosts)
        );
        assert_eq!(MetricKind::categorize("sequencer_health"), None);
    }

    #[test]
    fn test_metric_kind_round_trips_through_str() {
        for kind in MetricKind::ALL {
            assert_eq!(kind.as_str().parse::<MetricKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_field_value_json_shape() {
        let record = RawMetricRecord::new("mainnet", "block", Utc::now())
            .with_field("block_number", 19_000_000u64)
            .with_field("gas_price_gwei", 21.5)
            .with_field("builder", "0xabc");

        let json = serde_json::to_value(&record.fields).unwrap();
        assert_eq!(json["block_number"], 19_000_000);
        assert_eq!(json["gas_price_gwei"], 21.5);

        let back: Fields = serde_json::from_value(json).unwrap();
        assert_eq!(back.get("block_number"), Some(&FieldValue::Int(19_000_000)));
        assert_eq!(back.get("builder").and_then(FieldValue::as_str), Some("0xabc"));
    }

    #[test]
    fn test_large_unsigned_values_fall_back_to_float() {
        let value = FieldValue::from(u64::MAX);
        assert!(matches!(value, FieldValue::Float(_)));
    }

    #[test]
    fn test_health_status_thresholds() {
        assert_eq!(HealthStatus::from_score(95.0), HealthStatus::Excellent);
        assert_eq!(HealthStatus::from_score(75.0), HealthStatus::Good);
        assert_eq!(HealthStatus::from_score(60.0), HealthStatus::Fair);
        assert_eq!(HealthStatus::from_score(40.0), HealthStatus::Poor);
        assert_eq!(HealthStatus::from_score(39.9), HealthStatus::Critical);
    }

    #[test]
    fn test_time_range_trailing() {
        let end = Utc::now();
        let range = TimeRange::trailing(end, Duration::hours(1));
        assert!(range.contains(end - Duration::minutes(30)));
        assert!(!range.contains(end - Duration::hours(2)));
    }
}
