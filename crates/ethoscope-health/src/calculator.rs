//! Health score calculator
//!
//! Reads a week of history back from the sink, scores the six components,
//! runs anomaly detection on the headline series and folds everything into a
//! [`NetworkHealthScoreRecord`].

use chrono::{DateTime, Duration, Utc};
use ethoscope_core::{
    AnomalyFlag, ComponentName, ComponentScore, ComponentWeights, EthoscopeError, HealthStatus,
    MetricKind, NetworkHealthScoreRecord, Result, ScoringSettings, Severity, TimeRange,
};
use ethoscope_metrics::MetricSink;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::anomaly::{AnomalyDetector, Observation};
use crate::baseline::{preceding, MetricHistory, Series, WindowSpan, SLOT_SECONDS};
use crate::components::{
    self, clamp_score, GAS_WINDOW_WEIGHTS, MEV_NEUTRAL_SCORE, NEUTRAL_SCORE,
};

/// Kinds read back for scoring
const SCORED_KINDS: [MetricKind; 4] = [
    MetricKind::Block,
    MetricKind::Gas,
    MetricKind::Mempool,
    MetricKind::Mev,
];

/// One series checked for anomalies every cycle
struct AnomalySeries {
    kind: MetricKind,
    name: &'static str,
    samples: Series,
    expected: Option<f64>,
}

pub struct HealthScoreCalculator {
    sink: Arc<dyn MetricSink>,
    weights: ComponentWeights,
    detector: AnomalyDetector,
    min_anomaly_samples: usize,
    /// Newest sample already checked, per series
    checked_through: Mutex<HashMap<&'static str, DateTime<Utc>>>,
}

impl HealthScoreCalculator {
    pub fn new(sink: Arc<dyn MetricSink>, settings: &ScoringSettings) -> Self {
        Self {
            sink,
            weights: settings.weights,
            detector: AnomalyDetector::from_settings(settings),
            min_anomaly_samples: settings.min_anomaly_samples,
            checked_through: Mutex::new(HashMap::new()),
        }
    }

    pub async fn calculate(&self) -> Result<NetworkHealthScoreRecord> {
        self.calculate_at(Utc::now()).await
    }

    /// Score the network as of `now`
    ///
    /// Any sink error or non-finite intermediate aborts the cycle; a partial
    /// score is never returned.
    #[instrument(skip(self))]
    pub async fn calculate_at(&self, now: DateTime<Utc>) -> Result<NetworkHealthScoreRecord> {
        let history = self.load_history(now).await?;

        let components = self.score_components(&history);
        for component in &components {
            if !component.value.is_finite() {
                return Err(EthoscopeError::Computation(format!(
                    "component {} produced a non-finite score",
                    component.name
                )));
            }
        }

        let weighted: f64 = components.iter().map(ComponentScore::weighted).sum();
        if !weighted.is_finite() {
            return Err(EthoscopeError::Computation(
                "weighted score is not finite".to_string(),
            ));
        }
        let overall_score = clamp_score(weighted);

        let anomalies = self.detect_anomalies(&history);

        let mut health_status = HealthStatus::from_score(overall_score);
        if anomalies.iter().any(|a| a.severity == Severity::Critical) {
            health_status = health_status.min(HealthStatus::Poor);
        }

        let with_data = components.iter().filter(|c| c.has_data).count();
        let confidence = with_data as f64 / components.len() as f64;

        info!(
            overall_score,
            status = %health_status,
            anomalies = anomalies.len(),
            confidence,
            "Health score calculated"
        );

        Ok(NetworkHealthScoreRecord {
            timestamp: now,
            overall_score,
            components,
            anomalies,
            health_status,
            confidence,
        })
    }

    async fn load_history(&self, now: DateTime<Utc>) -> Result<MetricHistory> {
        let range = TimeRange::trailing(now, WindowSpan::Week.duration());
        let mut history = MetricHistory::new(now);
        for kind in SCORED_KINDS {
            let records = self.sink.query(kind, range).await?;
            debug!(kind = %kind, records = records.len(), "Loaded history");
            history.insert(kind, records);
        }
        Ok(history)
    }

    fn score_components(&self, history: &MetricHistory) -> Vec<ComponentScore> {
        let gas = history.gas_prices();
        let gas_windows: Vec<_> = WindowSpan::ALL
            .iter()
            .map(|span| history.window(&gas, *span).samples)
            .collect();
        let weighted_windows: Vec<(f64, &[f64])> = GAS_WINDOW_WEIGHTS
            .iter()
            .zip(&gas_windows)
            .map(|(weight, window)| (*weight, window.as_slice()))
            .collect();
        let current_gas = history.window(&gas, WindowSpan::Hour).samples.last().copied();

        let intervals = history.window(&history.block_intervals(), WindowSpan::Hour);
        let revenue = history.window(&history.mev_revenue(), WindowSpan::Hour);
        let builders = history.mev_builders(WindowSpan::Hour);
        let utilization = history.window(&history.gas_utilization(), WindowSpan::Hour);

        let pending = history.window(&history.mempool_pending(), WindowSpan::Day);
        let current_pending = history
            .window(&history.mempool_pending(), WindowSpan::Hour)
            .samples
            .last()
            .copied();

        let day_start = history.now() - WindowSpan::Day.duration();
        let heads: Vec<_> = history
            .block_heads()
            .into_iter()
            .filter(|h| h.captured_at >= day_start)
            .collect();

        ComponentName::ALL
            .iter()
            .map(|name| {
                let scored = match name {
                    ComponentName::GasEfficiency => {
                        components::gas_efficiency(current_gas, &weighted_windows)
                    }
                    ComponentName::NetworkStability => {
                        components::network_stability(&intervals.samples)
                    }
                    ComponentName::MevFairness => {
                        components::mev_fairness(&revenue.samples, &builders)
                    }
                    ComponentName::BlockProduction => {
                        components::block_production(&utilization.samples)
                    }
                    ComponentName::MempoolHealth => {
                        components::mempool_health(current_pending, &pending.samples)
                    }
                    ComponentName::ValidatorPerformance => {
                        components::validator_performance(&heads)
                    }
                };

                let fallback = match name {
                    ComponentName::MevFairness => MEV_NEUTRAL_SCORE,
                    _ => NEUTRAL_SCORE,
                };
                if scored.is_none() {
                    debug!(component = %name, fallback, "No data, using neutral score");
                }

                ComponentScore {
                    name: *name,
                    value: scored.map(clamp_score).unwrap_or(fallback),
                    weight: self.weights.get(*name),
                    has_data: scored.is_some(),
                }
            })
            .collect()
    }

    fn detect_anomalies(&self, history: &MetricHistory) -> Vec<AnomalyFlag> {
        let tracked = [
            AnomalySeries {
                kind: MetricKind::Gas,
                name: "gas_price_gwei",
                samples: history.gas_prices(),
                expected: None,
            },
            AnomalySeries {
                kind: MetricKind::Block,
                name: "block_interval_secs",
                samples: history.block_intervals(),
                expected: Some(SLOT_SECONDS),
            },
            AnomalySeries {
                kind: MetricKind::Mev,
                name: "mev_revenue_eth",
                samples: history.mev_revenue(),
                expected: None,
            },
            AnomalySeries {
                kind: MetricKind::Mempool,
                name: "pending_count",
                samples: history.mempool_pending(),
                expected: None,
            },
        ];

        let mut checked = self
            .checked_through
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut flags = Vec::new();
        for series in tracked {
            let Some((newest, _)) = series.samples.last().copied() else {
                continue;
            };

            // First sight of a series checks only its newest sample
            let candidates: Vec<(DateTime<Utc>, f64)> = match checked.get(series.name) {
                Some(through) => series
                    .samples
                    .iter()
                    .filter(|(at, _)| at > through)
                    .copied()
                    .collect(),
                None => series.samples.last().copied().into_iter().collect(),
            };

            for (observed_at, value) in candidates {
                let baseline = preceding(&series.samples, observed_at, Duration::hours(24));
                if baseline.len() < self.min_anomaly_samples {
                    continue;
                }
                let observation = Observation {
                    metric_kind: series.kind,
                    series: series.name.to_string(),
                    value,
                    observed_at,
                };
                for flag in self.detector.check(&observation, &baseline, series.expected) {
                    warn!(
                        series = series.name,
                        method = %flag.method,
                        value = flag.observed_value,
                        bound_or_score = flag.bound_or_score,
                        severity = %flag.severity,
                        "Anomaly detected"
                    );
                    flags.push(flag);
                }
            }

            checked.insert(series.name, newest);
        }
        flags
    }
}
