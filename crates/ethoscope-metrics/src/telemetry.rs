//! Pipeline telemetry: per-collector and global counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Types of telemetry events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEvent {
    /// Collector returned records (possibly none)
    Collected { records: usize, duration_ms: u64 },
    /// Collector was denied by an open circuit
    CircuitRejected,
    /// Collector missed the per-collector deadline
    TimedOut { timeout_ms: u64 },
    /// Collector task panicked or was cancelled
    Crashed { reason: String },
}

/// Counters for one collector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorTelemetry {
    pub invocations: u64,
    pub records: u64,
    pub empty_invocations: u64,
    pub circuit_rejections: u64,
    pub timeouts: u64,
    pub crashes: u64,
    pub last_duration_ms: Option<u64>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl CollectorTelemetry {
    fn record_event(&mut self, event: &TelemetryEvent) {
        self.invocations += 1;
        self.last_seen = Some(Utc::now());

        match event {
            TelemetryEvent::Collected {
                records,
                duration_ms,
            } => {
                self.records += *records as u64;
                if *records == 0 {
                    self.empty_invocations += 1;
                }
                self.last_duration_ms = Some(*duration_ms);
            }
            TelemetryEvent::CircuitRejected => self.circuit_rejections += 1,
            TelemetryEvent::TimedOut { .. } => self.timeouts += 1,
            TelemetryEvent::Crashed { .. } => self.crashes += 1,
        }
    }

    /// Fraction of invocations that produced at least one record
    pub fn yield_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 1.0;
        }
        let productive = self.invocations
            - self.empty_invocations
            - self.circuit_rejections
            - self.timeouts
            - self.crashes;
        productive as f64 / self.invocations as f64
    }
}

/// Telemetry for the whole pipeline
pub struct PipelineTelemetry {
    collectors: Arc<RwLock<HashMap<String, CollectorTelemetry>>>,
    collection_cycles: AtomicU64,
    records_processed: AtomicU64,
    records_dropped: AtomicU64,
    scoring_cycles: AtomicU64,
    scoring_failures: AtomicU64,
    anomalies_flagged: AtomicU64,
    persist_failures: AtomicU64,
}

impl PipelineTelemetry {
    pub fn new() -> Self {
        Self {
            collectors: Arc::new(RwLock::new(HashMap::new())),
            collection_cycles: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            scoring_cycles: AtomicU64::new(0),
            scoring_failures: AtomicU64::new(0),
            anomalies_flagged: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Record an event for a collector
    pub async fn record(&self, collector_id: &str, event: TelemetryEvent) {
        debug!(collector = %collector_id, ?event, "telemetry");
        let mut collectors = self.collectors.write().await;
        collectors
            .entry(collector_id.to_string())
            .or_default()
            .record_event(&event);
    }

    pub fn record_collection_cycle(&self, processed: usize, dropped: usize) {
        self.collection_cycles.fetch_add(1, Ordering::Relaxed);
        self.records_processed
            .fetch_add(processed as u64, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn record_scoring_cycle(&self, anomalies: usize) {
        self.scoring_cycles.fetch_add(1, Ordering::Relaxed);
        self.anomalies_flagged
            .fetch_add(anomalies as u64, Ordering::Relaxed);
    }

    pub fn record_scoring_failure(&self) {
        self.scoring_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn collector(&self, collector_id: &str) -> Option<CollectorTelemetry> {
        self.collectors.read().await.get(collector_id).cloned()
    }

    /// Snapshot everything, collectors in id order
    pub async fn summary(&self) -> TelemetrySummary {
        let collectors = self.collectors.read().await;
        TelemetrySummary {
            collection_cycles: self.collection_cycles.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            scoring_cycles: self.scoring_cycles.load(Ordering::Relaxed),
            scoring_failures: self.scoring_failures.load(Ordering::Relaxed),
            anomalies_flagged: self.anomalies_flagged.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            collectors: collectors
                .iter()
                .map(|(id, t)| (id.clone(), t.clone()))
                .collect(),
        }
    }
}

impl Default for PipelineTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable telemetry snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub collection_cycles: u64,
    pub records_processed: u64,
    pub records_dropped: u64,
    pub scoring_cycles: u64,
    pub scoring_failures: u64,
    pub anomalies_flagged: u64,
    pub persist_failures: u64,
    pub collectors: BTreeMap<String, CollectorTelemetry>,
}
