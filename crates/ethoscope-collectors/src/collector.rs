//! The collector contract and per-collector fault bookkeeping

use async_trait::async_trait;
use ethoscope_core::{MetricKind, RawMetricRecord};
use ethoscope_resilience::{CircuitOpen, CircuitState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::guard::CallError;

/// A unit that retrieves raw metrics from one external source
///
/// `collect` never fails past its own boundary: faults are recorded in
/// [`CollectorStats`] and yield an empty sequence. The one exception is a call
/// denied by an open circuit, which the orchestrator treats as "no data this cycle".
#[async_trait]
pub trait Collector: Send + Sync {
    /// Registry id, e.g. `mainnet`
    fn id(&self) -> &str;

    /// Kinds this collector may emit
    fn metric_kinds(&self) -> &[MetricKind];

    async fn collect(&self) -> Result<Vec<RawMetricRecord>, CircuitOpen>;

    /// Counters for observability
    fn stats(&self) -> CollectorStats;

    /// Breaker state of each protected endpoint
    fn circuits(&self) -> Vec<(String, CircuitState)>;

    /// Drop expired cache entries, returning how many were removed
    fn purge_caches(&self) -> usize {
        0
    }
}

/// Snapshot of a collector's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorStats {
    pub invocations: u64,
    pub records_emitted: u64,
    pub faults: u64,
    pub rate_limited: u64,
    pub circuit_rejections: u64,
    pub last_fault: Option<String>,
}

/// Interior-mutable counters shared by all collector variants
#[derive(Debug, Default)]
pub struct CollectorHealth {
    invocations: AtomicU64,
    records_emitted: AtomicU64,
    faults: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejections: AtomicU64,
    last_fault: Mutex<Option<String>>,
}

impl CollectorHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, count: usize) {
        self.records_emitted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a fault that produced no data (logged, never propagated)
    pub fn record_fault(&self, collector: &str, context: &str, fault: &dyn std::fmt::Display) {
        warn!(collector = %collector, context = %context, "collector fault: {}", fault);
        self.faults.fetch_add(1, Ordering::Relaxed);
        *self.last_fault.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(format!("{}: {}", context, fault));
    }

    /// Classify a failed guarded call
    pub fn record_call_error(&self, collector: &str, context: &str, err: &CallError) {
        match err {
            CallError::RateLimited(limited) => {
                debug!(collector = %collector, context = %context, "{}", limited);
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            CallError::CircuitOpen(open) => {
                debug!(collector = %collector, context = %context, "{}", open);
                self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            }
            CallError::Source(fault) => self.record_fault(collector, context, fault),
        }
    }

    pub fn snapshot(&self) -> CollectorStats {
        CollectorStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            last_fault: self
                .last_fault
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
        }
    }
}

/// Parse a JSON-RPC hex quantity (`"0x1b4"`)
pub fn parse_quantity(value: &Value) -> Option<u128> {
    let text = value.as_str()?;
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;
    if digits.is_empty() {
        return Some(0);
    }
    u128::from_str_radix(digits, 16).ok()
}

pub fn parse_quantity_u64(value: &Value) -> Option<u64> {
    parse_quantity(value).and_then(|v| u64::try_from(v).ok())
}

/// Parse a decimal string or JSON number (relay APIs send both)
pub fn parse_decimal(value: &Value) -> Option<u128> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    }
}

pub const WEI_PER_GWEI: f64 = 1e9;
pub const WEI_PER_ETH: f64 = 1e18;
