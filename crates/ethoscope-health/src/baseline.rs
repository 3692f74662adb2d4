//! Baseline windows rebuilt from stored history on every scoring cycle

use chrono::{DateTime, Duration, Utc};
use ethoscope_core::{MetricKind, ValidatedRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Nominal slot time on Ethereum mainnet
pub const SLOT_SECONDS: f64 = 12.0;

/// A time-stamped sample series, oldest first
pub type Series = Vec<(DateTime<Utc>, f64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WindowSpan {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
}

impl WindowSpan {
    pub const ALL: [WindowSpan; 3] = [Self::Hour, Self::Day, Self::Week];

    pub fn duration(&self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::hours(24),
            Self::Week => Duration::days(7),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "1h",
            Self::Day => "24h",
            Self::Week => "7d",
        }
    }
}

impl std::fmt::Display for WindowSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Samples of one series inside one trailing span
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineWindow {
    pub span: WindowSpan,
    pub samples: Vec<f64>,
}

impl BaselineWindow {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A block head as seen by the mainnet collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHead {
    pub number: i64,
    pub timestamp: i64,
    pub captured_at: DateTime<Utc>,
}

/// Stored records of the scored kinds, read once per cycle
#[derive(Debug, Clone)]
pub struct MetricHistory {
    now: DateTime<Utc>,
    records: BTreeMap<MetricKind, Vec<ValidatedRecord>>,
}

impl MetricHistory {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            records: BTreeMap::new(),
        }
    }

    pub fn with_records(mut self, kind: MetricKind, records: Vec<ValidatedRecord>) -> Self {
        self.insert(kind, records);
        self
    }

    pub fn insert(&mut self, kind: MetricKind, mut records: Vec<ValidatedRecord>) {
        records.sort_by_key(|r| r.captured_at);
        self.records.insert(kind, records);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn records(&self, kind: MetricKind) -> &[ValidatedRecord] {
        self.records.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// One numeric field of one kind over time
    pub fn series(&self, kind: MetricKind, field: &str) -> Series {
        self.records(kind)
            .iter()
            .filter_map(|r| Some((r.captured_at, r.field_f64(field)?)))
            .filter(|(_, v)| v.is_finite())
            .collect()
    }

    /// A numeric field of one kind, one sample per distinct block number
    ///
    /// Relays keep reporting the same payloads across polls and the mainnet
    /// collector may be restarted; the first sighting of a block wins.
    pub fn series_by_block(&self, kind: MetricKind, field: &str) -> Series {
        let mut seen = BTreeSet::new();
        self.records(kind)
            .iter()
            .filter(|r| match r.field_i64("block_number") {
                Some(number) => seen.insert(number),
                None => true,
            })
            .filter_map(|r| Some((r.captured_at, r.field_f64(field)?)))
            .filter(|(_, v)| v.is_finite())
            .collect()
    }

    pub fn gas_prices(&self) -> Series {
        self.series(MetricKind::Gas, "gas_price_gwei")
    }

    pub fn mempool_pending(&self) -> Series {
        self.series(MetricKind::Mempool, "pending_count")
    }

    pub fn mev_revenue(&self) -> Series {
        self.series_by_block(MetricKind::Mev, "mev_revenue_eth")
    }

    pub fn gas_utilization(&self) -> Series {
        self.series_by_block(MetricKind::Block, "gas_utilization_pct")
    }

    /// Distinct block heads in block order
    pub fn block_heads(&self) -> Vec<BlockHead> {
        let mut heads: BTreeMap<i64, BlockHead> = BTreeMap::new();
        for record in self.records(MetricKind::Block) {
            let (Some(number), Some(timestamp)) = (
                record.field_i64("block_number"),
                record.field_i64("block_timestamp"),
            ) else {
                continue;
            };
            heads.entry(number).or_insert(BlockHead {
                number,
                timestamp,
                captured_at: record.captured_at,
            });
        }
        heads.into_values().collect()
    }

    /// Average seconds per block between consecutive observed heads
    ///
    /// Gaps of several blocks are divided out, so a skipped poll does not look
    /// like a slow block.
    pub fn block_intervals(&self) -> Series {
        self.block_heads()
            .windows(2)
            .filter_map(|pair| {
                let blocks = pair[1].number - pair[0].number;
                let seconds = pair[1].timestamp - pair[0].timestamp;
                (blocks > 0 && seconds >= 0)
                    .then(|| (pair[1].captured_at, seconds as f64 / blocks as f64))
            })
            .collect()
    }

    /// Builder identities of MEV payloads inside a span, one per block
    pub fn mev_builders(&self, span: WindowSpan) -> Vec<String> {
        let start = self.now - span.duration();
        let mut seen = BTreeSet::new();
        self.records(MetricKind::Mev)
            .iter()
            .filter(|r| r.captured_at >= start && r.captured_at <= self.now)
            .filter(|r| match r.field_i64("block_number") {
                Some(number) => seen.insert(number),
                None => true,
            })
            .filter_map(|r| r.field_str("builder_pubkey").map(str::to_string))
            .collect()
    }

    /// Samples of `series` inside the trailing `span`
    pub fn window(&self, series: &[(DateTime<Utc>, f64)], span: WindowSpan) -> BaselineWindow {
        let start = self.now - span.duration();
        BaselineWindow {
            span,
            samples: series
                .iter()
                .filter(|(at, _)| *at >= start && *at <= self.now)
                .map(|(_, v)| *v)
                .collect(),
        }
    }
}

/// Values of `series` captured in `[at - span, at)`
pub fn preceding(series: &[(DateTime<Utc>, f64)], at: DateTime<Utc>, span: Duration) -> Vec<f64> {
    let start = at - span;
    series
        .iter()
        .filter(|(t, _)| *t >= start && *t < at)
        .map(|(_, v)| *v)
        .collect()
}
