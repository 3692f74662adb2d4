//! MEV-Boost relay collector
//!
//! Polls the `proposer_payload_delivered` data API of each configured relay.
//! Relays fail independently: one unreachable relay only removes its own payloads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethoscope_core::{CollectorSettings, MetricKind, RawMetricRecord};
use ethoscope_resilience::{CircuitOpen, CircuitState};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use crate::collector::{parse_decimal, Collector, CollectorHealth, CollectorStats, WEI_PER_ETH};
use crate::guard::{CallError, GuardedSource};
use crate::source::{Source, SourceFault, SourceRequest};

const DELIVERED_PATH: &str = "/relay/v1/data/bidtraces/proposer_payload_delivered?limit=100";

/// Payloads emitted as individual `mev` records per invocation
const EMITTED_PAYLOADS: usize = 50;
/// Payloads aggregated into the `mev_boost_stats` record
const AGGREGATED_PAYLOADS: usize = 100;

const KINDS: [MetricKind; 2] = [MetricKind::Mev, MetricKind::MevBoostStats];

/// One delivered payload as reported by a relay
#[derive(Debug, Clone, PartialEq)]
struct DeliveredPayload {
    relay: String,
    slot: Option<u64>,
    block_number: u64,
    block_hash: Option<String>,
    builder_pubkey: Option<String>,
    proposer_fee_recipient: Option<String>,
    value_wei: u128,
    gas_used: Option<u64>,
    gas_limit: Option<u64>,
    num_tx: Option<u64>,
}

impl DeliveredPayload {
    fn parse(relay: &str, entry: &Value) -> Option<Self> {
        let number = |name: &str| {
            entry
                .get(name)
                .and_then(parse_decimal)
                .and_then(|v| u64::try_from(v).ok())
        };
        let text = |name: &str| entry.get(name).and_then(Value::as_str).map(str::to_string);

        Some(Self {
            relay: relay.to_string(),
            slot: number("slot"),
            block_number: number("block_number")?,
            block_hash: text("block_hash"),
            builder_pubkey: text("builder_pubkey"),
            proposer_fee_recipient: text("proposer_fee_recipient"),
            value_wei: entry.get("value").and_then(parse_decimal)?,
            gas_used: number("gas_used"),
            gas_limit: number("gas_limit"),
            num_tx: number("num_tx"),
        })
    }

    fn value_eth(&self) -> f64 {
        self.value_wei as f64 / WEI_PER_ETH
    }

    fn into_record(self, source_id: &str, captured_at: DateTime<Utc>) -> RawMetricRecord {
        let value_eth = self.value_eth();
        RawMetricRecord::new(source_id, "mev", captured_at)
            .with_field("relay", self.relay)
            .with_field("block_number", self.block_number)
            .with_field("mev_revenue_eth", value_eth)
            .with_field("value_wei", self.value_wei as f64)
            .with_optional_field("slot", self.slot)
            .with_optional_field("block_hash", self.block_hash)
            .with_optional_field("builder_pubkey", self.builder_pubkey)
            .with_optional_field("proposer_fee_recipient", self.proposer_fee_recipient)
            .with_optional_field("gas_used", self.gas_used)
            .with_optional_field("gas_limit", self.gas_limit)
            .with_optional_field("num_tx", self.num_tx)
    }
}

pub struct MevRelayCollector {
    id: String,
    relays: Vec<(String, Arc<GuardedSource>)>,
    health: CollectorHealth,
}

impl MevRelayCollector {
    /// `relays` pairs each relay name with the source for its base URL
    pub fn new(
        id: impl Into<String>,
        relays: Vec<(String, Arc<dyn Source>)>,
        settings: &CollectorSettings,
    ) -> Self {
        let id = id.into();
        let relays = relays
            .into_iter()
            .map(|(name, source)| {
                let guarded = GuardedSource::new(format!("{}/{}", id, name), source, settings);
                (name, Arc::new(guarded))
            })
            .collect();

        Self {
            id,
            relays,
            health: CollectorHealth::new(),
        }
    }

    fn stats_record(
        &self,
        payloads: &[DeliveredPayload],
        relays_responding: usize,
        captured_at: DateTime<Utc>,
    ) -> RawMetricRecord {
        let window = &payloads[..payloads.len().min(AGGREGATED_PAYLOADS)];
        let total_value_eth: f64 = window.iter().map(DeliveredPayload::value_eth).sum();

        let mut builders: BTreeMap<&str, usize> = BTreeMap::new();
        for payload in window {
            if let Some(builder) = payload.builder_pubkey.as_deref() {
                *builders.entry(builder).or_default() += 1;
            }
        }
        // Ties resolve to the lexicographically smallest key
        let top_builder = builders
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(builder, count)| (builder.to_string(), *count));

        let mut record = RawMetricRecord::new(self.id.as_str(), "mev_boost_stats", captured_at)
            .with_field("block_count", window.len())
            .with_field("total_value_eth", total_value_eth)
            .with_field("avg_value_eth", total_value_eth / window.len().max(1) as f64)
            .with_field("unique_builders", builders.len())
            .with_field("relays_responding", relays_responding);

        if let Some((builder, count)) = top_builder {
            record = record
                .with_field("top_builder", builder)
                .with_field(
                    "top_builder_share_pct",
                    count as f64 * 100.0 / window.len().max(1) as f64,
                );
        }
        record
    }
}

#[async_trait]
impl Collector for MevRelayCollector {
    fn id(&self) -> &str {
        &self.id
    }

    fn metric_kinds(&self) -> &[MetricKind] {
        &KINDS
    }

    #[instrument(skip(self), fields(collector = %self.id, relays = self.relays.len()))]
    async fn collect(&self) -> Result<Vec<RawMetricRecord>, CircuitOpen> {
        self.health.record_invocation();
        let captured_at = Utc::now();

        let mut calls = JoinSet::new();
        for (name, relay) in &self.relays {
            let name = name.clone();
            let relay = Arc::clone(relay);
            calls.spawn(async move {
                let result = relay.call_cached(&SourceRequest::get(DELIVERED_PATH)).await;
                (name, result)
            });
        }

        let mut payloads = Vec::new();
        let mut responding = 0;
        let mut first_open: Option<CircuitOpen> = None;
        let mut open_count = 0;

        while let Some(joined) = calls.join_next().await {
            let (relay, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.health.record_fault(&self.id, "relay task", &e);
                    continue;
                }
            };

            match result {
                Ok(Value::Array(entries)) => {
                    responding += 1;
                    let before = payloads.len();
                    payloads.extend(
                        entries
                            .iter()
                            .filter_map(|entry| DeliveredPayload::parse(&relay, entry)),
                    );
                    debug!(relay = %relay, payloads = payloads.len() - before, "relay responded");
                }
                Ok(other) => {
                    let fault = SourceFault::Malformed(format!(
                        "expected an array of payloads, got {}",
                        json_type(&other)
                    ));
                    self.health.record_fault(&self.id, &relay, &fault);
                }
                Err(CallError::CircuitOpen(open)) => {
                    open_count += 1;
                    self.health
                        .record_call_error(&self.id, &relay, &CallError::CircuitOpen(open.clone()));
                    first_open.get_or_insert(open);
                }
                Err(err) => self.health.record_call_error(&self.id, &relay, &err),
            }
        }

        if open_count == self.relays.len() {
            if let Some(open) = first_open {
                return Err(open);
            }
        }

        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        // Newest first; relay name keeps the order total
        payloads.sort_by(|a, b| {
            b.block_number
                .cmp(&a.block_number)
                .then_with(|| a.relay.cmp(&b.relay))
        });

        let stats = self.stats_record(&payloads, responding, captured_at);
        let mut records: Vec<RawMetricRecord> = payloads
            .into_iter()
            .take(EMITTED_PAYLOADS)
            .map(|payload| payload.into_record(&self.id, captured_at))
            .collect();
        records.push(stats);

        self.health.record_emitted(records.len());
        Ok(records)
    }

    fn stats(&self) -> CollectorStats {
        self.health.snapshot()
    }

    fn circuits(&self) -> Vec<(String, CircuitState)> {
        self.relays
            .iter()
            .map(|(_, relay)| (relay.name().to_string(), relay.circuit_state()))
            .collect()
    }

    fn purge_caches(&self) -> usize {
        self.relays.iter().map(|(_, relay)| relay.purge_cache()).sum()
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;
    use ethoscope_core::{CollectorKind, RateLimitPolicy, RateLimitSettings};
    use serde_json::json;

    fn payload(block: u64, value_wei: &str, builder: &str) -> Value {
        json!({
            "slot": (block + 1_000_000).to_string(),
            "block_number": block.to_string(),
            "block_hash": format!("0x{:064x}", block),
            "builder_pubkey": builder,
            "proposer_fee_recipient": "0x388c818ca8b9251b393131c08a736a67ccb19297",
            "value": value_wei,
            "gas_used": "15000000",
            "gas_limit": "30000000",
            "num_tx": "150"
        })
    }

    fn relay(entries: Value) -> MockSource {
        MockSource::new("mock://relay").with_response(DELIVERED_PATH, entries)
    }

    fn settings() -> CollectorSettings {
        CollectorSettings {
            rate_limit: RateLimitSettings {
                calls: 2,
                period_secs: 12,
                policy: RateLimitPolicy::Skip,
            },
            ..CollectorSettings::new(CollectorKind::MevRelay)
        }
    }

    #[tokio::test]
    async fn test_merges_relays_newest_first() {
        let flashbots = relay(json!([
            payload(100, "50000000000000000", "0xb1"),
            payload(98, "10000000000000000", "0xb2"),
        ]));
        let agnostic = relay(json!([payload(99, "30000000000000000", "0xb1")]));

        let collector = MevRelayCollector::new(
            "mev_relay",
            vec![
                ("flashbots".to_string(), Arc::new(flashbots) as Arc<dyn Source>),
                ("agnostic".to_string(), Arc::new(agnostic) as Arc<dyn Source>),
            ],
            &settings(),
        );

        let records = collector.collect().await.unwrap();
        assert_eq!(records.len(), 4);

        let blocks: Vec<f64> = records[..3]
            .iter()
            .map(|r| r.field_f64("block_number").unwrap())
            .collect();
        assert_eq!(blocks, vec![100.0, 99.0, 98.0]);
        assert_eq!(records[1].fields["relay"].as_str(), Some("agnostic"));
        assert_eq!(records[0].field_f64("mev_revenue_eth"), Some(0.05));

        let stats = &records[3];
        assert_eq!(stats.metric_kind, "mev_boost_stats");
        assert_eq!(stats.field_f64("block_count"), Some(3.0));
        assert_eq!(stats.field_f64("unique_builders"), Some(2.0));
        assert_eq!(stats.fields["top_builder"].as_str(), Some("0xb1"));
        assert!((stats.field_f64("total_value_eth").unwrap() - 0.09).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_failing_relay_does_not_block_others() {
        let healthy = relay(json!([payload(100, "1000", "0xb1")]));
        let broken = MockSource::new("mock://down");

        let collector = MevRelayCollector::new(
            "mev_relay",
            vec![
                ("flashbots".to_string(), Arc::new(healthy) as Arc<dyn Source>),
                ("bloxroute_max".to_string(), Arc::new(broken) as Arc<dyn Source>),
            ],
            &settings(),
        );

        let records = collector.collect().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(collector.stats().faults, 1);
    }

    #[tokio::test]
    async fn test_all_circuits_open_is_reported() {
        let down = MockSource::new("mock://down")
            .with_fault(DELIVERED_PATH, SourceFault::Status { status: 502, body: String::new() });
        let settings = CollectorSettings {
            failure_threshold: 1,
            rate_limit: RateLimitSettings {
                calls: 10,
                period_secs: 1,
                policy: RateLimitPolicy::Skip,
            },
            ..settings()
        };
        let collector = MevRelayCollector::new(
            "mev_relay",
            vec![("flashbots".to_string(), Arc::new(down.clone()) as Arc<dyn Source>)],
            &settings,
        );

        assert!(collector.collect().await.unwrap().is_empty());
        assert!(collector.collect().await.is_err());
        assert_eq!(down.call_count(), 1);
        assert_eq!(collector.circuits()[0].1, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_unexpected_shape_is_a_fault() {
        let odd = relay(json!({"error": "maintenance"}));
        let collector = MevRelayCollector::new(
            "mev_relay",
            vec![("agnostic".to_string(), Arc::new(odd) as Arc<dyn Source>)],
            &settings(),
        );

        assert!(collector.collect().await.unwrap().is_empty());
        assert!(collector.stats().last_fault.unwrap().contains("object"));
    }
}
