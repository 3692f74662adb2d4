//! L2 network collector
//!
//! Samples each configured rollup/sidechain over JSON-RPC and estimates what
//! common transactions cost there in USD.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethoscope_core::{CollectorSettings, L2NetworkSettings, MetricKind, RawMetricRecord};
use ethoscope_resilience::{CircuitOpen, CircuitState};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::instrument;

use crate::collector::{
    parse_quantity, parse_quantity_u64, Collector, CollectorHealth, CollectorStats, WEI_PER_GWEI,
};
use crate::guard::{CallError, GuardedSource};
use crate::source::{Source, SourceFault, SourceRequest};

/// Gas used by the reference transactions priced in `l2_transaction_costs`
const REFERENCE_TRANSACTIONS: [(&str, u64); 4] = [
    ("eth_transfer_usd", 21_000),
    ("erc20_transfer_usd", 65_000),
    ("uniswap_swap_usd", 150_000),
    ("nft_mint_usd", 100_000),
];

const KINDS: [MetricKind; 2] = [MetricKind::L2Network, MetricKind::L2TransactionCosts];

struct L2Endpoint {
    network: L2NetworkSettings,
    rpc: Arc<GuardedSource>,
}

/// What one network produced in one invocation
struct NetworkSample {
    block_number: u64,
    block_timestamp: Option<u64>,
    transaction_count: Option<usize>,
    gas_price_gwei: Option<f64>,
    rpc_latency_ms: f64,
}

pub struct L2Collector {
    id: String,
    endpoints: Vec<L2Endpoint>,
    eth_usd_price: f64,
    /// Last (block number, block timestamp) per network, for block time
    previous: Mutex<HashMap<String, (u64, u64)>>,
    health: CollectorHealth,
}

impl L2Collector {
    pub fn new(
        id: impl Into<String>,
        networks: Vec<(L2NetworkSettings, Arc<dyn Source>)>,
        settings: &CollectorSettings,
    ) -> Self {
        let id = id.into();
        let endpoints = networks
            .into_iter()
            .map(|(network, source)| {
                let rpc = GuardedSource::new(format!("{}/{}", id, network.name), source, settings);
                L2Endpoint {
                    network,
                    rpc: Arc::new(rpc),
                }
            })
            .collect();

        Self {
            id,
            endpoints,
            eth_usd_price: settings.eth_usd_price,
            previous: Mutex::new(HashMap::new()),
            health: CollectorHealth::new(),
        }
    }

    async fn sample(rpc: Arc<GuardedSource>) -> Result<NetworkSample, CallError> {
        let started = Instant::now();
        let block = rpc
            .call(&SourceRequest::rpc("eth_getBlockByNumber", json!(["latest", false])))
            .await?;
        let rpc_latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let block_number = block
            .get("number")
            .and_then(parse_quantity_u64)
            .ok_or_else(|| SourceFault::Malformed("latest block has no number".to_string()))?;

        // Gas price is best effort; the block alone is a useful sample
        let gas_price_gwei = match rpc
            .call_cached(&SourceRequest::rpc("eth_gasPrice", json!([])))
            .await
        {
            Ok(value) => parse_quantity(&value).map(|wei| wei as f64 / WEI_PER_GWEI),
            Err(CallError::CircuitOpen(open)) => return Err(CallError::CircuitOpen(open)),
            Err(_) => None,
        };

        Ok(NetworkSample {
            block_number,
            block_timestamp: block.get("timestamp").and_then(parse_quantity_u64),
            transaction_count: block
                .get("transactions")
                .and_then(Value::as_array)
                .map(Vec::len),
            gas_price_gwei,
            rpc_latency_ms,
        })
    }

    /// Average seconds per block since the previous observation of this network
    fn block_time(&self, network: &str, sample: &NetworkSample) -> Option<f64> {
        let timestamp = sample.block_timestamp?;
        let mut previous = self.previous.lock().unwrap_or_else(|p| p.into_inner());
        let last = previous.insert(network.to_string(), (sample.block_number, timestamp));

        let (last_number, last_timestamp) = last?;
        if sample.block_number <= last_number || timestamp < last_timestamp {
            return None;
        }
        Some((timestamp - last_timestamp) as f64 / (sample.block_number - last_number) as f64)
    }

    fn records_for(
        &self,
        network: &L2NetworkSettings,
        sample: NetworkSample,
        captured_at: DateTime<Utc>,
    ) -> Vec<RawMetricRecord> {
        let block_time = self.block_time(&network.name, &sample);
        let source_id = format!("{}/{}", self.id, network.name);

        let mut records = vec![RawMetricRecord::new(source_id.as_str(), "l2_network", captured_at)
            .with_field("network", network.name.as_str())
            .with_field("chain_id", network.chain_id)
            .with_field("rollup_type", network.rollup_type.as_str())
            .with_field("block_number", sample.block_number)
            .with_field("rpc_latency_ms", sample.rpc_latency_ms)
            .with_optional_field("block_timestamp", sample.block_timestamp)
            .with_optional_field("transaction_count", sample.transaction_count)
            .with_optional_field("gas_price_gwei", sample.gas_price_gwei)
            .with_optional_field("block_time_secs", block_time)];

        if let Some(gas_price_gwei) = sample.gas_price_gwei {
            let mut costs = RawMetricRecord::new(source_id.as_str(), "l2_costs", captured_at)
                .with_field("network", network.name.as_str())
                .with_field("chain_id", network.chain_id)
                .with_field("gas_price_gwei", gas_price_gwei)
                .with_field("eth_usd_price", self.eth_usd_price);

            for (name, gas) in REFERENCE_TRANSACTIONS {
                let usd = gas as f64 * gas_price_gwei / WEI_PER_GWEI * self.eth_usd_price;
                costs = costs.with_field(name, usd);
            }
            records.push(costs);
        }

        records
    }
}

#[async_trait]
impl Collector for L2Collector {
    fn id(&self) -> &str {
        &self.id
    }

    fn metric_kinds(&self) -> &[MetricKind] {
        &KINDS
    }

    #[instrument(skip(self), fields(collector = %self.id, networks = self.endpoints.len()))]
    async fn collect(&self) -> Result<Vec<RawMetricRecord>, CircuitOpen> {
        self.health.record_invocation();
        let captured_at = Utc::now();

        let mut calls = JoinSet::new();
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let rpc = Arc::clone(&endpoint.rpc);
            calls.spawn(async move { (index, Self::sample(rpc).await) });
        }

        let mut samples = Vec::with_capacity(self.endpoints.len());
        let mut first_open: Option<CircuitOpen> = None;
        let mut open_count = 0;

        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((index, Ok(sample))) => samples.push((index, sample)),
                Ok((index, Err(err))) => {
                    let name = &self.endpoints[index].network.name;
                    self.health.record_call_error(&self.id, name, &err);
                    if let CallError::CircuitOpen(open) = err {
                        open_count += 1;
                        first_open.get_or_insert(open);
                    }
                }
                Err(e) => self.health.record_fault(&self.id, "network task", &e),
            }
        }

        if !self.endpoints.is_empty() && open_count == self.endpoints.len() {
            if let Some(open) = first_open {
                return Err(open);
            }
        }

        // Configuration order, independent of which network answered first
        samples.sort_by_key(|(index, _)| *index);
        let records: Vec<RawMetricRecord> = samples
            .into_iter()
            .flat_map(|(index, sample)| {
                self.records_for(&self.endpoints[index].network, sample, captured_at)
            })
            .collect();

        self.health.record_emitted(records.len());
        Ok(records)
    }

    fn stats(&self) -> CollectorStats {
        self.health.snapshot()
    }

    fn circuits(&self) -> Vec<(String, CircuitState)> {
        self.endpoints
            .iter()
            .map(|e| (e.rpc.name().to_string(), e.rpc.circuit_state()))
            .collect()
    }

    fn purge_caches(&self) -> usize {
        self.endpoints.iter().map(|e| e.rpc.purge_cache()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;
    use ethoscope_core::CollectorKind;

    const LATEST: &str = r#"eth_getBlockByNumber ["latest",false]"#;

    fn network(name: &str, chain_id: u64) -> L2NetworkSettings {
        L2NetworkSettings {
            name: name.to_string(),
            chain_id,
            rollup_type: "optimistic_rollup".to_string(),
            rpc_url: format!("mock://{}", name),
        }
    }

    fn node(number: u64, timestamp: u64, gas_price_wei: u64) -> MockSource {
        MockSource::new("mock://l2")
            .with_response(
                LATEST,
                json!({
                    "number": format!("0x{:x}", number),
                    "timestamp": format!("0x{:x}", timestamp),
                    "transactions": ["0x01", "0x02"]
                }),
            )
            .with_response("eth_gasPrice", json!(format!("0x{:x}", gas_price_wei)))
    }

    fn settings() -> CollectorSettings {
        CollectorSettings {
            eth_usd_price: 2000.0,
            cache_ttl_secs: 0,
            ..CollectorSettings::new(CollectorKind::L2)
        }
    }

    #[tokio::test]
    async fn test_network_and_cost_records() {
        // 0.01 gwei
        let base = node(1_000, 1_700_000_000, 10_000_000);
        let collector = L2Collector::new(
            "l2",
            vec![(network("base", 8453), Arc::new(base) as Arc<dyn Source>)],
            &settings(),
        );

        let records = collector.collect().await.unwrap();
        assert_eq!(records.len(), 2);

        let net = &records[0];
        assert_eq!(net.metric_kind, "l2_network");
        assert_eq!(net.source_id, "l2/base");
        assert_eq!(net.field_f64("chain_id"), Some(8453.0));
        assert_eq!(net.field_f64("transaction_count"), Some(2.0));

        let costs = &records[1];
        assert_eq!(costs.metric_kind, "l2_costs");
        // 21000 gas * 0.01 gwei = 0.00000021 ETH = $0.00042
        assert!((costs.field_f64("eth_transfer_usd").unwrap() - 0.00042).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_block_time_from_consecutive_samples() {
        let arb = node(100, 1_000, 10_000_000);
        let collector = L2Collector::new(
            "l2",
            vec![(network("arbitrum", 42161), Arc::new(arb.clone()) as Arc<dyn Source>)],
            &settings(),
        );

        let first = collector.collect().await.unwrap();
        assert!(!first[0].fields.contains_key("block_time_secs"));

        arb.set_response(
            LATEST,
            json!({"number": format!("0x{:x}", 148), "timestamp": format!("0x{:x}", 1_012)}),
        );
        let second = collector.collect().await.unwrap();
        assert_eq!(second[0].field_f64("block_time_secs"), Some(0.25));
    }

    #[tokio::test]
    async fn test_one_failing_network_does_not_block_others() {
        let optimism = node(5_000, 1_700_000_000, 1_000_000);
        let scroll = MockSource::new("mock://scroll")
            .with_fault(LATEST, SourceFault::Timeout(std::time::Duration::from_secs(5)));

        let collector = L2Collector::new(
            "l2",
            vec![
                (network("scroll", 534352), Arc::new(scroll) as Arc<dyn Source>),
                (network("optimism", 10), Arc::new(optimism) as Arc<dyn Source>),
            ],
            &settings(),
        );

        let records = collector.collect().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.source_id == "l2/optimism"));
        assert_eq!(collector.stats().faults, 1);
    }

    #[tokio::test]
    async fn test_missing_gas_price_skips_cost_record() {
        let polygon = MockSource::new("mock://polygon").with_response(
            LATEST,
            json!({"number": "0x10", "timestamp": "0x20"}),
        );
        let collector = L2Collector::new(
            "l2",
            vec![(network("polygon", 137), Arc::new(polygon) as Arc<dyn Source>)],
            &settings(),
        );

        let records = collector.collect().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metric_kind, "l2_network");
    }
}
