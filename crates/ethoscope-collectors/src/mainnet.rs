//! Ethereum mainnet collector (JSON-RPC)

use async_trait::async_trait;
use chrono::Utc;
use ethoscope_core::{CollectorSettings, MetricKind, RawMetricRecord};
use ethoscope_resilience::{CircuitOpen, CircuitState};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

use crate::collector::{parse_quantity, parse_quantity_u64, Collector, CollectorHealth, CollectorStats};
use crate::guard::{CallError, GuardedSource};
use crate::source::{Source, SourceRequest};

/// Transactions sampled from the pending block
const MEMPOOL_SAMPLE: usize = 100;

const KINDS: [MetricKind; 3] = [MetricKind::Block, MetricKind::Gas, MetricKind::Mempool];

/// Samples the latest block, gas prices and a pending-transaction snapshot
pub struct MainnetCollector {
    id: String,
    rpc: GuardedSource,
    last_block: Mutex<Option<u64>>,
    health: CollectorHealth,
}

impl MainnetCollector {
    pub fn new(id: impl Into<String>, source: Arc<dyn Source>, settings: &CollectorSettings) -> Self {
        let id = id.into();
        Self {
            rpc: GuardedSource::new(id.clone(), source, settings),
            id,
            last_block: Mutex::new(None),
            health: CollectorHealth::new(),
        }
    }

    /// Fetch a value, recording anything but an open circuit as "no data"
    async fn fetch(
        &self,
        request: SourceRequest,
        cached: bool,
    ) -> Result<Option<Value>, CircuitOpen> {
        let result = if cached {
            self.rpc.call_cached(&request).await
        } else {
            self.rpc.call(&request).await
        };

        match result {
            Ok(value) => Ok(Some(value)),
            Err(CallError::CircuitOpen(open)) => {
                self.health
                    .record_call_error(&self.id, &request.describe(), &CallError::CircuitOpen(open.clone()));
                Err(open)
            }
            Err(err) => {
                self.health.record_call_error(&self.id, &request.describe(), &err);
                Ok(None)
            }
        }
    }

    /// Fetch a reading that follows the block
    ///
    /// Once a circuit opens the remaining readings are skipped; the block
    /// record already built is still returned.
    async fn fetch_followup(&self, request: SourceRequest, circuit_open: &mut bool) -> Option<Value> {
        if *circuit_open {
            return None;
        }
        match self.fetch(request, true).await {
            Ok(value) => value,
            Err(open) => {
                debug!(retry_in = ?open.retry_in, "circuit opened mid-collect, keeping partial records");
                *circuit_open = true;
                None
            }
        }
    }

    fn is_duplicate(&self, block_number: u64) -> bool {
        let mut last = self.last_block.lock().unwrap_or_else(|p| p.into_inner());
        if *last == Some(block_number) {
            return true;
        }
        *last = Some(block_number);
        false
    }
}

#[async_trait]
impl Collector for MainnetCollector {
    fn id(&self) -> &str {
        &self.id
    }

    fn metric_kinds(&self) -> &[MetricKind] {
        &KINDS
    }

    #[instrument(skip(self), fields(collector = %self.id))]
    async fn collect(&self) -> Result<Vec<RawMetricRecord>, CircuitOpen> {
        self.health.record_invocation();
        let captured_at = Utc::now();

        let Some(block) = self
            .fetch(SourceRequest::rpc("eth_getBlockByNumber", json!(["latest", false])), false)
            .await?
        else {
            return Ok(Vec::new());
        };

        let Some(block_number) = block.get("number").and_then(parse_quantity_u64) else {
            self.health
                .record_fault(&self.id, "eth_getBlockByNumber", &"latest block has no number");
            return Ok(Vec::new());
        };

        if self.is_duplicate(block_number) {
            debug!(block_number, "block already emitted, skipping");
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(3);

        let transaction_count = block
            .get("transactions")
            .and_then(Value::as_array)
            .map(|txs| txs.len());
        let text = |name: &str| block.get(name).and_then(Value::as_str).map(str::to_string);
        let quantity = |name: &str| block.get(name).and_then(parse_quantity_u64);
        let base_fee_wei = quantity("baseFeePerGas");

        records.push(
            RawMetricRecord::new(self.id.as_str(), "block", captured_at)
                .with_field("block_number", block_number)
                .with_optional_field("block_hash", text("hash"))
                .with_optional_field("parent_hash", text("parentHash"))
                .with_optional_field("miner", text("miner"))
                .with_optional_field("block_timestamp", quantity("timestamp"))
                .with_optional_field("gas_used", quantity("gasUsed"))
                .with_optional_field("gas_limit", quantity("gasLimit"))
                .with_optional_field("base_fee_wei", base_fee_wei)
                .with_optional_field("transaction_count", transaction_count),
        );

        let mut circuit_open = false;

        if let Some(gas_price) = self
            .fetch_followup(SourceRequest::rpc("eth_gasPrice", json!([])), &mut circuit_open)
            .await
            .as_ref()
            .and_then(parse_quantity)
        {
            let priority = self
                .fetch_followup(
                    SourceRequest::rpc("eth_maxPriorityFeePerGas", json!([])),
                    &mut circuit_open,
                )
                .await
                .as_ref()
                .and_then(parse_quantity);

            records.push(
                RawMetricRecord::new(self.id.as_str(), "gas_price", captured_at)
                    .with_field("block_number", block_number)
                    .with_field("gas_price_wei", gas_price as f64)
                    .with_optional_field("base_fee_wei", base_fee_wei)
                    .with_optional_field("max_priority_fee_wei", priority.map(|p| p as f64)),
            );
        }

        if let Some(pending) = self
            .fetch_followup(
                SourceRequest::rpc("eth_getBlockByNumber", json!(["pending", true])),
                &mut circuit_open,
            )
            .await
        {
            let txs = pending
                .get("transactions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            let sampled: Vec<f64> = txs
                .iter()
                .take(MEMPOOL_SAMPLE)
                .filter_map(|tx| {
                    tx.get("gasPrice")
                        .or_else(|| tx.get("maxFeePerGas"))
                        .and_then(parse_quantity)
                })
                .map(|wei| wei as f64)
                .collect();

            let avg = (!sampled.is_empty()).then(|| sampled.iter().sum::<f64>() / sampled.len() as f64);
            let max = sampled.iter().cloned().reduce(f64::max);

            records.push(
                RawMetricRecord::new(self.id.as_str(), "mempool", captured_at)
                    .with_field("block_number", block_number)
                    .with_field("pending_count", txs.len())
                    .with_field("sampled_count", sampled.len())
                    .with_optional_field("avg_gas_price_wei", avg)
                    .with_optional_field("max_gas_price_wei", max),
            );
        }

        self.health.record_emitted(records.len());
        Ok(records)
    }

    fn stats(&self) -> CollectorStats {
        self.health.snapshot()
    }

    fn circuits(&self) -> Vec<(String, CircuitState)> {
        vec![(self.rpc.name().to_string(), self.rpc.circuit_state())]
    }

    fn purge_caches(&self) -> usize {
        self.rpc.purge_cache()
    }
}
