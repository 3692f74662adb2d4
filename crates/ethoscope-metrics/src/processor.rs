//! Metric processor: validate, normalize and categorize raw records
//!
//! Pure with respect to its input. Processing the same raw batch twice yields
//! byte-identical batches, so overlapping inputs are safe.

use ethoscope_core::{
    EthoscopeError, FieldValue, Fields, MetricKind, ProcessedMetricBatch, RawMetricRecord, Result,
    ValidatedRecord,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const HASH_PATTERN: &str = r"^0x[0-9a-fA-F]{64}$";
const WEI_PER_GWEI: f64 = 1e9;

/// Gas prices above this are accepted but logged
const SUSPICIOUS_GAS_PRICE_GWEI: f64 = 10_000.0;

/// A raw record that failed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedRecord {
    pub source_id: String,
    pub declared_kind: String,
    pub reason: String,
}

/// Output of one `process` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// One batch per kind that received at least one record
    pub batches: BTreeMap<MetricKind, ProcessedMetricBatch>,
    pub dropped: Vec<DroppedRecord>,
}

impl ProcessOutcome {
    pub fn record_count(&self) -> usize {
        self.batches.values().map(ProcessedMetricBatch::len).sum()
    }
}

pub struct MetricProcessor {
    hash_pattern: Regex,
}

impl MetricProcessor {
    pub fn new() -> Result<Self> {
        let hash_pattern = Regex::new(HASH_PATTERN)
            .map_err(|e| EthoscopeError::Other(format!("invalid hash pattern: {}", e)))?;
        Ok(Self { hash_pattern })
    }

    /// Validate, transform and bucket a raw batch
    ///
    /// Records of unknown kinds or failing validation are dropped and logged.
    /// Within a batch records are ordered by capture time, then source id.
    pub fn process(&self, raw: &[RawMetricRecord]) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();

        for record in raw {
            match self.process_one(record) {
                Ok(validated) => outcome
                    .batches
                    .entry(validated.metric_kind)
                    .or_insert_with(|| ProcessedMetricBatch::new(validated.metric_kind))
                    .records
                    .push(validated),
                Err(reason) => {
                    warn!(
                        source = %record.source_id,
                        kind = %record.metric_kind,
                        "dropping record: {}",
                        reason
                    );
                    outcome.dropped.push(DroppedRecord {
                        source_id: record.source_id.clone(),
                        declared_kind: record.metric_kind.clone(),
                        reason,
                    });
                }
            }
        }

        for batch in outcome.batches.values_mut() {
            batch.records.sort_by(|a, b| {
                a.captured_at
                    .cmp(&b.captured_at)
                    .then_with(|| a.source_id.cmp(&b.source_id))
            });
        }

        debug!(
            accepted = outcome.record_count(),
            dropped = outcome.dropped.len(),
            "processed raw batch"
        );
        outcome
    }

    fn process_one(&self, record: &RawMetricRecord) -> std::result::Result<ValidatedRecord, String> {
        let kind = MetricKind::categorize(&record.metric_kind)
            .ok_or_else(|| format!("unrecognized metric kind '{}'", record.metric_kind))?;

        if let Some((name, _)) = record
            .fields
            .iter()
            .find(|(_, v)| matches!(v, FieldValue::Float(f) if !f.is_finite()))
        {
            return Err(format!("field '{}' is not a finite number", name));
        }

        let mut fields = record.fields.clone();
        match kind {
            MetricKind::Block => self.block(&mut fields)?,
            MetricKind::Gas => gas(&mut fields)?,
            MetricKind::Mempool => mempool(&mut fields)?,
            MetricKind::Mev => self.mev(&mut fields)?,
            MetricKind::MevBoostStats => mev_boost_stats(&fields)?,
            MetricKind::L2Network => l2_network(&mut fields)?,
            MetricKind::L2TransactionCosts => l2_costs(&fields)?,
        }
        clamp_percentages(&mut fields);

        Ok(ValidatedRecord {
            source_id: record.source_id.clone(),
            metric_kind: kind,
            captured_at: record.captured_at,
            fields,
        })
    }

    fn check_hash(&self, fields: &Fields, name: &str) -> std::result::Result<(), String> {
        match fields.get(name) {
            None => Ok(()),
            Some(FieldValue::Text(hash)) if self.hash_pattern.is_match(hash) => Ok(()),
            Some(other) => Err(format!("{} is not a 32-byte hex hash: {:?}", name, other)),
        }
    }

    fn block(&self, fields: &mut Fields) -> std::result::Result<(), String> {
        require_positive_int(fields, "block_number")?;
        require_non_negative_if_present(fields, "transaction_count")?;
        self.check_hash(fields, "block_hash")?;
        self.check_hash(fields, "parent_hash")?;

        let gas_used = number(fields, "gas_used");
        let gas_limit = number(fields, "gas_limit");
        if let (Some(used), Some(limit)) = (gas_used, gas_limit) {
            if used < 0.0 || used > limit {
                return Err(format!("gas_used {} outside [0, gas_limit {}]", used, limit));
            }
            if limit > 0.0 {
                fields.insert("gas_utilization_pct".into(), (used / limit * 100.0).into());
            }
        }

        wei_to_gwei(fields, "base_fee_wei", "base_fee_gwei");
        Ok(())
    }

    fn mev(&self, fields: &mut Fields) -> std::result::Result<(), String> {
        require_positive_int(fields, "block_number")?;
        let revenue = number(fields, "mev_revenue_eth").ok_or("missing mev_revenue_eth")?;
        if revenue < 0.0 {
            return Err(format!("negative mev_revenue_eth {}", revenue));
        }
        self.check_hash(fields, "block_hash")?;

        if let (Some(used), Some(limit)) = (number(fields, "gas_used"), number(fields, "gas_limit")) {
            if limit > 0.0 {
                fields.insert("gas_utilization_pct".into(), (used / limit * 100.0).into());
            }
        }
        if let Some(used) = number(fields, "gas_used").filter(|u| *u > 0.0) {
            fields.insert(
                "mev_gas_price_gwei".into(),
                (revenue * WEI_PER_GWEI / used).into(),
            );
        }
        Ok(())
    }
}

fn gas(fields: &mut Fields) -> std::result::Result<(), String> {
    if number(fields, "gas_price_gwei").is_none() {
        wei_to_gwei(fields, "gas_price_wei", "gas_price_gwei");
    }
    let price = number(fields, "gas_price_gwei").ok_or("missing gas price")?;
    if price < 0.0 {
        return Err(format!("negative gas price {}", price));
    }
    if price > SUSPICIOUS_GAS_PRICE_GWEI {
        warn!(gas_price_gwei = price, "unusually high gas price");
    }

    wei_to_gwei(fields, "base_fee_wei", "base_fee_gwei");
    wei_to_gwei(fields, "max_priority_fee_wei", "max_priority_fee_gwei");

    if let Some(base_fee) = number(fields, "base_fee_gwei") {
        fields.insert(
            "priority_fee_gwei".into(),
            (price - base_fee).max(0.0).into(),
        );
    }
    Ok(())
}

fn mempool(fields: &mut Fields) -> std::result::Result<(), String> {
    let pending = number(fields, "pending_count").ok_or("missing pending_count")?;
    if pending < 0.0 {
        return Err(format!("negative pending_count {}", pending));
    }
    wei_to_gwei(fields, "avg_gas_price_wei", "avg_gas_price_gwei");
    wei_to_gwei(fields, "max_gas_price_wei", "max_gas_price_gwei");
    Ok(())
}

fn mev_boost_stats(fields: &Fields) -> std::result::Result<(), String> {
    let blocks = number(fields, "block_count").ok_or("missing block_count")?;
    if blocks < 0.0 {
        return Err(format!("negative block_count {}", blocks));
    }
    require_non_negative_if_present(fields, "avg_value_eth")?;
    require_non_negative_if_present(fields, "total_value_eth")
}

fn l2_network(fields: &mut Fields) -> std::result::Result<(), String> {
    require_positive_int(fields, "chain_id")?;
    require_positive_int(fields, "block_number")?;
    require_non_negative_if_present(fields, "gas_price_gwei")?;

    if let (Some(l2), Some(l1)) = (
        number(fields, "gas_price_gwei"),
        number(fields, "l1_gas_price_gwei"),
    ) {
        if l1 > 0.0 {
            fields.insert("gas_savings_pct".into(), ((1.0 - l2 / l1) * 100.0).into());
        }
    }
    Ok(())
}

fn l2_costs(fields: &Fields) -> std::result::Result<(), String> {
    require_positive_int(fields, "chain_id")?;
    let price = number(fields, "gas_price_gwei").ok_or("missing gas_price_gwei")?;
    if price < 0.0 {
        return Err(format!("negative gas_price_gwei {}", price));
    }
    Ok(())
}

fn number(fields: &Fields, name: &str) -> Option<f64> {
    fields.get(name).and_then(FieldValue::as_f64)
}

fn require_positive_int(fields: &Fields, name: &str) -> std::result::Result<(), String> {
    match fields.get(name).and_then(FieldValue::as_i64) {
        Some(v) if v > 0 => Ok(()),
        Some(v) => Err(format!("{} must be > 0, got {}", name, v)),
        None => Err(format!("missing or non-integer {}", name)),
    }
}

fn require_non_negative_if_present(fields: &Fields, name: &str) -> std::result::Result<(), String> {
    match fields.get(name) {
        None => Ok(()),
        Some(value) => match value.as_f64() {
            Some(v) if v >= 0.0 => Ok(()),
            Some(v) => Err(format!("{} must be >= 0, got {}", name, v)),
            None => Err(format!("{} is not numeric", name)),
        },
    }
}

fn wei_to_gwei(fields: &mut Fields, wei_field: &str, gwei_field: &str) {
    if fields.contains_key(gwei_field) {
        return;
    }
    if let Some(wei) = number(fields, wei_field) {
        fields.insert(gwei_field.to_string(), (wei / WEI_PER_GWEI).into());
    }
}

fn clamp_percentages(fields: &mut Fields) {
    for (name, value) in fields.iter_mut() {
        if !name.ends_with("_pct") {
            continue;
        }
        if let Some(v) = value.as_f64() {
            *value = FieldValue::Float(v.clamp(0.0, 100.0));
        }
    }
}
