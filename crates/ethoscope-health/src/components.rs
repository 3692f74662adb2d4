//! The six component scorers
//!
//! Each scorer takes a bounded sample set and returns a value in [0, 100], or
//! `None` when there is nothing to score. Deviation from the healthy baseline
//! only ever lowers the score.

use crate::baseline::{BlockHead, SLOT_SECONDS};
use crate::stats::{coefficient_of_variation, mean, median, percentile};

/// Score used for a component with no data
pub const NEUTRAL_SCORE: f64 = 50.0;

/// MEV fairness without relay data; relays are often rate limited
pub const MEV_NEUTRAL_SCORE: f64 = 75.0;

/// Window weights for gas efficiency: 1h, 24h, 7d
pub const GAS_WINDOW_WEIGHTS: [f64; 3] = [0.5, 0.3, 0.2];

/// Where the current gas price sits inside one window's distribution
///
/// At or below the median scores 100, at or above p95 scores 20, with a
/// volatility penalty of up to 20 points.
fn gas_window_score(current: f64, window: &[f64]) -> Option<f64> {
    let p50 = percentile(window, 50.0)?;
    let p95 = percentile(window, 95.0)?;

    let position = if current <= p50 {
        100.0
    } else if current >= p95 || p95 <= p50 {
        20.0
    } else {
        100.0 - 80.0 * (current - p50) / (p95 - p50)
    };

    let volatility = coefficient_of_variation(window).unwrap_or(0.0);
    Some(clamp_score(position - (volatility * 100.0).min(20.0)))
}

/// Gas price relative to its 1h, 24h and 7d baselines
///
/// `windows` pairs a weight with a window; an empty window contributes the
/// neutral score.
pub fn gas_efficiency(current: Option<f64>, windows: &[(f64, &[f64])]) -> Option<f64> {
    let current = current?;
    if windows.iter().all(|(_, w)| w.is_empty()) {
        return None;
    }

    let total: f64 = windows
        .iter()
        .map(|(weight, window)| weight * gas_window_score(current, window).unwrap_or(NEUTRAL_SCORE))
        .sum();
    let weight_sum: f64 = windows.iter().map(|(weight, _)| weight).sum();
    if weight_sum <= 0.0 {
        return None;
    }
    Some(clamp_score(total / weight_sum))
}

/// Block interval stability against the 12 s slot time
pub fn network_stability(intervals: &[f64]) -> Option<f64> {
    let average = mean(intervals)?;
    let deviation = (average - SLOT_SECONDS).abs();

    Some(if deviation <= 1.0 {
        100.0
    } else if deviation <= 3.0 {
        80.0
    } else if deviation <= 6.0 {
        60.0
    } else {
        40.0
    })
}

/// Extraction pressure and builder diversity
///
/// High average MEV per block costs up to 30 points; a diverse builder set
/// earns up to 10.
pub fn mev_fairness(revenues: &[f64], builders: &[String]) -> Option<f64> {
    let average = mean(revenues)?;

    let mut score = 90.0;
    if average > 0.1 {
        score -= (average * 100.0).min(30.0);
    }

    if !builders.is_empty() {
        let mut unique: Vec<&String> = builders.iter().collect();
        unique.sort();
        unique.dedup();
        let diversity = unique.len() as f64 / builders.len() as f64;
        score += (diversity * 20.0).min(10.0);
    }

    Some(clamp_score(score))
}

/// Gas utilization near the 50% EIP-1559 target
pub fn block_production(utilization_pct: &[f64]) -> Option<f64> {
    let average = mean(utilization_pct)?;
    Some(clamp_score(100.0 - (average - 50.0).abs() * 1.6))
}

/// Current pending count against its 24h median
pub fn mempool_health(current: Option<f64>, day: &[f64]) -> Option<f64> {
    let current = current?;
    let typical = median(day)?;

    if typical <= 0.0 {
        return Some(if current <= 0.0 { 100.0 } else { NEUTRAL_SCORE });
    }

    let ratio = current / typical;
    if ratio <= 1.0 {
        Some(100.0)
    } else {
        Some(clamp_score(100.0 - (ratio - 1.0) * 50.0))
    }
}

/// Missed-slot ratio between the first and last observed heads
///
/// Every 1% of missed slots costs 5 points.
pub fn validator_performance(heads: &[BlockHead]) -> Option<f64> {
    let (first, last) = (heads.first()?, heads.last()?);
    let slots = (last.timestamp - first.timestamp) as f64 / SLOT_SECONDS;
    if slots < 1.0 {
        return None;
    }

    let produced = (last.number - first.number) as f64;
    let missed = (slots - produced).max(0.0);
    let ratio = (missed / slots).min(1.0);
    Some(clamp_score(100.0 - ratio * 500.0))
}

pub fn clamp_score(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn head(number: i64, timestamp: i64) -> BlockHead {
        BlockHead {
            number,
            timestamp,
            captured_at: Utc.timestamp_opt(timestamp, 0).unwrap(),
        }
    }

    #[test]
    fn test_gas_efficiency_rewards_cheap_gas() {
        let day: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let windows: [(f64, &[f64]); 1] = [(1.0, day.as_slice())];

        let cheap = gas_efficiency(Some(10.0), &windows).unwrap();
        let pricey = gas_efficiency(Some(99.0), &windows).unwrap();
        assert!(cheap > pricey);
        assert!((0.0..=100.0).contains(&pricey));
    }

    #[test]
    fn test_gas_efficiency_missing_windows() {
        let hour = [20.0, 20.0, 20.0];
        let empty: [f64; 0] = [];
        let windows: [(f64, &[f64]); 3] = [(0.5, &hour[..]), (0.3, &empty[..]), (0.2, &empty[..])];

        // Flat hour scores 100; the two empty windows pull toward neutral
        let score = gas_efficiency(Some(20.0), &windows).unwrap();
        assert!((score - 75.0).abs() < 1e-9);

        let none: [(f64, &[f64]); 1] = [(1.0, &empty[..])];
        assert_eq!(gas_efficiency(Some(20.0), &none), None);
        assert_eq!(gas_efficiency(None, &windows), None);
    }

    #[test]
    fn test_network_stability_tiers() {
        assert_eq!(network_stability(&[12.0, 12.5, 11.5]), Some(100.0));
        assert_eq!(network_stability(&[14.0]), Some(80.0));
        assert_eq!(network_stability(&[17.0]), Some(60.0));
        assert_eq!(network_stability(&[30.0]), Some(40.0));
        assert_eq!(network_stability(&[]), None);
    }

    #[test]
    fn test_mev_fairness_penalizes_extraction() {
        let builders: Vec<String> = (0..4).map(|i| format!("0xb{}", i)).collect();
        let calm = mev_fairness(&[0.02, 0.03, 0.05, 0.04], &builders).unwrap();
        let heavy = mev_fairness(&[0.5, 0.4, 0.3, 0.6], &builders).unwrap();
        assert_eq!(calm, 100.0);
        assert_eq!(heavy, 70.0);

        let monopoly = vec!["0xb0".to_string(); 4];
        assert_eq!(mev_fairness(&[0.02; 4], &monopoly), Some(95.0));
        assert_eq!(mev_fairness(&[], &builders), None);
    }

    #[test]
    fn test_block_production_peaks_at_target() {
        assert_eq!(block_production(&[50.0, 50.0]), Some(100.0));
        assert_eq!(block_production(&[100.0]), Some(20.0));
        assert_eq!(block_production(&[0.0]), Some(20.0));
        assert!(block_production(&[60.0]).unwrap() > block_production(&[90.0]).unwrap());
    }

    #[test]
    fn test_mempool_health_ratio() {
        let day = [1_000.0, 1_000.0, 1_000.0];
        assert_eq!(mempool_health(Some(800.0), &day), Some(100.0));
        assert_eq!(mempool_health(Some(1_500.0), &day), Some(75.0));
        assert_eq!(mempool_health(Some(5_000.0), &day), Some(0.0));
        assert_eq!(mempool_health(None, &day), None);
    }

    #[test]
    fn test_validator_performance_missed_slots() {
        // 100 slots, 100 blocks
        assert_eq!(
            validator_performance(&[head(1_000, 0), head(1_100, 1_200)]),
            Some(100.0)
        );
        // 100 slots, 95 blocks: 5% missed
        assert_eq!(
            validator_performance(&[head(1_000, 0), head(1_095, 1_200)]),
            Some(75.0)
        );
        assert_eq!(validator_performance(&[head(1_000, 0)]), None);
    }
}
