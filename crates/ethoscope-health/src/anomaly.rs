//! Z-score and IQR outlier detection
//!
//! Both methods run independently on every sample; one sample may carry two flags.

use chrono::{DateTime, Utc};
use ethoscope_core::{AnomalyFlag, AnomalyMethod, MetricKind, ScoringSettings, Severity};

use crate::stats::{mean, median, quartiles, std_dev};

/// One value to test against a baseline
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub metric_kind: MetricKind,
    pub series: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyDetector {
    pub z_threshold: f64,
    pub iqr_multiplier: f64,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            iqr_multiplier: 1.5,
        }
    }
}

impl AnomalyDetector {
    pub fn new(z_threshold: f64, iqr_multiplier: f64) -> Self {
        Self {
            z_threshold,
            iqr_multiplier,
        }
    }

    pub fn from_settings(settings: &ScoringSettings) -> Self {
        Self::new(settings.z_score_threshold, settings.iqr_multiplier)
    }

    /// The z-score of `value` when it exceeds the threshold
    ///
    /// A constant window (std = 0) never flags.
    pub fn z_score_flag(&self, value: f64, window: &[f64]) -> Option<f64> {
        let m = mean(window)?;
        let sd = std_dev(window)?;
        if sd <= 0.0 {
            return None;
        }
        let z = (value - m) / sd;
        (z.abs() > self.z_threshold).then_some(z)
    }

    /// The violated fence when `value` falls outside `[q1 - k*iqr, q3 + k*iqr]`
    pub fn iqr_flag(&self, value: f64, window: &[f64]) -> Option<f64> {
        let (q1, q3) = quartiles(window)?;
        let iqr = q3 - q1;
        let lower = q1 - self.iqr_multiplier * iqr;
        let upper = q3 + self.iqr_multiplier * iqr;

        if value > upper {
            Some(upper)
        } else if value < lower {
            Some(lower)
        } else {
            None
        }
    }

    /// Test one observation against a baseline that does not contain it
    ///
    /// `expected` is the healthy value of the series when one exists (e.g. a
    /// 12 s block time); otherwise severity is measured against the baseline median.
    pub fn check(
        &self,
        observation: &Observation,
        baseline: &[f64],
        expected: Option<f64>,
    ) -> Vec<AnomalyFlag> {
        let mut flags = Vec::new();
        let value = observation.value;

        if let Some(z) = self.z_score_flag(value, baseline) {
            flags.push(self.flag(observation, AnomalyMethod::ZScore, z, baseline, expected));
        }
        if let Some(fence) = self.iqr_flag(value, baseline) {
            flags.push(self.flag(observation, AnomalyMethod::Iqr, fence, baseline, expected));
        }
        flags
    }

    /// Test every sample of a window against the window's own statistics
    pub fn scan(
        &self,
        metric_kind: MetricKind,
        series: &str,
        samples: &[(DateTime<Utc>, f64)],
    ) -> Vec<AnomalyFlag> {
        let window: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
        samples
            .iter()
            .flat_map(|(observed_at, value)| {
                let observation = Observation {
                    metric_kind,
                    series: series.to_string(),
                    value: *value,
                    observed_at: *observed_at,
                };
                self.check(&observation, &window, None)
            })
            .collect()
    }

    fn flag(
        &self,
        observation: &Observation,
        method: AnomalyMethod,
        bound_or_score: f64,
        baseline: &[f64],
        expected: Option<f64>,
    ) -> AnomalyFlag {
        AnomalyFlag {
            metric_kind: observation.metric_kind,
            series: observation.series.clone(),
            method,
            observed_value: observation.value,
            bound_or_score,
            severity: severity(observation.value, baseline, expected),
            observed_at: observation.observed_at,
        }
    }
}

/// Grade a deviation by relative distance from the reference and by sigmas
pub fn severity(value: f64, baseline: &[f64], expected: Option<f64>) -> Severity {
    let relative = expected
        .or_else(|| median(baseline))
        .filter(|reference| *reference != 0.0)
        .map(|reference| (value - reference).abs() / reference.abs())
        .unwrap_or(0.0);

    let sigmas = match (mean(baseline), std_dev(baseline)) {
        (Some(m), Some(sd)) if sd > 0.0 => (value - m).abs() / sd,
        _ => 0.0,
    };

    if relative > 1.0 || sigmas > 5.0 {
        Severity::Critical
    } else if relative > 0.5 || sigmas > 3.0 {
        Severity::High
    } else if relative > 0.25 || sigmas > 2.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}
