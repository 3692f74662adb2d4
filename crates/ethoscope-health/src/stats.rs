//! Descriptive statistics over sample windows

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Population standard deviation
pub fn std_dev(samples: &[f64]) -> Option<f64> {
    let m = mean(samples)?;
    let variance = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / samples.len() as f64;
    Some(variance.sqrt())
}

/// Coefficient of variation (std / |mean|); `None` when the mean is zero
pub fn coefficient_of_variation(samples: &[f64]) -> Option<f64> {
    let m = mean(samples)?;
    if m == 0.0 {
        return None;
    }
    Some(std_dev(samples)? / m.abs())
}

pub fn median(samples: &[f64]) -> Option<f64> {
    percentile(samples, 50.0)
}

/// Percentile with linear interpolation between closest ranks
///
/// Matches the common "linear" definition: rank = p/100 * (n - 1).
pub fn percentile(samples: &[f64], p: f64) -> Option<f64> {
    if samples.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// First and third quartiles
pub fn quartiles(samples: &[f64]) -> Option<(f64, f64)> {
    Some((percentile(samples, 25.0)?, percentile(samples, 75.0)?))
}
