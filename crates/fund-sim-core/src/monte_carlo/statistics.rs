use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::FundSimResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Percentile summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p5: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
}

/// A single histogram bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: u32,
    pub frequency: f64,
}

/// Descriptive statistics of one simulated quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: Percentiles,
    pub skewness: f64,
    pub kurtosis: f64,
    pub histogram: Vec<HistogramBin>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Percentile of a **sorted**, non-empty slice by linear interpolation.
/// `p` is in percent.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Histogram with `num_bins` equal-width bins over a sorted, non-empty slice.
pub fn build_histogram(sorted: &[f64], num_bins: usize) -> Vec<HistogramBin> {
    let min_val = sorted[0];
    let max_val = sorted[sorted.len() - 1];
    let num_bins = num_bins.max(1);

    // All values identical
    if (max_val - min_val).abs() < f64::EPSILON {
        return vec![HistogramBin {
            lower: min_val,
            upper: max_val,
            count: sorted.len() as u32,
            frequency: 1.0,
        }];
    }

    let bin_width = (max_val - min_val) / num_bins as f64;
    let n = sorted.len() as f64;

    let mut bins: Vec<HistogramBin> = (0..num_bins)
        .map(|i| HistogramBin {
            lower: min_val + i as f64 * bin_width,
            upper: if i == num_bins - 1 {
                max_val
            } else {
                min_val + (i + 1) as f64 * bin_width
            },
            count: 0,
            frequency: 0.0,
        })
        .collect();

    for &val in sorted {
        let idx = (((val - min_val) / bin_width).floor() as usize).min(num_bins - 1);
        bins[idx].count += 1;
    }
    for bin in &mut bins {
        bin.frequency = bin.count as f64 / n;
    }
    bins
}

/// Sort `values` ascending, rejecting NaN and infinities.
pub fn sorted_finite(values: &[f64], context: &str) -> FundSimResult<Vec<f64>> {
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(FundSimError::NumericalInstability {
            context: format!("{context}: non-finite observation {bad}"),
        });
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(sorted)
}

/// Population moments, percentiles and a histogram.
pub fn compute_statistics(values: &[f64], num_bins: usize) -> FundSimResult<DistributionStats> {
    if values.is_empty() {
        return Err(FundSimError::InsufficientData(
            "At least one observation required for statistics".into(),
        ));
    }
    let sorted = sorted_finite(values, "statistics")?;
    let n = sorted.len() as f64;

    let mean = sorted.iter().sum::<f64>() / n;
    let median = percentile_sorted(&sorted, 50.0);
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    // Skewness (population)
    let skewness = if std_dev > f64::EPSILON {
        sorted.iter().map(|v| ((v - mean) / std_dev).powi(3)).sum::<f64>() / n
    } else {
        0.0
    };

    // Excess kurtosis (population)
    let kurtosis = if std_dev > f64::EPSILON {
        sorted.iter().map(|v| ((v - mean) / std_dev).powi(4)).sum::<f64>() / n - 3.0
    } else {
        0.0
    };

    Ok(DistributionStats {
        count: sorted.len(),
        mean,
        median,
        std_dev,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        percentiles: Percentiles {
            p5: percentile_sorted(&sorted, 5.0),
            p10: percentile_sorted(&sorted, 10.0),
            p25: percentile_sorted(&sorted, 25.0),
            p50: median,
            p75: percentile_sorted(&sorted, 75.0),
            p90: percentile_sorted(&sorted, 90.0),
            p95: percentile_sorted(&sorted, 95.0),
        },
        skewness,
        kurtosis,
        histogram: build_histogram(&sorted, num_bins),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile_sorted(&sorted, 50.0), 3.0);
        assert!((percentile_sorted(&sorted, 10.0) - 1.4).abs() < 1e-12);
        assert_eq!(percentile_sorted(&[7.0], 95.0), 7.0);
    }

    #[test]
    fn test_statistics_of_uniform_grid() {
        let values: Vec<f64> = (0..=100).map(f64::from).collect();
        let stats = compute_statistics(&values, 10).unwrap();
        assert_eq!(stats.count, 101);
        assert!((stats.mean - 50.0).abs() < 1e-12);
        assert_eq!(stats.median, 50.0);
        assert!(stats.skewness.abs() < 1e-12);
        assert!(stats.percentiles.p5 < stats.percentiles.p95);
        assert_eq!(stats.histogram.len(), 10);
        let total: u32 = stats.histogram.iter().map(|b| b.count).sum();
        assert_eq!(total, 101);
    }

    #[test]
    fn test_constant_values_single_bin() {
        let stats = compute_statistics(&[0.1, 0.1, 0.1], 20).unwrap();
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.histogram.len(), 1);
        assert_eq!(stats.histogram[0].frequency, 1.0);
    }

    #[test]
    fn test_empty_and_nan_rejected() {
        assert!(matches!(
            compute_statistics(&[], 20),
            Err(FundSimError::InsufficientData(_))
        ));
        assert!(matches!(
            compute_statistics(&[0.1, f64::NAN], 20),
            Err(FundSimError::NumericalInstability { .. })
        ));
    }
}
