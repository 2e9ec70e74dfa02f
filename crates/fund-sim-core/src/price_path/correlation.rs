//! Zone correlation handling: validation, PSD-tolerant Cholesky
//! factorisation and correlated normal generation.

use crate::error::FundSimError;
use crate::FundSimResult;

/// Symmetry / unit-diagonal tolerance.
pub const MATRIX_TOLERANCE: f64 = 1e-9;

/// Pivots in `(-PSD_TOLERANCE, 0]` are treated as zero (semi-definite).
const PSD_TOLERANCE: f64 = 1e-10;

/// Off-diagonal residual permitted when a pivot is zero.
const SINGULAR_RESIDUAL_TOLERANCE: f64 = 1e-8;

pub fn identity(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

/// Check shape, symmetry, unit diagonal and entry bounds of an `n x n`
/// correlation matrix. Positive semi-definiteness is checked by
/// [`cholesky_lower_psd`].
pub fn validate_correlation_matrix(matrix: &[Vec<f64>], n: usize) -> FundSimResult<()> {
    if matrix.len() != n {
        return Err(FundSimError::InvalidCorrelation {
            reason: format!("expected {n} rows, found {}", matrix.len()),
        });
    }
    for (i, row) in matrix.iter().enumerate() {
        if row.len() != n {
            return Err(FundSimError::InvalidCorrelation {
                reason: format!("row {i} has {} columns, expected {n}", row.len()),
            });
        }
        for (j, &value) in row.iter().enumerate() {
            if !value.is_finite() {
                return Err(FundSimError::InvalidCorrelation {
                    reason: format!("entry ({i}, {j}) is not finite"),
                });
            }
            if !(-1.0 - MATRIX_TOLERANCE..=1.0 + MATRIX_TOLERANCE).contains(&value) {
                return Err(FundSimError::InvalidCorrelation {
                    reason: format!("entry ({i}, {j}) = {value} is outside [-1, 1]"),
                });
            }
            if (value - matrix[j][i]).abs() > MATRIX_TOLERANCE {
                return Err(FundSimError::InvalidCorrelation {
                    reason: format!("matrix is not symmetric at ({i}, {j})"),
                });
            }
        }
        if (row[i] - 1.0).abs() > MATRIX_TOLERANCE {
            return Err(FundSimError::InvalidCorrelation {
                reason: format!("diagonal entry {i} is {}, expected 1", row[i]),
            });
        }
    }
    Ok(())
}

/// Lower-triangular Cholesky factor of a positive semi-definite matrix.
///
/// Zero pivots are accepted (perfectly correlated zones) as long as the
/// column below them is also zero; anything else is reported as
/// [`FundSimError::NotPositiveSemiDefinite`].
pub fn cholesky_lower_psd(matrix: &[Vec<f64>]) -> FundSimResult<Vec<Vec<f64>>> {
    let n = matrix.len();
    let mut l = vec![vec![0.0; n]; n];

    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }

            if i == j {
                if sum < -PSD_TOLERANCE {
                    return Err(FundSimError::NotPositiveSemiDefinite {
                        pivot: i,
                        value: sum,
                    });
                }
                l[i][j] = sum.max(0.0).sqrt();
            } else if l[j][j] > PSD_TOLERANCE {
                l[i][j] = sum / l[j][j];
            } else if sum.abs() > SINGULAR_RESIDUAL_TOLERANCE {
                return Err(FundSimError::NotPositiveSemiDefinite {
                    pivot: j,
                    value: sum,
                });
            }
        }
    }

    Ok(l)
}

/// `out = L * independent`.
pub fn correlate_normals(cholesky: &[Vec<f64>], independent: &[f64], out: &mut [f64]) {
    for (i, row) in cholesky.iter().enumerate() {
        out[i] = row
            .iter()
            .take(i + 1)
            .zip(independent)
            .map(|(l, z)| l * z)
            .sum();
    }
}

/// Pearson correlation matrix of equally long series.
pub fn empirical_correlation(series: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = series.len();
    let means: Vec<f64> = series
        .iter()
        .map(|s| s.iter().sum::<f64>() / s.len().max(1) as f64)
        .collect();
    let mut out = identity(n);
    for i in 0..n {
        for j in (i + 1)..n {
            let mut cov = 0.0;
            let mut var_i = 0.0;
            let mut var_j = 0.0;
            for (a, b) in series[i].iter().zip(&series[j]) {
                let da = a - means[i];
                let db = b - means[j];
                cov += da * db;
                var_i += da * da;
                var_j += db * db;
            }
            let denom = (var_i * var_j).sqrt();
            let rho = if denom > 0.0 { cov / denom } else { 0.0 };
            out[i][j] = rho;
            out[j][i] = rho;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cholesky_reconstructs_matrix() {
        let m = vec![
            vec![1.0, 0.6, 0.2],
            vec![0.6, 1.0, -0.3],
            vec![0.2, -0.3, 1.0],
        ];
        let l = cholesky_lower_psd(&m).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let v: f64 = (0..3).map(|k| l[i][k] * l[j][k]).sum();
                assert!((v - m[i][j]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_perfect_correlation_is_accepted() {
        let m = vec![vec![1.0, 1.0], vec![1.0, 1.0]];
        let l = cholesky_lower_psd(&m).unwrap();
        assert_eq!(l[1][1], 0.0);
        let mut out = [0.0; 2];
        correlate_normals(&l, &[0.7, -1.3], &mut out);
        assert!((out[0] - out[1]).abs() < 1e-12);
    }

    #[test]
    fn test_non_psd_rejected() {
        let m = vec![
            vec![1.0, 0.9, -0.9],
            vec![0.9, 1.0, 0.9],
            vec![-0.9, 0.9, 1.0],
        ];
        assert!(matches!(
            cholesky_lower_psd(&m),
            Err(FundSimError::NotPositiveSemiDefinite { .. })
        ));
    }

    #[test]
    fn test_non_psd_behind_zero_pivot_rejected() {
        let m = vec![
            vec![1.0, 1.0, 0.0],
            vec![1.0, 1.0, 1.0],
            vec![0.0, 1.0, 1.0],
        ];
        assert!(cholesky_lower_psd(&m).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let asymmetric = vec![vec![1.0, 0.5], vec![0.4, 1.0]];
        assert!(validate_correlation_matrix(&asymmetric, 2).is_err());

        let bad_diag = vec![vec![0.9, 0.0], vec![0.0, 1.0]];
        assert!(validate_correlation_matrix(&bad_diag, 2).is_err());

        let out_of_range = vec![vec![1.0, 1.5], vec![1.5, 1.0]];
        assert!(validate_correlation_matrix(&out_of_range, 2).is_err());

        let wrong_shape = vec![vec![1.0, 0.0]];
        assert!(validate_correlation_matrix(&wrong_shape, 2).is_err());

        assert!(validate_correlation_matrix(&identity(3), 3).is_ok());
    }
}
