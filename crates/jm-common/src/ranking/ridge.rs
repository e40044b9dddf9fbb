use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RidgeError {
    #[error("no training samples")]
    Empty,
    #[error("{features} features but {targets} targets")]
    ShapeMismatch { features: usize, targets: usize },
    #[error("normal equations are singular")]
    Singular,
    #[error("non-finite value in training data")]
    NonFinite,
}

/// Zero mean, unit variance per column. Population standard deviation; a
/// constant column is centred but not scaled.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler<const N: usize> {
    pub mean: [f64; N],
    pub scale: [f64; N],
}

impl<const N: usize> StandardScaler<N> {
    pub fn fit(rows: &[[f64; N]]) -> Result<Self, RidgeError> {
        if rows.is_empty() {
            return Err(RidgeError::Empty);
        }
        let n = rows.len() as f64;

        let mut mean = [0.0; N];
        for row in rows {
            for (m, x) in mean.iter_mut().zip(row) {
                *m += x;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut scale = [0.0; N];
        for row in rows {
            for j in 0..N {
                let d = row[j] - mean[j];
                scale[j] += d * d;
            }
        }
        for s in scale.iter_mut() {
            *s = (*s / n).sqrt();
            if *s == 0.0 {
                *s = 1.0;
            }
        }

        if mean.iter().chain(scale.iter()).any(|v| !v.is_finite()) {
            return Err(RidgeError::NonFinite);
        }
        Ok(Self { mean, scale })
    }

    pub fn transform(&self, rows: &[[f64; N]]) -> Vec<[f64; N]> {
        rows.iter()
            .map(|row| std::array::from_fn(|j| (row[j] - self.mean[j]) / self.scale[j]))
            .collect()
    }
}

/// L2-regularised least squares with an unpenalised intercept.
#[derive(Debug, Clone, PartialEq)]
pub struct Ridge<const N: usize> {
    pub coef: [f64; N],
    pub intercept: f64,
}

impl<const N: usize> Ridge<N> {
    /// Solves `(XcᵀXc + αI) w = Xcᵀ yc` on centred data.
    pub fn fit(x: &[[f64; N]], y: &[f64], alpha: f64) -> Result<Self, RidgeError> {
        if x.is_empty() {
            return Err(RidgeError::Empty);
        }
        if x.len() != y.len() {
            return Err(RidgeError::ShapeMismatch {
                features: x.len(),
                targets: y.len(),
            });
        }
        if y.iter().any(|v| !v.is_finite()) || x.iter().flatten().any(|v| !v.is_finite()) {
            return Err(RidgeError::NonFinite);
        }

        let n = x.len() as f64;
        let mut x_mean = [0.0; N];
        for row in x {
            for j in 0..N {
                x_mean[j] += row[j] / n;
            }
        }
        let y_mean = y.iter().sum::<f64>() / n;

        let mut a = [[0.0; N]; N];
        let mut b = [0.0; N];
        for (row, target) in x.iter().zip(y) {
            let yc = target - y_mean;
            for i in 0..N {
                let xi = row[i] - x_mean[i];
                b[i] += xi * yc;
                for j in 0..N {
                    a[i][j] += xi * (row[j] - x_mean[j]);
                }
            }
        }
        for (i, row) in a.iter_mut().enumerate() {
            row[i] += alpha;
        }

        let coef = solve(a, b)?;
        let intercept = y_mean - coef.iter().zip(&x_mean).map(|(w, m)| w * m).sum::<f64>();
        Ok(Self { coef, intercept })
    }

    pub fn predict_one(&self, row: &[f64; N]) -> f64 {
        self.intercept + self.coef.iter().zip(row).map(|(w, x)| w * x).sum::<f64>()
    }

    /// Coefficient of determination on `(x, y)`.
    pub fn score(&self, x: &[[f64; N]], y: &[f64]) -> f64 {
        let predictions: Vec<f64> = x.iter().map(|row| self.predict_one(row)).collect();
        r2_score(y, &predictions)
    }
}

/// R². A constant target scores 1.0 when predicted exactly, else 0.0.
pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() || y_true.len() != y_pred.len() {
        return 0.0;
    }
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p) * (t - p))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean) * (t - mean)).sum();

    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Gaussian elimination with partial pivoting.
fn solve<const N: usize>(mut a: [[f64; N]; N], mut b: [f64; N]) -> Result<[f64; N], RidgeError> {
    for col in 0..N {
        let pivot = (col..N)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(RidgeError::Singular);
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..N {
            let factor = a[row][col] / a[col][col];
            for k in col..N {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; N];
    for row in (0..N).rev() {
        let tail: f64 = ((row + 1)..N).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(RidgeError::NonFinite);
    }
    Ok(x)
}
