use super::CohortError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};

/// Relative pivot size below which the normal equations count as singular.
const SINGULAR_PIVOT_TOLERANCE: f64 = 1.0e-10;

/// Z-standardizes each column in place with the population standard
/// deviation. A column with zero variance is only centred.
pub fn standardize_columns(matrix: &mut Array2<f64>) {
    for mut column in matrix.columns_mut() {
        let Some(mean) = column.mean() else {
            continue;
        };
        let std = column.std(0.0);
        if std > 0.0 {
            column.mapv_inplace(|v| (v - mean) / std);
        } else {
            column.mapv_inplace(|v| v - mean);
        }
    }
}

/// Regresses the covariates (with an intercept) out of the behavior scores by
/// ordinary least squares and returns the residuals. Without covariates the
/// scores are returned unchanged.
pub fn regress_covariates(
    behaviors: ArrayView1<'_, f64>,
    covariates: Option<ArrayView2<'_, f64>>,
) -> Result<Array1<f64>, CohortError> {
    let Some(covariates) = covariates else {
        log::info!("No covariates; behavior scores are used as loaded");
        return Ok(behaviors.to_owned());
    };
    let n = behaviors.len();
    if covariates.nrows() != n {
        return Err(CohortError::CovariateMismatch {
            rows: covariates.nrows(),
            patients: n,
        });
    }
    log::info!(
        "Regressing {} covariates out of the behavior scores",
        covariates.ncols()
    );

    let p = covariates.ncols() + 1;
    let mut design = Array2::<f64>::ones((n, p));
    design.slice_mut(s![.., 1..]).assign(&covariates);

    let gram = design.t().dot(&design);
    let rhs = design.t().dot(&behaviors);
    let coefficients = solve_symmetric(gram, rhs)?;
    let residuals = &behaviors - &design.dot(&coefficients);
    log::debug!("Covariate coefficients (intercept first): {coefficients}");
    Ok(residuals)
}

/// Gaussian elimination with partial pivoting on a small dense system.
fn solve_symmetric(mut a: Array2<f64>, mut b: Array1<f64>) -> Result<Array1<f64>, CohortError> {
    let n = b.len();
    let scale = a
        .diag()
        .iter()
        .fold(0.0f64, |acc, v| acc.max(v.abs()))
        .max(f64::MIN_POSITIVE);

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap_or(col);
        if a[[pivot_row, col]].abs() <= SINGULAR_PIVOT_TOLERANCE * scale {
            return Err(CohortError::SingularCovariates);
        }
        if pivot_row != col {
            for k in 0..n {
                a.swap([col, k], [pivot_row, k]);
            }
            b.swap(col, pivot_row);
        }

        let pivot = a[[col, col]];
        for row in col + 1..n {
            let factor = a[[row, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail = a.slice(s![row, row + 1..]).dot(&x.slice(s![row + 1..]));
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    Ok(x)
}
