//! # Kernel Regression Capability
//!
//! The analysis consumes regression as a black box: something that can be
//! fitted to a feature matrix and target vector, predicts new rows, and
//! exposes the training rows it selected as support vectors. [`Regressor`]
//! and [`SupportModel`] are that seam; any kernel method honouring them can
//! replace the default.
//!
//! The default, [`RbfSvr`], is epsilon-insensitive support-vector regression
//! with a Gaussian (RBF) kernel `exp(-gamma * |x - z|^2)`. The dual problem is
//! solved with sequential minimal optimization using second-order working-set
//! selection, the same formulation LIBSVM uses for epsilon-SVR: `2l` dual
//! variables (one pair per training row), box constraints `[0, C]`, and a
//! single equality constraint.

use crate::types::ParamCombination;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegressionError {
    #[error("cannot fit a regression model to an empty training set")]
    EmptyTrainingSet,
    #[error("feature matrix has {rows} rows but the target vector has {targets} entries")]
    DimensionMismatch { rows: usize, targets: usize },
    #[error("non-finite value found in the {0}")]
    NonFiniteInput(&'static str),
    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),
    #[error("prediction rows have {found} features but the model was trained on {expected}")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("the fitted model has no support vectors, so no effect map can be derived")]
    NoSupportVectors,
}

/// A fitted model exposing its support vectors.
pub trait SupportModel {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, RegressionError>;

    /// Indices of the training rows selected as support vectors, ascending.
    fn support_indices(&self) -> &[usize];

    /// The support-vector rows themselves, in `support_indices` order.
    fn support_vectors(&self) -> ArrayView2<'_, f64>;

    fn n_support(&self) -> usize {
        self.support_indices().len()
    }

    /// Coordinate-wise mean of the support vectors: the per-voxel effect map.
    fn support_vector_mean(&self) -> Result<Array1<f64>, RegressionError> {
        self.support_vectors()
            .mean_axis(Axis(0))
            .ok_or(RegressionError::NoSupportVectors)
    }
}

/// Something that fits a [`SupportModel`] for a given hyperparameter triple.
pub trait Regressor: Send + Sync {
    type Model: SupportModel + Send;

    fn fit(
        &self,
        params: &ParamCombination,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<Self::Model, RegressionError>;
}

pub const DEFAULT_SVR_TOLERANCE: f64 = 1.0e-3;
pub const DEFAULT_SVR_MAX_ITERATIONS: usize = 10_000_000;

/// Epsilon-SVR with an RBF kernel.
#[derive(Clone, Debug)]
pub struct RbfSvr {
    tolerance: f64,
    max_iterations: usize,
}

impl Default for RbfSvr {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_SVR_TOLERANCE,
            max_iterations: DEFAULT_SVR_MAX_ITERATIONS,
        }
    }
}

impl RbfSvr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stopping tolerance on the maximal KKT violation.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

#[derive(Clone, Debug)]
pub struct RbfSvrModel {
    gamma: f64,
    support: Vec<usize>,
    support_vectors: Array2<f64>,
    support_norms: Array1<f64>,
    /// `alpha_i - alpha_i*` for each support vector.
    dual_coef: Array1<f64>,
    rho: f64,
    iterations: usize,
}

impl RbfSvrModel {
    pub fn dual_coefficients(&self) -> ArrayView1<'_, f64> {
        self.dual_coef.view()
    }

    /// Negated intercept: predictions are `sum(coef * K) - rho`.
    pub fn rho(&self) -> f64 {
        self.rho
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

impl SupportModel for RbfSvrModel {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, RegressionError> {
        if self.support.is_empty() {
            return Ok(Array1::from_elem(x.nrows(), -self.rho));
        }
        if x.ncols() != self.support_vectors.ncols() {
            return Err(RegressionError::FeatureMismatch {
                expected: self.support_vectors.ncols(),
                found: x.ncols(),
            });
        }
        let cross = x.dot(&self.support_vectors.t());
        let row_norms = x.map_axis(Axis(1), |row| row.dot(&row));
        let mut kernel = cross;
        for (mut k_row, &norm) in kernel.axis_iter_mut(Axis(0)).zip(row_norms.iter()) {
            for (k, &sv_norm) in k_row.iter_mut().zip(self.support_norms.iter()) {
                let distance = (norm + sv_norm - 2.0 * *k).max(0.0);
                *k = (-self.gamma * distance).exp();
            }
        }
        Ok(kernel.dot(&self.dual_coef) - self.rho)
    }

    fn support_indices(&self) -> &[usize] {
        &self.support
    }

    fn support_vectors(&self) -> ArrayView2<'_, f64> {
        self.support_vectors.view()
    }
}

impl Regressor for RbfSvr {
    type Model = RbfSvrModel;

    fn fit(
        &self,
        params: &ParamCombination,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<Self::Model, RegressionError> {
        validate_params(params)?;
        let l = x.nrows();
        if l == 0 {
            return Err(RegressionError::EmptyTrainingSet);
        }
        if y.len() != l {
            return Err(RegressionError::DimensionMismatch {
                rows: l,
                targets: y.len(),
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(RegressionError::NonFiniteInput("feature matrix"));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(RegressionError::NonFiniteInput("target vector"));
        }

        let kernel = internal::rbf_gram(x, params.gamma);
        let solution = internal::solve_epsilon_svr(
            &kernel,
            y,
            params.c,
            params.epsilon,
            self.tolerance,
            self.max_iterations,
        );

        let support: Vec<usize> = (0..l)
            .filter(|&i| solution.alpha[i] - solution.alpha[i + l] != 0.0)
            .collect();
        let dual_coef: Array1<f64> = support
            .iter()
            .map(|&i| solution.alpha[i] - solution.alpha[i + l])
            .collect();
        let support_vectors = x.select(Axis(0), &support);
        let support_norms = support_vectors.map_axis(Axis(1), |row| row.dot(&row));

        log::debug!(
            "SVR fit ({params}): {} / {l} support vectors after {} iterations",
            support.len(),
            solution.iterations
        );

        Ok(RbfSvrModel {
            gamma: params.gamma,
            support,
            support_vectors,
            support_norms,
            dual_coef,
            rho: solution.rho,
            iterations: solution.iterations,
        })
    }
}

fn validate_params(params: &ParamCombination) -> Result<(), RegressionError> {
    if !(params.c.is_finite() && params.c > 0.0) {
        return Err(RegressionError::InvalidHyperparameter(format!(
            "C must be positive, got {}",
            params.c
        )));
    }
    if !(params.gamma.is_finite() && params.gamma > 0.0) {
        return Err(RegressionError::InvalidHyperparameter(format!(
            "gamma must be positive, got {}",
            params.gamma
        )));
    }
    if !(params.epsilon.is_finite() && params.epsilon >= 0.0) {
        return Err(RegressionError::InvalidHyperparameter(format!(
            "epsilon must be non-negative, got {}",
            params.epsilon
        )));
    }
    Ok(())
}

/// Internal module for the SMO solver.
mod internal {
    use super::*;

    const TAU: f64 = 1.0e-12;

    pub(super) struct SmoSolution {
        /// `2l` dual variables: `alpha` for `0..l`, `alpha*` for `l..2l`.
        pub alpha: Vec<f64>,
        pub rho: f64,
        pub iterations: usize,
    }

    pub(super) fn rbf_gram(x: ArrayView2<'_, f64>, gamma: f64) -> Array2<f64> {
        let norms = x.map_axis(Axis(1), |row| row.dot(&row));
        let mut gram = x.dot(&x.t());
        for ((i, j), k) in gram.indexed_iter_mut() {
            let distance = (norms[i] + norms[j] - 2.0 * *k).max(0.0);
            *k = (-gamma * distance).exp();
        }
        gram
    }

    /// The signed dual problem of epsilon-SVR:
    ///
    /// minimise `0.5 a'Qa + p'a` subject to `y'a = 0`, `0 <= a <= C`, where
    /// for `t < l`: `y_t = +1`, `p_t = eps - target_t`, and for `t >= l`:
    /// `y_t = -1`, `p_t = eps + target_{t-l}`; `Q_ts = y_t y_s K(t mod l, s mod l)`.
    pub(super) fn solve_epsilon_svr(
        kernel: &Array2<f64>,
        targets: ArrayView1<'_, f64>,
        c: f64,
        epsilon: f64,
        tolerance: f64,
        max_iterations: usize,
    ) -> SmoSolution {
        let l = targets.len();
        let n = 2 * l;
        let sign = |t: usize| if t < l { 1.0 } else { -1.0 };
        let q = |t: usize, s: usize| sign(t) * sign(s) * kernel[[t % l, s % l]];
        let qd: Vec<f64> = (0..n).map(|t| kernel[[t % l, t % l]]).collect();

        let mut alpha = vec![0.0; n];
        let mut gradient: Vec<f64> = (0..n)
            .map(|t| {
                if t < l {
                    epsilon - targets[t]
                } else {
                    epsilon + targets[t - l]
                }
            })
            .collect();

        let mut iterations = 0usize;
        while let Some((i, j)) = select_working_set(&alpha, &gradient, &qd, &q, &sign, c, tolerance)
        {
            if iterations >= max_iterations {
                log::warn!(
                    "SMO reached the iteration cap ({max_iterations}) before converging; using the current solution"
                );
                break;
            }
            iterations += 1;

            let (old_i, old_j) = (alpha[i], alpha[j]);
            let q_ij = q(i, j);
            if sign(i) != sign(j) {
                let quad = positive_or_tau(qd[i] + qd[j] + 2.0 * q_ij);
                let delta = (-gradient[i] - gradient[j]) / quad;
                let diff = alpha[i] - alpha[j];
                alpha[i] += delta;
                alpha[j] += delta;
                if diff > 0.0 {
                    if alpha[j] < 0.0 {
                        alpha[j] = 0.0;
                        alpha[i] = diff;
                    }
                } else if alpha[i] < 0.0 {
                    alpha[i] = 0.0;
                    alpha[j] = -diff;
                }
                if diff > 0.0 {
                    if alpha[i] > c {
                        alpha[i] = c;
                        alpha[j] = c - diff;
                    }
                } else if alpha[j] > c {
                    alpha[j] = c;
                    alpha[i] = c + diff;
                }
            } else {
                let quad = positive_or_tau(qd[i] + qd[j] - 2.0 * q_ij);
                let delta = (gradient[i] - gradient[j]) / quad;
                let sum = alpha[i] + alpha[j];
                alpha[i] -= delta;
                alpha[j] += delta;
                if sum > c {
                    if alpha[i] > c {
                        alpha[i] = c;
                        alpha[j] = sum - c;
                    }
                } else if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = sum;
                }
                if sum > c {
                    if alpha[j] > c {
                        alpha[j] = c;
                        alpha[i] = sum - c;
                    }
                } else if alpha[i] < 0.0 {
                    alpha[i] = 0.0;
                    alpha[j] = sum;
                }
            }

            let delta_i = alpha[i] - old_i;
            let delta_j = alpha[j] - old_j;
            for (t, g) in gradient.iter_mut().enumerate() {
                *g += q(i, t) * delta_i + q(j, t) * delta_j;
            }
        }

        let rho = compute_rho(&alpha, &gradient, &sign, c);
        SmoSolution {
            alpha,
            rho,
            iterations,
        }
    }

    fn positive_or_tau(value: f64) -> f64 {
        if value > 0.0 { value } else { TAU }
    }

    /// Second-order working-set selection. Returns `None` once the maximal
    /// KKT violation drops below `tolerance`.
    fn select_working_set(
        alpha: &[f64],
        gradient: &[f64],
        qd: &[f64],
        q: &impl Fn(usize, usize) -> f64,
        sign: &impl Fn(usize) -> f64,
        c: f64,
        tolerance: f64,
    ) -> Option<(usize, usize)> {
        let mut g_max = f64::NEG_INFINITY;
        let mut i_best = None;
        for (t, (&a, &g)) in alpha.iter().zip(gradient).enumerate() {
            if sign(t) > 0.0 {
                if a < c && -g >= g_max {
                    g_max = -g;
                    i_best = Some(t);
                }
            } else if a > 0.0 && g >= g_max {
                g_max = g;
                i_best = Some(t);
            }
        }
        let i = i_best?;

        let mut g_max2 = f64::NEG_INFINITY;
        let mut j_best = None;
        let mut objective_min = f64::INFINITY;
        for (j, (&a, &g)) in alpha.iter().zip(gradient).enumerate() {
            let (grad_diff, quad) = if sign(j) > 0.0 {
                if a <= 0.0 {
                    continue;
                }
                g_max2 = g_max2.max(g);
                (g_max + g, qd[i] + qd[j] - 2.0 * sign(i) * q(i, j))
            } else {
                if a >= c {
                    continue;
                }
                g_max2 = g_max2.max(-g);
                (g_max - g, qd[i] + qd[j] + 2.0 * sign(i) * q(i, j))
            };
            if grad_diff > 0.0 {
                let objective = -(grad_diff * grad_diff) / positive_or_tau(quad);
                if objective <= objective_min {
                    objective_min = objective;
                    j_best = Some(j);
                }
            }
        }

        if g_max + g_max2 < tolerance {
            return None;
        }
        j_best.map(|j| (i, j))
    }

    fn compute_rho(alpha: &[f64], gradient: &[f64], sign: &impl Fn(usize) -> f64, c: f64) -> f64 {
        let mut upper = f64::INFINITY;
        let mut lower = f64::NEG_INFINITY;
        let mut free_count = 0usize;
        let mut free_sum = 0.0;
        for (t, (&a, &g)) in alpha.iter().zip(gradient).enumerate() {
            let yg = sign(t) * g;
            if a >= c {
                if sign(t) < 0.0 {
                    upper = upper.min(yg);
                } else {
                    lower = lower.max(yg);
                }
            } else if a <= 0.0 {
                if sign(t) > 0.0 {
                    upper = upper.min(yg);
                } else {
                    lower = lower.max(yg);
                }
            } else {
                free_count += 1;
                free_sum += yg;
            }
        }
        if free_count > 0 {
            free_sum / free_count as f64
        } else {
            (upper + lower) / 2.0
        }
    }
}
