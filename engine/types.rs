//! Shared vocabulary of the analysis: patients, hyperparameter grids, and the
//! rows produced by cross-validated grid search.

use itertools::iproduct;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One patient as loaded from the cohort table. Immutable once built.
#[derive(Clone, Debug)]
pub struct PatientRecord {
    pub id: String,
    /// Masked lesion values, one per voxel in the brain mask.
    pub lesion: Array1<f64>,
    /// Behavior score already divided by the configured maximum score.
    pub behavior: f64,
    pub covariates: Option<Array1<f64>>,
}

/// A single (C, gamma, epsilon) point of the hyperparameter grid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamCombination {
    pub c: f64,
    pub gamma: f64,
    pub epsilon: f64,
}

impl fmt::Display for ParamCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "C = {}, gamma = {}, epsilon = {}",
            self.c, self.gamma, self.epsilon
        )
    }
}

/// The three value lists searched by cross-validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    pub c: Vec<f64>,
    pub gamma: Vec<f64>,
    pub epsilon: Vec<f64>,
}

impl ParamGrid {
    /// Returns the name of the first hyperparameter whose value list is empty.
    pub fn first_empty_axis(&self) -> Option<&'static str> {
        if self.c.is_empty() {
            Some("C")
        } else if self.gamma.is_empty() {
            Some("gamma")
        } else if self.epsilon.is_empty() {
            Some("epsilon")
        } else {
            None
        }
    }

    /// Returns the first value that cannot parameterize an RBF SVR: C and
    /// gamma must be positive, epsilon non-negative, all finite.
    pub fn first_invalid_value(&self) -> Option<(&'static str, f64)> {
        let not_positive = |v: &&f64| !(v.is_finite() && **v > 0.0);
        if let Some(&c) = self.c.iter().find(not_positive) {
            return Some(("C", c));
        }
        if let Some(&gamma) = self.gamma.iter().find(not_positive) {
            return Some(("gamma", gamma));
        }
        self.epsilon
            .iter()
            .find(|e| !(e.is_finite() && **e >= 0.0))
            .map(|&epsilon| ("epsilon", epsilon))
    }

    pub fn len(&self) -> usize {
        self.c.len() * self.gamma.len() * self.epsilon.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cartesian product in the canonical order: C outermost, then gamma,
    /// then epsilon. Best-model tie-breaking depends on this order.
    pub fn combinations(&self) -> Vec<ParamCombination> {
        iproduct!(
            self.c.iter().copied(),
            self.gamma.iter().copied(),
            self.epsilon.iter().copied()
        )
        .map(|(c, gamma, epsilon)| ParamCombination { c, gamma, epsilon })
        .collect()
    }
}

/// Score and support-vector count of one cross-validation fold.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FoldResult {
    /// Mean squared error on the held-out rows.
    pub score: f64,
    pub support_vectors: usize,
}

/// One evaluated grid point, as persisted in the results table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridSearchRow {
    /// 1-based position of the combination in grid order.
    pub iteration: usize,
    pub params: ParamCombination,
    pub folds: Vec<FoldResult>,
    pub mean_score: f64,
    pub mean_support_vectors: f64,
}

impl GridSearchRow {
    pub fn from_folds(iteration: usize, params: ParamCombination, folds: Vec<FoldResult>) -> Self {
        let n = folds.len().max(1) as f64;
        let mean_score = folds.iter().map(|fold| fold.score).sum::<f64>() / n;
        let mean_support_vectors =
            folds.iter().map(|fold| fold.support_vectors as f64).sum::<f64>() / n;
        Self {
            iteration,
            params,
            folds,
            mean_score,
            mean_support_vectors,
        }
    }
}

/// The grid point with the lowest mean cross-validation score.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BestModel {
    pub iteration: usize,
    pub score: f64,
    pub params: ParamCombination,
}

impl BestModel {
    /// Applies the strict less-than rule. The first row offered seeds the
    /// running best; later rows only replace it with a strictly lower score.
    pub fn consider(current: Option<Self>, row: &GridSearchRow) -> Self {
        let candidate = Self {
            iteration: row.iteration,
            score: row.mean_score,
            params: row.params,
        };
        match current {
            None => candidate,
            Some(best) if row.mean_score < best.score => candidate,
            Some(best) => best,
        }
    }
}
