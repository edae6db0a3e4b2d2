//! # Cross-Validated Grid Search
//!
//! Every hyperparameter combination is scored by k-fold cross-validation
//! (mean squared error on the held-out fold). The fold split is shuffled with
//! a fixed seed so that identical inputs always produce an identical results
//! table and best-model selection.
//!
//! Grid points are evaluated one after another in canonical (C, gamma,
//! epsilon) order and each finished row is handed to a [`ResultsSink`]
//! immediately, so the table never has to live in memory. The folds of one
//! grid point are independent and may run in parallel; their aggregation is
//! an arithmetic mean and does not depend on completion order.

use crate::progress::{AnalysisStage, ProgressObserver};
use crate::regression::{RegressionError, Regressor, SupportModel};
use crate::types::{BestModel, FoldResult, GridSearchRow, ParamCombination, ParamGrid};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// Seed of the fold shuffle. Changing it changes every results table.
pub const FOLD_SPLIT_SEED: u64 = 42;

pub const RESULTS_TABLE_HEADER: [&str; 8] = [
    "Iteration",
    "C",
    "Gamma",
    "Epsilon",
    "Avg_Score",
    "Scores",
    "Avg_Support_Vectors",
    "Support_Vectors",
];

#[derive(Debug, Error)]
pub enum GridSearchError {
    #[error("the hyperparameter grid has no values for {0}")]
    EmptyGrid(&'static str),
    #[error("cross-validation needs at least 2 folds, got {0}")]
    TooFewFolds(usize),
    #[error("cannot split {patients} patients into {folds} folds")]
    TooFewPatients { patients: usize, folds: usize },
    #[error("feature matrix has {rows} rows but {behaviors} behavior scores were given")]
    RowMismatch { rows: usize, behaviors: usize },
    #[error("the feature matrix is empty ({rows} patients x {voxels} voxels)")]
    EmptyFeatures { rows: usize, voxels: usize },
    #[error("regression failed for {params}: {source}")]
    Regression {
        params: ParamCombination,
        #[source]
        source: RegressionError,
    },
    #[error("malformed results table at record {record}: {message}")]
    MalformedTable { record: usize, message: String },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How independent units of work (folds, permutations) are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parallelism {
    /// One unit at a time, in order.
    Sequential,
    /// Units spread over the global rayon pool.
    #[default]
    Rayon,
}

/// One train/test partition of the patient indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fold {
    /// Ascending.
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffled k-fold splitting. The permuted index list is cut into `n_splits`
/// contiguous test blocks; the first `n % n_splits` blocks receive one extra
/// patient.
#[derive(Clone, Copy, Debug)]
pub struct KFold {
    n_splits: usize,
    seed: u64,
}

impl KFold {
    pub fn new(n_splits: usize) -> Self {
        Self {
            n_splits,
            seed: FOLD_SPLIT_SEED,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    pub fn split(&self, n_samples: usize) -> Result<Vec<Fold>, GridSearchError> {
        if self.n_splits < 2 {
            return Err(GridSearchError::TooFewFolds(self.n_splits));
        }
        if n_samples < self.n_splits {
            return Err(GridSearchError::TooFewPatients {
                patients: n_samples,
                folds: self.n_splits,
            });
        }

        let mut order: Vec<usize> = (0..n_samples).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        order.shuffle(&mut rng);

        let base = n_samples / self.n_splits;
        let extra = n_samples % self.n_splits;
        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for fold_index in 0..self.n_splits {
            let size = base + usize::from(fold_index < extra);
            let test = order[start..start + size].to_vec();
            let mut in_test = vec![false; n_samples];
            for &i in &test {
                in_test[i] = true;
            }
            let train = (0..n_samples).filter(|&i| !in_test[i]).collect();
            folds.push(Fold { train, test });
            start += size;
        }
        Ok(folds)
    }
}

/// Receives each grid-search row as soon as it is complete.
pub trait ResultsSink {
    fn record(&mut self, row: &GridSearchRow) -> Result<(), GridSearchError>;
}

impl ResultsSink for Vec<GridSearchRow> {
    fn record(&mut self, row: &GridSearchRow) -> Result<(), GridSearchError> {
        self.push(row.clone());
        Ok(())
    }
}

/// Streams rows to the `results_and_scores.csv` audit table.
pub struct CsvResultsWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvResultsWriter<File> {
    pub fn create(path: &Path) -> Result<Self, GridSearchError> {
        let file = File::create(path).map_err(|err| {
            std::io::Error::new(
                err.kind(),
                format!("failed to create {}: {err}", path.display()),
            )
        })?;
        Self::from_writer(file)
    }
}

impl<W: Write> CsvResultsWriter<W> {
    pub fn from_writer(inner: W) -> Result<Self, GridSearchError> {
        let mut writer = csv::Writer::from_writer(inner);
        writer.write_record(RESULTS_TABLE_HEADER)?;
        Ok(Self { writer })
    }

    pub fn finish(mut self) -> Result<W, GridSearchError> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|err| GridSearchError::Io(err.into_error()))
    }
}

impl<W: Write> ResultsSink for CsvResultsWriter<W> {
    fn record(&mut self, row: &GridSearchRow) -> Result<(), GridSearchError> {
        let mut buffer = ryu::Buffer::new();
        let mut format = |value: f64| buffer.format(value).to_string();
        let scores = row
            .folds
            .iter()
            .map(|fold| format(fold.score))
            .collect::<Vec<_>>()
            .join(";");
        let counts = row
            .folds
            .iter()
            .map(|fold| fold.support_vectors.to_string())
            .collect::<Vec<_>>()
            .join(";");
        self.writer.write_record([
            row.iteration.to_string(),
            format(row.params.c),
            format(row.params.gamma),
            format(row.params.epsilon),
            format(row.mean_score),
            scores,
            format(row.mean_support_vectors),
            counts,
        ])?;
        // Rows are durable as soon as they are recorded.
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads a results table written by [`CsvResultsWriter`].
pub fn read_results_table(path: &Path) -> Result<Vec<GridSearchRow>, GridSearchError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows: Vec<GridSearchRow> = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let record_number = index + 1;
        let malformed = |message: String| GridSearchError::MalformedTable {
            record: record_number,
            message,
        };
        if record.len() != RESULTS_TABLE_HEADER.len() {
            return Err(malformed(format!(
                "expected {} fields, found {}",
                RESULTS_TABLE_HEADER.len(),
                record.len()
            )));
        }
        let number = |field: usize| -> Result<f64, GridSearchError> {
            record[field].trim().parse::<f64>().map_err(|_| {
                malformed(format!(
                    "column {} holds '{}', not a number",
                    RESULTS_TABLE_HEADER[field], &record[field]
                ))
            })
        };
        let iteration = record[0]
            .trim()
            .parse::<usize>()
            .map_err(|_| malformed(format!("invalid iteration '{}'", &record[0])))?;
        let params = ParamCombination {
            c: number(1)?,
            gamma: number(2)?,
            epsilon: number(3)?,
        };
        let mean_score = number(4)?;
        let mean_support_vectors = number(6)?;

        let scores = split_list(&record[5], |s| s.parse::<f64>().ok())
            .ok_or_else(|| malformed(format!("invalid fold scores '{}'", &record[5])))?;
        let counts = split_list(&record[7], |s| s.parse::<usize>().ok())
            .ok_or_else(|| malformed(format!("invalid support counts '{}'", &record[7])))?;
        if scores.len() != counts.len() {
            return Err(malformed(format!(
                "{} fold scores but {} support-vector counts",
                scores.len(),
                counts.len()
            )));
        }
        let folds = scores
            .into_iter()
            .zip(counts)
            .map(|(score, support_vectors)| FoldResult {
                score,
                support_vectors,
            })
            .collect();

        rows.push(GridSearchRow {
            iteration,
            params,
            folds,
            mean_score,
            mean_support_vectors,
        });
    }
    Ok(rows)
}

fn split_list<T>(field: &str, parse: impl Fn(&str) -> Option<T>) -> Option<Vec<T>> {
    let field = field.trim();
    if field.is_empty() {
        return Some(Vec::new());
    }
    field.split(';').map(|part| parse(part.trim())).collect()
}

/// The result of a completed search.
#[derive(Clone, Debug)]
pub struct GridSearchOutcome {
    pub best: BestModel,
    /// Mean of the support vectors of the best model refitted on every patient.
    pub observed_effect: Array1<f64>,
    /// Support-vector count of that refit.
    pub n_support: usize,
    pub evaluated: usize,
}

pub struct GridSearchCv<'a, R: Regressor> {
    regressor: &'a R,
    grid: &'a ParamGrid,
    kfold: KFold,
    parallelism: Parallelism,
}

impl<'a, R: Regressor> GridSearchCv<'a, R> {
    pub fn new(regressor: &'a R, grid: &'a ParamGrid, n_splits: usize) -> Self {
        Self {
            regressor,
            grid,
            kfold: KFold::new(n_splits),
            parallelism: Parallelism::default(),
        }
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_kfold(mut self, kfold: KFold) -> Self {
        self.kfold = kfold;
        self
    }

    pub fn search(
        &self,
        features: ArrayView2<'_, f64>,
        behaviors: ArrayView1<'_, f64>,
        sink: &mut dyn ResultsSink,
        observer: &mut dyn ProgressObserver,
    ) -> Result<GridSearchOutcome, GridSearchError> {
        if let Some(axis) = self.grid.first_empty_axis() {
            return Err(GridSearchError::EmptyGrid(axis));
        }
        let (patients, voxels) = features.dim();
        if patients != behaviors.len() {
            return Err(GridSearchError::RowMismatch {
                rows: patients,
                behaviors: behaviors.len(),
            });
        }
        if patients == 0 || voxels == 0 {
            return Err(GridSearchError::EmptyFeatures {
                rows: patients,
                voxels,
            });
        }
        let folds = self.kfold.split(patients)?;

        let combinations = self.grid.combinations();
        let total = combinations.len();
        log::info!(
            "Grid search over {total} combinations with {}-fold cross-validation ({patients} patients, {voxels} voxels)",
            self.kfold.n_splits()
        );
        observer.on_stage_start(AnalysisStage::GridSearch, total);

        let mut best: Option<BestModel> = None;
        for (index, params) in combinations.into_iter().enumerate() {
            let started = Instant::now();
            let fold_results = self.evaluate(&params, &folds, features, behaviors)?;
            let row = GridSearchRow::from_folds(index + 1, params, fold_results);
            sink.record(&row)?;
            let current = BestModel::consider(best, &row);
            best = Some(current);

            log::info!(
                "Iteration {}/{total} ({params}): mean score {:.4}, mean support vectors {:.1}, took {:.2?}",
                row.iteration,
                row.mean_score,
                row.mean_support_vectors,
                started.elapsed()
            );
            log::debug!(
                "Best so far: iteration {} with score {:.4}",
                current.iteration,
                current.score
            );
            observer.on_stage_advance(AnalysisStage::GridSearch, index + 1);
        }
        observer.on_stage_finish(AnalysisStage::GridSearch);

        // The grid is non-empty, so at least one row seeded the best model.
        let best = best.ok_or(GridSearchError::EmptyGrid("C"))?;
        log::info!(
            "Best parameters: {} with score {:.4} (iteration {}/{total})",
            best.params,
            best.score,
            best.iteration
        );

        let regression_error = |source| GridSearchError::Regression {
            params: best.params,
            source,
        };
        let model = self
            .regressor
            .fit(&best.params, features, behaviors)
            .map_err(regression_error)?;
        let observed_effect = model.support_vector_mean().map_err(regression_error)?;

        Ok(GridSearchOutcome {
            best,
            observed_effect,
            n_support: model.n_support(),
            evaluated: total,
        })
    }

    fn evaluate(
        &self,
        params: &ParamCombination,
        folds: &[Fold],
        features: ArrayView2<'_, f64>,
        behaviors: ArrayView1<'_, f64>,
    ) -> Result<Vec<FoldResult>, GridSearchError> {
        let run_fold = |(fold_index, fold): (usize, &Fold)| -> Result<FoldResult, GridSearchError> {
            let result = score_fold(self.regressor, params, fold, features, behaviors)
                .map_err(|source| GridSearchError::Regression {
                    params: *params,
                    source,
                })?;
            log::debug!(
                "Fold {}/{}: score {:.6}, {} support vectors of {}",
                fold_index + 1,
                folds.len(),
                result.score,
                result.support_vectors,
                fold.train.len()
            );
            Ok(result)
        };

        match self.parallelism {
            Parallelism::Sequential => folds.iter().enumerate().map(run_fold).collect(),
            Parallelism::Rayon => folds.par_iter().enumerate().map(run_fold).collect(),
        }
    }
}

fn score_fold<R: Regressor>(
    regressor: &R,
    params: &ParamCombination,
    fold: &Fold,
    features: ArrayView2<'_, f64>,
    behaviors: ArrayView1<'_, f64>,
) -> Result<FoldResult, RegressionError> {
    let x_train = features.select(Axis(0), &fold.train);
    let y_train = behaviors.select(Axis(0), &fold.train);
    let x_test = features.select(Axis(0), &fold.test);
    let y_test = behaviors.select(Axis(0), &fold.test);

    let model = regressor.fit(params, x_train.view(), y_train.view())?;
    let predictions = model.predict(x_test.view())?;
    let score = (&predictions - &y_test)
        .mapv(|residual| residual * residual)
        .mean()
        .unwrap_or(0.0);
    Ok(FoldResult {
        score,
        support_vectors: model.n_support(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::regression::RbfSvr;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};
    use rand::Rng;
    use tempfile::tempdir;

    /// Predicts `c` times the training mean; every training row is a support
    /// vector. The score therefore depends on `c` only, which makes ties easy
    /// to construct.
    struct ScaledMean;

    struct ScaledMeanModel {
        prediction: f64,
        support: Vec<usize>,
        rows: Array2<f64>,
    }

    impl SupportModel for ScaledMeanModel {
        fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, RegressionError> {
            Ok(Array1::from_elem(x.nrows(), self.prediction))
        }
        fn support_indices(&self) -> &[usize] {
            &self.support
        }
        fn support_vectors(&self) -> ArrayView2<'_, f64> {
            self.rows.view()
        }
    }

    impl Regressor for ScaledMean {
        type Model = ScaledMeanModel;

        fn fit(
            &self,
            params: &ParamCombination,
            x: ArrayView2<'_, f64>,
            y: ArrayView1<'_, f64>,
        ) -> Result<Self::Model, RegressionError> {
            let mean = y.mean().ok_or(RegressionError::EmptyTrainingSet)?;
            Ok(ScaledMeanModel {
                prediction: params.c * mean,
                support: (0..x.nrows()).collect(),
                rows: x.to_owned(),
            })
        }
    }

    fn synthetic(patients: usize, voxels: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((patients, voxels), |_| {
            if rng.gen_bool(0.4) { 1.0 } else { 0.0 }
        });
        let y = x.sum_axis(Axis(1)) / voxels as f64;
        (x, y)
    }

    #[test]
    fn folds_partition_the_patients() {
        let folds = KFold::new(4).split(14).unwrap();
        let sizes: Vec<usize> = folds.iter().map(|f| f.test.len()).collect();
        assert_eq!(sizes, vec![4, 4, 3, 3]);

        let mut seen: Vec<usize> = folds.iter().flat_map(|f| f.test.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..14).collect::<Vec<_>>());

        for fold in &folds {
            assert!(fold.train.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(fold.train.len() + fold.test.len(), 14);
            assert!(fold.test.iter().all(|i| !fold.train.contains(i)));
        }
    }

    #[test]
    fn fold_split_is_reproducible() {
        assert_eq!(KFold::new(5).split(23).unwrap(), KFold::new(5).split(23).unwrap());
        assert_ne!(
            KFold::new(5).split(23).unwrap(),
            KFold::new(5).with_seed(7).split(23).unwrap()
        );
    }

    #[test]
    fn fold_preconditions_are_configuration_errors() {
        assert!(matches!(KFold::new(1).split(10), Err(GridSearchError::TooFewFolds(1))));
        assert!(matches!(
            KFold::new(4).split(3),
            Err(GridSearchError::TooFewPatients {
                patients: 3,
                folds: 4
            })
        ));
    }

    #[test]
    fn an_explicit_fold_plan_replaces_the_default() {
        let (x, y) = synthetic(12, 6, 4);
        let grid = ParamGrid {
            c: vec![1.0],
            gamma: vec![1.0],
            epsilon: vec![0.1],
        };
        let kfold = KFold::new(3).with_seed(7);
        assert_eq!(kfold.n_splits(), 3);
        let regressor = ScaledMean;
        let mut rows: Vec<GridSearchRow> = Vec::new();
        GridSearchCv::new(&regressor, &grid, 5)
            .with_kfold(kfold)
            .search(x.view(), y.view(), &mut rows, &mut NoopProgress)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].folds.len(), 3);
        assert!(rows[0].folds.iter().all(|f| f.support_vectors == 8));
    }

    #[test]
    fn ties_resolve_to_the_first_combination() {
        let (x, y) = synthetic(12, 6, 1);
        let grid = ParamGrid {
            c: vec![1.0],
            gamma: vec![0.5, 2.0],
            epsilon: vec![0.1, 0.2],
        };
        let regressor = ScaledMean;
        let mut rows: Vec<GridSearchRow> = Vec::new();
        let outcome = GridSearchCv::new(&regressor, &grid, 3)
            .search(x.view(), y.view(), &mut rows, &mut NoopProgress)
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.mean_score == rows[0].mean_score));
        assert_eq!(outcome.best.iteration, 1);
        assert_eq!(outcome.best.params, grid.combinations()[0]);
    }

    #[test]
    fn best_model_has_the_minimum_mean_score() {
        let (x, y) = synthetic(12, 6, 2);
        let grid = ParamGrid {
            c: vec![3.0, 1.0, 0.0],
            gamma: vec![1.0],
            epsilon: vec![0.1],
        };
        let regressor = ScaledMean;
        let mut rows: Vec<GridSearchRow> = Vec::new();
        let outcome = GridSearchCv::new(&regressor, &grid, 4)
            .search(x.view(), y.view(), &mut rows, &mut NoopProgress)
            .unwrap();
        let minimum = rows
            .iter()
            .map(|r| r.mean_score)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(outcome.best.score, minimum);
        assert_eq!(outcome.best.params.c, 1.0);
        // Every row is a support vector of the refit, so the effect is the
        // column mean of the features.
        let expected = x.mean_axis(Axis(0)).unwrap();
        assert_eq!(outcome.observed_effect, expected);
        assert_eq!(outcome.n_support, 12);
    }

    #[test]
    fn search_is_deterministic_across_parallelism() {
        let (x, y) = synthetic(16, 8, 3);
        let grid = ParamGrid {
            c: vec![1.0, 10.0],
            gamma: vec![0.1, 1.0],
            epsilon: vec![0.01],
        };
        let svr = RbfSvr::new();
        let run = |parallelism| {
            let mut rows: Vec<GridSearchRow> = Vec::new();
            let outcome = GridSearchCv::new(&svr, &grid, 4)
                .with_parallelism(parallelism)
                .search(x.view(), y.view(), &mut rows, &mut NoopProgress)
                .unwrap();
            (rows, outcome.best)
        };
        let (rows_a, best_a) = run(Parallelism::Sequential);
        let (rows_b, best_b) = run(Parallelism::Rayon);
        let (rows_c, best_c) = run(Parallelism::Sequential);
        assert_eq!(rows_a, rows_b);
        assert_eq!(rows_a, rows_c);
        assert_eq!(best_a, best_b);
        assert_eq!(best_a, best_c);
    }

    #[test]
    fn invalid_inputs_are_rejected_before_fitting() {
        let (x, y) = synthetic(6, 3, 4);
        let regressor = ScaledMean;
        let empty_grid = ParamGrid {
            c: vec![1.0],
            gamma: vec![],
            epsilon: vec![0.1],
        };
        let mut rows: Vec<GridSearchRow> = Vec::new();
        assert!(matches!(
            GridSearchCv::new(&regressor, &empty_grid, 2).search(
                x.view(),
                y.view(),
                &mut rows,
                &mut NoopProgress
            ),
            Err(GridSearchError::EmptyGrid("gamma"))
        ));

        let grid = ParamGrid {
            c: vec![1.0],
            gamma: vec![1.0],
            epsilon: vec![0.1],
        };
        assert!(matches!(
            GridSearchCv::new(&regressor, &grid, 10).search(
                x.view(),
                y.view(),
                &mut rows,
                &mut NoopProgress
            ),
            Err(GridSearchError::TooFewPatients { .. })
        ));
        assert!(matches!(
            GridSearchCv::new(&regressor, &grid, 2).search(
                x.view(),
                y.slice(ndarray::s![..4]),
                &mut rows,
                &mut NoopProgress
            ),
            Err(GridSearchError::RowMismatch {
                rows: 6,
                behaviors: 4
            })
        ));
        assert!(rows.is_empty());
    }

    #[test]
    fn results_table_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results_and_scores.csv");
        let (x, y) = synthetic(10, 4, 5);
        let grid = ParamGrid {
            c: vec![2.0, 0.5],
            gamma: vec![1.0],
            epsilon: vec![0.1],
        };
        let regressor = ScaledMean;
        let mut writer = CsvResultsWriter::create(&path).unwrap();
        GridSearchCv::new(&regressor, &grid, 5)
            .search(x.view(), y.view(), &mut writer, &mut NoopProgress)
            .unwrap();
        writer.finish().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(
            "Iteration,C,Gamma,Epsilon,Avg_Score,Scores,Avg_Support_Vectors,Support_Vectors"
        ));

        let rows = read_results_table(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].iteration, 2);
        assert_eq!(rows[1].params.c, 0.5);
        assert_eq!(rows[0].folds.len(), 5);
        assert!(rows[0].folds.iter().all(|f| f.support_vectors == 8));
        let mean = rows[0].folds.iter().map(|f| f.score).sum::<f64>() / 5.0;
        assert_abs_diff_eq!(rows[0].mean_score, mean, epsilon = 1e-12);
    }

    #[test]
    fn malformed_tables_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        std::fs::write(
            &path,
            "Iteration,C,Gamma,Epsilon,Avg_Score,Scores,Avg_Support_Vectors,Support_Vectors\n\
             1,1.0,0.5,0.1,0.2,0.1;0.3,4.0,4\n",
        )
        .unwrap();
        assert!(matches!(
            read_results_table(&path),
            Err(GridSearchError::MalformedTable { record: 1, .. })
        ));
    }
}
