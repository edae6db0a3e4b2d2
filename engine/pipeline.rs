//! # Analysis Orchestration
//!
//! [`run_core`] is the statistical engine proper: voxel filtering, grid
//! search, permutation testing and z-mapping over an already-masked lesion
//! matrix. [`run_analysis`] wraps it with everything a complete run needs:
//! loading the cohort, residualizing covariates, building the mask, and
//! writing the volumes and the summary.

use crate::cohort::{self, CohortError, CohortOptions, load_cohort, load_mask};
use crate::config::{AnalysisConfig, ConfigError};
use crate::grid_search::{
    CsvResultsWriter, GridSearchCv, GridSearchError, GridSearchOutcome, Parallelism,
};
use crate::permutation::{NullDistribution, PermutationEngine, PermutationError};
use crate::progress::{ProgressObserver, format_duration};
use crate::regression::{RbfSvr, Regressor};
use crate::types::{BestModel, ParamGrid};
use crate::volume::{ClusterFilter, VolumeError, VolumeMasker, write_volume};
use crate::voxel_filter::{FilterError, FilteredVoxels, MinPatientCount, VoxelFilter};
use crate::zmap::{
    MIN_CLUSTER_VOXELS, SIGNIFICANCE_LEVELS, ThresholdedMap, ZMapError, ZMapSummary, build_zmap,
    threshold_zmap,
};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use thiserror::Error;

pub const RESULTS_TABLE_FILE: &str = "results_and_scores.csv";
pub const NULL_STORE_FILE: &str = "null_distributions.bin";
pub const SUMMARY_FILE: &str = "summary.toml";
pub const THRESHOLDED_DIR: &str = "thresholded_zmaps";
pub const VOLUME_EXTENSION: &str = "txt.gz";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cohort(#[from] CohortError),
    #[error("voxel filtering failed: {0}")]
    Filter(#[from] FilterError),
    #[error("grid search failed: {0}")]
    GridSearch(#[from] GridSearchError),
    #[error("permutation testing failed: {0}")]
    Permutation(#[from] PermutationError),
    #[error("z-map construction failed: {0}")]
    ZMap(#[from] ZMapError),
    #[error("failed to write a volume: {0}")]
    Volume(#[from] VolumeError),
    #[error("lesion matrix has {lesions} rows but {behaviors} behavior scores were given")]
    RowMismatch { lesions: usize, behaviors: usize },
    #[error("failed to serialize the summary: {0}")]
    Summary(#[from] toml::ser::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything [`run_core`] needs besides the data.
#[derive(Clone, Debug)]
pub struct CoreSettings {
    pub min_patient_count: MinPatientCount,
    pub normalize: bool,
    pub grid: ParamGrid,
    pub n_splits: usize,
    pub search_parallelism: Parallelism,
    pub n_permutations: usize,
    pub permutation_seed: Option<u64>,
    pub permutation_parallelism: Parallelism,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl CoreSettings {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            min_patient_count: config.filter.min_patient_count,
            normalize: config.filter.normalize,
            grid: config.search.grid.clone(),
            n_splits: config.search.n_splits,
            search_parallelism: config.search.parallelism,
            n_permutations: config.permutation.n_permutations,
            permutation_seed: config.permutation.seed,
            permutation_parallelism: config.permutation.parallelism,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));
        if let Some(axis) = self.grid.first_empty_axis() {
            return invalid(format!("the hyperparameter grid has no values for {axis}"));
        }
        if let Some((axis, value)) = self.grid.first_invalid_value() {
            return invalid(format!("the hyperparameter grid has an invalid {axis} value {value}"));
        }
        if self.n_splits < 2 {
            return invalid(format!(
                "cross-validation needs at least 2 folds, got {}",
                self.n_splits
            ));
        }
        if self.n_permutations == 0 {
            return invalid("the number of permutations must be positive".into());
        }
        Ok(())
    }
}

/// In-memory results of [`run_core`]. The results table and the null store
/// are on disk.
#[derive(Clone, Debug)]
pub struct CoreOutcome {
    pub filtered: FilteredVoxels,
    pub search: GridSearchOutcome,
    pub null: NullDistribution,
    pub zmap: Array1<f64>,
    pub thresholded: Vec<ThresholdedMap>,
    pub results_table: PathBuf,
    pub null_store: PathBuf,
}

/// Filters voxels, searches the grid, builds the permutation null and the
/// z-map. Configuration problems are reported before any fitting starts.
pub fn run_core<R: Regressor>(
    lesions: ArrayView2<'_, f64>,
    behaviors: ArrayView1<'_, f64>,
    settings: &CoreSettings,
    regressor: &R,
    clusters: &dyn ClusterFilter,
    out_dir: &Path,
    observer: &mut dyn ProgressObserver,
) -> Result<CoreOutcome, PipelineError> {
    settings.validate()?;
    if lesions.nrows() != behaviors.len() {
        return Err(PipelineError::RowMismatch {
            lesions: lesions.nrows(),
            behaviors: behaviors.len(),
        });
    }
    if lesions.nrows() < settings.n_splits {
        return Err(GridSearchError::TooFewPatients {
            patients: lesions.nrows(),
            folds: settings.n_splits,
        }
        .into());
    }
    fs::create_dir_all(out_dir)?;

    let filtered =
        VoxelFilter::new(settings.min_patient_count, settings.normalize).apply(lesions)?;

    let results_table = out_dir.join(RESULTS_TABLE_FILE);
    let mut writer = CsvResultsWriter::create(&results_table)?;
    let search = GridSearchCv::new(regressor, &settings.grid, settings.n_splits)
        .with_parallelism(settings.search_parallelism)
        .search(filtered.features.view(), behaviors, &mut writer, observer)?;
    writer.finish()?;
    log::info!("Results and scores saved to {}", results_table.display());

    let null_store = out_dir.join(NULL_STORE_FILE);
    let mut engine = PermutationEngine::new(regressor, search.best.params, settings.n_permutations)
        .with_parallelism(settings.permutation_parallelism)
        .with_seed(settings.permutation_seed);
    if let Some(cancel) = &settings.cancel {
        engine = engine.with_cancellation(Arc::clone(cancel));
    }
    let permutations = engine.run(filtered.features.view(), behaviors, &null_store, observer)?;
    let null = permutations.distribution;

    let zmap = build_zmap(
        search.observed_effect.view(),
        null.mean.view(),
        null.std.view(),
    )?;
    let thresholded = threshold_zmap(
        zmap.view(),
        &SIGNIFICANCE_LEVELS,
        MIN_CLUSTER_VOXELS,
        clusters,
    )?;

    Ok(CoreOutcome {
        filtered,
        search,
        null,
        zmap,
        thresholded,
        results_table,
        null_store,
    })
}

#[derive(Clone, Debug, Serialize)]
pub struct ThresholdSummary {
    pub label: String,
    pub alpha: f64,
    pub critical_z: f64,
    pub surviving_voxels: usize,
}

/// Contents of `summary.toml`.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisSummary {
    pub patients: usize,
    pub lesion_files: usize,
    /// Mean lesioned volume per patient, in the units of the voxel spacing.
    pub mean_lesion_volume: f64,
    pub mask_voxels: usize,
    pub covariates: Vec<String>,
    pub min_patient_count: String,
    pub resolved_min_patient_count: usize,
    pub eligible_voxels: usize,
    pub grid_points: usize,
    pub n_splits: usize,
    pub n_permutations: usize,
    pub best_model_support_vectors: usize,
    /// Shown as a percentage, e.g. `5%`.
    pub significance_level: String,
    pub elapsed: String,
    pub best_model: BestModel,
    pub zmap: ZMapSummary,
    pub thresholds: Vec<ThresholdSummary>,
}

/// Runs a complete analysis as described by `config` and writes every
/// artifact into `config.output.directory`.
pub fn run_analysis(
    config: &AnalysisConfig,
    observer: &mut dyn ProgressObserver,
) -> Result<AnalysisSummary, PipelineError> {
    config.validate()?;
    let started = Instant::now();
    let out_dir = &config.output.directory;
    fs::create_dir_all(out_dir)?;

    let mask = config.cohort.mask.as_deref().map(load_mask).transpose()?;
    let cohort = load_cohort(
        &config.cohort.behavior_csv,
        &config.cohort.lesion_dir,
        mask,
        CohortOptions {
            max_score: config.cohort.max_score,
            regress_lesion_volume: config.cohort.regress_lesion_volume,
        },
    )?;
    let covariates = cohort.covariate_matrix();
    let behaviors = cohort::regress_covariates(
        cohort.behaviors().view(),
        covariates.as_ref().map(|matrix| matrix.view()),
    )?;
    let lesions = cohort.lesion_matrix();

    let settings = CoreSettings::from_config(config);
    let regressor = RbfSvr::new();
    let outcome = run_core(
        lesions.view(),
        behaviors.view(),
        &settings,
        &regressor,
        &cohort.mask,
        out_dir,
        observer,
    )?;

    let write = |name: &str, values: ArrayView1<'_, f64>| -> Result<(), PipelineError> {
        let path = out_dir.join(format!("{name}.{VOLUME_EXTENSION}"));
        write_volume(&path, &cohort.mask.unmask(values)?)?;
        log::info!("Saved {}", path.display());
        Ok(())
    };
    write("lesion_overlap", outcome.filtered.overlap.view())?;
    write("lesion_overlap_filtered", outcome.filtered.overlap_filtered.view())?;
    write("beta_map", outcome.search.observed_effect.view())?;
    write("null_map", outcome.null.mean.view())?;
    write("zmap", outcome.zmap.view())?;

    fs::create_dir_all(out_dir.join(THRESHOLDED_DIR))?;
    for map in &outcome.thresholded {
        write(
            &format!("{THRESHOLDED_DIR}/zmap_{}", map.level.label),
            map.values.view(),
        )?;
    }

    let summary = AnalysisSummary {
        patients: cohort.len(),
        lesion_files: cohort.lesion_volumes.len(),
        mean_lesion_volume: cohort.lesion_volumes.mean().unwrap_or(0.0),
        mask_voxels: cohort.mask.n_voxels(),
        covariates: cohort.covariate_names.clone(),
        min_patient_count: config.filter.min_patient_count.to_string(),
        resolved_min_patient_count: outcome.filtered.threshold,
        eligible_voxels: outcome.filtered.eligible_voxels(),
        grid_points: outcome.search.evaluated,
        n_splits: settings.n_splits,
        n_permutations: outcome.null.count,
        best_model_support_vectors: outcome.search.n_support,
        significance_level: format!("{}%", config.output.significance_level * 100.0),
        elapsed: format_duration(started.elapsed()),
        best_model: outcome.search.best,
        zmap: ZMapSummary::from_zmap(outcome.zmap.view()),
        thresholds: outcome
            .thresholded
            .iter()
            .map(|map| ThresholdSummary {
                label: map.level.label.to_string(),
                alpha: map.level.alpha,
                critical_z: map.level.critical_z,
                surviving_voxels: map.surviving_voxels,
            })
            .collect(),
    };
    let summary_path = out_dir.join(SUMMARY_FILE);
    fs::write(&summary_path, toml::to_string_pretty(&summary)?)?;
    log::info!(
        "Analysis finished in {}; summary saved to {}",
        summary.elapsed,
        summary_path.display()
    );
    Ok(summary)
}
