//! Cohort ingestion: the behavioral table, the lesion volumes it points to,
//! and the covariates that are regressed out of the behavior scores.
//!
//! The table is a CSV file with a `filename` column (lesion volume, relative
//! to the lesion directory) and a `behavior` column. Every other column is a
//! numeric covariate.

pub mod covariates;

pub use covariates::{regress_covariates, standardize_columns};

use crate::types::PatientRecord;
use crate::volume::{BrainMask, VolumeError, VolumeMasker, read_volume};
use ndarray::{Array1, Array2};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FILENAME_COLUMN: &str = "filename";
pub const BEHAVIOR_COLUMN: &str = "behavior";

#[derive(Debug, Error)]
pub enum CohortError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to read the behavioral table: {0}")]
    Csv(#[from] csv::Error),
    #[error("the behavioral table must contain a '{0}' column")]
    MissingColumn(&'static str),
    #[error("the behavioral table contains no patients")]
    Empty,
    #[error("row {row}, column '{column}': '{value}' is not a finite number")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },
    #[error("failed to load lesion {path}: {source}")]
    Lesion {
        path: PathBuf,
        #[source]
        source: VolumeError,
    },
    #[error("failed to load brain mask {path}: {source}")]
    Mask {
        path: PathBuf,
        #[source]
        source: VolumeError,
    },
    #[error("covariate matrix has {rows} rows but there are {patients} behavior scores")]
    CovariateMismatch { rows: usize, patients: usize },
    #[error("the covariates are collinear; cannot regress them out of the behavior scores")]
    SingularCovariates,
}

/// Options of [`load_cohort`].
#[derive(Clone, Copy, Debug)]
pub struct CohortOptions {
    /// Behavior scores are divided by this value.
    pub max_score: f64,
    /// Prepend the lesion volume as a covariate when the table has any.
    pub regress_lesion_volume: bool,
}

#[derive(Clone, Debug)]
pub struct Cohort {
    pub patients: Vec<PatientRecord>,
    /// Lesion volume of each patient in mm^3.
    pub lesion_volumes: Array1<f64>,
    /// Names of the covariate columns, in the order of the covariate vectors.
    pub covariate_names: Vec<String>,
    pub mask: BrainMask,
}

impl Cohort {
    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    /// Stacks the masked lesion vectors into a patients x voxels matrix.
    pub fn lesion_matrix(&self) -> Array2<f64> {
        let voxels = self.mask.n_voxels();
        let mut matrix = Array2::zeros((self.patients.len(), voxels));
        for (mut row, patient) in matrix.rows_mut().into_iter().zip(&self.patients) {
            row.assign(&patient.lesion);
        }
        matrix
    }

    pub fn behaviors(&self) -> Array1<f64> {
        self.patients.iter().map(|p| p.behavior).collect()
    }

    /// The standardized covariates as a patients x covariates matrix, or
    /// `None` when the table had no covariate columns.
    pub fn covariate_matrix(&self) -> Option<Array2<f64>> {
        let width = self.covariate_names.len();
        if width == 0 {
            return None;
        }
        let mut matrix = Array2::zeros((self.patients.len(), width));
        for (mut row, patient) in matrix.rows_mut().into_iter().zip(&self.patients) {
            if let Some(covariates) = &patient.covariates {
                row.assign(covariates);
            }
        }
        Some(matrix)
    }
}

pub fn load_mask(path: &Path) -> Result<BrainMask, CohortError> {
    read_volume(path)
        .and_then(|volume| BrainMask::from_volume(&volume))
        .map_err(|source| CohortError::Mask {
            path: path.to_path_buf(),
            source,
        })
}

struct TableRow {
    filename: String,
    behavior: f64,
    covariates: Vec<f64>,
}

/// Loads the behavioral table and every lesion it references. Without an
/// explicit `mask`, the full grid of the first lesion volume is used.
pub fn load_cohort(
    csv_path: &Path,
    lesion_dir: &Path,
    mask: Option<BrainMask>,
    options: CohortOptions,
) -> Result<Cohort, CohortError> {
    log::info!("Loading behavioral data from {}", csv_path.display());
    let (covariate_columns, rows) = read_table(csv_path)?;
    if rows.is_empty() {
        return Err(CohortError::Empty);
    }

    let mut mask = mask;
    let mut lesions = Vec::with_capacity(rows.len());
    let mut lesion_volumes = Vec::with_capacity(rows.len());
    for row in &rows {
        let path = lesion_dir.join(&row.filename);
        let lesion_error = |source| CohortError::Lesion {
            path: path.clone(),
            source,
        };
        let volume = read_volume(&path).map_err(lesion_error)?;
        if mask.is_none() {
            mask = Some(BrainMask::full(volume.dims(), volume.spacing).map_err(lesion_error)?);
        }
        let Some(active_mask) = mask.as_ref() else {
            return Err(CohortError::Empty);
        };
        lesions.push(active_mask.mask(&volume).map_err(lesion_error)?);
        lesion_volumes.push(volume.nonzero_volume());
    }
    let mask = mask.ok_or(CohortError::Empty)?;
    log::info!(
        "Loaded {} lesions over {} mask voxels",
        lesions.len(),
        mask.n_voxels()
    );

    let mut covariate_names = Vec::new();
    let covariates = if covariate_columns.is_empty() {
        log::info!("No additional covariates found in the behavioral table");
        None
    } else {
        let mut columns: Vec<Vec<f64>> = Vec::new();
        if options.regress_lesion_volume {
            log::info!(
                "Loaded {} additional covariates and lesion volume as covariate",
                covariate_columns.len()
            );
            covariate_names.push("lesion_volume".to_string());
            columns.push(lesion_volumes.clone());
        } else {
            log::info!(
                "Loaded {} additional covariates; lesion volume not regressed out",
                covariate_columns.len()
            );
        }
        for (index, name) in covariate_columns.iter().enumerate() {
            covariate_names.push(name.clone());
            columns.push(rows.iter().map(|row| row.covariates[index]).collect());
        }
        let mut matrix = Array2::from_shape_fn((rows.len(), columns.len()), |(i, j)| columns[j][i]);
        standardize_columns(&mut matrix);
        Some(matrix)
    };

    let patients = rows
        .into_iter()
        .zip(lesions)
        .enumerate()
        .map(|(index, (row, lesion))| PatientRecord {
            id: row.filename,
            lesion,
            behavior: row.behavior / options.max_score,
            covariates: covariates.as_ref().map(|matrix| matrix.row(index).to_owned()),
        })
        .collect();

    Ok(Cohort {
        patients,
        lesion_volumes: Array1::from(lesion_volumes),
        covariate_names,
        mask,
    })
}

fn read_table(path: &Path) -> Result<(Vec<String>, Vec<TableRow>), CohortError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let headers = reader.headers()?.clone();
    let position = |name: &'static str| {
        headers
            .iter()
            .position(|header| header == name)
            .ok_or(CohortError::MissingColumn(name))
    };
    let filename_index = position(FILENAME_COLUMN)?;
    let behavior_index = position(BEHAVIOR_COLUMN)?;
    let covariate_indices: Vec<usize> = (0..headers.len())
        .filter(|&i| i != filename_index && i != behavior_index)
        .collect();
    let covariate_columns = covariate_indices
        .iter()
        .map(|&i| headers[i].to_string())
        .collect();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row_number = index + 1;
        let number = |column: usize| -> Result<f64, CohortError> {
            let text = record.get(column).unwrap_or_default();
            match text.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(value),
                _ => Err(CohortError::InvalidValue {
                    row: row_number,
                    column: headers[column].to_string(),
                    value: text.to_string(),
                }),
            }
        };
        let behavior = number(behavior_index)?;
        let covariates = covariate_indices
            .iter()
            .map(|&i| number(i))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(TableRow {
            filename: record.get(filename_index).unwrap_or_default().to_string(),
            behavior,
            covariates,
        });
    }
    Ok((covariate_columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{Volume, write_volume};
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use tempfile::{TempDir, tempdir};

    fn write_lesion(dir: &Path, name: &str, values: Vec<f64>) {
        let volume = Volume {
            data: Array3::from_shape_vec((2, 2, 1), values).unwrap(),
            spacing: [2.0, 1.0, 1.0],
        };
        write_volume(&dir.join(name), &volume).unwrap();
    }

    fn fixture(table: &str) -> TempDir {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("scores.csv"), table).unwrap();
        write_lesion(dir.path(), "a.txt", vec![1.0, 0.0, 0.0, 0.0]);
        write_lesion(dir.path(), "b.txt.gz", vec![1.0, 1.0, 0.0, 0.0]);
        write_lesion(dir.path(), "c.txt", vec![0.0, 1.0, 1.0, 1.0]);
        dir
    }

    fn options(regress_lesion_volume: bool) -> CohortOptions {
        CohortOptions {
            max_score: 4.0,
            regress_lesion_volume,
        }
    }

    #[test]
    fn behaviors_are_scaled_and_lesions_masked() {
        let dir = fixture("filename,behavior\na.txt,1\nb.txt.gz,2\nc.txt,4\n");
        let cohort = load_cohort(
            &dir.path().join("scores.csv"),
            dir.path(),
            None,
            options(true),
        )
        .unwrap();
        assert_eq!(cohort.len(), 3);
        assert_eq!(cohort.behaviors(), Array1::from(vec![0.25, 0.5, 1.0]));
        assert_eq!(cohort.mask.n_voxels(), 4);
        assert_eq!(cohort.lesion_volumes, Array1::from(vec![2.0, 4.0, 6.0]));
        assert!(cohort.covariate_matrix().is_none());
        assert!(cohort.patients.iter().all(|p| p.covariates.is_none()));
        let matrix = cohort.lesion_matrix();
        assert_eq!(matrix.row(2).to_vec(), vec![0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn lesion_volume_joins_existing_covariates() {
        let dir = fixture("filename,behavior,age\na.txt,1,50\nb.txt.gz,2,60\nc.txt,4,70\n");
        let csv = dir.path().join("scores.csv");
        let cohort = load_cohort(&csv, dir.path(), None, options(true)).unwrap();
        assert_eq!(cohort.covariate_names, vec!["lesion_volume", "age"]);
        let matrix = cohort.covariate_matrix().unwrap();
        assert_eq!(matrix.dim(), (3, 2));
        for column in matrix.columns() {
            assert_abs_diff_eq!(column.mean().unwrap(), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(column.std(0.0), 1.0, epsilon = 1e-12);
        }

        let without = load_cohort(&csv, dir.path(), None, options(false)).unwrap();
        assert_eq!(without.covariate_names, vec!["age"]);
    }

    #[test]
    fn an_explicit_mask_selects_voxels() {
        let dir = fixture("filename,behavior\na.txt,1\nb.txt.gz,2\nc.txt,4\n");
        let mask_volume = Volume::new(
            Array3::from_shape_vec((2, 2, 1), vec![0.0, 1.0, 1.0, 0.0]).unwrap(),
        );
        let mask = BrainMask::from_volume(&mask_volume).unwrap();
        let cohort = load_cohort(
            &dir.path().join("scores.csv"),
            dir.path(),
            Some(mask),
            options(true),
        )
        .unwrap();
        assert_eq!(cohort.lesion_matrix().row(1).to_vec(), vec![1.0, 0.0]);
    }

    #[test]
    fn missing_columns_and_bad_values_are_data_errors() {
        let dir = fixture("filename,score\na.txt,1\n");
        assert!(matches!(
            load_cohort(
                &dir.path().join("scores.csv"),
                dir.path(),
                None,
                options(true)
            ),
            Err(CohortError::MissingColumn("behavior"))
        ));

        let dir = fixture("filename,behavior\na.txt,1\nb.txt.gz,high\n");
        match load_cohort(
            &dir.path().join("scores.csv"),
            dir.path(),
            None,
            options(true),
        ) {
            Err(CohortError::InvalidValue { row, column, .. }) => {
                assert_eq!(row, 2);
                assert_eq!(column, "behavior");
            }
            other => panic!("expected an invalid value, got {other:?}"),
        }

        let dir = fixture("filename,behavior\nmissing.txt,1\n");
        assert!(matches!(
            load_cohort(
                &dir.path().join("scores.csv"),
                dir.path(),
                None,
                options(true)
            ),
            Err(CohortError::Lesion { .. })
        ));

        let dir = fixture("filename,behavior\n");
        assert!(matches!(
            load_cohort(
                &dir.path().join("scores.csv"),
                dir.path(),
                None,
                options(true)
            ),
            Err(CohortError::Empty)
        ));
    }
}
