//! Voxel eligibility by patient overlap.
//!
//! A voxel takes part in the analysis only when at least a minimum number of
//! patients have a lesion there. Ineligible voxel columns are zeroed in every
//! patient row; patients themselves are never dropped, so the row alignment
//! with the behavior vector is preserved.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("the lesion matrix does not contain any patients")]
    EmptyCohort,
    #[error("the lesion matrix does not contain any voxels")]
    NoVoxels,
    #[error("invalid minimum patient count '{0}': expected a percentage such as \"10%\" or an integer count")]
    InvalidThreshold(String),
    #[error(
        "no voxel is lesioned in at least {threshold} of {patients} patients; lower the minimum patient count"
    )]
    NoEligibleVoxels { threshold: usize, patients: usize },
}

/// The minimum number of patients a voxel must be lesioned in, either as an
/// absolute count or as a percentage of the cohort.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MinPatientCount {
    Count(i64),
    Percent(f64),
}

impl MinPatientCount {
    /// Resolves the threshold against the cohort size. Percentages are
    /// truncated toward zero (`"33%"` of 10 patients is 3). A result of zero
    /// or below disables filtering and is reported as 0.
    pub fn resolve(&self, patient_count: usize) -> usize {
        let resolved = match *self {
            Self::Count(count) => count,
            Self::Percent(percent) => {
                let exact = patient_count as f64 * percent / 100.0;
                log::info!("{percent}% of {patient_count} patients = {exact}");
                exact.trunc() as i64
            }
        };
        resolved.max(0) as usize
    }
}

impl Default for MinPatientCount {
    fn default() -> Self {
        Self::Count(0)
    }
}

impl fmt::Display for MinPatientCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::Percent(percent) => write!(f, "{percent}%"),
        }
    }
}

impl FromStr for MinPatientCount {
    type Err = FilterError;

    /// Any string is a percentage of the cohort, with or without a trailing
    /// `%`: `"50"` and `"50%"` both mean half of the patients. Absolute counts
    /// come from integer values in the configuration.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let trimmed = text.trim();
        let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
        match number.parse::<f64>() {
            Ok(percent) if percent.is_finite() => Ok(Self::Percent(percent)),
            _ => Err(FilterError::InvalidThreshold(text.to_string())),
        }
    }
}

impl Serialize for MinPatientCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Count(count) => serializer.serialize_i64(*count),
            Self::Percent(_) => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for MinPatientCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(count) => Ok(Self::Count(count)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Output of [`VoxelFilter::apply`].
#[derive(Clone, Debug)]
pub struct FilteredVoxels {
    /// The resolved integer threshold; 0 means filtering was disabled.
    pub threshold: usize,
    /// Patients x voxels training matrix, ineligible columns zeroed and rows
    /// optionally scaled to unit L2 norm.
    pub features: Array2<f64>,
    pub eligibility: Array1<bool>,
    /// Number of patients with a non-zero value at each voxel.
    pub patient_counts: Array1<usize>,
    /// Column sums before filtering (lesion overlap).
    pub overlap: Array1<f64>,
    /// Column sums after filtering, before normalization.
    pub overlap_filtered: Array1<f64>,
}

impl FilteredVoxels {
    pub fn eligible_voxels(&self) -> usize {
        self.eligibility.iter().filter(|&&eligible| eligible).count()
    }
}

#[derive(Clone, Debug)]
pub struct VoxelFilter {
    min_patient_count: MinPatientCount,
    normalize: bool,
}

impl VoxelFilter {
    pub fn new(min_patient_count: MinPatientCount, normalize: bool) -> Self {
        Self {
            min_patient_count,
            normalize,
        }
    }

    /// Builds the training matrix from stacked patient lesion vectors
    /// (one row per patient).
    pub fn apply(&self, lesions: ArrayView2<'_, f64>) -> Result<FilteredVoxels, FilterError> {
        let (patients, voxels) = lesions.dim();
        if patients == 0 {
            return Err(FilterError::EmptyCohort);
        }
        if voxels == 0 {
            return Err(FilterError::NoVoxels);
        }

        let threshold = self.min_patient_count.resolve(patients);
        if threshold > 0 {
            log::info!("Filtering voxels by patient count: {threshold}/{patients}");
        } else {
            log::info!("Voxel filtering disabled (minimum patient count resolves to 0)");
        }

        let overlap = lesions.sum_axis(Axis(0));
        let patient_counts = lesions.map_axis(Axis(0), |column| {
            column.iter().filter(|&&value| value > 0.0).count()
        });
        let eligibility = patient_counts.mapv(|count| threshold == 0 || count >= threshold);

        let eligible = eligibility.iter().filter(|&&e| e).count();
        if eligible == 0 {
            return Err(FilterError::NoEligibleVoxels {
                threshold,
                patients,
            });
        }
        log::info!("{eligible} of {voxels} voxels are eligible");

        let mut features = lesions.to_owned();
        for (mut column, &keep) in features.axis_iter_mut(Axis(1)).zip(eligibility.iter()) {
            if !keep {
                column.fill(0.0);
            }
        }
        let overlap_filtered = features.sum_axis(Axis(0));

        if self.normalize {
            normalize_rows(&mut features);
        }

        Ok(FilteredVoxels {
            threshold,
            features,
            eligibility,
            patient_counts,
            overlap,
            overlap_filtered,
        })
    }
}

/// Scales every row to unit L2 norm. All-zero rows stay zero.
pub fn normalize_rows(matrix: &mut Array2<f64>) {
    for mut row in matrix.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|value| value / norm);
        }
    }
}
