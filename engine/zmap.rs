//! Z-scoring the observed effect map against the permutation null and
//! thresholding it at the fixed significance levels.

use crate::volume::{ClusterFilter, VolumeError};
use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum size of a surviving cluster, in voxels.
pub const MIN_CLUSTER_VOXELS: usize = 30;

pub const HISTOGRAM_BINS: usize = 50;

#[derive(Debug, Error)]
pub enum ZMapError {
    #[error("{what} has {found} voxels but the observed effect map has {expected}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("cluster filtering failed: {0}")]
    Volume(#[from] VolumeError),
}

/// A nominal one-sided significance level and its critical z-value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SignificanceLevel {
    pub label: &'static str,
    pub alpha: f64,
    pub critical_z: f64,
}

pub const SIGNIFICANCE_LEVELS: [SignificanceLevel; 4] = [
    SignificanceLevel {
        label: "p05",
        alpha: 0.05,
        critical_z: 1.644854,
    },
    SignificanceLevel {
        label: "p01",
        alpha: 0.01,
        critical_z: 2.326348,
    },
    SignificanceLevel {
        label: "p005",
        alpha: 0.005,
        critical_z: 2.575829,
    },
    SignificanceLevel {
        label: "p001",
        alpha: 0.001,
        critical_z: 3.090232,
    },
];

/// `(observed - null_mean) / null_std`, voxel by voxel. `null_std` already
/// carries the variance epsilon, so no voxel needs special handling.
pub fn build_zmap(
    observed: ArrayView1<'_, f64>,
    null_mean: ArrayView1<'_, f64>,
    null_std: ArrayView1<'_, f64>,
) -> Result<Array1<f64>, ZMapError> {
    let expected = observed.len();
    for (what, found) in [("null mean", null_mean.len()), ("null std", null_std.len())] {
        if found != expected {
            return Err(ZMapError::LengthMismatch {
                what,
                expected,
                found,
            });
        }
    }
    Ok(Zip::from(&observed)
        .and(&null_mean)
        .and(&null_std)
        .map_collect(|&o, &m, &s| (o - m) / s))
}

#[derive(Clone, Debug)]
pub struct ThresholdedMap {
    pub level: SignificanceLevel,
    pub values: Array1<f64>,
    pub surviving_voxels: usize,
}

/// Keeps voxels with `|z|` strictly above each level's critical value that
/// also belong to a cluster of at least `min_cluster_voxels` voxels.
pub fn threshold_zmap(
    zmap: ArrayView1<'_, f64>,
    levels: &[SignificanceLevel],
    min_cluster_voxels: usize,
    clusters: &dyn ClusterFilter,
) -> Result<Vec<ThresholdedMap>, ZMapError> {
    levels
        .iter()
        .map(|&level| -> Result<ThresholdedMap, ZMapError> {
            let suprathreshold =
                zmap.mapv(|z| if z.abs() > level.critical_z { z } else { 0.0 });
            let values = clusters.filter_clusters(suprathreshold.view(), min_cluster_voxels)?;
            let surviving_voxels = values.iter().filter(|&&z| z != 0.0).count();
            log::info!(
                "Thresholding z-map at p<{} (|z| > {}): {surviving_voxels} voxels survive",
                level.alpha,
                level.critical_z
            );
            Ok(ThresholdedMap {
                level,
                values,
                surviving_voxels,
            })
        })
        .collect()
}

/// Distribution of the non-zero z-values, as shown in the analysis summary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZMapSummary {
    pub min: f64,
    pub max: f64,
    pub nonzero_voxels: usize,
    pub nonzero_mean: f64,
    pub nonzero_std: f64,
    /// Histogram bounds are symmetric around zero: `[-limit, limit]`.
    pub histogram_limit: f64,
    pub histogram: Vec<usize>,
}

impl ZMapSummary {
    pub fn from_zmap(zmap: ArrayView1<'_, f64>) -> Self {
        let nonzero: Vec<f64> = zmap.iter().copied().filter(|&z| z != 0.0).collect();
        let (min, max) = zmap
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &z| {
                (lo.min(z), hi.max(z))
            });
        let (min, max) = if zmap.is_empty() { (0.0, 0.0) } else { (min, max) };

        let count = nonzero.len();
        let (mean, std) = if count == 0 {
            (0.0, 0.0)
        } else {
            let mean = nonzero.iter().sum::<f64>() / count as f64;
            let variance =
                nonzero.iter().map(|z| (z - mean) * (z - mean)).sum::<f64>() / count as f64;
            (mean, variance.sqrt())
        };

        let limit = nonzero.iter().fold(0.0f64, |acc, z| acc.max(z.abs()));
        let mut histogram = vec![0usize; HISTOGRAM_BINS];
        if limit > 0.0 {
            let width = 2.0 * limit / HISTOGRAM_BINS as f64;
            for z in &nonzero {
                let bin = ((z + limit) / width) as usize;
                histogram[bin.min(HISTOGRAM_BINS - 1)] += 1;
            }
        }

        Self {
            min,
            max,
            nonzero_voxels: count,
            nonzero_mean: mean,
            nonzero_std: std,
            histogram_limit: limit,
            histogram,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permutation::NULL_STD_EPSILON;
    use crate::volume::BrainMask;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn z_scores_include_the_variance_epsilon() {
        let std = (0.25f64 + NULL_STD_EPSILON).sqrt();
        let z = build_zmap(array![2.0].view(), array![1.0].view(), array![std].view()).unwrap();
        assert_abs_diff_eq!(z[0], 1.0 / (0.25f64 + 1e-8).sqrt(), epsilon = 1e-12);
        assert!(z[0] < 2.0);
        assert_abs_diff_eq!(z[0], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(matches!(
            build_zmap(
                array![1.0, 2.0].view(),
                array![0.0].view(),
                array![1.0, 1.0].view()
            ),
            Err(ZMapError::LengthMismatch {
                what: "null mean",
                ..
            })
        ));
    }

    #[test]
    fn levels_are_ordered_by_strictness() {
        let critical: Vec<f64> = SIGNIFICANCE_LEVELS.iter().map(|l| l.critical_z).collect();
        assert_eq!(critical, vec![1.644854, 2.326348, 2.575829, 3.090232]);
        let labels: Vec<&str> = SIGNIFICANCE_LEVELS.iter().map(|l| l.label).collect();
        assert_eq!(labels, vec!["p05", "p01", "p005", "p001"]);
    }

    #[test]
    fn moderate_z_survives_only_the_loosest_level() {
        let mask = BrainMask::full([3, 1, 1], [1.0; 3]).unwrap();
        let zmap = array![1.7, 0.0, -1.0];
        let maps = threshold_zmap(zmap.view(), &SIGNIFICANCE_LEVELS, 1, &mask).unwrap();
        assert_eq!(maps.len(), 4);
        assert_eq!(maps[0].values, array![1.7, 0.0, 0.0]);
        assert_eq!(maps[0].surviving_voxels, 1);
        for map in &maps[1..] {
            assert!(map.values.iter().all(|&z| z == 0.0));
        }
    }

    #[test]
    fn negative_effects_use_the_absolute_value() {
        let mask = BrainMask::full([2, 1, 1], [1.0; 3]).unwrap();
        let zmap = array![-2.4, 2.4];
        let maps = threshold_zmap(zmap.view(), &SIGNIFICANCE_LEVELS[..2], 1, &mask).unwrap();
        assert_eq!(maps[1].values, zmap);
    }

    #[test]
    fn strong_voxels_in_small_clusters_are_removed() {
        let mask = BrainMask::full([40, 1, 1], [1.0; 3]).unwrap();
        let mut zmap = Array1::zeros(40);
        for i in 0..10 {
            zmap[i] = 5.0;
        }
        let maps =
            threshold_zmap(zmap.view(), &SIGNIFICANCE_LEVELS, MIN_CLUSTER_VOXELS, &mask).unwrap();
        assert!(maps.iter().all(|m| m.surviving_voxels == 0));
    }

    #[test]
    fn exact_critical_value_does_not_survive() {
        let mask = BrainMask::full([1, 1, 1], [1.0; 3]).unwrap();
        let zmap = array![1.644854];
        let maps = threshold_zmap(zmap.view(), &SIGNIFICANCE_LEVELS[..1], 1, &mask).unwrap();
        assert_eq!(maps[0].surviving_voxels, 0);
    }

    #[test]
    fn summary_describes_nonzero_values() {
        let zmap = array![0.0, 1.0, -3.0, 0.0, 2.0];
        let summary = ZMapSummary::from_zmap(zmap.view());
        assert_eq!(summary.min, -3.0);
        assert_eq!(summary.max, 2.0);
        assert_eq!(summary.nonzero_voxels, 3);
        assert_abs_diff_eq!(summary.nonzero_mean, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.nonzero_std, (14.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_eq!(summary.histogram_limit, 3.0);
        assert_eq!(summary.histogram.iter().sum::<usize>(), 3);
        assert_eq!(summary.histogram[0], 1);
        assert_eq!(summary.histogram[HISTOGRAM_BINS - 1], 0);

        let empty = ZMapSummary::from_zmap(Array1::zeros(4).view());
        assert_eq!(empty.nonzero_voxels, 0);
        assert!(empty.histogram.iter().all(|&c| c == 0));
    }
}
