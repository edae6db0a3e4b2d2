use super::{BrainMask, VolumeError};
use ndarray::{Array1, ArrayView1};
use std::collections::VecDeque;

/// Zeroes connected clusters of a thresholded voxel vector that contain fewer
/// than `min_voxels` voxels.
pub trait ClusterFilter {
    fn filter_clusters(
        &self,
        values: ArrayView1<'_, f64>,
        min_voxels: usize,
    ) -> Result<Array1<f64>, VolumeError>;
}

/// Face-connected (6-neighbour) components over the mask grid. Positive and
/// negative voxels form separate clusters.
impl ClusterFilter for BrainMask {
    fn filter_clusters(
        &self,
        values: ArrayView1<'_, f64>,
        min_voxels: usize,
    ) -> Result<Array1<f64>, VolumeError> {
        let n = self.offsets().len();
        if values.len() != n {
            return Err(VolumeError::LengthMismatch {
                expected: n,
                found: values.len(),
            });
        }

        let mut output = values.to_owned();
        if min_voxels <= 1 {
            return Ok(output);
        }

        let [nx, ny, nz] = self.dims();
        let sign = |v: f64| v.partial_cmp(&0.0).map(|o| o as i8).unwrap_or(0);
        let mut visited = vec![false; n];
        let mut queue = VecDeque::new();
        let mut members = Vec::new();

        for seed in 0..n {
            let seed_sign = sign(values[seed]);
            if visited[seed] || seed_sign == 0 {
                continue;
            }

            members.clear();
            visited[seed] = true;
            queue.push_back(seed);
            while let Some(current) = queue.pop_front() {
                members.push(current);
                let offset = self.offsets()[current];
                let (x, rest) = (offset / (ny * nz), offset % (ny * nz));
                let (y, z) = (rest / nz, rest % nz);

                let mut neighbours = [None; 6];
                if x > 0 {
                    neighbours[0] = Some(offset - ny * nz);
                }
                if x + 1 < nx {
                    neighbours[1] = Some(offset + ny * nz);
                }
                if y > 0 {
                    neighbours[2] = Some(offset - nz);
                }
                if y + 1 < ny {
                    neighbours[3] = Some(offset + nz);
                }
                if z > 0 {
                    neighbours[4] = Some(offset - 1);
                }
                if z + 1 < nz {
                    neighbours[5] = Some(offset + 1);
                }

                for neighbour in neighbours.into_iter().flatten() {
                    if let Some(index) = self.masked_index(neighbour) {
                        if !visited[index] && sign(values[index]) == seed_sign {
                            visited[index] = true;
                            queue.push_back(index);
                        }
                    }
                }
            }

            if members.len() < min_voxels {
                for &index in &members {
                    output[index] = 0.0;
                }
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn line_mask(len: usize) -> BrainMask {
        BrainMask::full([len, 1, 1], [1.0; 3]).unwrap()
    }

    #[test]
    fn small_clusters_are_removed() {
        let mask = line_mask(50);
        let mut values = Array1::<f64>::zeros(50);
        for i in 0..10 {
            values[i] = 5.0;
        }
        for i in 15..47 {
            values[i] = 3.0;
        }
        let filtered = mask.filter_clusters(values.view(), 30).unwrap();
        assert!(filtered.iter().take(10).all(|&v| v == 0.0));
        assert!(filtered.iter().skip(15).take(32).all(|&v| v == 3.0));
    }

    #[test]
    fn opposite_signs_do_not_merge() {
        let mask = line_mask(6);
        let values = Array1::from(vec![2.0, 2.0, 2.0, -2.0, -2.0, -2.0]);
        let filtered = mask.filter_clusters(values.view(), 4).unwrap();
        assert!(filtered.iter().all(|&v| v == 0.0));

        let kept = mask.filter_clusters(values.view(), 3).unwrap();
        assert_eq!(kept, values);
    }

    #[test]
    fn connectivity_follows_grid_faces_only() {
        // 2x2 plane: diagonal voxels are not face neighbours.
        let mask = BrainMask::full([2, 2, 1], [1.0; 3]).unwrap();
        let values = Array1::from(vec![1.0, 0.0, 0.0, 1.0]);
        let filtered = mask.filter_clusters(values.view(), 2).unwrap();
        assert!(filtered.iter().all(|&v| v == 0.0));

        let values = Array1::from(vec![1.0, 1.0, 0.0, 0.0]);
        let filtered = mask.filter_clusters(values.view(), 2).unwrap();
        assert_eq!(filtered, values);
    }

    #[test]
    fn voxels_outside_the_mask_break_clusters() {
        let template = crate::volume::Volume::new(
            ndarray::Array3::from_shape_vec((5, 1, 1), vec![1.0, 1.0, 0.0, 1.0, 1.0]).unwrap(),
        );
        let mask = BrainMask::from_volume(&template).unwrap();
        let values = Array1::from(vec![1.0, 1.0, 1.0, 1.0]);
        let filtered = mask.filter_clusters(values.view(), 3).unwrap();
        assert!(filtered.iter().all(|&v| v == 0.0));
    }
}
