//! Plain-text volume format.
//!
//! ```text
//! # optional comments
//! dims 91 109 91
//! spacing 2 2 2
//! 0 0 1 1 0 ...
//! ```
//!
//! `dims` is required and precedes the values; `spacing` is optional and
//! defaults to 1 mm. Values are whitespace separated, in C order (the last
//! axis varies fastest), and may span any number of lines. Files ending in
//! `.gz` are transparently (de)compressed.

use super::{Volume, VolumeError};
use crate::shared::files::{create_text_sink, open_text_source};
use ndarray::Array3;
use std::io::Write;
use std::path::Path;

pub fn read_volume(path: &Path) -> Result<Volume, VolumeError> {
    let mut source = open_text_source(path)?;
    let path_display = path.display().to_string();
    let malformed = |line: usize, message: String| VolumeError::Malformed {
        path: path_display.clone(),
        line,
        message,
    };

    let mut dims: Option<[usize; 3]> = None;
    let mut spacing = [1.0; 3];
    let mut values: Vec<f64> = Vec::new();
    let mut line_number = 0usize;

    while let Some(raw_line) = source.next_line()? {
        line_number += 1;
        let line = std::str::from_utf8(raw_line)
            .map_err(|err| malformed(line_number, format!("line is not valid UTF-8: {err}")))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let first = fields.next().unwrap_or_default();
        if first.eq_ignore_ascii_case("dims") || first.eq_ignore_ascii_case("spacing") {
            if !values.is_empty() {
                return Err(malformed(
                    line_number,
                    format!("'{first}' must appear before the voxel values"),
                ));
            }
            let parsed: Vec<&str> = fields.collect();
            if parsed.len() != 3 {
                return Err(malformed(
                    line_number,
                    format!("'{first}' expects exactly three values"),
                ));
            }
            if first.eq_ignore_ascii_case("dims") {
                let mut parsed_dims = [0usize; 3];
                for (slot, text) in parsed_dims.iter_mut().zip(&parsed) {
                    *slot = match text.parse::<usize>() {
                        Ok(value) if value > 0 => value,
                        _ => {
                            return Err(malformed(
                                line_number,
                                format!("invalid dimension '{text}'"),
                            ));
                        }
                    };
                }
                dims = Some(parsed_dims);
            } else {
                for (slot, text) in spacing.iter_mut().zip(&parsed) {
                    *slot = match text.parse::<f64>() {
                        Ok(value) if value.is_finite() && value > 0.0 => value,
                        _ => {
                            return Err(malformed(
                                line_number,
                                format!("invalid spacing '{text}'"),
                            ));
                        }
                    };
                }
            }
            continue;
        }

        if dims.is_none() {
            return Err(malformed(
                line_number,
                "voxel values found before the 'dims' header".into(),
            ));
        }
        for text in std::iter::once(first).chain(fields) {
            let value: f64 = text
                .parse()
                .map_err(|_| malformed(line_number, format!("invalid voxel value '{text}'")))?;
            if !value.is_finite() {
                return Err(malformed(
                    line_number,
                    format!("non-finite voxel value '{text}'"),
                ));
            }
            values.push(value);
        }
    }

    let dims = dims.ok_or_else(|| malformed(0, "missing 'dims' header".into()))?;
    let expected: usize = dims.iter().product();
    if values.len() != expected {
        return Err(malformed(
            line_number,
            format!(
                "expected {expected} voxel values for dims {dims:?}, found {}",
                values.len()
            ),
        ));
    }

    let data = Array3::from_shape_vec((dims[0], dims[1], dims[2]), values)
        .map_err(|err| malformed(0, err.to_string()))?;
    Ok(Volume { data, spacing })
}

pub fn write_volume(path: &Path, volume: &Volume) -> Result<(), VolumeError> {
    let mut sink = create_text_sink(path)?;
    let [nx, ny, nz] = volume.dims();
    writeln!(sink, "dims {nx} {ny} {nz}")?;

    let mut buffer = ryu::Buffer::new();
    let [sx, sy, sz] = volume.spacing;
    writeln!(
        sink,
        "spacing {} {} {}",
        buffer.format(sx),
        ryu::Buffer::new().format(sy),
        ryu::Buffer::new().format(sz)
    )?;

    // One line per (x, y) row keeps files diffable without huge lines.
    let mut line = String::with_capacity(nz * 8);
    for row in volume.data.rows() {
        line.clear();
        for (i, &value) in row.iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            if value == 0.0 {
                line.push('0');
            } else {
                line.push_str(buffer.format(value));
            }
        }
        writeln!(sink, "{line}")?;
    }
    sink.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn volumes_survive_a_gzip_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.txt.gz");
        let data = Array3::from_shape_fn((3, 2, 4), |(x, y, z)| {
            (x * 100 + y * 10 + z) as f64 * 0.25 - 1.0
        });
        let volume = Volume {
            data,
            spacing: [2.0, 2.0, 1.5],
        };
        write_volume(&path, &volume).unwrap();
        let loaded = read_volume(&path).unwrap();
        assert_eq!(loaded, volume);
    }

    #[test]
    fn values_may_span_arbitrary_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lesion.txt");
        std::fs::write(&path, "# lesion\ndims 2 1 2\n1 0\n\n0\n1\n").unwrap();
        let loaded = read_volume(&path).unwrap();
        assert_eq!(loaded.dims(), [2, 1, 2]);
        assert_eq!(loaded.spacing, [1.0; 3]);
        assert_eq!(
            loaded.data.iter().copied().collect::<Vec<_>>(),
            vec![1.0, 0.0, 0.0, 1.0]
        );
    }

    #[test]
    fn wrong_value_count_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.txt");
        std::fs::write(&path, "dims 2 2 1\n1 0 1\n").unwrap();
        match read_volume(&path) {
            Err(VolumeError::Malformed { message, .. }) => {
                assert!(message.contains("expected 4 voxel values"))
            }
            other => panic!("expected malformed volume, got {other:?}"),
        }
    }

    #[test]
    fn values_before_dims_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("headless.txt");
        std::fs::write(&path, "1 0 1\ndims 1 1 3\n").unwrap();
        assert!(matches!(
            read_volume(&path),
            Err(VolumeError::Malformed { line: 1, .. })
        ));
    }
}
