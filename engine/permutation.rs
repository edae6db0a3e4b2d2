//! # Permutation Testing
//!
//! The null distribution of the effect map is built by refitting the
//! regression on label-shuffled behavior scores. Each permutation yields one
//! voxel-length vector (the mean of that model's support vectors).
//!
//! Memory stays bounded regardless of the permutation count: vectors are
//! appended to a binary store as they are produced, and a second pass reads
//! the store back one record at a time to accumulate the first and second
//! moments per voxel.
//!
//! ## Store layout
//!
//! ```text
//! bytes 0..8    magic "SVRNULL1"
//! bytes 8..16   voxel count, u64 little-endian
//! then          one record per permutation: voxel count x f64 little-endian
//! ```
//!
//! In parallel mode, rayon workers fit permutations and send finished
//! vectors through a bounded `crossbeam-channel`; the calling thread is the
//! only writer of the store and the only caller of the progress observer.

use crate::grid_search::Parallelism;
use crate::progress::{AnalysisStage, ProgressObserver, estimate_remaining, format_duration};
use crate::regression::{RegressionError, Regressor, SupportModel};
use crate::types::ParamCombination;
use crossbeam_channel::{Receiver, bounded};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const NULL_STORE_MAGIC: [u8; 8] = *b"SVRNULL1";

/// Added to the null variance before the square root, so a voxel whose null
/// vectors never vary still has a finite, positive standard deviation.
pub const NULL_STD_EPSILON: f64 = 1.0e-8;

const DEFAULT_CHANNEL_CAPACITY: usize = 32;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PermutationError {
    #[error("the number of permutations must be positive")]
    NoPermutations,
    #[error("feature matrix has {rows} rows but {behaviors} behavior scores were given")]
    RowMismatch { rows: usize, behaviors: usize },
    #[error("regression failed in permutation {permutation}: {source}")]
    Regression {
        permutation: usize,
        #[source]
        source: RegressionError,
    },
    #[error("{path} is not a null distribution store")]
    BadMagic { path: String },
    #[error("null distribution store header declares an unusable voxel count {declared}")]
    BadVoxelCount { declared: u64 },
    #[error("null vector has {found} voxels but the store holds {expected}-voxel records")]
    LengthMismatch { expected: usize, found: usize },
    #[error("null distribution store ends inside record {record}")]
    TruncatedRecord { record: usize },
    #[error("null distribution store holds no records")]
    EmptyStore,
    #[error("expected {expected} stored null vectors, found {found}")]
    CountMismatch { expected: usize, found: usize },
    #[error("permutation run was cancelled")]
    Cancelled,
    #[error("the null store writer stopped before all permutations were delivered")]
    WriterClosed,
    #[error("a permutation worker panicked")]
    WorkerPanicked,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn with_path(err: io::Error, action: &str, path: &Path) -> io::Error {
    io::Error::new(
        err.kind(),
        format!("failed to {action} {}: {err}", path.display()),
    )
}

/// Append-only writer of null vectors.
pub struct NullStoreWriter<W: Write> {
    inner: W,
    n_voxels: usize,
    records: usize,
    scratch: Vec<u8>,
}

impl NullStoreWriter<BufWriter<File>> {
    pub fn create(path: &Path, n_voxels: usize) -> Result<Self, PermutationError> {
        let file = File::create(path).map_err(|err| with_path(err, "create", path))?;
        Self::new(BufWriter::new(file), n_voxels)
    }
}

impl<W: Write> NullStoreWriter<W> {
    pub fn new(mut inner: W, n_voxels: usize) -> Result<Self, PermutationError> {
        inner.write_all(&NULL_STORE_MAGIC)?;
        inner.write_all(&(n_voxels as u64).to_le_bytes())?;
        Ok(Self {
            inner,
            n_voxels,
            records: 0,
            scratch: Vec::with_capacity(n_voxels * 8),
        })
    }

    pub fn append(&mut self, vector: ArrayView1<'_, f64>) -> Result<(), PermutationError> {
        if vector.len() != self.n_voxels {
            return Err(PermutationError::LengthMismatch {
                expected: self.n_voxels,
                found: vector.len(),
            });
        }
        self.scratch.clear();
        for value in vector.iter() {
            self.scratch.extend_from_slice(&value.to_le_bytes());
        }
        self.inner.write_all(&self.scratch)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    /// Flushes the store and returns the number of records written.
    pub fn finish(mut self) -> Result<usize, PermutationError> {
        self.inner.flush()?;
        Ok(self.records)
    }
}

/// Sequential reader over a store written by [`NullStoreWriter`].
pub struct NullStoreReader<R: Read> {
    inner: R,
    n_voxels: usize,
    records: usize,
    scratch: Vec<u8>,
}

impl NullStoreReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, PermutationError> {
        let file = File::open(path).map_err(|err| with_path(err, "open", path))?;
        Self::new(BufReader::new(file)).map_err(|err| match err {
            PermutationError::BadMagic { .. } => PermutationError::BadMagic {
                path: path.display().to_string(),
            },
            other => other,
        })
    }
}

impl<R: Read> NullStoreReader<R> {
    pub fn new(mut inner: R) -> Result<Self, PermutationError> {
        let mut header = [0u8; 16];
        if fill(&mut inner, &mut header)? != header.len() || header[..8] != NULL_STORE_MAGIC {
            return Err(PermutationError::BadMagic {
                path: "<stream>".to_string(),
            });
        }
        let mut count = [0u8; 8];
        count.copy_from_slice(&header[8..]);
        let declared = u64::from_le_bytes(count);
        let (n_voxels, record_bytes) = usize::try_from(declared)
            .ok()
            .and_then(|n| Some((n, n.checked_mul(8)?)))
            .ok_or(PermutationError::BadVoxelCount { declared })?;
        Ok(Self {
            inner,
            n_voxels,
            records: 0,
            scratch: vec![0u8; record_bytes],
        })
    }

    pub fn n_voxels(&self) -> usize {
        self.n_voxels
    }

    /// Reads the next record into `out`. Returns `false` at the end of the
    /// store.
    pub fn next_into(&mut self, out: &mut [f64]) -> Result<bool, PermutationError> {
        if out.len() != self.n_voxels {
            return Err(PermutationError::LengthMismatch {
                expected: self.n_voxels,
                found: out.len(),
            });
        }
        let read = fill(&mut self.inner, &mut self.scratch)?;
        if read == 0 {
            return Ok(false);
        }
        if read != self.scratch.len() {
            return Err(PermutationError::TruncatedRecord {
                record: self.records + 1,
            });
        }
        for (value, bytes) in out.iter_mut().zip(self.scratch.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            *value = f64::from_le_bytes(raw);
        }
        self.records += 1;
        Ok(true)
    }
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Per-voxel running sums of the null vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct NullAccumulator {
    sum: Array1<f64>,
    sum_of_squares: Array1<f64>,
    count: usize,
}

/// Voxel-wise mean and standard deviation of the null vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct NullDistribution {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
    pub count: usize,
}

impl NullAccumulator {
    pub fn new(n_voxels: usize) -> Self {
        Self {
            sum: Array1::zeros(n_voxels),
            sum_of_squares: Array1::zeros(n_voxels),
            count: 0,
        }
    }

    pub fn n_voxels(&self) -> usize {
        self.sum.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn update(&mut self, vector: ArrayView1<'_, f64>) -> Result<(), PermutationError> {
        if vector.len() != self.n_voxels() {
            return Err(PermutationError::LengthMismatch {
                expected: self.n_voxels(),
                found: vector.len(),
            });
        }
        ndarray::Zip::from(&mut self.sum)
            .and(&mut self.sum_of_squares)
            .and(&vector)
            .for_each(|sum, squares, &value| {
                *sum += value;
                *squares += value * value;
            });
        self.count += 1;
        Ok(())
    }

    /// Adds another partial accumulator. Sums are associative, so partials
    /// from independent workers may be merged in any order.
    pub fn merge(&mut self, other: &Self) -> Result<(), PermutationError> {
        if other.n_voxels() != self.n_voxels() {
            return Err(PermutationError::LengthMismatch {
                expected: self.n_voxels(),
                found: other.n_voxels(),
            });
        }
        self.sum += &other.sum;
        self.sum_of_squares += &other.sum_of_squares;
        self.count += other.count;
        Ok(())
    }

    /// The second pass: one read over the whole store.
    pub fn from_store<R: Read>(reader: &mut NullStoreReader<R>) -> Result<Self, PermutationError> {
        let mut accumulator = Self::new(reader.n_voxels());
        let mut record = vec![0.0; reader.n_voxels()];
        while reader.next_into(&mut record)? {
            accumulator.update(ArrayView1::from(&record[..]))?;
        }
        Ok(accumulator)
    }

    pub fn finalize(&self) -> Result<NullDistribution, PermutationError> {
        if self.count == 0 {
            return Err(PermutationError::EmptyStore);
        }
        let n = self.count as f64;
        let mean = &self.sum / n;
        let mut std = &self.sum_of_squares / n;
        ndarray::Zip::from(&mut std)
            .and(&mean)
            .for_each(|second_moment, &m| {
                // Cancellation can push the variance a hair below zero.
                let variance = (*second_moment - m * m).max(0.0);
                *second_moment = (variance + NULL_STD_EPSILON).sqrt();
            });
        Ok(NullDistribution {
            mean,
            std,
            count: self.count,
        })
    }
}

#[derive(Clone, Debug)]
pub struct PermutationOutcome {
    pub distribution: NullDistribution,
    pub store_path: PathBuf,
}

/// Refits the regression on shuffled behavior scores `n_permutations` times
/// with fixed hyperparameters.
pub struct PermutationEngine<'a, R: Regressor> {
    regressor: &'a R,
    params: ParamCombination,
    n_permutations: usize,
    parallelism: Parallelism,
    seed: Option<u64>,
    cancel: Option<Arc<AtomicBool>>,
    channel_capacity: usize,
}

impl<'a, R: Regressor> PermutationEngine<'a, R> {
    pub fn new(regressor: &'a R, params: ParamCombination, n_permutations: usize) -> Self {
        Self {
            regressor,
            params,
            n_permutations,
            parallelism: Parallelism::default(),
            seed: None,
            cancel: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Derives every permutation's generator from `seed` and its index
    /// instead of OS entropy, which makes the null distribution reproducible.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// The flag is checked before each permutation starts.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn run(
        &self,
        features: ArrayView2<'_, f64>,
        behaviors: ArrayView1<'_, f64>,
        store_path: &Path,
        observer: &mut dyn ProgressObserver,
    ) -> Result<PermutationOutcome, PermutationError> {
        if self.n_permutations == 0 {
            return Err(PermutationError::NoPermutations);
        }
        if features.nrows() != behaviors.len() {
            return Err(PermutationError::RowMismatch {
                rows: features.nrows(),
                behaviors: behaviors.len(),
            });
        }

        log::info!(
            "Running {} permutations with {} ({})",
            self.n_permutations,
            self.params,
            match self.seed {
                Some(seed) => format!("base seed {seed}"),
                None => "unseeded".to_string(),
            }
        );
        let mut writer = NullStoreWriter::create(store_path, features.ncols())?;
        observer.on_stage_start(AnalysisStage::Permutations, self.n_permutations);
        let started = Instant::now();
        match self.parallelism {
            Parallelism::Sequential => {
                let mut progress = WriteProgress::new(self.n_permutations, started);
                for index in 0..self.n_permutations {
                    let null_vector = self.permute_once(index, features, behaviors)?;
                    writer.append(null_vector.view())?;
                    progress.advance(observer);
                }
            }
            Parallelism::Rayon => self.run_parallel(features, behaviors, &mut writer, observer)?,
        }
        let written = writer.finish()?;
        observer.on_stage_finish(AnalysisStage::Permutations);
        log::info!(
            "Permutations completed in {}. Null distribution saved to {}",
            format_duration(started.elapsed()),
            store_path.display()
        );

        observer.on_stage_start(AnalysisStage::NullAccumulation, 1);
        let mut reader = NullStoreReader::open(store_path)?;
        let accumulator = NullAccumulator::from_store(&mut reader)?;
        if accumulator.count() != written || written != self.n_permutations {
            return Err(PermutationError::CountMismatch {
                expected: self.n_permutations,
                found: accumulator.count(),
            });
        }
        let distribution = accumulator.finalize()?;
        observer.on_stage_advance(AnalysisStage::NullAccumulation, 1);
        observer.on_stage_finish(AnalysisStage::NullAccumulation);

        Ok(PermutationOutcome {
            distribution,
            store_path: store_path.to_path_buf(),
        })
    }

    fn run_parallel<W: Write>(
        &self,
        features: ArrayView2<'_, f64>,
        behaviors: ArrayView1<'_, f64>,
        writer: &mut NullStoreWriter<W>,
        observer: &mut dyn ProgressObserver,
    ) -> Result<(), PermutationError> {
        let (sender, receiver) = bounded::<Array1<f64>>(self.channel_capacity);
        let n_permutations = self.n_permutations;

        std::thread::scope(|scope| -> Result<(), PermutationError> {
            let producer = scope.spawn(move || {
                (0..n_permutations)
                    .into_par_iter()
                    .try_for_each_with(sender, |sender, index| {
                        let null_vector = self.permute_once(index, features, behaviors)?;
                        sender
                            .send(null_vector)
                            .map_err(|_| PermutationError::WriterClosed)
                    })
            });

            let written = drain_into_store(receiver, writer, observer, n_permutations);
            let produced = producer
                .join()
                .map_err(|_| PermutationError::WorkerPanicked)?;
            // A writer failure makes the producers see a closed channel, so
            // the writer's error is the one worth reporting.
            written?;
            produced
        })
    }

    fn permute_once(
        &self,
        index: usize,
        features: ArrayView2<'_, f64>,
        behaviors: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, PermutationError> {
        if let Some(cancel) = &self.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(PermutationError::Cancelled);
            }
        }

        let mut rng = match self.seed {
            Some(base) => StdRng::seed_from_u64(base.wrapping_add(index as u64)),
            None => StdRng::from_entropy(),
        };
        let mut shuffled = behaviors.to_vec();
        shuffled.shuffle(&mut rng);

        let regression_error = |source| PermutationError::Regression {
            permutation: index + 1,
            source,
        };
        let model = self
            .regressor
            .fit(&self.params, features, ArrayView1::from(&shuffled[..]))
            .map_err(regression_error)?;
        let null_vector = model.support_vector_mean().map_err(regression_error)?;
        log::debug!(
            "Permutation {}: {} support vectors",
            index + 1,
            model.n_support()
        );
        Ok(null_vector)
    }
}

fn drain_into_store<W: Write>(
    receiver: Receiver<Array1<f64>>,
    writer: &mut NullStoreWriter<W>,
    observer: &mut dyn ProgressObserver,
    total: usize,
) -> Result<(), PermutationError> {
    let mut progress = WriteProgress::new(total, Instant::now());
    for null_vector in receiver.iter() {
        writer.append(null_vector.view())?;
        progress.advance(observer);
    }
    Ok(())
}

struct WriteProgress {
    total: usize,
    completed: usize,
    started: Instant,
    last_log: Instant,
}

impl WriteProgress {
    fn new(total: usize, started: Instant) -> Self {
        Self {
            total,
            completed: 0,
            started,
            last_log: started,
        }
    }

    fn advance(&mut self, observer: &mut dyn ProgressObserver) {
        self.completed += 1;
        observer.on_stage_advance(AnalysisStage::Permutations, self.completed);
        if self.last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
            self.last_log = Instant::now();
            let elapsed = self.started.elapsed();
            log::info!(
                "Permutation {}/{}: elapsed {}, eta {}",
                self.completed,
                self.total,
                format_duration(elapsed),
                format_duration(estimate_remaining(elapsed, self.completed, self.total))
            );
        }
    }
}
