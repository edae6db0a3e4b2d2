use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array2, Axis};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;
use svrlsm::permutation::{NullAccumulator, NullStoreReader, NullStoreWriter};

const VOXELS: usize = 20_000;

fn random_null_vectors(permutations: usize) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(0x5EED_0000 + permutations as u64);
    Array2::from_shape_fn((permutations, VOXELS), |_| rng.sample(Standard))
}

fn encode_store(vectors: &Array2<f64>) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut writer = NullStoreWriter::new(&mut bytes, VOXELS).unwrap();
    for row in vectors.rows() {
        writer.append(row).unwrap();
    }
    assert_eq!(writer.finish().unwrap(), vectors.nrows());
    bytes
}

fn streaming_moments(store: &[u8]) -> f64 {
    let mut reader = NullStoreReader::new(Cursor::new(store)).unwrap();
    let accumulator = NullAccumulator::from_store(&mut reader).unwrap();
    let distribution = accumulator.finalize().unwrap();
    distribution.mean.sum() + distribution.std.sum()
}

fn batch_moments(vectors: &Array2<f64>) -> f64 {
    let mean = vectors.mean_axis(Axis(0)).unwrap();
    let std = vectors.std_axis(Axis(0), 0.0);
    mean.sum() + std.sum()
}

fn benchmark_null_moments(c: &mut Criterion) {
    let mut group = c.benchmark_group("null_moments");
    group.sample_size(20);
    for permutations in [50_usize, 200] {
        let vectors = random_null_vectors(permutations);
        let store = encode_store(&vectors);
        group.throughput(Throughput::Elements((permutations * VOXELS) as u64));

        group.bench_with_input(
            BenchmarkId::new("streaming", permutations),
            &store,
            |b, input| {
                b.iter(|| black_box(streaming_moments(black_box(input))));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("batch", permutations),
            &vectors,
            |b, input| {
                b.iter(|| black_box(batch_moments(black_box(input))));
            },
        );
    }
    group.finish();
}

criterion_group!(null_moments, benchmark_null_moments);
criterion_main!(null_moments);
