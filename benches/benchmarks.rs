use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{Array, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use pathway_pca::prcomp::{prcomp, PrcompOptions};
use pathway_pca::{RotationCache, SingularValueDecomposition, SvdBackendKind, SvdFactory};

// (n_features, n_samples), pathway-sized
const SHAPES: [(usize, usize); 3] = [(20, 100), (100, 100), (200, 60)];

fn generate_data(n_features: usize, n_samples: usize) -> Array2<f64> {
    Array::random((n_features, n_samples), Uniform::new(0., 10.))
}

fn bench_svd_backends(c: &mut Criterion) {
    let factory = SvdFactory::new();
    let mut group = c.benchmark_group("SVD_full");

    for &(n_features, n_samples) in SHAPES.iter() {
        let data = generate_data(n_features, n_samples);
        group.throughput(Throughput::Elements((n_features * n_samples) as u64));
        for kind in [SvdBackendKind::Lapack, SvdBackendKind::Jacobi, SvdBackendKind::Randomized] {
            let backend = factory.create(kind).unwrap();
            group.bench_with_input(
                BenchmarkId::new(kind.name(), format!("{}x{}", n_features, n_samples)),
                &data,
                |b, matrix| b.iter(|| backend.svd(matrix.view()).unwrap()),
            );
        }
    }
    group.finish();
}

fn bench_top_k(c: &mut Criterion) {
    let backend = SvdFactory::new().create(SvdBackendKind::Randomized).unwrap();
    let mut group = c.benchmark_group("SVD_top_k");

    for &(n_features, n_samples) in [(500, 200), (200, 1000)].iter() {
        let data = generate_data(n_features, n_samples);
        group.throughput(Throughput::Elements((n_features * n_samples) as u64));
        group.bench_with_input(
            BenchmarkId::new("randomized_k10", format!("{}x{}", n_features, n_samples)),
            &data,
            |b, matrix| b.iter(|| backend.svd_top_k(matrix.view(), 10).unwrap()),
        );
    }
    group.finish();
}

fn bench_prcomp(c: &mut Criterion) {
    let mut group = c.benchmark_group("prcomp");
    let options = PrcompOptions { tol: Some(0.05), ..PrcompOptions::default() };

    for &(n_features, n_samples) in SHAPES.iter() {
        // prcomp takes samples x features
        let data = generate_data(n_samples, n_features);
        group.throughput(Throughput::Elements((n_features * n_samples) as u64));
        group.bench_with_input(
            BenchmarkId::new("embedded", format!("{}x{}", n_features, n_samples)),
            &data,
            |b, matrix| b.iter(|| prcomp(matrix.view(), &options).unwrap()),
        );
    }
    group.finish();
}

fn bench_rotation_cache(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let cache = RotationCache::open(dir.path(), 0).unwrap();
    let n_features = 200;
    let ids: Vec<String> = (0..n_features).map(|i| format!("probe_{}", i)).collect();
    let rotation = generate_data(10, n_features);
    cache.save_rotation_matrix("bench", "stored", &ids, &rotation).unwrap();

    let mut group = c.benchmark_group("rotation_cache");
    group.bench_function("save_delete_10x200", |b| {
        b.iter(|| {
            cache.save_rotation_matrix("bench", "churn", &ids, &rotation).unwrap();
            cache.delete_rotation("bench", "churn").unwrap();
        })
    });
    group.bench_function("load_10x200", |b| {
        b.iter(|| {
            let mut row_ids = Vec::with_capacity(n_features);
            cache.get_rotation_matrix("bench", "stored", &mut row_ids).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_svd_backends, bench_top_k, bench_prcomp, bench_rotation_cache);
criterion_main!(benches);
