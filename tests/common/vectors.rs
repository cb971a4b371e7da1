use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `n` random vectors of dimension `dims`, flattened, uniform in [-1, 1].
pub fn random_vectors(n: usize, dims: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n * dims).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Vectors clustered around `n_clusters` random centers, flattened.
/// Returns (vectors, centers). Vector `i` belongs to cluster `i / n_per_cluster`.
pub fn clustered_vectors(
    n_clusters: usize,
    n_per_cluster: usize,
    dims: usize,
    noise: f32,
) -> (Vec<f32>, Vec<f32>) {
    let mut rng = StdRng::seed_from_u64(123);

    let centers: Vec<f32> = (0..n_clusters * dims)
        .map(|_| rng.gen_range(-10.0..10.0))
        .collect();

    let mut vectors = Vec::with_capacity(n_clusters * n_per_cluster * dims);
    for center in centers.chunks_exact(dims) {
        for _ in 0..n_per_cluster {
            vectors.extend(center.iter().map(|&c| c + rng.gen_range(-noise..noise)));
        }
    }

    (vectors, centers)
}

/// `n` random packed binary codes of `dims` bits each.
pub fn random_binary(n: usize, dims: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..n * dims / 8).map(|_| rng.gen()).collect()
}

/// Sequential identifiers starting at `start`.
pub fn ids(start: i64, n: usize) -> Vec<i64> {
    (start..start + n as i64).collect()
}

/// The three-vector fixture: `[1,0,0,0]`, `[0,1,0,0]`, `[10,10,10,10]`.
pub fn three_vectors() -> Vec<f32> {
    vec![
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        10.0, 10.0, 10.0, 10.0,
    ]
}
