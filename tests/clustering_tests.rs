mod common;

use assert_approx_eq::assert_approx_eq;

use common::assertions::{assert_engine_error, assert_invalid};
use common::doubles::CountingIndex;
use common::vectors::{clustered_vectors, random_vectors};

use quiver::clustering::{kmeans_clustering, run_kmeans_advanced, Clustering, ClusteringParameters};
use quiver::index::distance::l2_squared;
use quiver::index::reference::ReferenceEngine;
use quiver::index::FloatIndex;
use quiver::types::MetricType;

const DIM: usize = 8;

fn params(niter: usize, nredo: usize) -> ClusteringParameters {
    ClusteringParameters {
        niter,
        nredo,
        min_points_per_centroid: 1,
        ..Default::default()
    }
}

// ─── Single-shot tests ───

#[test]
fn test_kmeans_clustering_finds_separated_clusters() {
    let engine = ReferenceEngine::default();
    let (data, centers) = clustered_vectors(4, 100, DIM, 0.5);

    let (centroids, mean_error) = kmeans_clustering(&engine, DIM, 400, 4, &data).unwrap();
    assert_eq!(centroids.len(), 4 * DIM);
    assert!(mean_error >= 0.0);
    // uniform noise in [-0.5, 0.5] has variance 1/12 per coordinate
    assert!(mean_error < 1.0, "mean error {mean_error} too large");

    for center in centers.chunks_exact(DIM) {
        let closest = centroids
            .chunks_exact(DIM)
            .map(|c| l2_squared(c, center))
            .fold(f32::INFINITY, f32::min);
        assert!(closest < 0.5, "no centroid near {center:?}");
    }
}

#[test]
fn test_kmeans_clustering_is_deterministic() {
    let engine = ReferenceEngine::default();
    let data = random_vectors(200, DIM);
    let first = kmeans_clustering(&engine, DIM, 200, 5, &data).unwrap();
    let second = kmeans_clustering(&engine, DIM, 200, 5, &data).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_kmeans_clustering_validation() {
    let engine = ReferenceEngine::default();
    let data = random_vectors(10, DIM);

    assert_invalid(kmeans_clustering(&engine, DIM, 11, 2, &data));
    assert_invalid(kmeans_clustering(&engine, DIM, 10, 0, &data));
    assert_engine_error(
        kmeans_clustering(&engine, DIM, 10, 20, &data),
        "Number of training points",
    );
}

// ─── Orchestrated training tests ───

#[test]
fn test_parameter_defaults() {
    let p = ClusteringParameters::default();
    assert_eq!(p.niter, 25);
    assert_eq!(p.nredo, 1);
    assert_eq!(p.min_points_per_centroid, 39);
    assert_eq!(p.max_points_per_centroid, 256);
    assert_eq!(p.seed, 1234);
    assert!(!p.spherical && !p.int_centroids && !p.frozen_centroids && !p.update_index);

    let partial: ClusteringParameters = serde_json::from_str(r#"{"niter": 5, "spherical": true}"#).unwrap();
    assert_eq!(partial.niter, 5);
    assert!(partial.spherical);
    assert_eq!(partial.max_points_per_centroid, 256);
}

#[test]
fn test_construction_validation() {
    assert_invalid(Clustering::new(0, 4));
    assert_invalid(Clustering::new(DIM, 0));

    let mut clustering = Clustering::new(DIM, 2).unwrap();
    assert_invalid(clustering.set_centroids(&[0.0; DIM + 1]));
    assert_invalid(clustering.set_centroids(&[0.0; 3 * DIM]));
    assert!(clustering.centroids().is_empty());
    assert!(clustering.mean_error().is_none());
}

#[test]
fn test_train_validation() {
    let mut clustering = Clustering::with_params(DIM, 20, params(5, 1)).unwrap();
    assert_invalid(clustering.train(&random_vectors(10, DIM), None));
    assert_invalid(clustering.train(&[0.0; DIM + 3], None));
    assert_invalid(clustering.train(&[], None));

    let frozen = ClusteringParameters {
        frozen_centroids: true,
        ..params(5, 1)
    };
    let mut clustering = Clustering::with_params(DIM, 2, frozen).unwrap();
    assert_invalid(clustering.train(&random_vectors(50, DIM), None));
}

#[test]
fn test_train_records_stats_per_iteration() {
    let (data, _) = clustered_vectors(4, 50, DIM, 0.5);
    let mut clustering = Clustering::with_params(DIM, 4, params(6, 3)).unwrap();
    clustering.train(&data, None).unwrap();

    assert_eq!(clustering.centroids().len(), 4 * DIM);
    assert_eq!(clustering.iteration_stats().len(), 18);
    for stats in clustering.iteration_stats() {
        assert!(stats.obj >= 0.0);
        assert!(stats.imbalance_factor >= 1.0 - 1e-9);
    }

    // the kept run is the restart whose final objective is lowest
    let best_final = clustering
        .iteration_stats()
        .chunks(6)
        .map(|run| run[5].obj)
        .fold(f32::INFINITY, f32::min);
    assert_approx_eq!(clustering.mean_error().unwrap(), best_final / 200.0, 1e-5);
}

#[test]
fn test_restarts_never_worse_than_single_run() {
    let data = random_vectors(300, DIM);

    let mut single = Clustering::with_params(DIM, 6, params(10, 1)).unwrap();
    single.train(&data, None).unwrap();
    let mut multi = Clustering::with_params(DIM, 6, params(10, 4)).unwrap();
    multi.train(&data, None).unwrap();

    // restart 0 of `multi` reproduces `single`
    assert!(multi.mean_error().unwrap() <= single.mean_error().unwrap());
}

#[test]
fn test_frozen_centroids_stay_fixed() {
    let (data, _) = clustered_vectors(4, 50, DIM, 0.5);
    let seeds: Vec<f32> = (0..2 * DIM).map(|i| i as f32 * 0.1).collect();

    let frozen = ClusteringParameters {
        frozen_centroids: true,
        ..params(8, 1)
    };
    let clustering = run_kmeans_advanced(DIM, 4, frozen, &data, Some(&seeds), None).unwrap();
    assert_eq!(&clustering.centroids()[..2 * DIM], seeds.as_slice());
    assert_eq!(clustering.centroids().len(), 4 * DIM);
}

#[test]
fn test_seeded_centroids_are_refined_when_not_frozen() {
    let (data, centers) = clustered_vectors(2, 100, DIM, 0.5);
    let seeds: Vec<f32> = centers.iter().map(|c| c + 1.0).collect();

    let clustering = run_kmeans_advanced(DIM, 2, params(10, 1), &data, Some(&seeds), None).unwrap();
    for (centroid, center) in clustering.centroids().chunks_exact(DIM).zip(centers.chunks_exact(DIM)) {
        assert!(l2_squared(centroid, center) < 0.5);
    }
}

#[test]
fn test_int_centroids_are_rounded() {
    let (data, _) = clustered_vectors(3, 40, DIM, 0.5);
    let int = ClusteringParameters {
        int_centroids: true,
        ..params(5, 1)
    };
    let clustering = run_kmeans_advanced(DIM, 3, int, &data, None, None).unwrap();
    assert!(clustering.centroids().iter().all(|v| v.fract() == 0.0));
}

#[test]
fn test_spherical_centroids_have_unit_norm() {
    let data = random_vectors(200, DIM);
    let spherical = ClusteringParameters {
        spherical: true,
        ..params(5, 1)
    };
    let clustering = run_kmeans_advanced(DIM, 4, spherical, &data, None, None).unwrap();
    for c in clustering.centroids().chunks_exact(DIM) {
        let norm = c.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert_approx_eq!(norm, 1.0, 1e-4);
    }
}

#[test]
fn test_training_is_subsampled() {
    let data = random_vectors(500, DIM);
    let capped = ClusteringParameters {
        max_points_per_centroid: 10,
        ..params(3, 1)
    };
    let mut clustering = Clustering::with_params(DIM, 4, capped).unwrap();
    clustering.train(&data, None).unwrap();

    let last = clustering.iteration_stats().last().unwrap();
    // mean error is taken over the 40 sampled points
    assert_approx_eq!(clustering.mean_error().unwrap(), last.obj / 40.0, 1e-5);
}

#[test]
fn test_huge_point_limits_do_not_overflow() {
    let data = random_vectors(100, DIM);
    let unbounded = ClusteringParameters {
        min_points_per_centroid: usize::MAX,
        max_points_per_centroid: usize::MAX,
        decode_block_size: usize::MAX,
        ..params(2, 1)
    };

    let mut clustering = Clustering::with_params(DIM, 4, unbounded.clone()).unwrap();
    clustering.train(&data, None).unwrap();
    let last = clustering.iteration_stats().last().unwrap();
    // nothing was sampled away
    assert_approx_eq!(clustering.mean_error().unwrap(), last.obj / 100.0, 1e-5);

    let engine = ReferenceEngine::default();
    let mut index = FloatIndex::create(&engine, DIM, "Flat", MetricType::L2).unwrap();
    run_kmeans_advanced(DIM, 4, unbounded, &data, None, Some(&mut index)).unwrap();
    assert_eq!(index.ntotal(), 4);
}

// ─── Accelerating index tests ───

#[test]
fn test_accelerating_index_holds_final_centroids() {
    let engine = ReferenceEngine::default();
    let (data, _) = clustered_vectors(4, 50, DIM, 0.5);
    let mut index = FloatIndex::create(&engine, DIM, "Flat", MetricType::L2).unwrap();

    let accelerated = run_kmeans_advanced(DIM, 4, params(6, 1), &data, None, Some(&mut index)).unwrap();
    let plain = run_kmeans_advanced(DIM, 4, params(6, 1), &data, None, None).unwrap();

    assert_eq!(index.ntotal(), 4);
    assert_approx_eq!(accelerated.mean_error().unwrap(), plain.mean_error().unwrap(), 1e-3);

    let stored = index.reconstruct_batch(&[0, 1, 2, 3]).unwrap();
    assert_eq!(stored, accelerated.centroids());
}

#[test]
fn test_accelerating_ivf_retrained_with_update_index() {
    let engine = ReferenceEngine::default();
    let (data, _) = clustered_vectors(4, 50, DIM, 0.5);
    let mut index = FloatIndex::create(&engine, DIM, "IVF2,Flat", MetricType::L2).unwrap();

    let update = ClusteringParameters {
        update_index: true,
        ..params(4, 1)
    };
    let clustering = run_kmeans_advanced(DIM, 4, update, &data, None, Some(&mut index)).unwrap();
    assert_eq!(clustering.iteration_stats().len(), 4);
    assert!(index.is_trained());
    assert_eq!(index.ntotal(), 4);
}

#[test]
fn test_assignment_searches_in_blocks() {
    let (data, _) = clustered_vectors(4, 50, DIM, 0.5);
    let blocked = ClusteringParameters {
        decode_block_size: 64,
        ..params(2, 1)
    };

    let (mut index, log) = CountingIndex::build(DIM, "Flat");
    let clustering = run_kmeans_advanced(DIM, 4, blocked, &data, None, Some(&mut index)).unwrap();
    // 200 points in blocks of 64 take four searches per iteration
    assert_eq!(log.lock().nprobes.len(), 8);

    let engine = ReferenceEngine::default();
    let mut whole = FloatIndex::create(&engine, DIM, "Flat", MetricType::L2).unwrap();
    let reference = run_kmeans_advanced(DIM, 4, params(2, 1), &data, None, Some(&mut whole)).unwrap();
    assert_eq!(clustering.centroids(), reference.centroids());
    assert_approx_eq!(clustering.mean_error().unwrap(), reference.mean_error().unwrap(), 1e-5);
}

#[test]
fn test_accelerating_index_dimension_checked() {
    let engine = ReferenceEngine::default();
    let mut index = FloatIndex::create(&engine, 4, "Flat", MetricType::L2).unwrap();
    let data = random_vectors(50, DIM);
    assert_invalid(run_kmeans_advanced(DIM, 2, params(3, 1), &data, None, Some(&mut index)));
}
