use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use quiver::accelerator::AcceleratorManager;
use quiver::clustering::{kmeans_clustering, run_kmeans_advanced};
use quiver::config::Config;
use quiver::error::Result;
use quiver::index::reference::{EmulatedDevices, ReferenceEngine};
use quiver::index::FloatIndex;
use quiver::metrics;
use quiver::types::MetricType;

const DIM: usize = 32;
const CLUSTERS: usize = 8;
const PER_CLUSTER: usize = 250;

fn main() {
    // Load .env
    let _ = dotenvy::dotenv();

    let config = match Config::load(None) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(2);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
        }
    }

    metrics::init();
    tracing::info!("quiver demo starting");

    if let Err(e) = run(&config) {
        tracing::error!(error = %e, "demo failed");
        std::process::exit(1);
    }
}

/// Points scattered around `CLUSTERS` random centers.
fn clustered_data(rng: &mut StdRng) -> Vec<f32> {
    let centers: Vec<f32> = (0..CLUSTERS * DIM).map(|_| rng.gen_range(0.0..100.0)).collect();
    let mut data = Vec::with_capacity(CLUSTERS * PER_CLUSTER * DIM);
    for c in 0..CLUSTERS {
        for _ in 0..PER_CLUSTER {
            for j in 0..DIM {
                data.push(centers[c * DIM + j] + rng.gen_range(-5.0..5.0));
            }
        }
    }
    data
}

fn run(config: &Config) -> Result<()> {
    let engine = ReferenceEngine::new(config.clustering.niter, config.clustering.seed);
    let mut rng = StdRng::seed_from_u64(123456);
    let data = clustered_data(&mut rng);
    let n = data.len() / DIM;

    let (_, mean_err) = kmeans_clustering(&engine, DIM, n, CLUSTERS, &data)?;
    tracing::info!(mean_err, "single-shot k-means");

    let mut accel = FloatIndex::create(&engine, DIM, "Flat", MetricType::L2)?;
    let clustering = run_kmeans_advanced(DIM, CLUSTERS, config.clustering.clone(), &data, None, Some(&mut accel))?;
    tracing::info!(
        mean_err = clustering.mean_error().unwrap_or_default(),
        iterations = clustering.iteration_stats().len(),
        "orchestrated k-means"
    );

    let description = format!("IVF{CLUSTERS},Flat");
    let mut index = FloatIndex::create(&engine, DIM, &description, MetricType::L2)?;
    index.train(&data)?;
    let ids: Vec<i64> = (0..n as i64).collect();
    index.add_with_ids(&data, &ids)?;
    index.set_nprobe(config.search.nprobe);

    let query = &data[..DIM];
    let k = config.search.default_k;
    let overrides = config.default_override();

    let hits = index.search_without_ids(query, k, &[0], overrides.as_ref())?;
    tracing::info!(labels = ?hits.labels, "search excluding the query itself");

    let candidates: Vec<i64> = (0..CLUSTERS as i64).collect();
    let (eligible, distances) = index.centroid_distances(query, &candidates)?;
    let include: Vec<i64> = ids.iter().copied().filter(|id| id % 2 == 0).collect();
    let hits = index.search_specified_clusters(&include, &eligible, 2, k, query, &distances, overrides.as_ref())?;
    tracing::info!(labels = ?hits.labels, clusters = ?&eligible[..2.min(eligible.len())], "cluster-restricted search");

    let backend = EmulatedDevices::new(config.accelerator.emulated_devices, config.accelerator.memory_per_device);
    let manager = AcceleratorManager::new(Box::new(backend));
    if manager.device_count() > 0 {
        let mut on_device = manager.transfer_to_device(&index, 0)?;
        let back = manager.transfer_to_host(&on_device)?;
        on_device.release();
        tracing::info!(ntotal = back.ntotal(), "device round trip");
    } else {
        tracing::info!("no accelerator devices configured, skipping transfer");
    }

    index.release();
    tracing::info!("quiver demo finished");
    Ok(())
}
