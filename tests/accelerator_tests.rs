mod common;

use std::sync::atomic::Ordering;

use common::assertions::{assert_engine_error, assert_invalid};
use common::doubles::{BrokenBackend, CountingIndex, FailingBackend};
use common::vectors::{clustered_vectors, ids, random_vectors};

use quiver::accelerator::AcceleratorManager;
use quiver::index::reference::{EmulatedDevices, ReferenceEngine};
use quiver::index::FloatIndex;
use quiver::types::MetricType;

const DIM: usize = 16;

fn host_ivf() -> (FloatIndex, Vec<f32>) {
    let engine = ReferenceEngine::default();
    let (data, _) = clustered_vectors(4, 25, DIM, 0.5);
    let mut index = FloatIndex::create(&engine, DIM, "IVF4,Flat", MetricType::L2).unwrap();
    index.train(&data).unwrap();
    index.add_with_ids(&data, &ids(1000, 100)).unwrap();
    index.set_nprobe(2);
    (index, data)
}

// ─── Device discovery tests ───

#[test]
fn test_emulated_device_count_and_memory() {
    let manager = AcceleratorManager::new(Box::new(EmulatedDevices::new(2, 1 << 20)));
    assert_eq!(manager.device_count(), 2);

    let memory = manager.free_memory(1).unwrap();
    assert_eq!(memory.total, 1 << 20);
    assert!(memory.free <= memory.total);

    assert_invalid(manager.free_memory(2));
}

#[test]
fn test_enumeration_failure_means_no_devices() {
    let manager = AcceleratorManager::new(Box::new(BrokenBackend));
    assert_eq!(manager.device_count(), 0);

    let (index, _) = host_ivf();
    assert_invalid(manager.transfer_to_device(&index, 0));
}

#[test]
fn test_free_memory_tracks_resident_indexes() {
    let manager = AcceleratorManager::new(Box::new(EmulatedDevices::new(2, 1 << 20)));
    let (host, _) = host_ivf();
    let footprint = host.size() as u64;
    assert!(footprint > 0);

    let mut on_device = manager.transfer_to_device(&host, 0).unwrap();
    assert_eq!(manager.free_memory(0).unwrap().free, (1 << 20) - footprint);
    assert_eq!(manager.free_memory(1).unwrap().free, 1 << 20);

    on_device.release();
    assert_eq!(manager.free_memory(0).unwrap().free, 1 << 20);
}

#[test]
fn test_resident_indexes_share_device_budget() {
    let (host, _) = host_ivf();
    let footprint = host.size() as u64;
    let manager = AcceleratorManager::new(Box::new(EmulatedDevices::new(1, footprint * 3 / 2)));

    let first = manager.transfer_to_device(&host, 0).unwrap();
    assert_engine_error(manager.transfer_to_device(&host, 0), "out of device memory");

    drop(first);
    let second = manager.transfer_to_device(&host, 0).unwrap();
    assert_eq!(second.index().unwrap().ntotal(), 100);
    assert_eq!(manager.free_memory(0).unwrap().free, footprint * 3 / 2 - footprint);
}

// ─── Transfer tests ───

#[test]
fn test_round_trip_preserves_index() {
    let devices = EmulatedDevices::new(1, 1 << 24);
    let live = devices.live_counter();
    let manager = AcceleratorManager::new(Box::new(devices));
    let (host, data) = host_ivf();

    let mut on_device = manager.transfer_to_device(&host, 0).unwrap();
    assert_eq!(on_device.device(), 0);
    assert_eq!(live.load(Ordering::SeqCst), 1);

    let device_index = on_device.index().unwrap();
    assert_eq!(device_index.ntotal(), host.ntotal());
    assert_eq!(device_index.d(), DIM);
    assert_eq!(device_index.nprobe(), 2);

    let query = &data[..4 * DIM];
    let expected = host.search(query, 5).unwrap();
    assert_eq!(device_index.search(query, 5).unwrap(), expected);

    let back = manager.transfer_to_host(&on_device).unwrap();
    assert_eq!(back.ntotal(), host.ntotal());
    assert_eq!(back.search(query, 5).unwrap(), expected);

    // host index is still usable after the round trip
    assert_eq!(host.ntotal(), 100);

    on_device.release();
    assert!(on_device.is_released());
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_device_index_search_through_filters() {
    let manager = AcceleratorManager::new(Box::new(EmulatedDevices::new(1, 1 << 24)));
    let (host, data) = host_ivf();
    let on_device = manager.transfer_to_device(&host, 0).unwrap();

    let result = on_device
        .index()
        .unwrap()
        .search_with_ids(&data[..DIM], 2, &[1000, 1001], None)
        .unwrap();
    assert_eq!(result.labels, vec![1000, 1001]);
}

#[test]
fn test_transfer_rejects_unknown_device() {
    let devices = EmulatedDevices::new(1, 1 << 24);
    let live = devices.live_counter();
    let manager = AcceleratorManager::new(Box::new(devices));
    let (host, _) = host_ivf();

    assert_invalid(manager.transfer_to_device(&host, 1));
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_transfer_rejects_released_host_index() {
    let manager = AcceleratorManager::new(Box::new(EmulatedDevices::new(1, 1 << 24)));
    let (mut host, _) = host_ivf();
    host.release();
    assert_invalid(manager.transfer_to_device(&host, 0));
}

#[test]
fn test_out_of_memory_releases_resources() {
    let devices = EmulatedDevices::new(1, 64);
    let live = devices.live_counter();
    let manager = AcceleratorManager::new(Box::new(devices));
    let (host, _) = host_ivf();

    assert_engine_error(manager.transfer_to_device(&host, 0), "out of device memory");
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failed_transfer_releases_resources() {
    let (backend, live) = FailingBackend::new(2);
    let manager = AcceleratorManager::new(Box::new(backend));
    let (host, _) = host_ivf();

    for device in 0..2 {
        assert_engine_error(manager.transfer_to_device(&host, device), "out of device memory");
    }
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_emulated_devices_refuse_foreign_indexes() {
    let manager = AcceleratorManager::new(Box::new(EmulatedDevices::new(1, 1 << 24)));
    let (mut wrapped, _) = CountingIndex::build(DIM, "IVF4,Flat");
    wrapped.train(&random_vectors(64, DIM)).unwrap();

    assert_engine_error(manager.transfer_to_device(&wrapped, 0), "cannot be placed");
}

// ─── Release tests ───

#[test]
fn test_device_index_release_is_idempotent() {
    let devices = EmulatedDevices::new(1, 1 << 24);
    let live = devices.live_counter();
    let manager = AcceleratorManager::new(Box::new(devices));
    let (host, _) = host_ivf();

    let mut on_device = manager.transfer_to_device(&host, 0).unwrap();
    on_device.release();
    on_device.release();
    assert!(on_device.index().is_none());
    assert_eq!(live.load(Ordering::SeqCst), 0);

    assert_invalid(manager.transfer_to_host(&on_device));
}

#[test]
fn test_dropping_device_index_frees_resources() {
    let devices = EmulatedDevices::new(2, 1 << 24);
    let live = devices.live_counter();
    let manager = AcceleratorManager::new(Box::new(devices));
    let (host, _) = host_ivf();

    {
        let _a = manager.transfer_to_device(&host, 0).unwrap();
        let _b = manager.transfer_to_device(&host, 1).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 2);
    }
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_host_transfer_failure_keeps_device_copy() {
    let manager = AcceleratorManager::new(Box::new(EmulatedDevices::new(1, 1 << 24)));
    let (host, _) = host_ivf();
    let on_device = manager.transfer_to_device(&host, 0).unwrap();

    let (failing, _) = FailingBackend::new(1);
    let other = AcceleratorManager::new(Box::new(failing));
    assert_engine_error(other.transfer_to_host(&on_device), "device unreachable");
    assert!(!on_device.is_released());
    assert_eq!(on_device.index().unwrap().ntotal(), 100);
}

#[test]
fn test_concurrent_transfers_to_one_device() {
    let devices = EmulatedDevices::new(1, 1 << 24);
    let live = devices.live_counter();
    let manager = AcceleratorManager::new(Box::new(devices));
    let (host, _) = host_ivf();

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| manager.transfer_to_device(&host, 0).map(|d| d.index().map(|i| i.ntotal()))))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), Some(100));
        }
    });
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_transfers_are_counted() {
    quiver::metrics::init();
    let manager = AcceleratorManager::new(Box::new(EmulatedDevices::new(1, 1 << 24)));
    let (host, _) = host_ivf();
    let on_device = manager.transfer_to_device(&host, 0).unwrap();
    manager.transfer_to_host(&on_device).unwrap();

    let text = quiver::metrics::gather_text();
    assert!(text.contains("quiver_device_transfers_total"));
    assert!(text.contains(r#"direction="to_host""#));
}
