//! In-process stand-in for accelerator hardware.
//!
//! Each emulated device has a fixed memory budget. Transfers clone the
//! reference index, tag the copy with its device and charge its footprint to
//! the resources that placed it; dropping those resources gives the memory
//! back. Live resource handles are counted so callers can confirm nothing
//! leaks.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::accelerator::{AcceleratorBackend, DeviceMemory, DeviceResources};
use crate::index::traits::{EngineFailure, EngineResult, NativeIndex};

use super::ReferenceIndex;

#[derive(Debug)]
pub struct EmulatedDevices {
    count: usize,
    memory_per_device: u64,
    live: Arc<AtomicUsize>,
    /// Bytes in use on each device.
    used: Arc<[AtomicU64]>,
}

impl EmulatedDevices {
    pub fn new(count: usize, memory_per_device: u64) -> Self {
        Self {
            count,
            memory_per_device,
            live: Arc::new(AtomicUsize::new(0)),
            used: (0..count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Resource handles currently allocated and not yet dropped.
    pub fn live_resources(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Shared handle on the live-resource counter, usable after the backend
    /// has been moved into a manager.
    pub fn live_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live)
    }

    fn check(&self, device: usize) -> EngineResult<()> {
        if device >= self.count {
            return Err(EngineFailure::new(format!("no such device: {device}")));
        }
        Ok(())
    }
}

struct EmulatedResources {
    device: usize,
    live: Arc<AtomicUsize>,
    used: Arc<[AtomicU64]>,
    /// Bytes charged to `device` by indexes placed through these resources.
    reserved: AtomicU64,
}

impl DeviceResources for EmulatedResources {
    fn device(&self) -> usize {
        self.device
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for EmulatedResources {
    fn drop(&mut self) {
        let reserved = self.reserved.load(Ordering::SeqCst);
        self.used[self.device].fetch_sub(reserved, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn downcast(index: &dyn NativeIndex<f32>) -> EngineResult<&ReferenceIndex<f32>> {
    index
        .as_any()
        .downcast_ref::<ReferenceIndex<f32>>()
        .ok_or_else(|| EngineFailure::new("index type cannot be placed on an emulated device"))
}

impl AcceleratorBackend for EmulatedDevices {
    fn device_count(&self) -> EngineResult<usize> {
        Ok(self.count)
    }

    fn memory(&self, device: usize) -> EngineResult<DeviceMemory> {
        self.check(device)?;
        let used = self.used[device].load(Ordering::SeqCst);
        Ok(DeviceMemory {
            free: self.memory_per_device.saturating_sub(used),
            total: self.memory_per_device,
        })
    }

    fn create_resources(&self, device: usize) -> EngineResult<Box<dyn DeviceResources>> {
        self.check(device)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(EmulatedResources {
            device,
            live: Arc::clone(&self.live),
            used: Arc::clone(&self.used),
            reserved: AtomicU64::new(0),
        }))
    }

    fn index_to_device(
        &self,
        resources: &dyn DeviceResources,
        index: &dyn NativeIndex<f32>,
    ) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        let resources = resources
            .as_any()
            .downcast_ref::<EmulatedResources>()
            .ok_or_else(|| EngineFailure::new("resources were not allocated by the emulated backend"))?;
        let host = downcast(index)?;
        let needed = host.size() as u64;
        let budget = self.memory_per_device;
        self.used[resources.device]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(needed).filter(|&total| total <= budget)
            })
            .map_err(|used| {
                EngineFailure::new(format!(
                    "out of device memory: need {needed} bytes, device has {} free",
                    budget.saturating_sub(used)
                ))
            })?;
        resources.reserved.fetch_add(needed, Ordering::SeqCst);
        let mut copy = host.clone();
        copy.device = Some(resources.device());
        Ok(Box::new(copy))
    }

    fn index_to_host(&self, index: &dyn NativeIndex<f32>) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        let mut copy = downcast(index)?.clone();
        copy.device = None;
        Ok(Box::new(copy))
    }
}
