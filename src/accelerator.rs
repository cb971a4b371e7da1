//! Accelerator device management.
//!
//! An [`AcceleratorManager`] wraps a backend that can enumerate devices,
//! allocate per-device resources and move float indexes between host memory
//! and a device. Allocation and transfer on one device are serialized by a
//! per-device lock; the lock is released as soon as the transfer returns.

use std::any::Any;

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::error::{QuiverError, Result};
use crate::index::traits::{EngineResult, NativeIndex};
use crate::index::FloatIndex;
use crate::metrics;

/// Memory a device holds, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemory {
    pub free: u64,
    pub total: u64,
}

/// Resources allocated on one device. Dropping releases them.
pub trait DeviceResources: Send + Sync {
    fn device(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

/// Device driver. Implementations are expected to be thread-safe but need not
/// serialize allocation themselves.
pub trait AcceleratorBackend: Send + Sync {
    fn device_count(&self) -> EngineResult<usize>;

    fn memory(&self, device: usize) -> EngineResult<DeviceMemory>;

    fn create_resources(&self, device: usize) -> EngineResult<Box<dyn DeviceResources>>;

    fn index_to_device(
        &self,
        resources: &dyn DeviceResources,
        index: &dyn NativeIndex<f32>,
    ) -> EngineResult<Box<dyn NativeIndex<f32>>>;

    fn index_to_host(&self, index: &dyn NativeIndex<f32>) -> EngineResult<Box<dyn NativeIndex<f32>>>;
}

/// A float index resident on a device, together with the resources backing
/// it. Releasing frees the resources first, then the index.
pub struct DeviceIndex {
    index: Option<FloatIndex>,
    resources: Option<Box<dyn DeviceResources>>,
    device: usize,
}

impl std::fmt::Debug for DeviceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIndex")
            .field("device", &self.device)
            .field("index", &self.index)
            .field("released", &self.is_released())
            .finish()
    }
}

impl DeviceIndex {
    pub fn device(&self) -> usize {
        self.device
    }

    /// The device-resident index, or `None` once released.
    pub fn index(&self) -> Option<&FloatIndex> {
        self.index.as_ref()
    }

    pub fn index_mut(&mut self) -> Option<&mut FloatIndex> {
        self.index.as_mut()
    }

    pub fn is_released(&self) -> bool {
        self.index.is_none() && self.resources.is_none()
    }

    /// Idempotent.
    pub fn release(&mut self) {
        let had_resources = self.resources.take().is_some();
        if let Some(mut index) = self.index.take() {
            index.release();
        }
        if had_resources {
            debug!(device = self.device, "released device index");
        }
    }
}

impl Drop for DeviceIndex {
    fn drop(&mut self) {
        self.release();
    }
}

/// Entry point for device discovery and host/device transfers.
pub struct AcceleratorManager {
    backend: Box<dyn AcceleratorBackend>,
    device_count: usize,
    locks: Vec<Mutex<()>>,
}

impl std::fmt::Debug for AcceleratorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorManager")
            .field("device_count", &self.device_count)
            .finish()
    }
}

impl AcceleratorManager {
    /// Probe the backend. A backend that cannot report its devices is treated
    /// as having none.
    pub fn new(backend: Box<dyn AcceleratorBackend>) -> Self {
        let device_count = match backend.device_count() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "device enumeration failed, assuming no accelerators");
                0
            }
        };
        debug!(device_count, "accelerator manager ready");
        Self {
            backend,
            device_count,
            locks: (0..device_count).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.device_count {
            return Err(QuiverError::invalid(format!(
                "invalid device id {device}, {} device(s) available",
                self.device_count
            )));
        }
        Ok(())
    }

    /// Free and total memory on `device`.
    pub fn free_memory(&self, device: usize) -> Result<DeviceMemory> {
        self.check_device(device)?;
        Ok(self.backend.memory(device)?)
    }

    /// Copy `index` onto `device`. The host index is left untouched. On
    /// failure the freshly allocated resources are released before returning.
    #[instrument(skip(self, index), fields(ntotal = index.ntotal()))]
    pub fn transfer_to_device(&self, index: &FloatIndex, device: usize) -> Result<DeviceIndex> {
        self.check_device(device)?;
        let native = index.native()?;

        let transferred = {
            let _guard = self.locks[device].lock();
            self.backend.create_resources(device).and_then(|resources| {
                self.backend
                    .index_to_device(resources.as_ref(), native)
                    .map(|device_native| (resources, device_native))
            })
        };

        match transferred {
            Ok((resources, device_native)) => {
                metrics::DEVICE_TRANSFERS_TOTAL
                    .with_label_values(&["to_device", "ok"])
                    .inc();
                debug!(device, "index copied to device");
                Ok(DeviceIndex {
                    index: Some(FloatIndex::from_native(device_native)),
                    resources: Some(resources),
                    device,
                })
            }
            Err(e) => {
                metrics::DEVICE_TRANSFERS_TOTAL
                    .with_label_values(&["to_device", "error"])
                    .inc();
                warn!(device, error = %e, "index transfer to device failed");
                Err(e.into())
            }
        }
    }

    /// Copy a device-resident index back into host memory. The device copy
    /// stays alive until the caller releases it.
    #[instrument(skip(self, device_index), fields(device = device_index.device()))]
    pub fn transfer_to_host(&self, device_index: &DeviceIndex) -> Result<FloatIndex> {
        let index = device_index
            .index()
            .ok_or_else(|| QuiverError::invalid("device index has been released"))?;
        let native = index.native()?;

        match self.backend.index_to_host(native) {
            Ok(host) => {
                metrics::DEVICE_TRANSFERS_TOTAL
                    .with_label_values(&["to_host", "ok"])
                    .inc();
                Ok(FloatIndex::from_native(host))
            }
            Err(e) => {
                metrics::DEVICE_TRANSFERS_TOTAL
                    .with_label_values(&["to_host", "error"])
                    .inc();
                warn!(error = %e, "index transfer to host failed");
                Err(e.into())
            }
        }
    }
}
