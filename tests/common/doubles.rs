//! Test doubles for the engine and accelerator seams.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use quiver::accelerator::{AcceleratorBackend, DeviceMemory, DeviceResources};
use quiver::index::reference::ReferenceEngine;
use quiver::index::traits::{EngineFailure, EngineResult, IvfFacet, NativeIndex, VectorEngine};
use quiver::index::FloatIndex;
use quiver::params::SearchParams;
use quiver::selector::IdSelector;
use quiver::types::{DirectMapType, MetricType, SearchResult, StructuralKind};

/// What the core asked of the engine. Capability queries (`ivf()`, `d()`,
/// `nprobe()`, ...) are not recorded; only operations are.
#[derive(Debug, Default, Clone)]
pub struct CallLog {
    pub operations: usize,
    /// `assign` lists handed to `search_preassigned`, one entry per call.
    pub preassigned: Vec<Vec<i64>>,
    /// `params.nprobe()` seen by each search or preassigned search.
    pub nprobes: Vec<Option<usize>>,
    pub max_codes: Vec<usize>,
}

/// Float index that delegates to the reference engine and records calls.
pub struct CountingIndex {
    inner: Box<dyn NativeIndex<f32>>,
    log: Arc<Mutex<CallLog>>,
}

impl CountingIndex {
    /// Wrap a reference-engine index built from `description`.
    pub fn build(d: usize, description: &str) -> (FloatIndex, Arc<Mutex<CallLog>>) {
        let engine = ReferenceEngine::default();
        let inner = engine
            .index_factory(d, description, MetricType::L2)
            .expect("reference engine should build the index");
        let log = Arc::new(Mutex::new(CallLog::default()));
        let counting = CountingIndex {
            inner,
            log: Arc::clone(&log),
        };
        (FloatIndex::from_native(Box::new(counting)), log)
    }

    fn record(&self) {
        self.log.lock().operations += 1;
    }

    fn facet(&self) -> &dyn IvfFacet<f32> {
        self.inner.ivf().expect("wrapped index should be an inverted file")
    }
}

impl NativeIndex<f32> for CountingIndex {
    fn d(&self) -> usize {
        self.inner.d()
    }

    fn metric(&self) -> MetricType {
        self.inner.metric()
    }

    fn is_trained(&self) -> bool {
        self.inner.is_trained()
    }

    fn ntotal(&self) -> usize {
        self.inner.ntotal()
    }

    fn kind(&self) -> StructuralKind {
        self.inner.kind()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn train(&mut self, n: usize, x: &[f32]) -> EngineResult<()> {
        self.record();
        self.inner.train(n, x)
    }

    fn add(&mut self, n: usize, x: &[f32]) -> EngineResult<()> {
        self.record();
        self.inner.add(n, x)
    }

    fn add_with_ids(&mut self, n: usize, x: &[f32], ids: &[i64]) -> EngineResult<()> {
        self.record();
        self.inner.add_with_ids(n, x, ids)
    }

    fn search(
        &self,
        n: usize,
        x: &[f32],
        k: usize,
        params: Option<&SearchParams<'_>>,
    ) -> EngineResult<SearchResult<f32>> {
        {
            let mut log = self.log.lock();
            log.operations += 1;
            log.nprobes.push(params.and_then(|p| p.nprobe()));
            log.max_codes.push(params.map_or(0, |p| p.max_codes()));
        }
        self.inner.search(n, x, k, params)
    }

    fn reset(&mut self) -> EngineResult<()> {
        self.record();
        self.inner.reset()
    }

    fn remove_ids(&mut self, selector: &IdSelector) -> EngineResult<usize> {
        self.record();
        self.inner.remove_ids(selector)
    }

    fn ivf(&self) -> Option<&dyn IvfFacet<f32>> {
        self.inner.ivf().map(|_| self as &dyn IvfFacet<f32>)
    }

    fn ivf_mut(&mut self) -> Option<&mut dyn IvfFacet<f32>> {
        if self.inner.ivf().is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl IvfFacet<f32> for CountingIndex {
    fn nlist(&self) -> usize {
        self.facet().nlist()
    }

    fn nprobe(&self) -> usize {
        self.facet().nprobe()
    }

    fn set_nprobe(&mut self, nprobe: usize) {
        if let Some(ivf) = self.inner.ivf_mut() {
            ivf.set_nprobe(nprobe);
        }
    }

    fn direct_map(&self) -> DirectMapType {
        self.facet().direct_map()
    }

    fn set_direct_map(&mut self, kind: DirectMapType) -> EngineResult<()> {
        self.record();
        match self.inner.ivf_mut() {
            Some(ivf) => ivf.set_direct_map(kind),
            None => Err(EngineFailure::new("wrapped index is not an inverted file")),
        }
    }

    fn list_ids(&self, list_no: usize) -> Vec<i64> {
        self.facet().list_ids(list_no)
    }

    fn closest_eligible_centroids(
        &self,
        x: &[f32],
        eligible: &IdSelector,
        limit: usize,
    ) -> EngineResult<(Vec<i64>, Vec<f32>)> {
        self.record();
        self.facet().closest_eligible_centroids(x, eligible, limit)
    }

    fn search_preassigned(
        &self,
        n: usize,
        x: &[f32],
        k: usize,
        assign: &[i64],
        centroid_dis: &[f32],
        params: &SearchParams<'_>,
    ) -> EngineResult<SearchResult<f32>> {
        {
            let mut log = self.log.lock();
            log.operations += 1;
            log.preassigned.push(assign.to_vec());
            log.nprobes.push(params.nprobe());
            log.max_codes.push(params.max_codes());
        }
        self.facet().search_preassigned(n, x, k, assign, centroid_dis, params)
    }
}

/// Accelerator backend whose transfers always fail after resources were
/// allocated. `live` counts resource handles not yet dropped.
pub struct FailingBackend {
    pub devices: usize,
    pub live: Arc<AtomicUsize>,
}

impl FailingBackend {
    pub fn new(devices: usize) -> (Self, Arc<AtomicUsize>) {
        let live = Arc::new(AtomicUsize::new(0));
        (
            Self {
                devices,
                live: Arc::clone(&live),
            },
            live,
        )
    }
}

struct TrackedResources {
    device: usize,
    live: Arc<AtomicUsize>,
}

impl DeviceResources for TrackedResources {
    fn device(&self) -> usize {
        self.device
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for TrackedResources {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AcceleratorBackend for FailingBackend {
    fn device_count(&self) -> EngineResult<usize> {
        Ok(self.devices)
    }

    fn memory(&self, _device: usize) -> EngineResult<DeviceMemory> {
        Ok(DeviceMemory { free: 0, total: 0 })
    }

    fn create_resources(&self, device: usize) -> EngineResult<Box<dyn DeviceResources>> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackedResources {
            device,
            live: Arc::clone(&self.live),
        }))
    }

    fn index_to_device(
        &self,
        _resources: &dyn DeviceResources,
        _index: &dyn NativeIndex<f32>,
    ) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        Err(EngineFailure::new("out of device memory"))
    }

    fn index_to_host(&self, _index: &dyn NativeIndex<f32>) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        Err(EngineFailure::new("device unreachable"))
    }
}

/// Backend that cannot even enumerate its devices.
pub struct BrokenBackend;

impl AcceleratorBackend for BrokenBackend {
    fn device_count(&self) -> EngineResult<usize> {
        Err(EngineFailure::new("driver not loaded"))
    }

    fn memory(&self, _device: usize) -> EngineResult<DeviceMemory> {
        Err(EngineFailure::new("driver not loaded"))
    }

    fn create_resources(&self, _device: usize) -> EngineResult<Box<dyn DeviceResources>> {
        Err(EngineFailure::new("driver not loaded"))
    }

    fn index_to_device(
        &self,
        _resources: &dyn DeviceResources,
        _index: &dyn NativeIndex<f32>,
    ) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        Err(EngineFailure::new("driver not loaded"))
    }

    fn index_to_host(&self, _index: &dyn NativeIndex<f32>) -> EngineResult<Box<dyn NativeIndex<f32>>> {
        Err(EngineFailure::new("driver not loaded"))
    }
}
