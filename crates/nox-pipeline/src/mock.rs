//! Host-resident device and engine doubles.
//!
//! [`HostMemory`] hands out fake device addresses backed by host vectors in a
//! shared [`DeviceHeap`]; [`PassthroughDenoiser`] reads and writes that heap
//! through the same addresses.  The engine enforces the call order and the
//! buffer sizes the real runtime requires, estimates intensity as the mean
//! luminance of the input and copies the input image to the output on invoke.
//!
//! Used by unit tests and by `nox --dry-run`.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use nox_core::backend::DenoiserBackend;
use nox_core::device::{AllocationLedger, DeviceAllocation, DeviceMemory, LedgerSnapshot};
use nox_core::error::{EngineError, Result};
use nox_core::ffi_types::{
    CUdeviceptr, CUstream, OPTIX_DENOISER_MODEL_KIND_TEMPORAL, OPTIX_ERROR_INVALID_OPERATION,
    OPTIX_ERROR_INVALID_VALUE, OPTIX_PIXEL_FORMAT_FLOAT3, OPTIX_PIXEL_FORMAT_FLOAT4, OPTIX_SUCCESS,
    OptixDenoiser, OptixDenoiserGuideLayer, OptixDenoiserLayer, OptixDenoiserModelKind,
    OptixDenoiserOptions, OptixDenoiserParams, OptixDenoiserSizes, OptixImage2D, OptixResult,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Device heap ────────────────────────────────────────────────────────────

#[derive(Default)]
struct HeapInner {
    next: CUdeviceptr,
    blocks: HashMap<CUdeviceptr, Vec<u8>>,
}

/// Fake device address space shared by [`HostMemory`] and [`PassthroughDenoiser`].
#[derive(Clone, Default)]
pub struct DeviceHeap {
    inner: Arc<Mutex<HeapInner>>,
}

impl DeviceHeap {
    fn insert(&self, bytes: usize) -> CUdeviceptr {
        let mut heap = lock(&self.inner);
        // 256-byte aligned, never zero.
        heap.next += 0x100 + (bytes as CUdeviceptr).next_multiple_of(0x100);
        let ptr = heap.next;
        heap.blocks.insert(ptr, vec![0; bytes]);
        ptr
    }

    fn remove(&self, ptr: CUdeviceptr) {
        lock(&self.inner).blocks.remove(&ptr);
    }

    /// Size of the block starting at `ptr`.
    pub fn block_len(&self, ptr: CUdeviceptr) -> Option<usize> {
        lock(&self.inner).blocks.get(&ptr).map(Vec::len)
    }

    /// Copy of the first `len` bytes at `ptr`.
    pub fn read(&self, ptr: CUdeviceptr, len: usize) -> Option<Vec<u8>> {
        let heap = lock(&self.inner);
        let block = heap.blocks.get(&ptr)?;
        block.get(..len).map(<[u8]>::to_vec)
    }

    /// Overwrite the start of the block at `ptr`.  `false` if out of bounds.
    pub fn write(&self, ptr: CUdeviceptr, bytes: &[u8]) -> bool {
        let mut heap = lock(&self.inner);
        match heap.blocks.get_mut(&ptr).and_then(|b| b.get_mut(..bytes.len())) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Number of live blocks.
    pub fn live_blocks(&self) -> usize {
        lock(&self.inner).blocks.len()
    }
}

// ─── HostMemory ─────────────────────────────────────────────────────────────

/// [`DeviceMemory`] over host vectors.
pub struct HostMemory {
    heap: DeviceHeap,
    ledger: Arc<AllocationLedger>,
    /// Allocation index (1-based, counted from arming) that fails; 0 = never.
    fail_at: AtomicUsize,
    armed_allocs: AtomicUsize,
}

impl HostMemory {
    pub fn new() -> Self {
        Self {
            heap: DeviceHeap::default(),
            ledger: Arc::new(AllocationLedger::new()),
            fail_at: AtomicUsize::new(0),
            armed_allocs: AtomicUsize::new(0),
        }
    }

    /// The heap backing this allocator; pass it to [`PassthroughDenoiser::new`].
    pub fn heap(&self) -> DeviceHeap {
        self.heap.clone()
    }

    /// Make the `n`-th allocation from now fail with `ResourceExhausted`.
    pub fn fail_allocation(&self, n: usize) {
        self.armed_allocs.store(0, Ordering::Relaxed);
        self.fail_at.store(n, Ordering::Relaxed);
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory for HostMemory {
    type Buffer = HostBuffer;

    fn alloc(&self, bytes: usize) -> Result<HostBuffer> {
        let fail_at = self.fail_at.load(Ordering::Relaxed);
        if fail_at > 0 {
            let n = self.armed_allocs.fetch_add(1, Ordering::Relaxed) + 1;
            if n == fail_at {
                self.fail_at.store(0, Ordering::Relaxed);
                return Err(EngineError::ResourceExhausted {
                    requested: bytes,
                    detail: "injected allocation failure".into(),
                });
            }
        }

        let reserved = bytes.max(1);
        let ptr = self.heap.insert(reserved);
        self.ledger.on_alloc(reserved);
        Ok(HostBuffer {
            ptr,
            len: bytes,
            reserved,
            heap: self.heap.clone(),
            ledger: Arc::clone(&self.ledger),
        })
    }

    fn upload(&self, src: &[u8], dst: &mut HostBuffer) -> Result<()> {
        if src.len() > dst.len || !self.heap.write(dst.ptr, src) {
            return Err(EngineError::BufferSize {
                need: src.len(),
                have: dst.len,
            });
        }
        Ok(())
    }

    fn download(&self, src: &HostBuffer, dst: &mut [u8]) -> Result<()> {
        let data = self
            .heap
            .read(src.ptr, dst.len())
            .filter(|_| dst.len() <= src.len)
            .ok_or(EngineError::BufferSize {
                need: dst.len(),
                have: src.len,
            })?;
        dst.copy_from_slice(&data);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn stream(&self) -> CUstream {
        std::ptr::null_mut()
    }

    fn ledger(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }
}

/// Block in a [`DeviceHeap`].
pub struct HostBuffer {
    ptr: CUdeviceptr,
    len: usize,
    reserved: usize,
    heap: DeviceHeap,
    ledger: Arc<AllocationLedger>,
}

impl DeviceAllocation for HostBuffer {
    fn device_ptr(&self) -> CUdeviceptr {
        self.ptr
    }

    fn byte_len(&self) -> usize {
        self.len
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.heap.remove(self.ptr);
        self.ledger.on_free(self.reserved);
    }
}

// ─── PassthroughDenoiser ────────────────────────────────────────────────────

/// Options a denoiser instance was created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateRecord {
    pub kind: OptixDenoiserModelKind,
    pub guide_albedo: bool,
    pub guide_normal: bool,
}

struct Instance {
    record: CreateRecord,
    sized: Option<(u32, u32, OptixDenoiserSizes)>,
    setup: Option<(u32, u32)>,
}

#[derive(Default)]
struct EngineState {
    next_handle: usize,
    instances: HashMap<usize, Instance>,
    calls: Vec<&'static str>,
    created: Vec<CreateRecord>,
    last_params: Option<OptixDenoiserParams>,
    last_guide: Option<OptixDenoiserGuideLayer>,
    fail: Option<(&'static str, OptixResult)>,
}

/// Engine double that copies its input to its output.
pub struct PassthroughDenoiser {
    heap: DeviceHeap,
    state: Mutex<EngineState>,
}

impl PassthroughDenoiser {
    pub fn new(heap: DeviceHeap) -> Self {
        Self {
            heap,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Make every later call to `call` return `status`.
    pub fn fail_on(&self, call: &'static str, status: OptixResult) {
        lock(&self.state).fail = Some((call, status));
    }

    /// Entry points invoked so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.state).calls.clone()
    }

    /// Creation options of every instance, in creation order.
    pub fn created(&self) -> Vec<CreateRecord> {
        lock(&self.state).created.clone()
    }

    /// Parameters of the most recent invoke.
    pub fn last_params(&self) -> Option<OptixDenoiserParams> {
        lock(&self.state).last_params
    }

    /// Guide layer of the most recent invoke.
    pub fn last_guide(&self) -> Option<OptixDenoiserGuideLayer> {
        lock(&self.state).last_guide
    }

    /// Instances created and not yet destroyed.
    pub fn live_instances(&self) -> usize {
        lock(&self.state).instances.len()
    }

    /// State buffer bytes required for a resolution.
    pub fn state_size(width: u32, height: u32) -> usize {
        1024 + (width as usize) * (height as usize) * 16
    }

    /// Scratch bytes required for a resolution (no tiling overlap).
    pub fn scratch_size(width: u32, height: u32) -> usize {
        256 + (width as usize) * (height as usize) * 8
    }

    fn enter(&self, call: &'static str) -> (MutexGuard<'_, EngineState>, Option<OptixResult>) {
        let mut state = lock(&self.state);
        state.calls.push(call);
        let injected = state.fail.filter(|(c, _)| *c == call).map(|(_, rc)| rc);
        (state, injected)
    }

    fn image_matches(&self, image: &OptixImage2D, width: u32, height: u32) -> bool {
        if image.is_unbound() {
            return true;
        }
        let need = image.rowStrideInBytes as usize * image.height as usize;
        image.width == width
            && image.height == height
            && self.heap.block_len(image.data).is_some_and(|len| len >= need)
    }

    fn mean_luminance(&self, image: &OptixImage2D) -> Option<f32> {
        let channels = match image.format {
            OPTIX_PIXEL_FORMAT_FLOAT3 => 3,
            OPTIX_PIXEL_FORMAT_FLOAT4 => 4,
            _ => return None,
        };
        let pixels = image.width as usize * image.height as usize;
        let bytes = self.heap.read(image.data, pixels * channels * 4)?;
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let sum: f32 = values
            .chunks_exact(channels)
            .map(|p| 0.2126 * p[0] + 0.7152 * p[1] + 0.0722 * p[2])
            .sum();
        Some(if pixels == 0 { 0.0 } else { sum / pixels as f32 })
    }
}

fn handle_id(handle: OptixDenoiser) -> usize {
    handle as usize
}

impl DenoiserBackend for PassthroughDenoiser {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn create(
        &self,
        kind: OptixDenoiserModelKind,
        options: &OptixDenoiserOptions,
        handle: &mut OptixDenoiser,
    ) -> OptixResult {
        let (mut state, injected) = self.enter("optixDenoiserCreate");
        if let Some(rc) = injected {
            return rc;
        }
        if options.guideNormal != 0 && options.guideAlbedo == 0 {
            return OPTIX_ERROR_INVALID_VALUE;
        }
        state.next_handle += 0x10;
        let id = 0x1000 + state.next_handle;
        let record = CreateRecord {
            kind,
            guide_albedo: options.guideAlbedo != 0,
            guide_normal: options.guideNormal != 0,
        };
        state.created.push(record);
        state.instances.insert(
            id,
            Instance {
                record,
                sized: None,
                setup: None,
            },
        );
        *handle = id as *mut c_void;
        OPTIX_SUCCESS
    }

    fn compute_memory_resources(
        &self,
        handle: OptixDenoiser,
        width: u32,
        height: u32,
        sizes: &mut OptixDenoiserSizes,
    ) -> OptixResult {
        let (mut state, injected) = self.enter("optixDenoiserComputeMemoryResources");
        if let Some(rc) = injected {
            return rc;
        }
        let Some(instance) = state.instances.get_mut(&handle_id(handle)) else {
            return OPTIX_ERROR_INVALID_VALUE;
        };
        let scratch = Self::scratch_size(width, height);
        *sizes = OptixDenoiserSizes {
            stateSizeInBytes: Self::state_size(width, height),
            withOverlapScratchSizeInBytes: scratch * 2,
            withoutOverlapScratchSizeInBytes: scratch,
            overlapWindowSizeInPixels: 0,
        };
        instance.sized = Some((width, height, *sizes));
        OPTIX_SUCCESS
    }

    fn setup(
        &self,
        handle: OptixDenoiser,
        _stream: CUstream,
        width: u32,
        height: u32,
        state_ptr: CUdeviceptr,
        state_size: usize,
        scratch: CUdeviceptr,
        scratch_size: usize,
    ) -> OptixResult {
        let (mut state, injected) = self.enter("optixDenoiserSetup");
        if let Some(rc) = injected {
            return rc;
        }
        let Some(instance) = state.instances.get_mut(&handle_id(handle)) else {
            return OPTIX_ERROR_INVALID_VALUE;
        };
        let Some((max_w, max_h, sizes)) = instance.sized else {
            return OPTIX_ERROR_INVALID_OPERATION;
        };
        let buffers_ok = state_size >= sizes.stateSizeInBytes
            && scratch_size >= sizes.withoutOverlapScratchSizeInBytes
            && self.heap.block_len(state_ptr).is_some_and(|l| l >= state_size)
            && self.heap.block_len(scratch).is_some_and(|l| l >= scratch_size);
        if width > max_w || height > max_h || !buffers_ok {
            return OPTIX_ERROR_INVALID_VALUE;
        }
        instance.setup = Some((width, height));
        OPTIX_SUCCESS
    }

    fn compute_intensity(
        &self,
        handle: OptixDenoiser,
        _stream: CUstream,
        input: &OptixImage2D,
        intensity: CUdeviceptr,
        _scratch: CUdeviceptr,
        _scratch_size: usize,
    ) -> OptixResult {
        let (state, injected) = self.enter("optixDenoiserComputeIntensity");
        if let Some(rc) = injected {
            return rc;
        }
        let Some(instance) = state.instances.get(&handle_id(handle)) else {
            return OPTIX_ERROR_INVALID_VALUE;
        };
        if instance.setup.is_none() {
            return OPTIX_ERROR_INVALID_OPERATION;
        }
        let Some(mean) = self.mean_luminance(input) else {
            return OPTIX_ERROR_INVALID_VALUE;
        };
        if !self.heap.write(intensity, &mean.to_ne_bytes()) {
            return OPTIX_ERROR_INVALID_VALUE;
        }
        OPTIX_SUCCESS
    }

    fn invoke(
        &self,
        handle: OptixDenoiser,
        _stream: CUstream,
        params: &OptixDenoiserParams,
        _state_ptr: CUdeviceptr,
        _state_size: usize,
        guide: &OptixDenoiserGuideLayer,
        layers: &[OptixDenoiserLayer],
        _offset_x: u32,
        _offset_y: u32,
        _scratch: CUdeviceptr,
        _scratch_size: usize,
    ) -> OptixResult {
        let (mut state, injected) = self.enter("optixDenoiserInvoke");
        if let Some(rc) = injected {
            return rc;
        }
        let Some(instance) = state.instances.get(&handle_id(handle)) else {
            return OPTIX_ERROR_INVALID_VALUE;
        };
        let Some((width, height)) = instance.setup else {
            return OPTIX_ERROR_INVALID_OPERATION;
        };
        let record = instance.record;

        let [layer] = layers else {
            return OPTIX_ERROR_INVALID_VALUE;
        };
        let temporal = record.kind == OPTIX_DENOISER_MODEL_KIND_TEMPORAL;
        let guides_bound = (!record.guide_albedo || !guide.albedo.is_unbound())
            && (!record.guide_normal || !guide.normal.is_unbound())
            && (!temporal || (!guide.flow.is_unbound() && !layer.previousOutput.is_unbound()));
        let sizes_ok = [
            &layer.input,
            &layer.previousOutput,
            &layer.output,
            &guide.albedo,
            &guide.normal,
            &guide.flow,
        ]
        .into_iter()
        .all(|img| self.image_matches(img, width, height));
        if !guides_bound || !sizes_ok || layer.input.is_unbound() || layer.output.is_unbound() {
            return OPTIX_ERROR_INVALID_VALUE;
        }
        if self.heap.block_len(params.hdrIntensity).is_none_or(|len| len < 4) {
            return OPTIX_ERROR_INVALID_VALUE;
        }

        let len = layer.input.rowStrideInBytes as usize * layer.input.height as usize;
        let copied = self
            .heap
            .read(layer.input.data, len)
            .is_some_and(|bytes| self.heap.write(layer.output.data, &bytes));
        if !copied {
            return OPTIX_ERROR_INVALID_VALUE;
        }

        state.last_params = Some(*params);
        state.last_guide = Some(*guide);
        debug!(width, height, temporal, "Pass-through denoise");
        OPTIX_SUCCESS
    }

    fn destroy(&self, handle: OptixDenoiser) -> OptixResult {
        let (mut state, injected) = self.enter("optixDenoiserDestroy");
        if let Some(rc) = injected {
            return rc;
        }
        match state.instances.remove(&handle_id(handle)) {
            Some(_) => OPTIX_SUCCESS,
            None => OPTIX_ERROR_INVALID_VALUE,
        }
    }
}
