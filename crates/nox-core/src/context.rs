//! Shared CUDA context: single device, default stream, VRAM accounting.
//!
//! [`GpuContext`] is the production [`DeviceMemory`] implementation.  All
//! denoiser buffers (state, scratch, image layers, intensity) are allocated
//! through it and returned to the driver when the owning [`CudaBuffer`] is
//! dropped.  An optional VRAM cap is checked before each allocation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr};
use tracing::{debug, info, warn};

use crate::device::{AllocationLedger, DeviceAllocation, DeviceMemory, LedgerSnapshot};
use crate::error::{EngineError, Result};
use crate::ffi_types::{CUdeviceptr, CUstream};

// ─── GPU context ─────────────────────────────────────────────────────────────

/// Long-lived GPU context shared by every denoise session on one device.
pub struct GpuContext {
    device: Arc<CudaDevice>,

    /// Device memory accounting (lock-free reads).
    ledger: Arc<AllocationLedger>,

    /// VRAM limit (bytes). 0 = unlimited.
    vram_limit: AtomicUsize,

    /// Enforce VRAM limit as a hard allocation error instead of warn-only.
    strict_vram_limit: AtomicBool,
}

impl GpuContext {
    /// Initialize the GPU context on the given device ordinal.
    ///
    /// Makes the device's primary context current on the calling thread,
    /// which is where the OptiX device context will be created.
    pub fn new(device_ordinal: usize) -> Result<Arc<Self>> {
        let device = CudaDevice::new(device_ordinal)?;
        let name = device.name().unwrap_or_else(|_| "unknown".into());
        info!(device = device_ordinal, name = %name, "CUDA device initialized");

        Ok(Arc::new(Self {
            device,
            ledger: Arc::new(AllocationLedger::new()),
            vram_limit: AtomicUsize::new(0),
            strict_vram_limit: AtomicBool::new(false),
        }))
    }

    /// Number of CUDA devices visible to the driver.
    pub fn device_count() -> Result<usize> {
        Ok(CudaDevice::count()? as usize)
    }

    /// Access the underlying `CudaDevice`.
    #[inline]
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Read current and peak VRAM usage (bytes) for allocations through this context.
    #[inline]
    pub fn vram_usage(&self) -> (usize, usize) {
        let snap = self.ledger.snapshot();
        (snap.live_bytes, snap.peak_bytes)
    }

    /// Set a VRAM usage cap (bytes).  0 = unlimited.
    pub fn set_vram_limit(&self, limit_bytes: usize) {
        self.vram_limit.store(limit_bytes, Ordering::Relaxed);
        info!(limit_mb = limit_bytes / (1024 * 1024), "VRAM limit set");
    }

    /// Enable/disable hard-fail behavior when a configured VRAM limit would be exceeded.
    pub fn set_strict_vram_limit(&self, enabled: bool) {
        self.strict_vram_limit.store(enabled, Ordering::Relaxed);
        info!(enabled, "Strict VRAM limit enforcement");
    }
}

impl DeviceMemory for GpuContext {
    type Buffer = CudaBuffer;

    fn alloc(&self, bytes: usize) -> Result<CudaBuffer> {
        // Zero-byte requests still get a distinct address.
        let reserve = bytes.max(1);
        let current = self.ledger.live_bytes();
        let limit = self.vram_limit.load(Ordering::Relaxed);
        let would_exceed = check_vram_limit(
            self.strict_vram_limit.load(Ordering::Relaxed),
            (limit > 0).then_some(limit),
            current,
            reserve,
        )?;
        if would_exceed {
            warn!(
                current_mb = current / (1024 * 1024),
                limit_mb = limit / (1024 * 1024),
                requested_bytes = bytes,
                "VRAM usage would exceed configured limit; continuing because strict_vram_limit=false"
            );
        }

        // SAFETY: u8 has no invalid bit patterns; contents are overwritten
        // by upload or by the denoiser before being read.
        let slice = unsafe { self.device.alloc::<u8>(reserve) }.map_err(|e| {
            EngineError::ResourceExhausted {
                requested: bytes,
                detail: e.to_string(),
            }
        })?;
        self.ledger.on_alloc(reserve);
        debug!(bytes = reserve, "Device buffer allocated");

        Ok(CudaBuffer {
            slice,
            len: bytes,
            reserved: reserve,
            ledger: Arc::clone(&self.ledger),
        })
    }

    fn upload(&self, src: &[u8], dst: &mut CudaBuffer) -> Result<()> {
        if src.len() > dst.len {
            return Err(EngineError::BufferSize {
                need: src.len(),
                have: dst.len,
            });
        }
        if src.is_empty() {
            return Ok(());
        }
        // Stream-ordered copy; the staging vector is parked in the slice
        // until the copy completes, so the host does not wait here.
        let staged = staging_buffer(src, dst.reserved);
        self.device.htod_copy_into(staged, &mut dst.slice)?;
        Ok(())
    }

    fn download(&self, src: &CudaBuffer, dst: &mut [u8]) -> Result<()> {
        if dst.len() > src.len {
            return Err(EngineError::BufferSize {
                need: dst.len(),
                have: src.len,
            });
        }
        if dst.is_empty() {
            return Ok(());
        }
        let view = src.slice.slice(..dst.len());
        self.device.dtoh_sync_copy_into(&view, dst)?;
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }

    fn stream(&self) -> CUstream {
        *self.device.cu_stream() as CUstream
    }

    fn ledger(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }
}

// SAFETY: GpuContext only exposes the device through cudarc, which binds the
// context per call; counters are atomics.
unsafe impl Send for GpuContext {}
unsafe impl Sync for GpuContext {}

// ─── Buffers ────────────────────────────────────────────────────────────────

/// Device allocation owned by a [`GpuContext`].
pub struct CudaBuffer {
    slice: CudaSlice<u8>,
    len: usize,
    reserved: usize,
    ledger: Arc<AllocationLedger>,
}

impl DeviceAllocation for CudaBuffer {
    #[inline]
    fn device_ptr(&self) -> CUdeviceptr {
        *self.slice.device_ptr()
    }

    #[inline]
    fn byte_len(&self) -> usize {
        self.len
    }
}

impl Drop for CudaBuffer {
    fn drop(&mut self) {
        // The slice itself is returned to the driver right after this.
        self.ledger.on_free(self.reserved);
    }
}

// SAFETY: CudaSlice holds an Arc<CudaDevice> and a raw device address.
unsafe impl Send for CudaBuffer {}

/// Host copy of `src` padded with zeros to the full allocation size.
fn staging_buffer(src: &[u8], reserved: usize) -> Vec<u8> {
    let mut staged = Vec::with_capacity(reserved.max(src.len()));
    staged.extend_from_slice(src);
    staged.resize(reserved.max(src.len()), 0);
    staged
}

fn check_vram_limit(
    strict: bool,
    limit: Option<usize>,
    current: usize,
    requested: usize,
) -> Result<bool> {
    let Some(limit_bytes) = limit.filter(|limit| *limit > 0) else {
        return Ok(false);
    };

    let would_be = current.saturating_add(requested);
    if would_be <= limit_bytes {
        return Ok(false);
    }

    if strict {
        return Err(EngineError::VramLimitExceeded {
            limit_bytes,
            would_be_bytes: would_be,
        });
    }

    Ok(true)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_buffer_covers_the_whole_allocation() {
        let staged = staging_buffer(&[1, 2, 3], 8);
        assert_eq!(staged, [1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(staging_buffer(&[9; 4], 4), [9; 4]);
    }

    #[test]
    fn vram_limit_warn_only_mode_preserves_success() {
        let ok = check_vram_limit(false, Some(1_024), 900, 200)
            .expect("warn-only mode should not fail");
        assert!(ok, "helper should indicate would-exceed for caller warning");
    }

    #[test]
    fn vram_limit_strict_mode_fails_when_exceeded() {
        let err = check_vram_limit(true, Some(1_024), 900, 200).expect_err("strict mode must fail");
        match err {
            EngineError::VramLimitExceeded {
                limit_bytes,
                would_be_bytes,
            } => {
                assert_eq!(limit_bytes, 1_024);
                assert_eq!(would_be_bytes, 1_100);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn vram_limit_strict_mode_allows_exact_boundary() {
        let ok = check_vram_limit(true, Some(1_024), 768, 256).expect("equal-to-limit is allowed");
        assert!(!ok, "no warning when boundary is exactly met");
    }

    #[test]
    fn vram_limit_unset_never_triggers() {
        assert!(!check_vram_limit(true, None, usize::MAX - 1, 1).unwrap());
        assert!(!check_vram_limit(true, Some(0), 10, 10).unwrap());
    }
}
