//! Device memory contract.
//!
//! Every device buffer the denoise pipeline touches is obtained through a
//! [`DeviceMemory`] implementation and released when its buffer value is
//! dropped.  The CUDA implementation lives in [`crate::context`]; tests use
//! a host-backed implementation with fake device addresses.
//!
//! All allocations and frees are counted in an [`AllocationLedger`] so the
//! pipeline can prove that every buffer it acquired was released, on both
//! the success and the error path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::Result;
use crate::ffi_types::{CUdeviceptr, CUstream};

/// A single device allocation.  Freed on drop.
pub trait DeviceAllocation: Send {
    /// Device address of the first byte.
    fn device_ptr(&self) -> CUdeviceptr;
    /// Usable size in bytes.
    fn byte_len(&self) -> usize;
}

/// Allocator and transfer engine for one device and one stream.
///
/// Transfers are stream-ordered: `upload` and `download` enqueue copies that
/// are complete once [`synchronize`](Self::synchronize) returns.  Implementations
/// may complete them eagerly.
pub trait DeviceMemory: Send + Sync {
    type Buffer: DeviceAllocation;

    /// Allocate `bytes` of device memory.  Contents are unspecified.
    fn alloc(&self, bytes: usize) -> Result<Self::Buffer>;

    /// Enqueue a copy of `src` into the start of `dst` on [`Self::stream`].
    ///
    /// Returns without waiting for the device; `src` may be reused at once.
    fn upload(&self, src: &[u8], dst: &mut Self::Buffer) -> Result<()>;

    /// Copy the first `dst.len()` bytes of `src` into `dst`.
    fn download(&self, src: &Self::Buffer, dst: &mut [u8]) -> Result<()>;

    /// Block until all enqueued work on the stream has completed.
    fn synchronize(&self) -> Result<()>;

    /// Raw stream handle passed to the denoiser.
    fn stream(&self) -> CUstream;

    /// Allocation counters for this allocator.
    fn ledger(&self) -> LedgerSnapshot;
}

// ─── Allocation ledger ──────────────────────────────────────────────────────

/// Atomic allocation counters.  Lock-free reads.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    allocations: AtomicU64,
    frees: AtomicU64,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl AllocationLedger {
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            live_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn on_alloc(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let prev = self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.peak_bytes.fetch_max(prev + bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_free(&self, bytes: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Bytes currently allocated.
    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of an [`AllocationLedger`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub allocations: u64,
    pub frees: u64,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

impl LedgerSnapshot {
    /// `true` when every allocation has a matching free.
    #[inline]
    pub fn is_balanced(&self) -> bool {
        self.allocations == self.frees && self.live_bytes == 0
    }

    /// Counter deltas since `earlier`.
    pub fn since(&self, earlier: &LedgerSnapshot) -> LedgerSnapshot {
        LedgerSnapshot {
            allocations: self.allocations - earlier.allocations,
            frees: self.frees - earlier.frees,
            live_bytes: self.live_bytes.saturating_sub(earlier.live_bytes),
            peak_bytes: self.peak_bytes,
        }
    }
}
