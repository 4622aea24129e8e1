//! Denoiser backend trait: the raw engine contract.
//!
//! Methods mirror the OptiX denoiser entry points one-to-one and return the
//! engine's status code untouched.  Status translation into [`EngineError`]
//! happens in [`check_optix`] so every caller names the failing call the
//! same way.

use crate::error::{EngineError, Result};
use crate::ffi_types::{
    CUdeviceptr, CUstream, OPTIX_SUCCESS, OptixDenoiser, OptixDenoiserGuideLayer,
    OptixDenoiserLayer, OptixDenoiserModelKind, OptixDenoiserOptions, OptixDenoiserParams,
    OptixDenoiserSizes, OptixImage2D, OptixResult,
};

/// Engine-facing denoiser interface.
///
/// Implementors must accept calls from the thread that owns the current
/// CUDA context; all device pointers are addresses from the same
/// [`DeviceMemory`](crate::device::DeviceMemory) the caller allocated with.
pub trait DenoiserBackend: Send + Sync {
    /// Short identifier for logs and probe output.
    fn name(&self) -> &str;

    fn create(
        &self,
        kind: OptixDenoiserModelKind,
        options: &OptixDenoiserOptions,
        handle: &mut OptixDenoiser,
    ) -> OptixResult;

    fn compute_memory_resources(
        &self,
        handle: OptixDenoiser,
        width: u32,
        height: u32,
        sizes: &mut OptixDenoiserSizes,
    ) -> OptixResult;

    #[allow(clippy::too_many_arguments)]
    fn setup(
        &self,
        handle: OptixDenoiser,
        stream: CUstream,
        width: u32,
        height: u32,
        state: CUdeviceptr,
        state_size: usize,
        scratch: CUdeviceptr,
        scratch_size: usize,
    ) -> OptixResult;

    fn compute_intensity(
        &self,
        handle: OptixDenoiser,
        stream: CUstream,
        input: &OptixImage2D,
        intensity: CUdeviceptr,
        scratch: CUdeviceptr,
        scratch_size: usize,
    ) -> OptixResult;

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &self,
        handle: OptixDenoiser,
        stream: CUstream,
        params: &OptixDenoiserParams,
        state: CUdeviceptr,
        state_size: usize,
        guide: &OptixDenoiserGuideLayer,
        layers: &[OptixDenoiserLayer],
        offset_x: u32,
        offset_y: u32,
        scratch: CUdeviceptr,
        scratch_size: usize,
    ) -> OptixResult;

    fn destroy(&self, handle: OptixDenoiser) -> OptixResult;
}

/// How a failing status is reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// Creation / setup: the engine rejected the requested configuration.
    Configuration,
    /// Everything else.
    Invocation,
}

/// Translate an engine status into a `Result`, naming the failing call.
#[inline]
pub fn check_optix(rc: OptixResult, call: &'static str, kind: CallKind) -> Result<()> {
    if rc == OPTIX_SUCCESS {
        return Ok(());
    }
    Err(match kind {
        CallKind::Configuration => EngineError::configuration(call, rc),
        CallKind::Invocation => EngineError::backend(call, rc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi_types::OPTIX_ERROR_INTERNAL_ERROR;

    #[test]
    fn success_passes_through() {
        assert!(check_optix(OPTIX_SUCCESS, "optixDenoiserInvoke", CallKind::Invocation).is_ok());
    }

    #[test]
    fn failure_kind_selects_error_variant() {
        let err = check_optix(OPTIX_ERROR_INTERNAL_ERROR, "optixDenoiserSetup", CallKind::Configuration)
            .expect_err("non-success must fail");
        assert!(matches!(err, EngineError::Configuration { call: "optixDenoiserSetup", .. }));

        let err = check_optix(OPTIX_ERROR_INTERNAL_ERROR, "optixDenoiserInvoke", CallKind::Invocation)
            .expect_err("non-success must fail");
        assert!(matches!(
            err,
            EngineError::BackendInvocation { call: "optixDenoiserInvoke", code: 7990, .. }
        ));
    }
}
