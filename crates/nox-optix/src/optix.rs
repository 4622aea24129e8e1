//! OptiX denoiser backend.
//!
//! [`OptixBackend`] owns one OptiX device context created on the CUDA
//! context current at construction time.  It forwards every
//! [`DenoiserBackend`] call to the runtime's function table and returns the
//! status unchanged.

use std::ffi::{CStr, c_char, c_void};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use nox_core::backend::DenoiserBackend;
use nox_core::error::{EngineError, Result};
use nox_core::ffi_types::{
    CUdeviceptr, CUstream, OPTIX_DEVICE_CONTEXT_VALIDATION_MODE_ALL,
    OPTIX_DEVICE_CONTEXT_VALIDATION_MODE_OFF, OPTIX_ERROR_ENTRY_SYMBOL_NOT_FOUND, OPTIX_SUCCESS,
    OptixDenoiser, OptixDenoiserGuideLayer, OptixDenoiserLayer, OptixDenoiserModelKind,
    OptixDenoiserOptions, OptixDenoiserParams, OptixDenoiserSizes, OptixDeviceContext,
    OptixDeviceContextOptions, OptixImage2D, OptixResult,
};

use crate::sys::{self, OptixApi};

/// Forward runtime log messages into `tracing`.
unsafe extern "C" fn log_callback(
    level: u32,
    tag: *const c_char,
    message: *const c_char,
    _cbdata: *mut c_void,
) {
    let read = |p: *const c_char| {
        if p.is_null() {
            String::new()
        } else {
            // SAFETY: OptiX passes NUL-terminated strings valid for this call.
            unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
        }
    };
    let tag = read(tag);
    let message = read(message);
    match level {
        1 | 2 => error!(target: "optix", tag = %tag, "{message}"),
        3 => warn!(target: "optix", tag = %tag, "{message}"),
        _ => debug!(target: "optix", tag = %tag, "{message}"),
    }
}

/// OptiX denoiser engine bound to one device context.
pub struct OptixBackend {
    api: Arc<OptixApi>,
    context: OptixDeviceContext,
}

impl OptixBackend {
    /// Load the runtime and create a device context on the current CUDA context.
    ///
    /// `validation` enables the runtime's internal validation mode, which is
    /// slow.  `library` overrides the default driver library search.
    pub fn new(validation: bool, library: Option<&Path>) -> Result<Self> {
        let api = sys::load(library)?;
        let Some(create) = api.table.optixDeviceContextCreate else {
            return Err(EngineError::configuration(
                "optixDeviceContextCreate",
                OPTIX_ERROR_ENTRY_SYMBOL_NOT_FOUND,
            ));
        };

        let options = OptixDeviceContextOptions {
            logCallbackFunction: Some(log_callback),
            logCallbackData: std::ptr::null_mut(),
            logCallbackLevel: 4,
            validationMode: if validation {
                OPTIX_DEVICE_CONTEXT_VALIDATION_MODE_ALL
            } else {
                OPTIX_DEVICE_CONTEXT_VALIDATION_MODE_OFF
            },
        };
        let mut context: OptixDeviceContext = std::ptr::null_mut();
        // SAFETY: a null CUcontext selects the current context; options and
        // out-pointer are valid for the call.
        let rc = unsafe { create(std::ptr::null_mut(), &options, &mut context) };
        if rc != OPTIX_SUCCESS {
            return Err(EngineError::configuration("optixDeviceContextCreate", rc));
        }

        info!(library = %api.library, validation, "OptiX device context created");
        Ok(Self { api, context })
    }

    /// Library the runtime was loaded from.
    pub fn library(&self) -> &str {
        &self.api.library
    }

    fn missing(&self, call: &'static str) -> OptixResult {
        warn!(call, "OptiX entry point missing from function table");
        OPTIX_ERROR_ENTRY_SYMBOL_NOT_FOUND
    }
}

impl DenoiserBackend for OptixBackend {
    fn name(&self) -> &str {
        "optix"
    }

    fn create(
        &self,
        kind: OptixDenoiserModelKind,
        options: &OptixDenoiserOptions,
        handle: &mut OptixDenoiser,
    ) -> OptixResult {
        let Some(f) = self.api.table.optixDenoiserCreate else {
            return self.missing("optixDenoiserCreate");
        };
        // SAFETY: context is live for self's lifetime; pointers are valid references.
        unsafe { f(self.context, kind, options, handle) }
    }

    fn compute_memory_resources(
        &self,
        handle: OptixDenoiser,
        width: u32,
        height: u32,
        sizes: &mut OptixDenoiserSizes,
    ) -> OptixResult {
        let Some(f) = self.api.table.optixDenoiserComputeMemoryResources else {
            return self.missing("optixDenoiserComputeMemoryResources");
        };
        // SAFETY: handle came from create; sizes is a valid out-reference.
        unsafe { f(handle, width, height, sizes) }
    }

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
    ) -> OptixResult {
        let Some(f) = self.api.table.optixDenoiserSetup else {
            return self.missing("optixDenoiserSetup");
        };
        // SAFETY: buffers were allocated with the reported sizes on this device.
        unsafe { f(handle, stream, width, height, state, state_size, scratch, scratch_size) }
    }

    fn compute_intensity(
        &self,
        handle: OptixDenoiser,
        stream: CUstream,
        input: &OptixImage2D,
        intensity: CUdeviceptr,
        scratch: CUdeviceptr,
        scratch_size: usize,
    ) -> OptixResult {
        let Some(f) = self.api.table.optixDenoiserComputeIntensity else {
            return self.missing("optixDenoiserComputeIntensity");
        };
        // SAFETY: input describes a live device buffer; intensity holds one f32.
        unsafe { f(handle, stream, input, intensity, scratch, scratch_size) }
    }

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
    ) -> OptixResult {
        let Some(f) = self.api.table.optixDenoiserInvoke else {
            return self.missing("optixDenoiserInvoke");
        };
        // SAFETY: every descriptor references a live device buffer sized for it.
        unsafe {
            f(
                handle,
                stream,
                params,
                state,
                state_size,
                guide,
                layers.as_ptr(),
                layers.len() as u32,
                offset_x,
                offset_y,
                scratch,
                scratch_size,
            )
        }
    }

    fn destroy(&self, handle: OptixDenoiser) -> OptixResult {
        let Some(f) = self.api.table.optixDenoiserDestroy else {
            return self.missing("optixDenoiserDestroy");
        };
        // SAFETY: handle came from create and is destroyed once.
        unsafe { f(handle) }
    }
}

impl Drop for OptixBackend {
    fn drop(&mut self) {
        if let Some(f) = self.api.table.optixDeviceContextDestroy {
            // SAFETY: context was created in new() and is destroyed once.
            let rc = unsafe { f(self.context) };
            if rc != OPTIX_SUCCESS {
                warn!(
                    status = rc,
                    name = %self.api.error_name(rc),
                    "optixDeviceContextDestroy failed"
                );
            }
        }
    }
}

// SAFETY: the device context is internally synchronized by OptiX; calls are
// issued against the CUDA context current on the calling thread.
unsafe impl Send for OptixBackend {}
unsafe impl Sync for OptixBackend {}
