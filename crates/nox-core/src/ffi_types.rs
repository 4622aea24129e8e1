//! Raw CUDA / OptiX ABI types shared across crate boundaries.
//!
//! Layouts follow the OptiX 7.4 headers (function table ABI 55): the
//! denoiser alpha mode still lives in [`OptixDenoiserParams`] and the guide
//! layer carries exactly albedo, normal and flow.

#![allow(non_camel_case_types, non_snake_case)]

use std::ffi::{c_char, c_void};

// ─── CUDA driver ────────────────────────────────────────────────────────────

pub type CUresult = i32;
pub type CUdeviceptr = u64;
pub type CUstream = *mut c_void;
pub type CUcontext = *mut c_void;

pub const CUDA_SUCCESS: CUresult = 0;

// ─── OptiX status codes ─────────────────────────────────────────────────────

pub type OptixResult = i32;

pub const OPTIX_SUCCESS: OptixResult = 0;
pub const OPTIX_ERROR_INVALID_VALUE: OptixResult = 7001;
pub const OPTIX_ERROR_HOST_OUT_OF_MEMORY: OptixResult = 7002;
pub const OPTIX_ERROR_INVALID_OPERATION: OptixResult = 7003;
pub const OPTIX_ERROR_INTERNAL_ERROR: OptixResult = 7990;
pub const OPTIX_ERROR_DEVICE_OUT_OF_MEMORY: OptixResult = 7991;
pub const OPTIX_ERROR_LIBRARY_NOT_FOUND: OptixResult = 7804;
pub const OPTIX_ERROR_ENTRY_SYMBOL_NOT_FOUND: OptixResult = 7805;
pub const OPTIX_ERROR_UNSUPPORTED_ABI_VERSION: OptixResult = 7801;
pub const OPTIX_ERROR_CUDA_ERROR: OptixResult = 7900;

/// Symbolic name for the status codes the denoiser path can produce.
pub fn optix_result_name(rc: OptixResult) -> &'static str {
    match rc {
        OPTIX_SUCCESS => "OPTIX_SUCCESS",
        OPTIX_ERROR_INVALID_VALUE => "OPTIX_ERROR_INVALID_VALUE",
        OPTIX_ERROR_HOST_OUT_OF_MEMORY => "OPTIX_ERROR_HOST_OUT_OF_MEMORY",
        OPTIX_ERROR_INVALID_OPERATION => "OPTIX_ERROR_INVALID_OPERATION",
        OPTIX_ERROR_INTERNAL_ERROR => "OPTIX_ERROR_INTERNAL_ERROR",
        OPTIX_ERROR_DEVICE_OUT_OF_MEMORY => "OPTIX_ERROR_DEVICE_OUT_OF_MEMORY",
        OPTIX_ERROR_LIBRARY_NOT_FOUND => "OPTIX_ERROR_LIBRARY_NOT_FOUND",
        OPTIX_ERROR_ENTRY_SYMBOL_NOT_FOUND => "OPTIX_ERROR_ENTRY_SYMBOL_NOT_FOUND",
        OPTIX_ERROR_UNSUPPORTED_ABI_VERSION => "OPTIX_ERROR_UNSUPPORTED_ABI_VERSION",
        OPTIX_ERROR_CUDA_ERROR => "OPTIX_ERROR_CUDA_ERROR",
        _ => "OPTIX_ERROR_UNKNOWN",
    }
}

// ─── Opaque handles ─────────────────────────────────────────────────────────

pub type OptixDeviceContext = *mut c_void;
pub type OptixDenoiser = *mut c_void;

// ─── Enums (C `enum` is `int`-sized) ────────────────────────────────────────

pub type OptixPixelFormat = u32;

pub const OPTIX_PIXEL_FORMAT_HALF3: OptixPixelFormat = 0x2201;
pub const OPTIX_PIXEL_FORMAT_HALF4: OptixPixelFormat = 0x2202;
pub const OPTIX_PIXEL_FORMAT_FLOAT3: OptixPixelFormat = 0x2203;
pub const OPTIX_PIXEL_FORMAT_FLOAT4: OptixPixelFormat = 0x2204;
pub const OPTIX_PIXEL_FORMAT_UCHAR3: OptixPixelFormat = 0x2205;
pub const OPTIX_PIXEL_FORMAT_UCHAR4: OptixPixelFormat = 0x2206;
pub const OPTIX_PIXEL_FORMAT_HALF2: OptixPixelFormat = 0x2207;
pub const OPTIX_PIXEL_FORMAT_FLOAT2: OptixPixelFormat = 0x2208;

pub type OptixDenoiserModelKind = u32;

pub const OPTIX_DENOISER_MODEL_KIND_LDR: OptixDenoiserModelKind = 0x2322;
pub const OPTIX_DENOISER_MODEL_KIND_HDR: OptixDenoiserModelKind = 0x2323;
pub const OPTIX_DENOISER_MODEL_KIND_AOV: OptixDenoiserModelKind = 0x2324;
pub const OPTIX_DENOISER_MODEL_KIND_TEMPORAL: OptixDenoiserModelKind = 0x2325;

pub type OptixDenoiserAlphaMode = u32;

pub const OPTIX_DENOISER_ALPHA_MODE_COPY: OptixDenoiserAlphaMode = 0;

pub type OptixDeviceContextValidationMode = u32;

pub const OPTIX_DEVICE_CONTEXT_VALIDATION_MODE_OFF: OptixDeviceContextValidationMode = 0;
pub const OPTIX_DEVICE_CONTEXT_VALIDATION_MODE_ALL: OptixDeviceContextValidationMode = 0xFFFF_FFFF;

// ─── Structs ────────────────────────────────────────────────────────────────

/// Device-resident 2D image as seen by the denoiser.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptixImage2D {
    pub data: CUdeviceptr,
    pub width: u32,
    pub height: u32,
    pub rowStrideInBytes: u32,
    pub pixelStrideInBytes: u32,
    pub format: OptixPixelFormat,
}

impl OptixImage2D {
    /// `true` when no buffer is bound (absent guide / previous output).
    #[inline]
    pub fn is_unbound(&self) -> bool {
        self.data == 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptixDenoiserOptions {
    pub guideAlbedo: u32,
    pub guideNormal: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptixDenoiserSizes {
    pub stateSizeInBytes: usize,
    pub withOverlapScratchSizeInBytes: usize,
    pub withoutOverlapScratchSizeInBytes: usize,
    pub overlapWindowSizeInPixels: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OptixDenoiserParams {
    pub denoiseAlpha: OptixDenoiserAlphaMode,
    pub hdrIntensity: CUdeviceptr,
    pub blendFactor: f32,
    pub hdrAverageColor: CUdeviceptr,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptixDenoiserGuideLayer {
    pub albedo: OptixImage2D,
    pub normal: OptixImage2D,
    pub flow: OptixImage2D,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptixDenoiserLayer {
    pub input: OptixImage2D,
    pub previousOutput: OptixImage2D,
    pub output: OptixImage2D,
}

pub type OptixLogCallback =
    Option<unsafe extern "C" fn(level: u32, tag: *const c_char, message: *const c_char, cbdata: *mut c_void)>;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct OptixDeviceContextOptions {
    pub logCallbackFunction: OptixLogCallback,
    pub logCallbackData: *mut c_void,
    pub logCallbackLevel: i32,
    pub validationMode: OptixDeviceContextValidationMode,
}

impl Default for OptixDeviceContextOptions {
    fn default() -> Self {
        Self {
            logCallbackFunction: None,
            logCallbackData: std::ptr::null_mut(),
            logCallbackLevel: 0,
            validationMode: OPTIX_DEVICE_CONTEXT_VALIDATION_MODE_OFF,
        }
    }
}
