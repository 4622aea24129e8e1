//! OptiX function table loader.
//!
//! OptiX exposes a single exported symbol, `optixQueryFunctionTable`, from
//! the driver library.  Every other entry point is read from the table it
//! fills in, whose layout is fixed by the ABI version.

#![allow(non_snake_case)]

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use nox_core::error::{EngineError, Result};
use nox_core::ffi_types::{
    CUcontext, CUdeviceptr, CUstream, OPTIX_SUCCESS, OptixDenoiser, OptixDenoiserGuideLayer,
    OptixDenoiserLayer, OptixDenoiserModelKind, OptixDenoiserOptions, OptixDenoiserParams,
    OptixDenoiserSizes, OptixDeviceContext, OptixDeviceContextOptions, OptixImage2D, OptixResult,
    optix_result_name,
};

/// Function table ABI for OptiX 7.4.
pub const OPTIX_ABI_VERSION: i32 = 55;

#[cfg(target_os = "linux")]
const DEFAULT_LIBRARIES: &[&str] = &["libnvoptix.so.1", "libnvoptix.so"];
#[cfg(windows)]
const DEFAULT_LIBRARIES: &[&str] = &["nvoptix.dll"];
#[cfg(not(any(target_os = "linux", windows)))]
const DEFAULT_LIBRARIES: &[&str] = &[];

type Unused = *const c_void;

/// Entry points in ABI-55 table order.  Unused slots are kept opaque.
#[repr(C)]
pub struct OptixFunctionTable {
    pub optixGetErrorName: Option<unsafe extern "C" fn(OptixResult) -> *const c_char>,
    pub optixGetErrorString: Option<unsafe extern "C" fn(OptixResult) -> *const c_char>,

    pub optixDeviceContextCreate: Option<
        unsafe extern "C" fn(
            CUcontext,
            *const OptixDeviceContextOptions,
            *mut OptixDeviceContext,
        ) -> OptixResult,
    >,
    pub optixDeviceContextDestroy: Option<unsafe extern "C" fn(OptixDeviceContext) -> OptixResult>,
    // GetProperty .. GetCacheDatabaseSizes
    _device_context: [Unused; 8],
    // Module, program group, pipeline
    _module: [Unused; 6],
    _program_group: [Unused; 3],
    _pipeline: [Unused; 3],
    // Acceleration structures
    _accel: [Unused; 7],
    _reserved: [Unused; 2],
    // SbtRecordPackHeader, Launch
    _launch: [Unused; 2],

    pub optixDenoiserCreate: Option<
        unsafe extern "C" fn(
            OptixDeviceContext,
            OptixDenoiserModelKind,
            *const OptixDenoiserOptions,
            *mut OptixDenoiser,
        ) -> OptixResult,
    >,
    pub optixDenoiserDestroy: Option<unsafe extern "C" fn(OptixDenoiser) -> OptixResult>,
    pub optixDenoiserComputeMemoryResources: Option<
        unsafe extern "C" fn(OptixDenoiser, u32, u32, *mut OptixDenoiserSizes) -> OptixResult,
    >,
    pub optixDenoiserSetup: Option<
        unsafe extern "C" fn(
            OptixDenoiser,
            CUstream,
            u32,
            u32,
            CUdeviceptr,
            usize,
            CUdeviceptr,
            usize,
        ) -> OptixResult,
    >,
    pub optixDenoiserInvoke: Option<
        unsafe extern "C" fn(
            OptixDenoiser,
            CUstream,
            *const OptixDenoiserParams,
            CUdeviceptr,
            usize,
            *const OptixDenoiserGuideLayer,
            *const OptixDenoiserLayer,
            u32,
            u32,
            u32,
            CUdeviceptr,
            usize,
        ) -> OptixResult,
    >,
    pub optixDenoiserComputeIntensity: Option<
        unsafe extern "C" fn(
            OptixDenoiser,
            CUstream,
            *const OptixImage2D,
            CUdeviceptr,
            CUdeviceptr,
            usize,
        ) -> OptixResult,
    >,
    pub optixDenoiserComputeAverageColor: Option<
        unsafe extern "C" fn(
            OptixDenoiser,
            CUstream,
            *const OptixImage2D,
            CUdeviceptr,
            CUdeviceptr,
            usize,
        ) -> OptixResult,
    >,
    pub optixDenoiserCreateWithUserModel: Option<
        unsafe extern "C" fn(OptixDeviceContext, *const c_void, usize, *mut OptixDenoiser) -> OptixResult,
    >,
}

// SAFETY: the table holds process-global function addresses only.
unsafe impl Send for OptixFunctionTable {}
unsafe impl Sync for OptixFunctionTable {}

type QueryFunctionTable = unsafe extern "C" fn(
    abi_id: i32,
    num_options: u32,
    option_keys: *mut c_void,
    option_values: *mut *const c_void,
    function_table: *mut c_void,
    size_of_table: usize,
) -> OptixResult;

/// A loaded OptiX runtime.  The library stays mapped for the process lifetime.
pub struct OptixApi {
    pub table: OptixFunctionTable,
    pub library: String,
}

impl OptixApi {
    /// Human-readable name for a status, preferring the runtime's own table.
    pub fn error_name(&self, rc: OptixResult) -> String {
        if let Some(f) = self.table.optixGetErrorName {
            // SAFETY: OptiX returns a static NUL-terminated string for any code.
            let p = unsafe { f(rc) };
            if !p.is_null() {
                return unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned();
            }
        }
        optix_result_name(rc).to_string()
    }
}

static DEFAULT_API: OnceLock<std::result::Result<Arc<OptixApi>, String>> = OnceLock::new();

/// Load the OptiX runtime, either from `library` or from the default search list.
///
/// The default load is cached for the process.
pub fn load(library: Option<&Path>) -> Result<Arc<OptixApi>> {
    let loaded = match library {
        Some(path) => load_from(&[&path.to_string_lossy()]).map(Arc::new),
        None => DEFAULT_API
            .get_or_init(|| load_from(DEFAULT_LIBRARIES).map(Arc::new))
            .clone(),
    };
    loaded.map_err(|err| {
        EngineError::RuntimeUnavailable(format!(
            "{err}. The OptiX runtime ships with the NVIDIA driver; \
ensure the driver is installed and its libraries are on the loader path."
        ))
    })
}

fn load_from(candidates: &[&str]) -> std::result::Result<OptixApi, String> {
    if candidates.is_empty() {
        return Err("OptiX is not available on this platform".into());
    }

    let mut last_err = "no candidates".to_string();
    for candidate in candidates {
        match platform::open(candidate) {
            Ok(handle) => {
                let query: QueryFunctionTable =
                    platform::symbol(handle, "optixQueryFunctionTable")?;
                let table = query_table(query)?;
                return Ok(OptixApi {
                    table,
                    library: (*candidate).to_string(),
                });
            }
            Err(err) => last_err = err,
        }
    }
    Err(format!("failed to open {}: {last_err}", candidates.join("|")))
}

fn query_table(query: QueryFunctionTable) -> std::result::Result<OptixFunctionTable, String> {
    // SAFETY: every field is a nullable function pointer or raw pointer; all-zero is valid.
    let mut table: OptixFunctionTable = unsafe { std::mem::zeroed() };
    // SAFETY: table is writable storage of exactly the declared size.
    let rc = unsafe {
        query(
            OPTIX_ABI_VERSION,
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut table as *mut OptixFunctionTable as *mut c_void,
            std::mem::size_of::<OptixFunctionTable>(),
        )
    };
    if rc != OPTIX_SUCCESS {
        return Err(format!(
            "optixQueryFunctionTable(abi {OPTIX_ABI_VERSION}) failed with {rc} ({}); \
the installed driver may be too old",
            optix_result_name(rc)
        ));
    }
    Ok(table)
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;

    unsafe extern "C" {
        fn dlopen(filename: *const c_char, flags: i32) -> *mut c_void;
        fn dlerror() -> *const c_char;
        fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
    }

    const RTLD_NOW: i32 = 2;
    const RTLD_LOCAL: i32 = 0;

    fn last_error(fallback: &str) -> String {
        // SAFETY: dlerror returns thread-local C string or null.
        unsafe {
            let p = dlerror();
            if p.is_null() {
                fallback.to_string()
            } else {
                CStr::from_ptr(p).to_string_lossy().to_string()
            }
        }
    }

    pub(super) fn open(name: &str) -> std::result::Result<*mut c_void, String> {
        let soname = CString::new(name).map_err(|_| format!("invalid library name: {name}"))?;
        // SAFETY: valid NUL-terminated name and dlopen flags.
        let handle = unsafe { dlopen(soname.as_ptr(), RTLD_NOW | RTLD_LOCAL) };
        if handle.is_null() {
            Err(last_error("unknown dlopen error"))
        } else {
            Ok(handle)
        }
    }

    pub(super) fn symbol<T>(handle: *mut c_void, name: &'static str) -> std::result::Result<T, String> {
        let cname = CString::new(name).map_err(|_| format!("invalid symbol name: {name}"))?;
        // SAFETY: handle is a valid dlopen handle and cname is a valid C symbol name.
        let ptr = unsafe { dlsym(handle, cname.as_ptr()) };
        if ptr.is_null() {
            Err(format!("dlsym({name}) failed: {}", last_error("unknown dlsym error")))
        } else {
            // SAFETY: ptr points to a function with signature T.
            Ok(unsafe { std::mem::transmute_copy(&ptr) })
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::*;

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn LoadLibraryA(name: *const c_char) -> *mut c_void;
        fn GetProcAddress(module: *mut c_void, name: *const c_char) -> *mut c_void;
        fn GetLastError() -> u32;
    }

    pub(super) fn open(name: &str) -> std::result::Result<*mut c_void, String> {
        let cname = CString::new(name).map_err(|_| format!("invalid library name: {name}"))?;
        // SAFETY: valid NUL-terminated module name.
        let handle = unsafe { LoadLibraryA(cname.as_ptr()) };
        if handle.is_null() {
            // SAFETY: plain Win32 call.
            Err(format!("LoadLibrary failed with error {}", unsafe { GetLastError() }))
        } else {
            Ok(handle)
        }
    }

    pub(super) fn symbol<T>(handle: *mut c_void, name: &'static str) -> std::result::Result<T, String> {
        let cname = CString::new(name).map_err(|_| format!("invalid symbol name: {name}"))?;
        // SAFETY: handle is a loaded module and cname is a valid C string.
        let ptr = unsafe { GetProcAddress(handle, cname.as_ptr()) };
        if ptr.is_null() {
            Err(format!("GetProcAddress({name}) failed"))
        } else {
            // SAFETY: ptr points to a function with signature T.
            Ok(unsafe { std::mem::transmute_copy(&ptr) })
        }
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod platform {
    use super::*;

    pub(super) fn open(name: &str) -> std::result::Result<*mut c_void, String> {
        Err(format!("dynamic loading of {name} is not supported on this platform"))
    }

    pub(super) fn symbol<T>(_handle: *mut c_void, name: &'static str) -> std::result::Result<T, String> {
        Err(format!("symbol {name} unavailable on this platform"))
    }
}
