//! Typed error hierarchy for the denoise engine.
//!
//! Uses `thiserror` for library-grade errors.  Every variant maps to a
//! stable integer code via [`EngineError::error_code`] so the CLI can use it
//! as a process exit status without string parsing.

use crate::ffi_types::{OptixResult, optix_result_name};

/// All errors originating from the nox engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── CUDA ──────────────────────────────────────────────────────────
    #[error("CUDA driver error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    // ── Denoiser engine ──────────────────────────────────────────────
    #[error("Denoiser rejected configuration in {call}: {detail}")]
    Configuration { call: &'static str, detail: String },

    #[error("{call} failed with OptiX status {code} ({name})")]
    BackendInvocation {
        call: &'static str,
        code: OptixResult,
        name: &'static str,
    },

    #[error("OptiX runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    // ── Images / channels ────────────────────────────────────────────
    #[error("Could not find rendered image with channel name '{channel}' in:\n{available}")]
    ChannelNotFound { channel: String, available: String },

    #[error("Image format error: {0}")]
    ImageFormat(String),

    #[error("Buffer size mismatch: need {need} bytes, have {have}")]
    BufferSize { need: usize, have: usize },

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("Configuration file error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Device resources ─────────────────────────────────────────────
    #[error("Device allocation of {requested} bytes failed: {detail}")]
    ResourceExhausted { requested: usize, detail: String },

    #[error("VRAM limit exceeded: {would_be_bytes} bytes would exceed cap of {limit_bytes} bytes")]
    VramLimitExceeded {
        limit_bytes: usize,
        would_be_bytes: usize,
    },

    // ── Invariants ───────────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Map a non-success status from a creation/setup call.
    pub fn configuration(call: &'static str, code: OptixResult) -> Self {
        Self::Configuration {
            call,
            detail: format!("OptiX status {code} ({})", optix_result_name(code)),
        }
    }

    /// Map a non-success status from any other engine call.
    pub fn backend(call: &'static str, code: OptixResult) -> Self {
        Self::BackendInvocation {
            call,
            code,
            name: optix_result_name(code),
        }
    }

    /// Stable integer error code.
    ///
    /// - 1xx: CUDA/driver
    /// - 2xx: Denoiser engine
    /// - 3xx: Images and channels
    /// - 4xx: Pipeline surfaces
    /// - 5xx: Device resources
    /// - 6xx: Invariants
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Cuda(_) => 100,
            Self::Configuration { .. } => 200,
            Self::BackendInvocation { .. } => 201,
            Self::RuntimeUnavailable(_) => 202,
            Self::ChannelNotFound { .. } => 300,
            Self::ImageFormat(_) => 301,
            Self::BufferSize { .. } => 302,
            Self::Config(_) => 400,
            Self::Io(_) => 401,
            Self::ResourceExhausted { .. } => 500,
            Self::VramLimitExceeded { .. } => 501,
            Self::InvariantViolation(_) => 600,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi_types::OPTIX_ERROR_INVALID_VALUE;

    #[test]
    fn backend_error_carries_call_and_status() {
        let err = EngineError::backend("optixDenoiserInvoke", OPTIX_ERROR_INVALID_VALUE);
        let msg = err.to_string();
        assert!(msg.contains("optixDenoiserInvoke"));
        assert!(msg.contains("7001"));
        assert!(msg.contains("OPTIX_ERROR_INVALID_VALUE"));
        assert_eq!(err.error_code(), 201);
    }

    #[test]
    fn configuration_error_names_the_call() {
        let err = EngineError::configuration("optixDenoiserCreate", OPTIX_ERROR_INVALID_VALUE);
        assert!(err.to_string().contains("optixDenoiserCreate"));
        assert_eq!(err.error_code(), 200);
    }
}
