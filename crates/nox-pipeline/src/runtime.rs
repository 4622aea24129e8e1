//! CLI/runtime bridge helpers.
//!
//! Keeps CUDA and OptiX composition inside `nox-pipeline` so callers can
//! depend on the pipeline without importing the backend crates directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use nox_core::context::GpuContext;
use nox_core::error::{EngineError, Result};
use nox_optix::OptixBackend;

use crate::pipeline::Denoiser;

/// Runtime settings, from a JSON file and/or CLI flags.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// CUDA device ordinal.
    pub device: usize,
    /// Explicit OptiX driver library instead of the default search.
    pub optix_library: Option<PathBuf>,
    /// Enable OptiX validation mode (slow).
    pub validation_mode: bool,
    /// Hard VRAM cap in MiB.  `None` or 0 = unlimited.
    pub vram_limit_mib: Option<usize>,
}

impl RuntimeConfig {
    pub fn from_json_str(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|err| EngineError::Config(format!("Invalid runtime config JSON: {err}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!(
                "Failed to read runtime config from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }
}

/// CUDA device plus OptiX engine, ready to denoise.
///
/// Field order matters: the OptiX device context is destroyed before the
/// CUDA context it was created on.
pub struct Runtime {
    backend: OptixBackend,
    ctx: Arc<GpuContext>,
}

impl Runtime {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let ctx = GpuContext::new(config.device)?;
        if let Some(vram_limit_mib) = config.vram_limit_mib
            && vram_limit_mib > 0
        {
            ctx.set_strict_vram_limit(true);
            ctx.set_vram_limit(vram_limit_mib * 1024 * 1024);
        }
        let backend = OptixBackend::new(config.validation_mode, config.optix_library.as_deref())?;
        info!(
            device = config.device,
            library = backend.library(),
            "Denoise runtime ready"
        );
        Ok(Self { backend, ctx })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    pub fn backend(&self) -> &OptixBackend {
        &self.backend
    }

    pub fn denoiser(&self) -> Denoiser<'_, GpuContext, OptixBackend> {
        Denoiser::new(self.ctx.as_ref(), &self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.device, 0);
        assert!(!cfg.validation_mode);
    }

    #[test]
    fn full_config_parses() {
        let cfg = RuntimeConfig::from_json_str(
            r#"{"device": 1, "optix_library": "/opt/nvidia/libnvoptix.so.1",
                "validation_mode": true, "vram_limit_mib": 2048}"#,
        )
        .unwrap();
        assert_eq!(cfg.device, 1);
        assert_eq!(
            cfg.optix_library.as_deref(),
            Some(Path::new("/opt/nvidia/libnvoptix.so.1"))
        );
        assert!(cfg.validation_mode);
        assert_eq!(cfg.vram_limit_mib, Some(2048));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = RuntimeConfig::from_json_str(r#"{"blend_factor": 0.5}"#)
            .expect_err("unknown key must fail");
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("blend_factor"));
        assert_eq!(err.error_code(), 400);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = RuntimeConfig::from_json_file(Path::new("/nonexistent/nox.json"))
            .expect_err("missing file must fail");
        assert!(err.to_string().contains("/nonexistent/nox.json"));
    }
}
