//! Engine session typestate.
//!
//! ```text
//! create ─► Created ─compute_sizes─► Measured ─allocate─► Allocated
//!        ─setup─► Ready ─invoke─► Invoked ─destroy─► (buffers)
//! ```
//!
//! Each transition consumes the session, so calls out of order do not
//! compile.  The engine handle is destroyed exactly once: either by
//! [`EngineSession::destroy`], which returns the stage payload so the caller
//! can free guides before state and scratch, or by `Drop` on any early exit.

use tracing::{debug, warn};

use nox_core::backend::{CallKind, DenoiserBackend, check_optix};
use nox_core::device::{DeviceAllocation, DeviceMemory};
use nox_core::error::{EngineError, Result};
use nox_core::ffi_types::{
    CUstream, OPTIX_DENOISER_ALPHA_MODE_COPY, OPTIX_SUCCESS, OptixDenoiser, OptixDenoiserLayer,
    OptixDenoiserParams, OptixDenoiserSizes, OptixImage2D,
};

use crate::adapter::DeviceImage;
use crate::guides::{GuideBundle, GuideConfig};

// ─── Stages ─────────────────────────────────────────────────────────────────

/// Handle created, no resolution yet.
pub struct Created;

/// Memory requirements known for `width × height`.
pub struct Measured {
    width: u32,
    height: u32,
    sizes: OptixDenoiserSizes,
}

/// State and scratch buffers held by a session from allocation on.
pub struct SessionBuffers<Buf> {
    width: u32,
    height: u32,
    state: Buf,
    scratch: Buf,
}

impl<Buf: DeviceAllocation> SessionBuffers<Buf> {
    #[inline]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[inline]
    pub fn state_size(&self) -> usize {
        self.state.byte_len()
    }

    #[inline]
    pub fn scratch_size(&self) -> usize {
        self.scratch.byte_len()
    }
}

/// Buffers allocated, not yet bound.
pub struct Allocated<Buf>(SessionBuffers<Buf>);
/// Set up for the allocated resolution.
pub struct Ready<Buf>(SessionBuffers<Buf>);
/// At least one pass queued.
pub struct Invoked<Buf>(SessionBuffers<Buf>);

impl<Buf> Allocated<Buf> {
    pub fn into_buffers(self) -> SessionBuffers<Buf> {
        self.0
    }
}

impl<Buf> Ready<Buf> {
    pub fn into_buffers(self) -> SessionBuffers<Buf> {
        self.0
    }
}

impl<Buf> Invoked<Buf> {
    pub fn into_buffers(self) -> SessionBuffers<Buf> {
        self.0
    }
}

/// Auto-exposure scalar on the device.  Only [`EngineSession::estimate_intensity`]
/// produces one, so invocation cannot skip it.
pub struct Intensity<Buf>(Buf);

/// Images bound to the single denoise layer.
pub struct LayerImages<'a, Buf> {
    pub input: &'a DeviceImage<Buf>,
    pub previous_output: Option<&'a DeviceImage<Buf>>,
    pub output: &'a DeviceImage<Buf>,
}

// ─── Handle guard ───────────────────────────────────────────────────────────

struct HandleGuard<'b, B: DenoiserBackend + ?Sized> {
    backend: &'b B,
    raw: OptixDenoiser,
}

impl<B: DenoiserBackend + ?Sized> HandleGuard<'_, B> {
    fn release(self) -> Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        let rc = this.backend.destroy(this.raw);
        debug!(status = rc, "Denoiser destroyed");
        check_optix(rc, "optixDenoiserDestroy", CallKind::Invocation)
    }
}

impl<B: DenoiserBackend + ?Sized> Drop for HandleGuard<'_, B> {
    fn drop(&mut self) {
        let rc = self.backend.destroy(self.raw);
        if rc != OPTIX_SUCCESS {
            warn!(status = rc, "optixDenoiserDestroy failed during cleanup");
        } else {
            debug!("Denoiser destroyed during cleanup");
        }
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

/// One engine instance moving through its lifecycle.
///
/// Field order matters: the handle is destroyed before the stage's buffers
/// are freed when a session is dropped.
pub struct EngineSession<'b, B: DenoiserBackend + ?Sized, S> {
    handle: HandleGuard<'b, B>,
    config: GuideConfig,
    stream: CUstream,
    stage: S,
}

impl<'b, B: DenoiserBackend + ?Sized, S> EngineSession<'b, B, S> {
    #[inline]
    pub fn config(&self) -> &GuideConfig {
        &self.config
    }

    #[inline]
    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// Destroy the engine handle and hand back the stage payload.
    ///
    /// On failure the payload is dropped with the error.
    pub fn destroy(self) -> Result<S> {
        let EngineSession { handle, stage, .. } = self;
        handle.release()?;
        Ok(stage)
    }

    fn advance<T>(self, stage: T) -> EngineSession<'b, B, T> {
        EngineSession {
            handle: self.handle,
            config: self.config,
            stream: self.stream,
            stage,
        }
    }
}

impl<'b, B: DenoiserBackend + ?Sized> EngineSession<'b, B, Created> {
    /// Create an engine instance for `config` on `stream`.
    pub fn create(backend: &'b B, config: GuideConfig, stream: CUstream) -> Result<Self> {
        let mut raw: OptixDenoiser = std::ptr::null_mut();
        let rc = backend.create(config.model_kind(), &config.options(), &mut raw);
        check_optix(rc, "optixDenoiserCreate", CallKind::Configuration)?;
        debug!(
            backend = backend.name(),
            guide_albedo = config.guide_albedo(),
            guide_normal = config.guide_normal(),
            temporal = config.temporal(),
            "Denoiser created"
        );
        Ok(Self {
            handle: HandleGuard { backend, raw },
            config,
            stream,
            stage: Created,
        })
    }

    /// Query memory requirements for `width × height`.
    pub fn compute_sizes(self, width: u32, height: u32) -> Result<EngineSession<'b, B, Measured>> {
        let mut sizes = OptixDenoiserSizes::default();
        let rc = self
            .handle
            .backend
            .compute_memory_resources(self.handle.raw, width, height, &mut sizes);
        check_optix(rc, "optixDenoiserComputeMemoryResources", CallKind::Invocation)?;
        debug!(
            width,
            height,
            state_bytes = sizes.stateSizeInBytes,
            scratch_bytes = sizes.withoutOverlapScratchSizeInBytes,
            "Denoiser sized"
        );
        Ok(self.advance(Measured {
            width,
            height,
            sizes,
        }))
    }
}

impl<'b, B: DenoiserBackend + ?Sized> EngineSession<'b, B, Measured> {
    /// State buffer bytes required.
    pub fn state_size(&self) -> usize {
        self.stage.sizes.stateSizeInBytes
    }

    /// Scratch bytes required (single tile, no overlap).
    pub fn scratch_size(&self) -> usize {
        self.stage.sizes.withoutOverlapScratchSizeInBytes
    }

    /// Allocate state and scratch buffers.
    pub fn allocate<M: DeviceMemory>(
        self,
        memory: &M,
    ) -> Result<EngineSession<'b, B, Allocated<M::Buffer>>> {
        let state = memory.alloc(self.state_size())?;
        let scratch = memory.alloc(self.scratch_size())?;
        let (width, height) = (self.stage.width, self.stage.height);
        Ok(self.advance(Allocated(SessionBuffers {
            width,
            height,
            state,
            scratch,
        })))
    }
}

impl<'b, B: DenoiserBackend + ?Sized, Buf: DeviceAllocation> EngineSession<'b, B, Allocated<Buf>> {
    /// Bind state and scratch to the sized resolution.  Not retryable.
    pub fn setup(self) -> Result<EngineSession<'b, B, Ready<Buf>>> {
        let bufs = &self.stage.0;
        let rc = self.handle.backend.setup(
            self.handle.raw,
            self.stream,
            bufs.width,
            bufs.height,
            bufs.state.device_ptr(),
            bufs.state.byte_len(),
            bufs.scratch.device_ptr(),
            bufs.scratch.byte_len(),
        );
        check_optix(rc, "optixDenoiserSetup", CallKind::Configuration)?;
        debug!(width = bufs.width, height = bufs.height, "Denoiser set up");

        let EngineSession {
            handle,
            config,
            stream,
            stage: Allocated(bufs),
        } = self;
        Ok(EngineSession {
            handle,
            config,
            stream,
            stage: Ready(bufs),
        })
    }
}

impl<'b, B: DenoiserBackend + ?Sized, Buf: DeviceAllocation> EngineSession<'b, B, Ready<Buf>> {
    /// Compute the auto-exposure scalar of `input` into a new 4-byte buffer.
    pub fn estimate_intensity<M>(&self, memory: &M, input: &DeviceImage<Buf>) -> Result<Intensity<Buf>>
    where
        M: DeviceMemory<Buffer = Buf>,
    {
        let intensity = memory.alloc(std::mem::size_of::<f32>())?;
        let bufs = &self.stage.0;
        let rc = self.handle.backend.compute_intensity(
            self.handle.raw,
            self.stream,
            &input.descriptor(),
            intensity.device_ptr(),
            bufs.scratch.device_ptr(),
            bufs.scratch.byte_len(),
        );
        check_optix(rc, "optixDenoiserComputeIntensity", CallKind::Invocation)?;
        Ok(Intensity(intensity))
    }

    /// Queue one denoise pass writing `layer.output`.
    ///
    /// Alpha is copied, blending is off and no average color is supplied.
    /// Every bound image must match the set-up resolution.
    pub fn invoke(
        self,
        intensity: &Intensity<Buf>,
        guides: &GuideBundle<Buf>,
        layer: LayerImages<'_, Buf>,
    ) -> Result<EngineSession<'b, B, Invoked<Buf>>> {
        let bufs = &self.stage.0;
        let expected = (bufs.width, bufs.height);

        if self.config.temporal() && layer.previous_output.is_none() {
            return Err(EngineError::InvariantViolation(
                "temporal denoising requires a previous output image".into(),
            ));
        }
        let bound = [("input", Some(layer.input)), ("output", Some(layer.output))]
            .into_iter()
            .chain([("previous output", layer.previous_output)])
            .filter_map(|(name, img)| img.map(|img| (name, img)))
            .chain(guides.bound());
        for (name, img) in bound {
            if img.size() != expected {
                return Err(EngineError::Configuration {
                    call: "optixDenoiserInvoke",
                    detail: format!(
                        "layer check: {name} image is {}x{}, denoiser was set up for {}x{}",
                        img.width(),
                        img.height(),
                        expected.0,
                        expected.1
                    ),
                });
            }
        }

        let params = OptixDenoiserParams {
            denoiseAlpha: OPTIX_DENOISER_ALPHA_MODE_COPY,
            hdrIntensity: intensity.0.device_ptr(),
            blendFactor: 0.0,
            hdrAverageColor: 0,
        };
        let layers = [OptixDenoiserLayer {
            input: layer.input.descriptor(),
            previousOutput: layer
                .previous_output
                .map(DeviceImage::descriptor)
                .unwrap_or_else(OptixImage2D::default),
            output: layer.output.descriptor(),
        }];
        let guide = guides.layer();

        let rc = self.handle.backend.invoke(
            self.handle.raw,
            self.stream,
            &params,
            bufs.state.device_ptr(),
            bufs.state.byte_len(),
            &guide,
            &layers,
            0,
            0,
            bufs.scratch.device_ptr(),
            bufs.scratch.byte_len(),
        );
        check_optix(rc, "optixDenoiserInvoke", CallKind::Invocation)?;
        debug!(width = expected.0, height = expected.1, "Denoiser invoked");

        let EngineSession {
            handle,
            config,
            stream,
            stage: Ready(bufs),
        } = self;
        Ok(EngineSession {
            handle,
            config,
            stream,
            stage: Invoked(bufs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter;
    use crate::mock::{HostMemory, PassthroughDenoiser};
    use nox_core::ffi_types::{OPTIX_ERROR_INTERNAL_ERROR, OPTIX_PIXEL_FORMAT_FLOAT3};
    use nox_core::image::{HostImage, PixelFormat};

    fn rgb(w: u32, h: u32) -> HostImage {
        let values: Vec<f32> = (0..w * h * 3).map(|v| v as f32 / 8.0).collect();
        HostImage::from_f32(PixelFormat::RGB, w, h, &values).unwrap()
    }

    #[test]
    fn full_lifecycle_runs_calls_in_order() {
        let memory = HostMemory::new();
        let engine = PassthroughDenoiser::new(memory.heap());
        let cfg = GuideConfig::new(false, false, false);
        let guides = crate::guides::build_guides(&memory, &cfg, None, None, None).unwrap();

        let session = EngineSession::create(&engine, cfg, memory.stream())
            .unwrap()
            .compute_sizes(4, 4)
            .unwrap();
        assert_eq!(session.state_size(), PassthroughDenoiser::state_size(4, 4));
        let session = session.allocate(&memory).unwrap().setup().unwrap();

        let host = rgb(4, 4);
        let input = adapter::upload(&memory, &host, OPTIX_PIXEL_FORMAT_FLOAT3, true).unwrap();
        let output = adapter::upload(&memory, &host, OPTIX_PIXEL_FORMAT_FLOAT3, false).unwrap();
        let intensity = session.estimate_intensity(&memory, &input).unwrap();
        let session = session
            .invoke(
                &intensity,
                &guides,
                LayerImages {
                    input: &input,
                    previous_output: None,
                    output: &output,
                },
            )
            .unwrap();
        let bufs = session.destroy().unwrap().into_buffers();
        assert_eq!(bufs.size(), (4, 4));

        assert_eq!(
            engine.calls(),
            [
                "optixDenoiserCreate",
                "optixDenoiserComputeMemoryResources",
                "optixDenoiserSetup",
                "optixDenoiserComputeIntensity",
                "optixDenoiserInvoke",
                "optixDenoiserDestroy",
            ]
        );
        let params = engine.last_params().unwrap();
        assert_eq!(params.denoiseAlpha, OPTIX_DENOISER_ALPHA_MODE_COPY);
        assert_eq!(params.blendFactor, 0.0);
        assert_eq!(params.hdrAverageColor, 0);
        assert_eq!(engine.live_instances(), 0);
    }

    #[test]
    fn trait_object_backend_drives_the_session() {
        let memory = HostMemory::new();
        let engine = PassthroughDenoiser::new(memory.heap());
        let backend: &dyn DenoiserBackend = &engine;
        let session: EngineSession<'_, dyn DenoiserBackend, Measured> =
            EngineSession::create(backend, GuideConfig::new(true, false, false), memory.stream())
                .unwrap()
                .compute_sizes(3, 2)
                .unwrap();
        assert_eq!(session.scratch_size(), PassthroughDenoiser::scratch_size(3, 2));
        let session = session.allocate(&memory).unwrap().setup().unwrap();
        assert_eq!(session.stage().0.size(), (3, 2));
        session.destroy().unwrap();
        assert_eq!(engine.live_instances(), 0);
        assert!(memory.ledger().is_balanced());
    }

    #[test]
    fn create_failure_is_configuration_error() {
        let memory = HostMemory::new();
        let engine = PassthroughDenoiser::new(memory.heap());
        engine.fail_on("optixDenoiserCreate", OPTIX_ERROR_INTERNAL_ERROR);
        let err = EngineSession::create(&engine, GuideConfig::new(true, true, false), memory.stream())
            .err()
            .expect("create must fail");
        assert!(matches!(err, EngineError::Configuration { call: "optixDenoiserCreate", .. }));
    }

    #[test]
    fn dropping_a_session_destroys_handle_and_frees_buffers() {
        let memory = HostMemory::new();
        let engine = PassthroughDenoiser::new(memory.heap());
        let session = EngineSession::create(&engine, GuideConfig::new(false, false, false), memory.stream())
            .unwrap()
            .compute_sizes(8, 8)
            .unwrap()
            .allocate(&memory)
            .unwrap();
        assert_eq!(memory.ledger().allocations, 2);
        drop(session);
        assert_eq!(engine.live_instances(), 0);
        assert!(memory.ledger().is_balanced());
        assert_eq!(engine.calls().last(), Some(&"optixDenoiserDestroy"));
    }

    #[test]
    fn setup_failure_is_configuration_error_and_cleans_up() {
        let memory = HostMemory::new();
        let engine = PassthroughDenoiser::new(memory.heap());
        engine.fail_on("optixDenoiserSetup", OPTIX_ERROR_INTERNAL_ERROR);
        let err = EngineSession::create(&engine, GuideConfig::new(false, false, false), memory.stream())
            .unwrap()
            .compute_sizes(2, 2)
            .unwrap()
            .allocate(&memory)
            .unwrap()
            .setup()
            .err()
            .expect("setup must fail");
        assert!(matches!(err, EngineError::Configuration { call: "optixDenoiserSetup", .. }));
        assert_eq!(engine.live_instances(), 0);
        assert!(memory.ledger().is_balanced());
    }

    #[test]
    fn mismatched_layer_is_rejected_before_invoke() {
        let memory = HostMemory::new();
        let engine = PassthroughDenoiser::new(memory.heap());
        let cfg = GuideConfig::new(false, false, false);
        let guides = crate::guides::build_guides(&memory, &cfg, None, None, None).unwrap();
        let session = EngineSession::create(&engine, cfg, memory.stream())
            .unwrap()
            .compute_sizes(4, 4)
            .unwrap()
            .allocate(&memory)
            .unwrap()
            .setup()
            .unwrap();
        let input = adapter::upload(&memory, &rgb(4, 4), OPTIX_PIXEL_FORMAT_FLOAT3, true).unwrap();
        let output = adapter::upload(&memory, &rgb(4, 2), OPTIX_PIXEL_FORMAT_FLOAT3, false).unwrap();
        let intensity = session.estimate_intensity(&memory, &input).unwrap();
        let err = session
            .invoke(
                &intensity,
                &guides,
                LayerImages {
                    input: &input,
                    previous_output: None,
                    output: &output,
                },
            )
            .err()
            .expect("size mismatch must fail");
        assert!(matches!(err, EngineError::Configuration { call: "optixDenoiserInvoke", .. }));
        assert!(err.to_string().contains("layer check: output image is 4x2"));
        assert!(!engine.calls().contains(&"optixDenoiserInvoke"));
        assert_eq!(engine.live_instances(), 0);
    }

    #[test]
    fn destroy_failure_still_frees_buffers() {
        let memory = HostMemory::new();
        let engine = PassthroughDenoiser::new(memory.heap());
        engine.fail_on("optixDenoiserDestroy", OPTIX_ERROR_INTERNAL_ERROR);
        let session = EngineSession::create(&engine, GuideConfig::new(false, false, false), memory.stream())
            .unwrap()
            .compute_sizes(2, 2)
            .unwrap()
            .allocate(&memory)
            .unwrap();
        let err = session.destroy().err().expect("destroy must fail");
        assert!(matches!(err, EngineError::BackendInvocation { call: "optixDenoiserDestroy", .. }));
        assert!(memory.ledger().is_balanced());
        let destroys = engine
            .calls()
            .iter()
            .filter(|c| **c == "optixDenoiserDestroy")
            .count();
        assert_eq!(destroys, 1, "handle is destroyed exactly once");
    }

    #[test]
    fn intensity_buffer_holds_one_float() {
        let memory = HostMemory::new();
        let engine = PassthroughDenoiser::new(memory.heap());
        let session = EngineSession::create(&engine, GuideConfig::new(false, false, false), memory.stream())
            .unwrap()
            .compute_sizes(1, 1)
            .unwrap()
            .allocate(&memory)
            .unwrap()
            .setup()
            .unwrap();
        let host = HostImage::from_f32(PixelFormat::RGB, 1, 1, &[1.0, 1.0, 1.0]).unwrap();
        let input = adapter::upload(&memory, &host, OPTIX_PIXEL_FORMAT_FLOAT3, true).unwrap();
        let Intensity(buf) = session.estimate_intensity(&memory, &input).unwrap();
        assert_eq!(buf.byte_len(), 4);
        let bytes = memory.heap().read(buf.device_ptr(), 4).unwrap();
        let value = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert!((value - 1.0).abs() < 1e-6);
    }
}
