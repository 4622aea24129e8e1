//! Denoise entry points.
//!
//! [`Denoiser`] sequences one engine run per call:
//!
//! 1. Convert the noisy (and previous) image to RGB `F32`.
//! 2. Create, size, allocate and set up an [`EngineSession`].
//! 3. Upload input (and previous output), reserve the output, estimate intensity.
//! 4. Upload guides, invoke, read the output back and synchronize.
//! 5. Destroy the engine, then free guides, then layers and session buffers.
//!
//! Every buffer is an RAII value, so an error at any step releases whatever
//! was allocated before it.

use std::time::Instant;

use tracing::info;

use nox_core::backend::DenoiserBackend;
use nox_core::device::DeviceMemory;
use nox_core::error::Result;
use nox_core::ffi_types::OPTIX_PIXEL_FORMAT_FLOAT3;
use nox_core::image::{ComponentType, HostImage, PixelFormat};

use crate::adapter;
use crate::channels::{self, ChannelSpec};
use crate::guides::{self, GuideConfig};
use crate::session::{EngineSession, LayerImages};

/// Denoiser bound to one device allocator and one engine backend.
pub struct Denoiser<'a, M: DeviceMemory, B: DenoiserBackend + ?Sized> {
    memory: &'a M,
    backend: &'a B,
}

impl<'a, M: DeviceMemory, B: DenoiserBackend + ?Sized> Denoiser<'a, M, B> {
    pub fn new(memory: &'a M, backend: &'a B) -> Self {
        Self { memory, backend }
    }

    /// Single-frame denoise.
    ///
    /// `normals` is ignored without `albedo`.  The result has the size,
    /// pixel format and component type of `noisy`.
    pub fn denoise(
        &self,
        noisy: &HostImage,
        albedo: Option<&HostImage>,
        normals: Option<&HostImage>,
    ) -> Result<HostImage> {
        self.run(noisy, None, albedo, normals)
    }

    /// Temporal denoise using the previous frame's result and a motion-flow field.
    ///
    /// `flow` is a 2-channel `F32` image.  `previous` must have the size of
    /// `noisy`; a mismatch is a configuration error.
    pub fn denoise_temporal(
        &self,
        noisy: &HostImage,
        flow: &HostImage,
        previous: &HostImage,
        albedo: Option<&HostImage>,
        normals: Option<&HostImage>,
    ) -> Result<HostImage> {
        self.run(noisy, Some((flow, previous)), albedo, normals)
    }

    /// Single-frame denoise of a multi-layer render.
    ///
    /// Layers are picked by name from `spec`.  Non-multi-layer images are
    /// denoised directly without guides.
    pub fn denoise_channels(&self, image: &HostImage, spec: &ChannelSpec) -> Result<HostImage> {
        if image.pixel_format() != PixelFormat::MultiChannel {
            return self.denoise(image, None, None);
        }
        let located = channels::locate(image, spec)?;
        self.denoise(
            &located.beauty,
            located.albedo.as_ref(),
            located.normals.as_ref(),
        )
    }

    fn run(
        &self,
        noisy: &HostImage,
        temporal: Option<(&HostImage, &HostImage)>,
        albedo: Option<&HostImage>,
        normals: Option<&HostImage>,
    ) -> Result<HostImage> {
        let started = Instant::now();
        let memory = self.memory;
        let config = GuideConfig::new(albedo.is_some(), normals.is_some(), temporal.is_some());
        let (width, height) = noisy.size();

        let noisy_rgb = noisy.convert(PixelFormat::RGB, ComponentType::F32, false)?;
        let previous_rgb = temporal
            .map(|(_, prev)| prev.convert(PixelFormat::RGB, ComponentType::F32, false))
            .transpose()?;

        let session = EngineSession::create(self.backend, config, memory.stream())?
            .compute_sizes(width, height)?
            .allocate(memory)?
            .setup()?;

        let input = adapter::upload(memory, &noisy_rgb, OPTIX_PIXEL_FORMAT_FLOAT3, true)?;
        let previous = previous_rgb
            .as_ref()
            .map(|img| adapter::upload(memory, img, OPTIX_PIXEL_FORMAT_FLOAT3, true))
            .transpose()?;
        let output = adapter::upload(memory, &noisy_rgb, OPTIX_PIXEL_FORMAT_FLOAT3, false)?;
        let intensity = session.estimate_intensity(memory, &input)?;

        let guides = guides::build_guides(
            memory,
            &config,
            albedo,
            normals,
            temporal.map(|(flow, _)| flow),
        )?;

        let session = session.invoke(
            &intensity,
            &guides,
            LayerImages {
                input: &input,
                previous_output: previous.as_ref(),
                output: &output,
            },
        )?;
        let data = adapter::download(memory, &output)?;

        let session_buffers = session.destroy()?;
        drop(guides);
        drop((input, previous, output, intensity));
        drop(session_buffers);

        let denoised = HostImage::from_raw(PixelFormat::RGB, ComponentType::F32, width, height, data)?;
        let denoised = restore_layout(denoised, noisy)?;

        info!(
            width,
            height,
            temporal = config.temporal(),
            guide_albedo = config.guide_albedo(),
            guide_normal = config.guide_normal(),
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Denoise complete"
        );
        Ok(denoised)
    }
}

/// Bring the RGB `F32` engine output back to the layout of `source`.
///
/// The engine only sees color, so an alpha channel is carried over from
/// `source` unchanged.
fn restore_layout(denoised: HostImage, source: &HostImage) -> Result<HostImage> {
    let format = source.pixel_format();
    if format == PixelFormat::RGB && source.component() == ComponentType::F32 {
        return Ok(denoised);
    }
    let Some(alpha) = format.alpha_index() else {
        return denoised.convert(format, source.component(), false);
    };

    let channels = source.channel_count();
    let mut values = denoised
        .convert(format, ComponentType::F32, false)?
        .to_f32_vec();
    for (pixel, out) in values.chunks_exact_mut(channels).enumerate() {
        out[alpha] = source.sample(pixel * channels + alpha);
    }
    let (width, height) = source.size();
    let restored = HostImage::from_f32(format, width, height, &values)?;
    if source.component() == ComponentType::F32 {
        Ok(restored)
    } else {
        restored.convert(format, source.component(), false)
    }
}
