//! Guide flags and device guide buffers.
//!
//! [`GuideConfig`] fixes, once per run, which guides the engine is created
//! with: albedo whenever an albedo image is supplied, normals only together
//! with albedo, and motion flow exactly in temporal mode.  [`build_guides`]
//! then uploads the matching images into a [`GuideBundle`].

use nox_core::device::{DeviceAllocation, DeviceMemory};
use nox_core::error::{EngineError, Result};
use nox_core::ffi_types::{
    OPTIX_DENOISER_MODEL_KIND_HDR, OPTIX_DENOISER_MODEL_KIND_TEMPORAL, OPTIX_PIXEL_FORMAT_FLOAT2,
    OPTIX_PIXEL_FORMAT_FLOAT3, OptixDenoiserGuideLayer, OptixDenoiserModelKind,
    OptixDenoiserOptions,
};
use nox_core::image::{ComponentType, HostImage, PixelFormat};

use crate::adapter::{self, DeviceImage};

/// Validated guide capability flags for one engine instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuideConfig {
    guide_albedo: bool,
    guide_normal: bool,
    temporal: bool,
}

impl GuideConfig {
    /// Normals without albedo are dropped.
    pub fn new(has_albedo: bool, has_normals: bool, temporal: bool) -> Self {
        Self {
            guide_albedo: has_albedo,
            guide_normal: has_albedo && has_normals,
            temporal,
        }
    }

    #[inline]
    pub fn guide_albedo(&self) -> bool {
        self.guide_albedo
    }

    #[inline]
    pub fn guide_normal(&self) -> bool {
        self.guide_normal
    }

    #[inline]
    pub fn temporal(&self) -> bool {
        self.temporal
    }

    pub fn options(&self) -> OptixDenoiserOptions {
        OptixDenoiserOptions {
            guideAlbedo: self.guide_albedo as u32,
            guideNormal: self.guide_normal as u32,
        }
    }

    pub fn model_kind(&self) -> OptixDenoiserModelKind {
        if self.temporal {
            OPTIX_DENOISER_MODEL_KIND_TEMPORAL
        } else {
            OPTIX_DENOISER_MODEL_KIND_HDR
        }
    }
}

/// Convert left-handed normals to the engine's convention in place.
///
/// Negates X and Z of every pixel; Y is up in both conventions.  Applying
/// it twice restores the input.
pub fn flip_normals(normals: &mut HostImage) -> Result<()> {
    if normals.channel_count() < 3 {
        return Err(EngineError::ImageFormat(format!(
            "normal guide needs 3 channels, image has {}",
            normals.channel_count()
        )));
    }
    normals.for_each_pixel_f32_mut(|n| {
        n[0] = -n[0];
        n[2] = -n[2];
    })
}

/// Device-resident guides for one invocation.
pub struct GuideBundle<Buf> {
    albedo: Option<DeviceImage<Buf>>,
    normal: Option<DeviceImage<Buf>>,
    flow: Option<DeviceImage<Buf>>,
}

impl<Buf: DeviceAllocation> GuideBundle<Buf> {
    pub fn albedo(&self) -> Option<&DeviceImage<Buf>> {
        self.albedo.as_ref()
    }

    pub fn normal(&self) -> Option<&DeviceImage<Buf>> {
        self.normal.as_ref()
    }

    pub fn flow(&self) -> Option<&DeviceImage<Buf>> {
        self.flow.as_ref()
    }

    /// Engine guide layer; absent guides are unbound descriptors.
    pub fn layer(&self) -> OptixDenoiserGuideLayer {
        let bind = |img: &Option<DeviceImage<Buf>>| {
            img.as_ref().map(DeviceImage::descriptor).unwrap_or_default()
        };
        OptixDenoiserGuideLayer {
            albedo: bind(&self.albedo),
            normal: bind(&self.normal),
            flow: bind(&self.flow),
        }
    }

    /// Bound guides with their names, for resolution checks.
    pub fn bound(&self) -> impl Iterator<Item = (&'static str, &DeviceImage<Buf>)> {
        [
            ("albedo", self.albedo.as_ref()),
            ("normal", self.normal.as_ref()),
            ("flow", self.flow.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, img)| img.map(|img| (name, img)))
    }
}

/// Upload the guides `config` asks for.
///
/// Albedo is converted to RGB `F32`.  Normals are converted to `F32` in their
/// own layout and flipped on a private copy.  Flow is uploaded as-is as a
/// 2-channel float image.  An image the config requires but that is `None`
/// is an invariant violation.
pub fn build_guides<M: DeviceMemory>(
    memory: &M,
    config: &GuideConfig,
    albedo: Option<&HostImage>,
    normals: Option<&HostImage>,
    flow: Option<&HostImage>,
) -> Result<GuideBundle<M::Buffer>> {
    let albedo = if config.guide_albedo {
        let image = required(albedo, "albedo")?;
        let rgb = image.convert(PixelFormat::RGB, ComponentType::F32, false)?;
        Some(adapter::upload(memory, &rgb, OPTIX_PIXEL_FORMAT_FLOAT3, true)?)
    } else {
        None
    };

    let normal = if config.guide_normal {
        let image = required(normals, "normals")?;
        let mut working = image.convert(image.pixel_format(), ComponentType::F32, false)?;
        flip_normals(&mut working)?;
        Some(adapter::upload(memory, &working, OPTIX_PIXEL_FORMAT_FLOAT3, true)?)
    } else {
        None
    };

    let flow = if config.temporal {
        let image = required(flow, "flow")?;
        Some(adapter::upload(memory, image, OPTIX_PIXEL_FORMAT_FLOAT2, true)?)
    } else {
        None
    };

    Ok(GuideBundle {
        albedo,
        normal,
        flow,
    })
}

fn required<'a>(image: Option<&'a HostImage>, guide: &str) -> Result<&'a HostImage> {
    image.ok_or_else(|| {
        EngineError::InvariantViolation(format!("{guide} guide enabled but no {guide} image given"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::HostMemory;

    fn normals() -> HostImage {
        HostImage::from_f32(
            PixelFormat::XYZ,
            2,
            1,
            &[0.25, 0.5, -0.75, -1.0, 0.0, 1.0],
        )
        .unwrap()
    }

    #[test]
    fn flip_is_an_involution_on_x_and_z() {
        let original = normals();
        let mut img = original.clone();
        flip_normals(&mut img).unwrap();
        assert_eq!(img.to_f32_vec(), vec![-0.25, 0.5, 0.75, 1.0, 0.0, -1.0]);
        flip_normals(&mut img).unwrap();
        assert_eq!(img, original);
    }

    #[test]
    fn no_guides_means_no_capabilities() {
        let cfg = GuideConfig::new(false, false, false);
        assert_eq!(cfg.options(), OptixDenoiserOptions::default());
        assert_eq!(cfg.model_kind(), OPTIX_DENOISER_MODEL_KIND_HDR);
    }

    #[test]
    fn albedo_alone_never_enables_normals() {
        let cfg = GuideConfig::new(true, false, false);
        assert!(cfg.guide_albedo());
        assert!(!cfg.guide_normal());
    }

    #[test]
    fn normals_without_albedo_are_dropped() {
        let cfg = GuideConfig::new(false, true, false);
        assert!(!cfg.guide_albedo());
        assert!(!cfg.guide_normal());
    }

    #[test]
    fn temporal_selects_temporal_model() {
        let cfg = GuideConfig::new(true, true, true);
        assert_eq!(cfg.model_kind(), OPTIX_DENOISER_MODEL_KIND_TEMPORAL);
        assert_eq!(
            cfg.options(),
            OptixDenoiserOptions {
                guideAlbedo: 1,
                guideNormal: 1
            }
        );
    }

    #[test]
    fn build_flips_a_private_copy_of_normals() {
        let memory = HostMemory::new();
        let albedo = HostImage::from_f32(PixelFormat::RGB, 2, 1, &[0.5; 6]).unwrap();
        let source = normals();
        let cfg = GuideConfig::new(true, true, false);
        let bundle = build_guides(&memory, &cfg, Some(&albedo), Some(&source), None).unwrap();

        assert_eq!(source, normals(), "caller's normals are untouched");
        let uploaded = adapter::download(&memory, bundle.normal().unwrap()).unwrap();
        let mut flipped = normals();
        flip_normals(&mut flipped).unwrap();
        assert_eq!(uploaded, flipped.data());
        assert!(bundle.flow().is_none());
        assert!(bundle.layer().flow.is_unbound());
    }

    #[test]
    fn temporal_bundle_always_carries_flow() {
        let memory = HostMemory::new();
        let flow = HostImage::with_channels(&["U", "V"], 2, 1, &[0.0; 4]).unwrap();
        let cfg = GuideConfig::new(false, false, true);
        let bundle = build_guides(&memory, &cfg, None, None, Some(&flow)).unwrap();
        assert!(bundle.flow().is_some());
        assert!(bundle.albedo().is_none() && bundle.normal().is_none());
        let names: Vec<&str> = bundle.bound().map(|(n, _)| n).collect();
        assert_eq!(names, ["flow"]);
    }

    #[test]
    fn failed_build_releases_earlier_guides() {
        let memory = HostMemory::new();
        let albedo = HostImage::from_f32(PixelFormat::RGB, 2, 1, &[0.5; 6]).unwrap();
        let bad_normals = HostImage::with_channels(&["a", "b"], 2, 1, &[0.0; 4]).unwrap();
        let cfg = GuideConfig::new(true, true, false);
        assert!(build_guides(&memory, &cfg, Some(&albedo), Some(&bad_normals), None).is_err());
        assert!(memory.ledger().is_balanced());
    }
}
