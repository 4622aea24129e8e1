//! Beauty / guide layer lookup in multi-layer renders.

use nox_core::error::{EngineError, Result};
use nox_core::image::{HostImage, PixelFormat, ROOT_LAYER};

/// Layer names to pull out of a multi-layer image.
///
/// An empty guide name means the guide is not requested.  An empty beauty
/// name selects the root layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelSpec {
    pub beauty: String,
    pub albedo: String,
    pub normals: String,
}

impl ChannelSpec {
    pub fn new(
        beauty: impl Into<String>,
        albedo: impl Into<String>,
        normals: impl Into<String>,
    ) -> Self {
        Self {
            beauty: beauty.into(),
            albedo: albedo.into(),
            normals: normals.into(),
        }
    }
}

/// Sub-images selected by [`locate`].
#[derive(Clone, Debug, PartialEq)]
pub struct Located {
    pub beauty: HostImage,
    pub albedo: Option<HostImage>,
    pub normals: Option<HostImage>,
}

/// Select the beauty, albedo and normals layers named by `spec`.
///
/// Images that are not multi-layer are returned as the beauty image with no
/// guides.  Layers are scanned once, stopping as soon as every requested
/// name has been matched.  A missing guide layer is omitted; a missing
/// beauty layer is an error listing the layers present.
pub fn locate(image: &HostImage, spec: &ChannelSpec) -> Result<Located> {
    if image.pixel_format() != PixelFormat::MultiChannel {
        return Ok(Located {
            beauty: image.clone(),
            albedo: None,
            normals: None,
        });
    }

    let beauty_name = if spec.beauty.is_empty() {
        ROOT_LAYER
    } else {
        spec.beauty.as_str()
    };

    let mut beauty = None;
    let mut albedo = None;
    let mut normals = None;
    for (name, layer) in image.split() {
        // A layer may serve more than one role.
        if !spec.albedo.is_empty() && name == spec.albedo && albedo.is_none() {
            albedo = Some(layer.clone());
        }
        if !spec.normals.is_empty() && name == spec.normals && normals.is_none() {
            normals = Some(layer.clone());
        }
        if name == beauty_name && beauty.is_none() {
            beauty = Some(layer);
        }

        let done = beauty.is_some()
            && (spec.albedo.is_empty() || albedo.is_some())
            && (spec.normals.is_empty() || normals.is_some());
        if done {
            break;
        }
    }

    let Some(beauty) = beauty else {
        return Err(EngineError::ChannelNotFound {
            channel: beauty_name.to_string(),
            available: image.to_string(),
        });
    };
    Ok(Located {
        beauty,
        albedo,
        normals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render() -> HostImage {
        let names = [
            "beauty.R", "beauty.G", "beauty.B", "albedo.R", "albedo.G", "albedo.B", "normals.X",
            "normals.Y", "normals.Z",
        ];
        let values: Vec<f32> = (0..9 * 4).map(|v| v as f32 / 10.0).collect();
        HostImage::with_channels(&names, 2, 2, &values).unwrap()
    }

    #[test]
    fn locates_named_layers_matching_split() {
        let image = render();
        let layers = image.split();
        let found = locate(&image, &ChannelSpec::new("beauty", "albedo", "normals")).unwrap();
        assert_eq!(found.beauty, layers[0].1);
        assert_eq!(found.albedo.as_ref(), Some(&layers[1].1));
        assert_eq!(found.normals.as_ref(), Some(&layers[2].1));
        assert_eq!(found.normals.unwrap().pixel_format(), PixelFormat::XYZ);
    }

    #[test]
    fn missing_beauty_lists_available_layers() {
        let err = locate(&render(), &ChannelSpec::new("color", "albedo", ""))
            .expect_err("beauty layer is absent");
        let msg = err.to_string();
        assert!(msg.contains("'color'"));
        assert!(msg.contains("beauty, albedo, normals"));
        assert_eq!(err.error_code(), 300);
    }

    #[test]
    fn missing_guides_are_omitted() {
        let found = locate(&render(), &ChannelSpec::new("beauty", "diffuse", "")).unwrap();
        assert!(found.albedo.is_none());
        assert!(found.normals.is_none());
    }

    #[test]
    fn empty_guide_names_are_not_requested() {
        let found = locate(&render(), &ChannelSpec::new("beauty", "", "")).unwrap();
        assert!(found.albedo.is_none());
        assert!(found.normals.is_none());
    }

    #[test]
    fn empty_beauty_selects_root_layer() {
        let image =
            HostImage::with_channels(&["R", "G", "B", "albedo.R", "albedo.G", "albedo.B"], 1, 1, &[
                1.0, 2.0, 3.0, 4.0, 5.0, 6.0,
            ])
            .unwrap();
        let found = locate(&image, &ChannelSpec::new("", "albedo", "")).unwrap();
        assert_eq!(found.beauty.to_f32_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(found.albedo.unwrap().to_f32_vec(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn one_layer_can_be_beauty_and_albedo() {
        let image =
            HostImage::with_channels(&["rgb.R", "rgb.G", "rgb.B"], 1, 1, &[0.2, 0.4, 0.6]).unwrap();
        let found = locate(&image, &ChannelSpec::new("rgb", "rgb", "")).unwrap();
        assert_eq!(found.beauty.to_f32_vec(), vec![0.2, 0.4, 0.6]);
        assert_eq!(found.albedo.as_ref(), Some(&found.beauty));
        assert!(found.normals.is_none());
    }

    #[test]
    fn plain_image_bypasses_lookup() {
        let image = HostImage::from_f32(PixelFormat::RGB, 1, 1, &[0.1, 0.2, 0.3]).unwrap();
        let found = locate(&image, &ChannelSpec::new("missing", "albedo", "normals")).unwrap();
        assert_eq!(found.beauty, image);
        assert!(found.albedo.is_none() && found.normals.is_none());
    }
}
