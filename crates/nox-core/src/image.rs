//! Host-resident image container.
//!
//! [`HostImage`] is the host side of every transfer: renderer outputs come in
//! as host images, the device adapter uploads their raw bytes, and the
//! denoised result is wrapped back into one.  Pixels are interleaved
//! (`[c0 c1 c2 c0 c1 c2 ...]`) in native byte order so the payload can be
//! copied to device memory verbatim.
//!
//! # Multi-layer images
//!
//! A [`PixelFormat::MultiChannel`] image carries free-form channel names.
//! Channels named `layer.suffix` belong to `layer`; unprefixed channels
//! belong to the root layer [`ROOT_LAYER`].  [`HostImage::split`] turns such
//! an image into one sub-image per layer, inferring each layer's pixel format
//! from its suffixes.

use std::fmt;

use crate::error::{EngineError, Result};

/// Layer name assigned to channels without a `layer.` prefix.
pub const ROOT_LAYER: &str = "<root>";

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Channel semantics of a host image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Single luminance channel.
    Y,
    /// Luminance + alpha.
    YA,
    /// Linear RGB.
    RGB,
    /// Linear RGB + alpha.
    RGBA,
    /// Three-component vector data (e.g. shading normals).
    XYZ,
    /// Arbitrary named channels, possibly several layers.
    MultiChannel,
}

impl PixelFormat {
    /// Canonical channel names, empty for [`PixelFormat::MultiChannel`].
    pub const fn channel_names(self) -> &'static [&'static str] {
        match self {
            Self::Y => &["Y"],
            Self::YA => &["Y", "A"],
            Self::RGB => &["R", "G", "B"],
            Self::RGBA => &["R", "G", "B", "A"],
            Self::XYZ => &["X", "Y", "Z"],
            Self::MultiChannel => &[],
        }
    }

    /// Index of the alpha channel, if the format has one.
    #[inline]
    pub const fn alpha_index(self) -> Option<usize> {
        match self {
            Self::YA => Some(1),
            Self::RGBA => Some(3),
            _ => None,
        }
    }

    fn from_suffixes(suffixes: &[&str]) -> Self {
        match suffixes {
            ["Y"] => Self::Y,
            ["Y", "A"] => Self::YA,
            ["R", "G", "B"] => Self::RGB,
            ["R", "G", "B", "A"] => Self::RGBA,
            ["X", "Y", "Z"] => Self::XYZ,
            _ => Self::MultiChannel,
        }
    }
}

// ─── Component type ─────────────────────────────────────────────────────────

/// Storage type of one channel value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentType {
    /// Unsigned 8-bit, normalized to `[0, 1]`.
    U8,
    /// Unsigned 16-bit, normalized to `[0, 1]`.
    U16,
    /// 32-bit IEEE float, stored as-is.
    F32,
}

impl ComponentType {
    /// Bytes per channel value.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::F32 => 4,
        }
    }

    #[inline]
    fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            Self::U8 => f32::from(bytes[0]) / 255.0,
            Self::U16 => f32::from(u16::from_ne_bytes([bytes[0], bytes[1]])) / 65535.0,
            Self::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    #[inline]
    fn encode(self, value: f32, out: &mut Vec<u8>) {
        match self {
            Self::U8 => out.push((value.clamp(0.0, 1.0) * 255.0).round() as u8),
            Self::U16 => {
                out.extend_from_slice(&((value.clamp(0.0, 1.0) * 65535.0).round() as u16).to_ne_bytes())
            }
            Self::F32 => out.extend_from_slice(&value.to_ne_bytes()),
        }
    }
}

// ─── HostImage ───────────────────────────────────────────────────────────────

/// Host-resident interleaved pixel buffer.
///
/// Invariant: `data.len() == width × height × channel_count × component.size()`
/// and `channel_names.len() == channel_count`.
#[derive(Clone, Debug, PartialEq)]
pub struct HostImage {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    component: ComponentType,
    channel_names: Vec<String>,
    data: Vec<u8>,
}

impl HostImage {
    /// Zero-filled image with the canonical channels of `pixel_format`.
    ///
    /// Fails for [`PixelFormat::MultiChannel`]; use [`HostImage::with_channels`].
    pub fn new(
        pixel_format: PixelFormat,
        component: ComponentType,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let names = canonical_names(pixel_format)?;
        let len = (width as usize) * (height as usize) * names.len() * component.size();
        Ok(Self {
            width,
            height,
            pixel_format,
            component,
            channel_names: names,
            data: vec![0; len],
        })
    }

    /// Wrap an existing payload.  `data` must match the image's byte size.
    pub fn from_raw(
        pixel_format: PixelFormat,
        component: ComponentType,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Result<Self> {
        let names = canonical_names(pixel_format)?;
        Self::assemble(pixel_format, component, width, height, names, data)
    }

    /// Build an `F32` image with canonical channels from interleaved values.
    pub fn from_f32(
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
        values: &[f32],
    ) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_raw(pixel_format, ComponentType::F32, width, height, data)
    }

    /// Build a multi-channel `F32` image from channel names and interleaved values.
    pub fn with_channels<S: AsRef<str>>(
        channel_names: &[S],
        width: u32,
        height: u32,
        values: &[f32],
    ) -> Result<Self> {
        if channel_names.is_empty() {
            return Err(EngineError::ImageFormat(
                "multi-channel image needs at least one channel name".into(),
            ));
        }
        let names = channel_names.iter().map(|n| n.as_ref().to_string()).collect();
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::assemble(
            PixelFormat::MultiChannel,
            ComponentType::F32,
            width,
            height,
            names,
            data,
        )
    }

    fn assemble(
        pixel_format: PixelFormat,
        component: ComponentType,
        width: u32,
        height: u32,
        channel_names: Vec<String>,
        data: Vec<u8>,
    ) -> Result<Self> {
        let need = (width as usize) * (height as usize) * channel_names.len() * component.size();
        if data.len() != need {
            return Err(EngineError::BufferSize {
                need,
                have: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixel_format,
            component,
            channel_names,
            data,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(width, height)` in pixels.
    #[inline]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[inline]
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    #[inline]
    pub fn component(&self) -> ComponentType {
        self.component
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channel_names.len()
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// Bytes per pixel (all channels).
    #[inline]
    pub fn bytes_per_pixel(&self) -> usize {
        self.channel_count() * self.component.size()
    }

    /// Total payload size in bytes.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// Raw interleaved payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Read channel value `index` (flat, interleaved) normalized to `f32`.
    #[inline]
    pub fn sample(&self, index: usize) -> f32 {
        let size = self.component.size();
        self.component.decode(&self.data[index * size..(index + 1) * size])
    }

    /// All channel values as `f32`, interleaved.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let size = self.component.size();
        self.data
            .chunks_exact(size)
            .map(|c| self.component.decode(c))
            .collect()
    }

    /// Apply `f` to every pixel of an `F32` image in place.
    ///
    /// `f` receives the pixel's channel values; writes are stored back.
    pub fn for_each_pixel_f32_mut<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut [f32]),
    {
        if self.component != ComponentType::F32 {
            return Err(EngineError::ImageFormat(format!(
                "in-place pixel access requires F32 components, image is {:?}",
                self.component
            )));
        }
        let channels = self.channel_count();
        let mut pixel = vec![0f32; channels];
        for chunk in self.data.chunks_exact_mut(channels * 4) {
            for (value, bytes) in pixel.iter_mut().zip(chunk.chunks_exact(4)) {
                *value = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            f(&mut pixel);
            for (value, bytes) in pixel.iter().zip(chunk.chunks_exact_mut(4)) {
                bytes.copy_from_slice(&value.to_ne_bytes());
            }
        }
        Ok(())
    }

    /// Convert to a new image with the given channel layout and component type.
    ///
    /// When `premultiply` is set and the source carries alpha, color channels
    /// are multiplied by it.  The source is never modified.
    pub fn convert(
        &self,
        pixel_format: PixelFormat,
        component: ComponentType,
        premultiply: bool,
    ) -> Result<HostImage> {
        let mapping = self.channel_mapping(pixel_format)?;
        let src_channels = self.channel_count();
        let alpha = self.pixel_format.alpha_index().filter(|_| premultiply);
        let target_alpha = pixel_format.alpha_index();

        let mut out =
            Vec::with_capacity(self.pixel_count() * mapping.len() * component.size());
        for pixel in 0..self.pixel_count() {
            let base = pixel * src_channels;
            let a = alpha.map(|i| self.sample(base + i)).unwrap_or(1.0);
            for (dst, source) in mapping.iter().enumerate() {
                let value = match source {
                    Source::Channel(i) => self.sample(base + i),
                    Source::Luminance => {
                        0.2126 * self.sample(base)
                            + 0.7152 * self.sample(base + 1)
                            + 0.0722 * self.sample(base + 2)
                    }
                    Source::One => 1.0,
                };
                let is_color = Some(dst) != target_alpha;
                let value = if is_color && alpha.is_some() { value * a } else { value };
                component.encode(value, &mut out);
            }
        }

        let names = if pixel_format == PixelFormat::MultiChannel {
            self.channel_names.clone()
        } else {
            canonical_names(pixel_format)?
        };
        Self::assemble(pixel_format, component, self.width, self.height, names, out)
    }

    fn channel_mapping(&self, target: PixelFormat) -> Result<Vec<Source>> {
        use PixelFormat::*;
        use Source::{Channel, Luminance, One};

        let src = self.pixel_format;
        let mapping = match (src, target) {
            (s, t) if s == t => (0..self.channel_count()).map(Channel).collect(),
            (Y | YA, RGB | XYZ) => vec![Channel(0), Channel(0), Channel(0)],
            (Y | YA, RGBA) => vec![Channel(0), Channel(0), Channel(0), One],
            (Y, YA) => vec![Channel(0), One],
            (YA, Y) => vec![Channel(0)],
            (RGB | XYZ | RGBA, RGB | XYZ) => vec![Channel(0), Channel(1), Channel(2)],
            (RGB | XYZ, RGBA) => vec![Channel(0), Channel(1), Channel(2), One],
            (RGB | RGBA, Y) => vec![Luminance],
            (RGB, YA) => vec![Luminance, One],
            (RGBA, YA) => vec![Luminance, Channel(3)],
            (MultiChannel, RGB | XYZ) if self.channel_count() == 3 => {
                vec![Channel(0), Channel(1), Channel(2)]
            }
            (_, MultiChannel) => (0..self.channel_count()).map(Channel).collect(),
            _ => {
                return Err(EngineError::ImageFormat(format!(
                    "unsupported conversion {src:?} ({} channels) -> {target:?}",
                    self.channel_count()
                )));
            }
        };
        Ok(mapping)
    }

    /// Split a multi-layer image into `(layer name, sub-image)` pairs.
    ///
    /// Layers appear in order of their first channel.  Non-multi-channel
    /// images yield a single [`ROOT_LAYER`] entry.
    pub fn split(&self) -> Vec<(String, HostImage)> {
        if self.pixel_format != PixelFormat::MultiChannel {
            return vec![(ROOT_LAYER.to_string(), self.clone())];
        }

        let mut groups: Vec<(String, Vec<(usize, &str)>)> = Vec::new();
        for (index, name) in self.channel_names.iter().enumerate() {
            let (layer, suffix) = name
                .rsplit_once('.')
                .unwrap_or((ROOT_LAYER, name.as_str()));
            match groups.iter_mut().find(|(l, _)| l == layer) {
                Some((_, channels)) => channels.push((index, suffix)),
                None => groups.push((layer.to_string(), vec![(index, suffix)])),
            }
        }

        let size = self.component.size();
        let src_channels = self.channel_count();
        groups
            .into_iter()
            .map(|(layer, channels)| {
                let suffixes: Vec<&str> = channels.iter().map(|(_, s)| *s).collect();
                let pixel_format = PixelFormat::from_suffixes(&suffixes);
                let mut data = Vec::with_capacity(self.pixel_count() * channels.len() * size);
                for pixel in 0..self.pixel_count() {
                    for (index, _) in &channels {
                        let at = (pixel * src_channels + index) * size;
                        data.extend_from_slice(&self.data[at..at + size]);
                    }
                }
                let names = suffixes.iter().map(|s| s.to_string()).collect();
                let image = HostImage {
                    width: self.width,
                    height: self.height,
                    pixel_format,
                    component: self.component,
                    channel_names: names,
                    data,
                };
                (layer, image)
            })
            .collect()
    }
}

impl fmt::Display for HostImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HostImage[")?;
        writeln!(f, "  pixel_format = {:?},", self.pixel_format)?;
        writeln!(f, "  component = {:?},", self.component)?;
        writeln!(f, "  size = [{}, {}],", self.width, self.height)?;
        writeln!(f, "  channels = [{}],", self.channel_names.join(", "))?;
        if self.pixel_format == PixelFormat::MultiChannel {
            let layers: Vec<String> = self.split().into_iter().map(|(name, _)| name).collect();
            writeln!(f, "  layers = [{}],", layers.join(", "))?;
        }
        write!(f, "]")
    }
}

#[derive(Clone, Copy, Debug)]
enum Source {
    Channel(usize),
    Luminance,
    One,
}

fn canonical_names(pixel_format: PixelFormat) -> Result<Vec<String>> {
    if pixel_format == PixelFormat::MultiChannel {
        return Err(EngineError::ImageFormat(
            "multi-channel images need explicit channel names".into(),
        ));
    }
    Ok(pixel_format
        .channel_names()
        .iter()
        .map(|s| s.to_string())
        .collect())
}
