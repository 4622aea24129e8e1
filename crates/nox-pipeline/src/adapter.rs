//! Host image to device image adaptation.
//!
//! A [`DeviceImage`] pairs an owned device buffer with the tiled layout the
//! engine sees through [`OptixImage2D`].  Images are tightly packed: the pixel
//! stride is the per-pixel byte size and the row stride is `width` pixels.

use nox_core::device::{DeviceAllocation, DeviceMemory};
use nox_core::error::{EngineError, Result};
use nox_core::ffi_types::{
    OPTIX_PIXEL_FORMAT_FLOAT2, OPTIX_PIXEL_FORMAT_FLOAT3, OPTIX_PIXEL_FORMAT_FLOAT4, OptixImage2D,
    OptixPixelFormat,
};
use nox_core::image::{ComponentType, HostImage};

/// Device-resident image.  The buffer is freed when the value is dropped.
pub struct DeviceImage<Buf> {
    buffer: Buf,
    width: u32,
    height: u32,
    pixel_stride: u32,
    format: OptixPixelFormat,
}

impl<Buf: DeviceAllocation> DeviceImage<Buf> {
    /// Engine-facing descriptor.  Valid while `self` is alive.
    pub fn descriptor(&self) -> OptixImage2D {
        OptixImage2D {
            data: self.buffer.device_ptr(),
            width: self.width,
            height: self.height,
            rowStrideInBytes: self.width * self.pixel_stride,
            pixelStrideInBytes: self.pixel_stride,
            format: self.format,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[inline]
    pub fn format(&self) -> OptixPixelFormat {
        self.format
    }

    /// Total payload size in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.buffer.byte_len()
    }
}

/// Channel count of the float formats the pipeline uploads.
fn float_channels(format: OptixPixelFormat) -> Result<usize> {
    match format {
        OPTIX_PIXEL_FORMAT_FLOAT2 => Ok(2),
        OPTIX_PIXEL_FORMAT_FLOAT3 => Ok(3),
        OPTIX_PIXEL_FORMAT_FLOAT4 => Ok(4),
        other => Err(EngineError::ImageFormat(format!(
            "unsupported device pixel format 0x{other:04x}"
        ))),
    }
}

/// Allocate a device image shaped like `image`.
///
/// With `copy_data` the pixel payload is uploaded; otherwise the buffer is
/// left uninitialized for the engine to fill.  `image` must already be `F32`
/// with the channel count `format` implies.
pub fn upload<M: DeviceMemory>(
    memory: &M,
    image: &HostImage,
    format: OptixPixelFormat,
    copy_data: bool,
) -> Result<DeviceImage<M::Buffer>> {
    let channels = float_channels(format)?;
    if image.component() != ComponentType::F32 || image.channel_count() != channels {
        return Err(EngineError::ImageFormat(format!(
            "device format 0x{format:04x} needs {channels}-channel F32 pixels, image has {} {:?} channels",
            image.channel_count(),
            image.component()
        )));
    }

    let mut buffer = memory.alloc(image.buffer_size())?;
    if copy_data {
        memory.upload(image.data(), &mut buffer)?;
    }

    Ok(DeviceImage {
        buffer,
        width: image.width(),
        height: image.height(),
        pixel_stride: image.bytes_per_pixel() as u32,
        format,
    })
}

/// Read a device image back to host memory.
///
/// Waits for all work queued on the stream before returning.
pub fn download<M: DeviceMemory>(memory: &M, image: &DeviceImage<M::Buffer>) -> Result<Vec<u8>> {
    let mut host = vec![0u8; image.byte_len()];
    memory.download(&image.buffer, &mut host)?;
    memory.synchronize()?;
    Ok(host)
}
