//! Portable float map (PFM) reader and writer.
//!
//! `PF` files hold RGB, `Pf` files a single channel.  Rows are stored
//! bottom-to-top; a negative scale marks little-endian samples.

use std::fs;
use std::path::Path;

use nox_core::error::{EngineError, Result};
use nox_core::image::{ComponentType, HostImage, PixelFormat};

pub fn read(path: &Path) -> Result<HostImage> {
    let bytes = fs::read(path)?;
    decode(&bytes).map_err(|err| match err {
        EngineError::ImageFormat(msg) => {
            EngineError::ImageFormat(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

/// Read a PFM as a 2-channel motion-flow image (first two channels kept).
pub fn read_flow(path: &Path) -> Result<HostImage> {
    let image = read(path)?;
    if image.channel_count() < 2 {
        return Err(EngineError::ImageFormat(format!(
            "{}: flow needs at least 2 channels",
            path.display()
        )));
    }
    let channels = image.channel_count();
    let values: Vec<f32> = image
        .to_f32_vec()
        .chunks_exact(channels)
        .flat_map(|p| [p[0], p[1]])
        .collect();
    HostImage::with_channels(&["flow.U", "flow.V"], image.width(), image.height(), &values)
}

pub fn write(path: &Path, image: &HostImage) -> Result<()> {
    let (magic, format) = match image.pixel_format() {
        PixelFormat::Y | PixelFormat::YA => ("Pf", PixelFormat::Y),
        _ => ("PF", PixelFormat::RGB),
    };
    let image = image.convert(format, ComponentType::F32, false)?;
    let channels = image.channel_count();
    let row_len = image.width() as usize * channels;
    let values = image.to_f32_vec();

    let mut out = format!("{magic}\n{} {}\n-1.0\n", image.width(), image.height()).into_bytes();
    out.reserve(values.len() * 4);
    for row in values.chunks_exact(row_len.max(1)).rev() {
        for v in row {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    fs::write(path, out)?;
    Ok(())
}

fn decode(bytes: &[u8]) -> Result<HostImage> {
    let mut fields = Vec::with_capacity(4);
    let mut pos = 0;
    while fields.len() < 4 {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let start = pos;
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if start == pos {
            return Err(EngineError::ImageFormat("truncated PFM header".into()));
        }
        fields.push(String::from_utf8_lossy(&bytes[start..pos]).into_owned());
    }
    // Exactly one whitespace byte separates the header from the samples.
    pos += 1;

    let (format, channels) = match fields[0].as_str() {
        "PF" => (PixelFormat::RGB, 3),
        "Pf" => (PixelFormat::Y, 1),
        other => {
            return Err(EngineError::ImageFormat(format!(
                "not a PFM file (magic '{other}')"
            )));
        }
    };
    let parse_dim = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| EngineError::ImageFormat(format!("bad PFM dimension '{s}'")))
    };
    let width = parse_dim(&fields[1])?;
    let height = parse_dim(&fields[2])?;
    let scale: f32 = fields[3]
        .parse()
        .map_err(|_| EngineError::ImageFormat(format!("bad PFM scale '{}'", fields[3])))?;
    let little_endian = scale < 0.0;

    let row_len = (width as usize).checked_mul(channels);
    let need = row_len
        .and_then(|len| len.checked_mul(height as usize))
        .and_then(|len| len.checked_mul(4));
    let (Some(row_len), Some(need)) = (row_len, need) else {
        return Err(EngineError::ImageFormat(format!(
            "PFM dimensions {width}x{height} are too large"
        )));
    };
    let end = pos.checked_add(need).ok_or_else(|| {
        EngineError::ImageFormat(format!("PFM dimensions {width}x{height} are too large"))
    })?;
    let payload = bytes.get(pos..end).ok_or(EngineError::BufferSize {
        need,
        have: bytes.len().saturating_sub(pos),
    })?;

    let samples: Vec<f32> = payload
        .chunks_exact(4)
        .map(|b| {
            let b = [b[0], b[1], b[2], b[3]];
            if little_endian {
                f32::from_le_bytes(b)
            } else {
                f32::from_be_bytes(b)
            }
        })
        .collect();
    let values: Vec<f32> = samples
        .chunks_exact(row_len.max(1))
        .rev()
        .flatten()
        .copied()
        .collect();
    HostImage::from_f32(format, width, height, &values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_preserves_top_row_first_order() {
        let dir = std::env::temp_dir().join(format!("nox_pfm_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rgb.pfm");

        let values: Vec<f32> = (0..2 * 3 * 3).map(|v| v as f32).collect();
        let image = HostImage::from_f32(PixelFormat::RGB, 2, 3, &values).unwrap();
        write(&path, &image).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"PF\n2 3\n-1.0\n"));
        // First stored row is the bottom image row.
        let first = f32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        assert_eq!(first, 12.0);

        assert_eq!(read(&path).unwrap(), image);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn big_endian_grayscale_decodes() {
        let mut bytes = b"Pf\n1 2\n1.0\n".to_vec();
        bytes.extend_from_slice(&2.0f32.to_be_bytes());
        bytes.extend_from_slice(&1.0f32.to_be_bytes());
        let image = decode(&bytes).unwrap();
        assert_eq!(image.pixel_format(), PixelFormat::Y);
        assert_eq!(image.to_f32_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = b"PF\n2 2\n-1.0\n\0\0\0\0".to_vec();
        assert!(matches!(decode(&bytes), Err(EngineError::BufferSize { .. })));
    }

    #[test]
    fn oversized_dimensions_are_rejected() {
        let mut bytes = b"PF\n4294967295 4294967295\n-1.0\n".to_vec();
        bytes.extend_from_slice(&[0; 16]);
        let err = decode(&bytes).expect_err("dimensions overflow the payload size");
        assert!(matches!(err, EngineError::ImageFormat(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = decode(b"P6\n1 1\n255\n\0\0\0").expect_err("not a PFM");
        assert!(err.to_string().contains("magic"));
    }
}
