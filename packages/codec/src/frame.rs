//! Input frame type and the RGB to YUV 4:2:0 semi-planar converter.

use crate::CodecError;

/// An input image with one packed `0xAARRGGBB` value per pixel.
///
/// Frames are immutable once queued; the encode worker consumes each one
/// exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row-major packed pixels, `width * height` entries.
    pixels: Vec<u32>,
}

impl Frame {
    /// Create a frame from packed `0xAARRGGBB` pixels.
    pub fn new(width: u32, height: u32, pixels: Vec<u32>) -> Result<Self, CodecError> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(CodecError::ConversionError(format!(
                "pixel count mismatch: expected {}, got {}",
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Create a frame from RGBA bytes (4 bytes per pixel).
    pub fn from_rgba(width: u32, height: u32, rgba: &[u8]) -> Result<Self, CodecError> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(CodecError::ConversionError(format!(
                "RGBA data size mismatch: expected {}, got {}",
                expected,
                rgba.len()
            )));
        }
        let pixels = rgba
            .chunks_exact(4)
            .map(|p| pack_argb(p[3], p[0], p[1], p[2]))
            .collect();
        Self::new(width, height, pixels)
    }

    /// Create a frame filled with a single packed `0xAARRGGBB` color.
    #[must_use]
    pub fn solid(width: u32, height: u32, argb: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![argb; width as usize * height as usize],
        }
    }

    /// Packed pixels, row-major.
    #[must_use]
    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// Convert to the YUV 4:2:0 semi-planar layout fed to the video codec.
    pub fn to_yuv420sp(&self) -> Result<Vec<u8>, CodecError> {
        argb_to_yuv420sp(&self.pixels, self.width, self.height)
    }
}

/// Pack 8-bit components into a `0xAARRGGBB` pixel.
#[inline]
#[must_use]
pub fn pack_argb(a: u8, r: u8, g: u8, b: u8) -> u32 {
    (u32::from(a) << 24) | (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
}

/// Size of a YUV 4:2:0 semi-planar buffer for the given dimensions.
#[must_use]
pub fn expected_yuv420sp_size(width: u32, height: u32) -> usize {
    (width as usize * height as usize * 3) / 2
}

// ============================================================================
// Color conversion
// ============================================================================

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert packed ARGB pixels to YUV 4:2:0 semi-planar.
///
/// Output is a `width * height` luma plane followed by one (V, U) pair per
/// chroma site. A site is any pixel whose row index and linear index are both
/// even, taken without averaging. Dimensions whose chroma sites do not fit in
/// the `3 * width * height / 2` buffer are rejected.
pub fn argb_to_yuv420sp(argb: &[u32], width: u32, height: u32) -> Result<Vec<u8>, CodecError> {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 {
        return Err(CodecError::InvalidDimensions { width, height });
    }
    let pixels = w * h;
    if argb.len() != pixels {
        return Err(CodecError::ConversionError(format!(
            "ARGB data size mismatch: expected {}, got {}",
            pixels,
            argb.len()
        )));
    }

    let total = expected_yuv420sp_size(width, height);
    let chroma_sites = h.div_ceil(2) * w.div_ceil(2);
    if pixels + chroma_sites * 2 > total {
        return Err(CodecError::InvalidDimensions { width, height });
    }

    let mut out = vec![0u8; total];
    let (luma, chroma) = out.split_at_mut(pixels);
    let mut uv = 0usize;

    for (j, row) in argb.chunks_exact(w).enumerate() {
        let row_base = j * w;
        let even_row = j % 2 == 0;
        let luma_row = &mut luma[row_base..row_base + w];

        for (i, (&px, y_out)) in row.iter().zip(luma_row.iter_mut()).enumerate() {
            let r = ((px >> 16) & 0xFF) as i32;
            let g = ((px >> 8) & 0xFF) as i32;
            let b = (px & 0xFF) as i32;

            *y_out = clamp_u8((r * 77 + g * 150 + b * 29 + 128) >> 8);

            if even_row && (row_base + i) % 2 == 0 {
                let v = ((r * -43 - g * 84 + b * 127 + 128) >> 8) + 128;
                let u = ((r * 127 - g * 106 - b * 21 + 128) >> 8) + 128;
                chroma[uv] = clamp_u8(v);
                chroma[uv + 1] = clamp_u8(u);
                uv += 2;
            }
        }
    }

    Ok(out)
}

// ============================================================================
// image integration
// ============================================================================

#[cfg(feature = "image")]
impl From<&image::RgbaImage> for Frame {
    fn from(img: &image::RgbaImage) -> Self {
        let pixels = img
            .pixels()
            .map(|p| pack_argb(p.0[3], p.0[0], p.0[1], p.0[2]))
            .collect();
        Frame {
            width: img.width(),
            height: img.height(),
            pixels,
        }
    }
}
