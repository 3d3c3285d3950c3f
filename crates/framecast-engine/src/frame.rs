//! Frame description + the region/flip copy.
//!
//! The published image is always top-down: row 0 of a shared surface is the top row of the
//! image. A frame whose source is stored bottom-up (GL-style readback) is submitted with
//! `flip = true` and gets its rows reversed while being copied.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ShareError, ShareResult};
use crate::gpu::SourceTexture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
}

impl Default for PixelFormat {
    fn default() -> Self { PixelFormat::Rgba8 }
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        4
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Bgra8 => "bgra8",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rgba8" => Some(PixelFormat::Rgba8),
            "bgra8" => Some(PixelFormat::Bgra8),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel rectangle inside a source texture (native row order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Whole-texture region.
    pub fn full(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }

    /// Reject empty regions and regions that leave the texture.
    pub fn validate(&self, tex_w: u32, tex_h: u32) -> ShareResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ShareError::InvalidRegion {
                msg: format!("empty region {}x{}", self.width, self.height),
            });
        }
        let right = self.x as u64 + self.width as u64;
        let bottom = self.y as u64 + self.height as u64;
        if right > tex_w as u64 || bottom > tex_h as u64 {
            return Err(ShareError::InvalidRegion {
                msg: format!(
                    "region {}x{}+{}+{} exceeds texture {tex_w}x{tex_h}",
                    self.width, self.height, self.x, self.y
                ),
            });
        }
        Ok(())
    }
}

/// Shape of a shared surface. Two frames with equal descriptors can share a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceDesc {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl SurfaceDesc {
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn byte_len(&self) -> usize {
        self.stride() * self.height as usize
    }
}

impl fmt::Display for SurfaceDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

/// One rendered frame on its way to the share server. Consumed exactly once.
pub struct Frame {
    pub texture: Arc<dyn SourceTexture>,
    pub region: Region,
    pub flip: bool,
    pub seq: u64,
}

impl Frame {
    pub fn desc(&self) -> SurfaceDesc {
        SurfaceDesc {
            format: self.texture.format(),
            width: self.region.width,
            height: self.region.height,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("region", &self.region)
            .field("flip", &self.flip)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Read `region` out of `texture` into a tightly packed top-down buffer.
///
/// `flip = true` means the texture stores its rows bottom-up, so the rows are reversed.
pub fn copy_region(texture: &dyn SourceTexture, region: Region, flip: bool) -> ShareResult<Vec<u8>> {
    region.validate(texture.width(), texture.height())?;
    let stride = region.width as usize * texture.format().bytes_per_pixel();
    let mut out = vec![0u8; stride * region.height as usize];
    texture.read_rows(region, &mut out)?;
    if flip {
        flip_rows(&mut out, stride);
    }
    Ok(out)
}

/// Reverse row order in place.
pub fn flip_rows(buf: &mut [u8], stride: usize) {
    if stride == 0 {
        return;
    }
    let rows = buf.len() / stride;
    for y in 0..rows / 2 {
        let (top, bottom) = buf.split_at_mut((rows - 1 - y) * stride);
        top[y * stride..(y + 1) * stride].swap_with_slice(&mut bottom[..stride]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareTexture;

    #[test]
    fn region_validation() {
        assert!(Region::new(0, 0, 4, 4).validate(4, 4).is_ok());
        assert!(Region::new(1, 1, 3, 3).validate(4, 4).is_ok());
        assert!(matches!(
            Region::new(0, 0, 0, 4).validate(4, 4),
            Err(ShareError::InvalidRegion { .. })
        ));
        assert!(matches!(
            Region::new(2, 0, 3, 1).validate(4, 4),
            Err(ShareError::InvalidRegion { .. })
        ));
        assert!(Region::new(u32::MAX, 0, 2, 1).validate(4, 4).is_err());
    }

    #[test]
    fn flip_rows_odd_and_even() {
        let mut even = vec![1, 1, 2, 2, 3, 3, 4, 4];
        flip_rows(&mut even, 2);
        assert_eq!(even, vec![4, 4, 3, 3, 2, 2, 1, 1]);

        let mut odd = vec![1, 2, 3];
        flip_rows(&mut odd, 1);
        assert_eq!(odd, vec![3, 2, 1]);
    }

    #[test]
    fn flipped_copy_is_exact_row_reversal() {
        let tex = SoftwareTexture::new(16, 8, PixelFormat::Rgba8);
        tex.fill_test_pattern(7);
        let region = Region::new(2, 1, 10, 6);

        let upright = copy_region(&tex, region, false).unwrap();
        let flipped = copy_region(&tex, region, true).unwrap();
        assert_ne!(upright, flipped);

        let stride = 10 * 4;
        let rows_up: Vec<&[u8]> = upright.chunks(stride).collect();
        let mut rows_fl: Vec<&[u8]> = flipped.chunks(stride).collect();
        rows_fl.reverse();
        assert_eq!(rows_up, rows_fl);
    }

    #[test]
    fn crop_reads_the_right_pixels() {
        let tex = SoftwareTexture::new(4, 4, PixelFormat::Rgba8);
        tex.fill_test_pattern(0);
        let out = copy_region(&tex, Region::new(1, 2, 2, 1), false).unwrap();
        assert_eq!(&out[0..4], tex.pixel(1, 2).as_slice());
        assert_eq!(&out[4..8], tex.pixel(2, 2).as_slice());
    }

    #[test]
    fn pixel_format_names() {
        assert_eq!(PixelFormat::parse("bgra8"), Some(PixelFormat::Bgra8));
        assert_eq!(PixelFormat::parse("yuv"), None);
        assert_eq!(PixelFormat::Rgba8.to_string(), "rgba8");
    }
}
