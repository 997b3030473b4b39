use super::ConvertError;
use crate::engine::{PixelFormat, VideoFrame};

/// Converts decoded pictures to packed BGR24 at their original size.
pub trait Scaler: Send {
    fn supports(&self, format: PixelFormat) -> bool;

    /// Writes `frame` to `out`, one row every `stride` bytes. `out` holds at least
    /// `stride * frame.height` bytes.
    fn scale(&mut self, frame: &VideoFrame, out: &mut [u8], stride: usize)
        -> Result<(), ConvertError>;
}

/// Bytes per pixel of the first plane.
pub(crate) const fn bytes_per_pixel(format: PixelFormat) -> usize {
    match format {
        PixelFormat::Yuv420p | PixelFormat::Gray8 => 1,
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        PixelFormat::Rgba | PixelFormat::Bgra => 4,
    }
}

/// Software converter for the pixel formats of [`PixelFormat`], using BT.601 limited range
/// coefficients for YUV input.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bgr24Scaler;

impl Scaler for Bgr24Scaler {
    fn supports(&self, _format: PixelFormat) -> bool {
        true
    }

    fn scale(
        &mut self,
        frame: &VideoFrame,
        out: &mut [u8],
        stride: usize,
    ) -> Result<(), ConvertError> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let expected_planes = match frame.pixel_format {
            PixelFormat::Yuv420p => 3,
            _ => 1,
        };
        if frame.planes.len() < expected_planes {
            return Err(ConvertError::FormatMismatch(format!(
                "{} planes for {:?}",
                frame.planes.len(),
                frame.pixel_format
            )));
        }
        if stride < width * 3 || out.len() < stride * height {
            return Err(ConvertError::BufferTooSmall {
                needed: width * 3 * height,
                available: out.len(),
            });
        }
        let first = &frame.planes[0];
        for y in 0..height {
            let dst = &mut out[y * stride..y * stride + width * 3];
            match frame.pixel_format {
                PixelFormat::Bgr24 => copy_packed(row(first, y, width * 3)?, dst, 3, [0, 1, 2]),
                PixelFormat::Rgb24 => copy_packed(row(first, y, width * 3)?, dst, 3, [2, 1, 0]),
                PixelFormat::Bgra => copy_packed(row(first, y, width * 4)?, dst, 4, [0, 1, 2]),
                PixelFormat::Rgba => copy_packed(row(first, y, width * 4)?, dst, 4, [2, 1, 0]),
                PixelFormat::Gray8 => {
                    for (pixel, luma) in dst.chunks_exact_mut(3).zip(row(first, y, width)?) {
                        pixel.fill(*luma);
                    }
                }
                PixelFormat::Yuv420p => {
                    let luma = row(first, y, width)?;
                    let chroma_width = width.div_ceil(2);
                    let u = row(&frame.planes[1], y / 2, chroma_width)?;
                    let v = row(&frame.planes[2], y / 2, chroma_width)?;
                    for (x, pixel) in dst.chunks_exact_mut(3).enumerate() {
                        pixel.copy_from_slice(&yuv_to_bgr(luma[x], u[x / 2], v[x / 2]));
                    }
                }
            }
        }
        Ok(())
    }
}

fn row(plane: &crate::engine::Plane, y: usize, len: usize) -> Result<&[u8], ConvertError> {
    let start = y * plane.stride;
    plane
        .data
        .get(start..start + len)
        .ok_or_else(|| ConvertError::FormatMismatch(format!("row {y} is out of bounds")))
}

/// Reorders packed pixels; `order` picks the source bytes of B, G and R.
#[inline]
fn copy_packed(src: &[u8], dst: &mut [u8], bytes_per_pixel: usize, order: [usize; 3]) {
    for (pixel, source) in dst.chunks_exact_mut(3).zip(src.chunks_exact(bytes_per_pixel)) {
        pixel[0] = source[order[0]];
        pixel[1] = source[order[1]];
        pixel[2] = source[order[2]];
    }
}

#[inline]
fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |value: i32| ((value + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 516 * d),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 409 * e),
    ]
}
