//! Pixel conversion and scaling collaborators used by the capture path
//!
//! Both run synchronously on the capture thread and have no error channel:
//! short or mismatched buffers are clipped, never a panic.

/// Converts a whole frame from one pixel format into another.
pub trait PixelConverter: Send {
    fn convert(&self, src: &[u8], dst: &mut [u8], width: u32, height: u32);
}

/// Resamples a packed frame to new dimensions without changing its format.
pub trait FrameScaler: Send {
    fn scale(
        &self,
        src: &[u8],
        src_width: u32,
        src_height: u32,
        dst: &mut [u8],
        dst_width: u32,
        dst_height: u32,
    );
}

/// YUYV 4:2:2 to little-endian RGB565 with integer BT.601 coefficients.
#[derive(Debug, Default, Clone, Copy)]
pub struct Yuyv422ToRgb565;

#[inline]
fn clamp(v: i32) -> u16 {
    v.clamp(0, 255) as u16
}

#[inline]
fn rgb565(y: u8, u: u8, v: u8) -> u16 {
    let c = 1192 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = clamp((c + 1634 * e) >> 10);
    let g = clamp((c - 833 * e - 400 * d) >> 10);
    let b = clamp((c + 2066 * d) >> 10);

    ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3)
}

impl PixelConverter for Yuyv422ToRgb565 {
    fn convert(&self, src: &[u8], dst: &mut [u8], width: u32, height: u32) {
        let pixels = (width as usize * height as usize)
            .min(src.len() / 2)
            .min(dst.len() / 2);

        // One macropixel carries two pixels sharing U and V
        for (yuyv, out) in src
            .chunks_exact(4)
            .zip(dst.chunks_exact_mut(4))
            .take(pixels / 2)
        {
            let (y0, u, y1, v) = (yuyv[0], yuyv[1], yuyv[2], yuyv[3]);
            out[..2].copy_from_slice(&rgb565(y0, u, v).to_le_bytes());
            out[2..].copy_from_slice(&rgb565(y1, u, v).to_le_bytes());
        }
    }
}

/// Nearest-neighbour resampling over 4-byte macropixels.
///
/// Works for any packed 16-bit format; horizontal steps are two pixels wide
/// so YUV 4:2:2 chroma stays paired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestScaler;

impl FrameScaler for NearestScaler {
    fn scale(
        &self,
        src: &[u8],
        src_width: u32,
        src_height: u32,
        dst: &mut [u8],
        dst_width: u32,
        dst_height: u32,
    ) {
        let src_cols = src_width as usize / 2;
        let dst_cols = dst_width as usize / 2;
        let (src_rows, dst_rows) = (src_height as usize, dst_height as usize);
        if src_cols == 0 || dst_cols == 0 || src_rows == 0 || dst_rows == 0 {
            return;
        }

        let src_stride = src_cols * 4;
        let dst_stride = dst_cols * 4;
        let rows = dst_rows.min(dst.len() / dst_stride);

        for dy in 0..rows {
            let sy = dy * src_rows / dst_rows;
            let Some(src_row) = src.get(sy * src_stride..(sy + 1) * src_stride) else {
                return;
            };
            let dst_row = &mut dst[dy * dst_stride..(dy + 1) * dst_stride];
            for (dx, out) in dst_row.chunks_exact_mut(4).enumerate() {
                let sx = dx * src_cols / dst_cols;
                out.copy_from_slice(&src_row[sx * 4..sx * 4 + 4]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_reference_colours() {
        // white, black
        let src = [235, 128, 16, 128];
        let mut dst = [0u8; 4];
        Yuyv422ToRgb565.convert(&src, &mut dst, 2, 1);
        assert_eq!(u16::from_le_bytes([dst[0], dst[1]]), 0xffff);
        assert_eq!(u16::from_le_bytes([dst[2], dst[3]]), 0x0000);
    }

    #[test]
    fn converter_clips_short_buffers() {
        let src = [128u8; 6];
        let mut dst = [0u8; 2];
        Yuyv422ToRgb565.convert(&src, &mut dst, 640, 480);
        assert_eq!(dst, [0, 0]);
    }

    #[test]
    fn halves_a_frame() {
        // 4x2 source, macropixel n filled with n
        let mut src = Vec::new();
        for n in 0..4u8 {
            src.extend_from_slice(&[n; 4]);
        }
        let mut dst = [0xffu8; 4];
        NearestScaler.scale(&src, 4, 2, &mut dst, 2, 1);
        assert_eq!(dst, [0; 4]);

        let mut dst = [0u8; 16];
        NearestScaler.scale(&src, 4, 2, &mut dst, 4, 2);
        assert_eq!(&dst[..], &src[..]);
    }

    #[test]
    fn scaler_tolerates_truncated_source() {
        let src = [1u8; 8];
        let mut dst = [0u8; 64];
        NearestScaler.scale(&src, 8, 8, &mut dst, 8, 8);
    }
}
