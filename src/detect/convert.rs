use super::DetectError;
use crate::FrameFormat;

/// BT.601 integer YUV to RGB for one pixel.
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Convert one packed YUYV row (`Y0 U Y1 V` per pixel pair) into RGB24.
fn convert_row(src: &[u8], dst: &mut [u8]) {
    for (yuyv, rgb) in src.chunks_exact(4).zip(dst.chunks_exact_mut(6)) {
        let (y0, u, y1, v) = (yuyv[0], yuyv[1], yuyv[2], yuyv[3]);
        rgb[..3].copy_from_slice(&yuv_to_rgb(y0, u, v));
        rgb[3..].copy_from_slice(&yuv_to_rgb(y1, u, v));
    }
}

/// Convert a YUYV frame into `dst`, honouring the driver's line stride.
///
/// Returns the number of RGB bytes written (`width * height * 3`).
pub fn yuyv_to_rgb(src: &[u8], format: &FrameFormat, dst: &mut [u8]) -> Result<usize, DetectError> {
    let width = format.width as usize;
    let height = format.height as usize;
    let row_in = width * 2;
    let row_out = width * 3;
    let stride = (format.bytes_per_line as usize).max(row_in);

    let needed_in = if height == 0 {
        0
    } else {
        stride * (height - 1) + row_in
    };
    if src.len() < needed_in {
        return Err(DetectError::FrameSizeMismatch {
            expected: needed_in,
            actual: src.len(),
        });
    }
    let needed_out = row_out * height;
    if dst.len() < needed_out {
        return Err(DetectError::OutputTooSmall {
            needed: needed_out,
            available: dst.len(),
        });
    }

    for (row, out) in dst[..needed_out].chunks_exact_mut(row_out).enumerate() {
        let start = row * stride;
        convert_row(&src[start..start + row_in], out);
    }
    Ok(needed_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelEncoding;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn reference_points() {
        assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(0, 0, 0), [0, 135, 0]);
    }

    #[test]
    fn arbitrary_inputs_stay_in_range() {
        // Every output is a u8 by construction; this exercises the extremes
        // where the unclamped transform leaves [0, 255].
        let mut rng = StdRng::seed_from_u64(601);
        for _ in 0..10_000 {
            let (y, u, v) = (rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>());
            let c = i32::from(y) - 16;
            let e = i32::from(v) - 128;
            let raw_r = (298 * c + 409 * e + 128) >> 8;
            let [r, _, _] = yuv_to_rgb(y, u, v);
            assert_eq!(i32::from(r), raw_r.clamp(0, 255));
        }
    }

    #[test]
    fn frame_is_one_and_a_half_times_input() -> Result<(), DetectError> {
        let format = FrameFormat::packed(4, 2, PixelEncoding::Yuyv);
        let src = [235u8, 128, 235, 128].repeat(4);
        let mut dst = vec![0u8; 64];
        let written = yuyv_to_rgb(&src, &format, &mut dst)?;
        assert_eq!(written, src.len() * 3 / 2);
        assert!(dst[..written].iter().all(|&b| b == 255));
        assert!(dst[written..].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn padded_stride_is_skipped() -> Result<(), DetectError> {
        let format = FrameFormat {
            bytes_per_line: 6,
            size_image: 12,
            ..FrameFormat::packed(2, 2, PixelEncoding::Yuyv)
        };
        // Each row: one white pixel pair followed by two bytes of padding.
        let src = [235, 128, 235, 128, 0, 0, 16, 128, 16, 128, 9, 9];
        let mut dst = [7u8; 12];
        assert_eq!(yuyv_to_rgb(&src, &format, &mut dst)?, 12);
        assert_eq!(&dst[..6], &[255; 6]);
        assert_eq!(&dst[6..], &[0; 6]);
        Ok(())
    }

    #[test]
    fn short_input_is_a_size_mismatch() {
        let format = FrameFormat::packed(4, 2, PixelEncoding::Yuyv);
        let mut dst = vec![0u8; 24];
        let err = yuyv_to_rgb(&[0u8; 10], &format, &mut dst).unwrap_err();
        assert!(matches!(
            err,
            DetectError::FrameSizeMismatch {
                expected: 16,
                actual: 10
            }
        ));
    }
}
