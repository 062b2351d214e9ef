//! Reference Sobel kernel
//!
//! What one filter core computes over the band it is given: luma as the
//! mean of R, G and B, the 3×3 Sobel gradients, `|gx| + |gy|` clamped to
//! 255, written back as opaque grey. The outermost rows and columns of a
//! band have no full neighbourhood and come out black.

/// Bytes per RGBA pixel.
pub const PIXEL_BYTES: usize = 4;

const GX: [[i32; 3]; 3] = [[-1, 0, 1], [-2, 0, 2], [-1, 0, 1]];
const GY: [[i32; 3]; 3] = [[-1, -2, -1], [0, 0, 0], [1, 2, 1]];

fn luma(pixel: &[u8]) -> i32 {
    (i32::from(pixel[0]) + i32::from(pixel[1]) + i32::from(pixel[2])) / 3
}

/// Filter a `rows` × `columns` RGBA band.
///
/// # Panics
///
/// Panics if `input` is shorter than the band.
#[must_use]
pub fn sobel(input: &[u8], rows: usize, columns: usize) -> Vec<u8> {
    assert!(input.len() >= rows * columns * PIXEL_BYTES, "band larger than input");

    let gray: Vec<i32> = input[..rows * columns * PIXEL_BYTES]
        .chunks_exact(PIXEL_BYTES)
        .map(luma)
        .collect();

    let mut output = vec![0u8; rows * columns * PIXEL_BYTES];
    for (i, pixel) in output.chunks_exact_mut(PIXEL_BYTES).enumerate() {
        let (y, x) = (i / columns, i % columns);
        let magnitude = if y == 0 || x == 0 || y + 1 >= rows || x + 1 >= columns {
            0
        } else {
            let (mut gx, mut gy) = (0, 0);
            for (dy, (kx_row, ky_row)) in GX.iter().zip(GY.iter()).enumerate() {
                for dx in 0..3 {
                    let value = gray[(y + dy - 1) * columns + x + dx - 1];
                    gx += kx_row[dx] * value;
                    gy += ky_row[dx] * value;
                }
            }
            (gx.abs() + gy.abs()).min(255)
        };
        // Clamped to 0..=255 above
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let m = magnitude as u8;
        pixel.copy_from_slice(&[m, m, m, 0xFF]);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(rows: usize, columns: usize, f: impl Fn(usize, usize) -> u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(rows * columns * PIXEL_BYTES);
        for y in 0..rows {
            for x in 0..columns {
                let v = f(y, x);
                data.extend_from_slice(&[v, v, v, 0xFF]);
            }
        }
        data
    }

    #[test]
    fn flat_image_has_no_edges() {
        let out = sobel(&image(5, 5, |_, _| 128), 5, 5);
        assert!(out.chunks_exact(4).all(|p| p == [0, 0, 0, 0xFF]));
    }

    #[test]
    fn vertical_edge_is_detected() {
        let out = sobel(&image(5, 6, |_, x| if x < 3 { 0 } else { 200 }), 5, 6);
        let at = |y: usize, x: usize| out[(y * 6 + x) * 4];
        assert_eq!(at(2, 2), 255);
        assert_eq!(at(2, 3), 255);
        assert_eq!(at(2, 1), 0);
        // Border stays black
        assert_eq!(at(0, 3), 0);
    }

    #[test]
    fn gentle_gradient_is_not_clamped() {
        let out = sobel(&image(3, 3, |_, x| (x * 10) as u8), 3, 3);
        // gx = (20 - 0) * (1 + 2 + 1)
        assert_eq!(out[4 * 4], 80);
    }

    #[test]
    fn degenerate_bands_are_all_border() {
        assert!(sobel(&[], 0, 4).is_empty());
        let out = sobel(&image(2, 2, |y, x| (y * 100 + x * 50) as u8), 2, 2);
        assert!(out.chunks_exact(4).all(|p| p[0] == 0));
    }
}
