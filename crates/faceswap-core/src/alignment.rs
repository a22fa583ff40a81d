//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical crop using the five InsightFace
//! reference landmarks and least-squares estimation. The same transform is
//! inverted to paste swapped crops back into the source frame.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// A face crop warped to canonical position, with the frame → crop transform.
pub struct AlignedFace {
    pub crop: RgbImage,
    /// 2×3 matrix mapping frame coordinates into crop coordinates.
    pub matrix: [f32; 6],
}

/// Reference landmarks scaled for a square crop of `size` pixels.
///
/// Sizes divisible by 112 scale the ArcFace template directly; other sizes
/// (the 128 px swapper crop) use a 128 basis with an 8 px horizontal shift.
pub fn reference_landmarks(size: u32) -> [(f32, f32); 5] {
    let (ratio, diff_x) = if size % 112 == 0 {
        (size as f32 / 112.0, 0.0)
    } else {
        let ratio = size as f32 / 128.0;
        (ratio, 8.0 * ratio)
    };
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * ratio + diff_x, y * ratio))
}

/// Least-squares similarity transform (scale, rotation, translation) taking
/// `src` points onto `dst`, as `[a, -b, tx, b, a, ty]`.
///
/// Closed form over centered point sets; degenerate input (all `src` points
/// coincident) yields the identity.
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (smx, smy) = mean(src);
    let (dmx, dmy) = mean(dst);

    let (mut dot, mut cross, mut spread) = (0.0f32, 0.0f32, 0.0f32);
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx - smx, sy - smy);
        let (dx, dy) = (dx - dmx, dy - dmy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        spread += sx * sx + sy * sy;
    }
    if spread < f32::EPSILON {
        return [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    }

    let a = dot / spread;
    let b = cross / spread;
    let tx = dmx - (a * smx - b * smy);
    let ty = dmy - (b * smx + a * smy);
    [a, -b, tx, b, a, ty]
}

/// Invert a general 2×3 affine matrix. `None` if it is singular.
pub fn invert_affine(m: &[f32; 6]) -> Option<[f32; 6]> {
    let [a, b, c, d, e, f] = *m;
    let det = a * e - b * d;
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        e * inv_det,
        -b * inv_det,
        (b * f - c * e) * inv_det,
        -d * inv_det,
        a * inv_det,
        (c * d - a * f) * inv_det,
    ])
}

/// Map a point through a 2×3 affine matrix.
pub fn apply_affine(m: &[f32; 6], x: f32, y: f32) -> (f32, f32) {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

/// Bilinear RGB sample at a sub-pixel position. Out-of-bounds taps read as 0.
pub(crate) fn sample_rgb(frame: &RgbImage, sx: f32, sy: f32) -> [f32; 3] {
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;
    let (w, h) = (frame.width() as i64, frame.height() as i64);

    let tap = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = frame.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let tl = tap(x0, y0);
    let tr = tap(x0 + 1, y0);
    let bl = tap(x0, y0 + 1);
    let br = tap(x0 + 1, y0 + 1);

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        out[c] = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
    }
    out
}

/// Apply a 2×3 affine warp (frame → output coordinates) to produce an output image.
///
/// Uses bilinear interpolation. Out-of-bounds pixels are filled with 0 (black).
fn warp_affine(frame: &RgbImage, matrix: &[f32; 6], out_w: u32, out_h: u32) -> RgbImage {
    let Some(inverse) = invert_affine(matrix) else {
        return RgbImage::new(out_w, out_h);
    };

    RgbImage::from_fn(out_w, out_h, |ox, oy| {
        let (sx, sy) = apply_affine(&inverse, ox as f32, oy as f32);
        Rgb(sample_rgb(frame, sx, sy).map(|v| v.round().clamp(0.0, 255.0) as u8))
    })
}

/// Align a detected face to a canonical `size`×`size` crop.
///
/// Computes the similarity transform from the detected landmarks to the
/// reference positions for `size` and warps the face region into the crop.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5], size: u32) -> AlignedFace {
    let matrix = estimate_similarity_transform(landmarks, &reference_landmarks(size));
    let crop = warp_affine(frame, &matrix, size, size);
    AlignedFace { crop, matrix }
}
