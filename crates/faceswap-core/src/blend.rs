//! Paste-back of a swapped face crop into the full frame.
//!
//! The crop is warped back with the inverse alignment transform and blended
//! through a soft mask: the warped crop footprint, eroded so seams stay inside
//! the face, then Gaussian-feathered.

use crate::alignment::{apply_affine, invert_affine, sample_rgb};
use image::RgbImage;

/// Warped-mask values above this count as fully inside the crop.
const MASK_INSIDE_THRESHOLD: f32 = 20.0;
const MASK_FULL: f32 = 255.0;
const MIN_ERODE_KERNEL: usize = 10;
const MIN_BLUR_RADIUS: usize = 5;

/// Blend `crop` (aligned by `matrix`, frame → crop) back into `frame`.
pub fn paste_back(frame: &RgbImage, crop: &RgbImage, matrix: &[f32; 6]) -> RgbImage {
    let mut out = frame.clone();
    let Some(inverse) = invert_affine(matrix) else {
        return out;
    };

    let (crop_w, crop_h) = (crop.width() as f32, crop.height() as f32);
    let corners = [(0.0, 0.0), (crop_w, 0.0), (0.0, crop_h), (crop_w, crop_h)]
        .map(|(x, y)| apply_affine(&inverse, x, y));

    let min_x = corners.iter().map(|c| c.0).fold(f32::INFINITY, f32::min);
    let max_x = corners.iter().map(|c| c.0).fold(f32::NEG_INFINITY, f32::max);
    let min_y = corners.iter().map(|c| c.1).fold(f32::INFINITY, f32::min);
    let max_y = corners.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max);

    // Room for the erode and blur kernels around the footprint.
    let footprint = ((max_x - min_x) * (max_y - min_y)).max(0.0).sqrt() as usize;
    let margin = (footprint / 10).max(MIN_ERODE_KERNEL) + 2 * (footprint / 20).max(MIN_BLUR_RADIUS) + 2;

    let (fw, fh) = (frame.width() as i64, frame.height() as i64);
    let x0 = ((min_x.floor() as i64) - margin as i64).clamp(0, fw);
    let x1 = ((max_x.ceil() as i64) + margin as i64).clamp(0, fw);
    let y0 = ((min_y.floor() as i64) - margin as i64).clamp(0, fh);
    let y1 = ((max_y.ceil() as i64) + margin as i64).clamp(0, fh);
    if x0 >= x1 || y0 >= y1 {
        return out;
    }
    let (rw, rh) = ((x1 - x0) as usize, (y1 - y0) as usize);

    // Warped crop and its footprint mask, in region coordinates.
    let mut warped = vec![[0.0f32; 3]; rw * rh];
    let mut mask = vec![0.0f32; rw * rh];
    for ry in 0..rh {
        for rx in 0..rw {
            let (cx, cy) = apply_affine(matrix, (x0 as usize + rx) as f32, (y0 as usize + ry) as f32);
            let idx = ry * rw + rx;
            warped[idx] = sample_rgb(crop, cx, cy);
            let white = MASK_FULL * coverage(cx, cy, crop.width(), crop.height());
            mask[idx] = if white > MASK_INSIDE_THRESHOLD { MASK_FULL } else { white };
        }
    }

    let Some(mask_size) = full_mask_size(&mask, rw, rh) else {
        return out;
    };

    erode(&mut mask, rw, rh, (mask_size / 10).max(MIN_ERODE_KERNEL));
    gaussian_blur(&mut mask, rw, rh, 2 * (mask_size / 20).max(MIN_BLUR_RADIUS) + 1);

    for ry in 0..rh {
        for rx in 0..rw {
            let idx = ry * rw + rx;
            let alpha = mask[idx] / MASK_FULL;
            if alpha <= 0.0 {
                continue;
            }
            let pixel = out.get_pixel_mut(x0 as u32 + rx as u32, y0 as u32 + ry as u32);
            for c in 0..3 {
                let blended = alpha * warped[idx][c] + (1.0 - alpha) * pixel[c] as f32;
                pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Fraction of a bilinear tap at (x, y) that lands inside a `w`×`h` plane.
fn coverage(x: f32, y: f32, w: u32, h: u32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let (fx, fy) = (x - x0, y - y0);
    let inside = |px: f32, py: f32| -> f32 {
        if px >= 0.0 && px < w as f32 && py >= 0.0 && py < h as f32 {
            1.0
        } else {
            0.0
        }
    };
    inside(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + inside(x0 + 1.0, y0) * fx * (1.0 - fy)
        + inside(x0, y0 + 1.0) * (1.0 - fx) * fy
        + inside(x0 + 1.0, y0 + 1.0) * fx * fy
}

/// Geometric mean of the extent of fully-set mask pixels, or `None` if none are set.
fn full_mask_size(mask: &[f32], w: usize, h: usize) -> Option<usize> {
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (usize::MAX, 0, usize::MAX, 0);
    for y in 0..h {
        for x in 0..w {
            if mask[y * w + x] >= MASK_FULL {
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);
            }
        }
    }
    if min_x == usize::MAX {
        return None;
    }
    Some((((max_x - min_x) * (max_y - min_y)) as f32).sqrt() as usize)
}

// The mask filters below run on f32 planes with kernel sizes taken from the
// face size. `imageops::blur` takes a sigma and works on 8-bit pixels, which
// would quantize the feather, and imageproc is not a dependency.

/// Grayscale erosion with a `k`×`k` box, anchored at the kernel center.
/// Taps outside the plane are ignored.
fn erode(mask: &mut [f32], w: usize, h: usize, k: usize) {
    if k <= 1 {
        return;
    }
    let before = (k / 2) as i64;
    let after = (k - 1 - k / 2) as i64;
    let mut tmp = vec![0.0f32; mask.len()];

    for y in 0..h {
        for x in 0..w {
            let lo = (x as i64 - before).max(0) as usize;
            let hi = (x as i64 + after).min(w as i64 - 1) as usize;
            tmp[y * w + x] = mask[y * w + lo..=y * w + hi].iter().copied().fold(f32::INFINITY, f32::min);
        }
    }
    for y in 0..h {
        let lo = (y as i64 - before).max(0) as usize;
        let hi = (y as i64 + after).min(h as i64 - 1) as usize;
        for x in 0..w {
            mask[y * w + x] = (lo..=hi).map(|yy| tmp[yy * w + x]).fold(f32::INFINITY, f32::min);
        }
    }
}

/// Normalized 1-D Gaussian kernel of odd size `ksize`, sigma derived from the size.
fn gaussian_kernel(ksize: usize) -> Vec<f32> {
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (ksize / 2) as f32;
    let weights: Vec<f32> = (0..ksize)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|v| v / sum).collect()
}

/// Separable Gaussian blur with edge clamping.
fn gaussian_blur(mask: &mut [f32], w: usize, h: usize, ksize: usize) {
    let kernel = gaussian_kernel(ksize);
    let radius = (ksize / 2) as i64;
    let mut tmp = vec![0.0f32; mask.len()];

    for y in 0..h {
        for x in 0..w {
            tmp[y * w + x] = kernel
                .iter()
                .enumerate()
                .map(|(i, kv)| {
                    let sx = (x as i64 + i as i64 - radius).clamp(0, w as i64 - 1) as usize;
                    kv * mask[y * w + sx]
                })
                .sum();
        }
    }
    for y in 0..h {
        for x in 0..w {
            mask[y * w + x] = kernel
                .iter()
                .enumerate()
                .map(|(i, kv)| {
                    let sy = (y as i64 + i as i64 - radius).clamp(0, h as i64 - 1) as usize;
                    kv * tmp[sy * w + x]
                })
                .sum();
        }
    }
}
