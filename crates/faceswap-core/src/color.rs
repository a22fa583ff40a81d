//! Color encoding conversions between decoded images, model frames and tensors.
//!
//! Decoders hand back whatever encoding the file carried (RGBA, 16-bit,
//! grayscale, ...). Every model in the pipeline consumes packed 8-bit RGB,
//! and results are persisted as 8-bit RGB JPEG.

use image::{DynamicImage, RgbImage};
use ndarray::Array4;

/// Convert a decoded image into the packed RGB frame the models expect.
pub fn to_model_frame(image: &DynamicImage) -> RgbImage {
    image.to_rgb8()
}

/// Wrap a model frame back into a persistable image.
pub fn from_model_frame(frame: RgbImage) -> DynamicImage {
    DynamicImage::ImageRgb8(frame)
}

/// Pack an RGB frame into a normalized NCHW tensor: `(p - mean) / std`.
pub fn frame_to_nchw(frame: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (frame.width() as usize, frame.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));

    for (x, y, pixel) in frame.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 - mean) / std;
        }
    }

    tensor
}

/// Unpack a flat NCHW RGB tensor (batch 1) into a frame, scaling each value
/// by `scale` and clamping to `[0, 255]`.
///
/// Returns `None` when `data` holds fewer than `3 * width * height` values.
pub fn nchw_to_frame(data: &[f32], width: u32, height: u32, scale: f32) -> Option<RgbImage> {
    let plane = (width * height) as usize;
    if data.len() < plane * 3 {
        return None;
    }

    let mut frame = RgbImage::new(width, height);
    for (x, y, pixel) in frame.enumerate_pixels_mut() {
        let idx = y as usize * width as usize + x as usize;
        for c in 0..3 {
            pixel[c] = (data[c * plane + idx] * scale).round().clamp(0.0, 255.0) as u8;
        }
    }

    Some(frame)
}
