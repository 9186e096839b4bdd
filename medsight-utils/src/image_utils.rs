use std::path::Path;

use anyhow::Result;
use image::{DynamicImage, ImageFormat, RgbImage, imageops::FilterType};
use ndarray::{Array3, Axis};

/// Sniff the container format of an encoded image from its leading bytes.
///
/// Returns `None` when the bytes do not start with a signature the codec layer knows.
pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Decode an in-memory image using an already sniffed format.
///
/// The raw [`image::ImageError`] is returned so callers can tell a codec that is not compiled
/// in (`ImageError::Unsupported`) apart from corrupt data.
pub fn decode_image(bytes: &[u8], format: ImageFormat) -> image::ImageResult<DynamicImage> {
    image::load_from_memory_with_format(bytes, format)
}

/// Lower-cased extension of an uploaded file name, without the dot.
pub fn file_extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Resize an image to the requested resolution using the provided filter.
pub fn resize_image(image: &DynamicImage, width: u32, height: u32, filter: FilterType) -> RgbImage {
    image.resize_exact(width, height, filter).to_rgb8()
}

/// Convert an RGB image into a CHW array of raw `0..=255` values.
pub fn rgb_to_chw(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut array = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (xi, yi) = (x as usize, y as usize);
        for channel in 0..3 {
            array[(channel, yi, xi)] = pixel[channel] as f32;
        }
    }
    array
}

/// Standardize every value by the sample's own mean and unbiased standard deviation.
///
/// A constant sample has zero spread, so it is only centred. Returns the `(mean, std)` used.
pub fn standardize_in_place(array: &mut Array3<f32>) -> (f32, f32) {
    let Some(mean) = array.mean() else {
        return (0.0, 0.0);
    };
    let std = if array.len() > 1 { array.std(1.0) } else { 0.0 };
    if std > f32::EPSILON {
        array.mapv_inplace(|v| (v - mean) / std);
    } else {
        array.mapv_inplace(|v| v - mean);
    }
    (mean, std)
}

/// Scale raw `0..=255` values to `0..=1` and apply fixed per-channel statistics.
pub fn normalize_channels(array: &mut Array3<f32>, mean: [f32; 3], std: [f32; 3]) -> Result<()> {
    anyhow::ensure!(
        array.len_of(Axis(0)) == 3,
        "expected 3 channels, got {}",
        array.len_of(Axis(0))
    );
    for (channel, mut plane) in array.axis_iter_mut(Axis(0)).enumerate() {
        let (m, s) = (mean[channel], std[channel]);
        anyhow::ensure!(s > 0.0, "channel {channel} std must be positive");
        plane.mapv_inplace(|v| (v / 255.0 - m) / s);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn rgb_to_chw_keeps_channel_order() {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(0, 0, Rgb([0, 128, 255]));
        image.put_pixel(1, 0, Rgb([255, 128, 0]));

        let array = rgb_to_chw(&image);
        assert_eq!(array.shape(), &[3, 2, 2]);
        assert_eq!(array[(0, 0, 0)], 0.0);
        assert_eq!(array[(2, 0, 0)], 255.0);
        assert_eq!(array[(0, 0, 1)], 255.0);
        assert_eq!(array[(1, 0, 1)], 128.0);
    }

    #[test]
    fn standardize_produces_zero_mean_unit_std() {
        let mut array = Array3::from_shape_vec((1, 1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let (mean, std) = standardize_in_place(&mut array);
        assert!((mean - 2.5).abs() < 1e-6);
        assert!((std - 1.290_994_4).abs() < 1e-5);
        let sum: f32 = array.iter().sum();
        assert!(sum.abs() < 1e-5);
    }

    #[test]
    fn standardize_centres_constant_input() {
        let mut array = Array3::from_elem((3, 2, 2), 7.0f32);
        let (_, std) = standardize_in_place(&mut array);
        assert_eq!(std, 0.0);
        assert!(array.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn standardize_handles_degenerate_extents() {
        let mut single = Array3::from_elem((1, 1, 1), 42.0f32);
        assert_eq!(standardize_in_place(&mut single), (42.0, 0.0));
        assert_eq!(single[(0, 0, 0)], 0.0);

        let mut empty = Array3::<f32>::zeros((3, 0, 0));
        assert_eq!(standardize_in_place(&mut empty), (0.0, 0.0));
    }

    #[test]
    fn normalize_channels_maps_to_unit_range() {
        let mut array = Array3::from_elem((3, 1, 2), 255.0f32);
        array[(1, 0, 0)] = 0.0;
        normalize_channels(&mut array, [0.5; 3], [0.5; 3]).unwrap();
        assert_eq!(array[(0, 0, 0)], 1.0);
        assert_eq!(array[(1, 0, 0)], -1.0);
    }

    #[test]
    fn file_extension_is_lowercased() {
        assert_eq!(file_extension("scan.PNG").as_deref(), Some("png"));
        assert_eq!(file_extension("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(file_extension("noext"), None);
    }

    #[test]
    fn sniff_rejects_garbage() {
        assert!(sniff_format(b"definitely not an image").is_none());
        assert!(sniff_format(&[]).is_none());
    }
}
