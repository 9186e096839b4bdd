//! Mask union and translucent overlay rendering.

use anyhow::{Context, Result, ensure};
use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use ndarray::Array2;

use medsight_utils::config::SegmentationSettings;
use medsight_utils::timing_guard;

/// Overlay tint and opacity (`0` transparent, `255` opaque).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayStyle {
    pub color: [u8; 3],
    pub alpha: u8,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            color: [0, 255, 0],
            alpha: 150,
        }
    }
}

impl From<&SegmentationSettings> for OverlayStyle {
    fn from(settings: &SegmentationSettings) -> Self {
        Self {
            color: settings.overlay_color,
            alpha: settings.overlay_alpha,
        }
    }
}

/// Rendered segmentation result.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    /// Original image with the union of all masks tinted.
    pub overlay: RgbImage,
    /// One tinted rendering per mask, in model output order.
    pub per_mask: Vec<RgbImage>,
    /// Number of foreground pixels in the union mask.
    pub covered_pixels: usize,
}

/// Merges model masks and paints them over the source image.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskCompositor {
    style: OverlayStyle,
}

impl MaskCompositor {
    pub fn new(style: OverlayStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> OverlayStyle {
        self.style
    }

    /// Render the union overlay and per-mask overlays.
    ///
    /// Masks whose resolution differs from the image are resampled nearest-neighbour first.
    /// An empty mask list yields the original image unchanged.
    pub fn composite(
        &self,
        original: &RgbImage,
        masks: &[Array2<bool>],
        scores: &[f32],
    ) -> Result<Composite> {
        let _guard = timing_guard("medsight_core::composite", log::Level::Debug);
        ensure!(
            masks.len() == scores.len(),
            "model returned {} masks but {} scores",
            masks.len(),
            scores.len()
        );
        let (width, height) = original.dimensions();
        let fitted: Vec<Array2<bool>> = masks
            .iter()
            .map(|mask| fit_mask(mask, width, height))
            .collect::<Result<_>>()?;

        let (overlay, covered_pixels) = match union_mask(&fitted)? {
            Some(union) => {
                let covered = union.iter().filter(|&&v| v).count();
                (paint(original, &union, self.style), covered)
            }
            None => (original.clone(), 0),
        };
        let per_mask = fitted
            .iter()
            .map(|mask| paint(original, mask, self.style))
            .collect();

        Ok(Composite {
            overlay,
            per_mask,
            covered_pixels,
        })
    }
}

/// Element-wise OR of same-shaped masks. `None` for an empty list.
pub fn union_mask(masks: &[Array2<bool>]) -> Result<Option<Array2<bool>>> {
    let Some((first, rest)) = masks.split_first() else {
        return Ok(None);
    };
    let mut union = first.clone();
    for (index, mask) in rest.iter().enumerate() {
        ensure!(
            mask.dim() == union.dim(),
            "mask {} has shape {:?}, expected {:?}",
            index + 1,
            mask.dim(),
            union.dim()
        );
        union.zip_mut_with(mask, |acc, &m| *acc |= m);
    }
    Ok(Some(union))
}

/// Resample a `(rows, cols)` mask to `width` x `height` with nearest-neighbour lookup.
pub fn fit_mask(mask: &Array2<bool>, width: u32, height: u32) -> Result<Array2<bool>> {
    let (rows, cols) = mask.dim();
    ensure!(rows > 0 && cols > 0, "mask has an empty extent");
    if (rows, cols) == (height as usize, width as usize) {
        return Ok(mask.clone());
    }
    let plane = GrayImage::from_raw(
        cols as u32,
        rows as u32,
        mask.iter().map(|&on| if on { u8::MAX } else { 0 }).collect(),
    )
    .context("mask does not fit an image plane")?;
    let resized = imageops::resize(&plane, width, height, FilterType::Nearest);
    let fitted = resized.into_raw().into_iter().map(|v| v > u8::MAX / 2).collect();
    Array2::from_shape_vec((height as usize, width as usize), fitted)
        .context("resized mask has an unexpected shape")
}

fn blend_channel(src: u8, tint: u8, alpha: u8) -> u8 {
    let a = alpha as u32;
    ((src as u32 * (255 - a) + tint as u32 * a + 127) / 255) as u8
}

fn paint(original: &RgbImage, mask: &Array2<bool>, style: OverlayStyle) -> RgbImage {
    let mut out = original.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if mask[(y as usize, x as usize)] {
            let Rgb([r, g, b]) = *pixel;
            *pixel = Rgb([
                blend_channel(r, style.color[0], style.alpha),
                blend_channel(g, style.color[1], style.alpha),
                blend_channel(b, style.color[2], style.alpha),
            ]);
        }
    }
    out
}
