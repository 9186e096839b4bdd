//! Preprocessing utilities for turning uploaded bytes into model inputs.
//!
//! Segmentation models receive the full-resolution image, channel-first, standardized by the
//! sample's own mean and standard deviation. Classification models receive a fixed-size resize
//! normalized with per-channel statistics from [`ClassificationInput`].

use image::{DynamicImage, GenericImageView, ImageError, RgbImage, imageops::FilterType};
use log::debug;
use ndarray::{Array4, Axis};

use medsight_utils::config::ClassificationSettings;
use medsight_utils::{
    decode_image, normalize_channels, resize_image, rgb_to_chw, sniff_format,
    standardize_in_place, timing_guard,
};

use crate::engine::ModelKind;
use crate::error::PreprocessError;

/// Fixed input geometry and statistics for classification models.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationInput {
    /// Square side length of the model input.
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for ClassificationInput {
    fn default() -> Self {
        Self {
            size: 224,
            mean: [0.5; 3],
            std: [0.5; 3],
        }
    }
}

impl From<&ClassificationSettings> for ClassificationInput {
    fn from(settings: &ClassificationSettings) -> Self {
        Self {
            size: settings.input_size,
            mean: settings.mean,
            std: settings.std,
        }
    }
}

/// Model-ready tensor plus the images needed later for rendering.
#[derive(Debug, Clone)]
pub struct NormalizedTensor {
    pub kind: ModelKind,
    /// `[1, 3, H, W]` float tensor in RGB channel order.
    pub tensor: Array4<f32>,
    /// Decoded upload as RGB at its original resolution.
    pub source: RgbImage,
    /// The resized, un-normalized image the classifier saw. `None` for segmentation.
    pub model_view: Option<RgbImage>,
}

impl NormalizedTensor {
    /// Original `(width, height)` of the upload.
    pub fn original_size(&self) -> (u32, u32) {
        self.source.dimensions()
    }

    /// Spatial `(width, height)` of the tensor.
    pub fn tensor_size(&self) -> (u32, u32) {
        let shape = self.tensor.shape();
        (shape[3] as u32, shape[2] as u32)
    }
}

/// Converts upload bytes into a [`NormalizedTensor`] for a model kind.
pub trait Preprocessor: Send + Sync + std::fmt::Debug {
    fn normalize(&self, bytes: &[u8], kind: ModelKind) -> Result<NormalizedTensor, PreprocessError>;
}

/// Default CPU implementation backed by `image` + ndarray utilities.
#[derive(Debug, Default, Clone)]
pub struct CpuPreprocessor {
    classification: ClassificationInput,
}

impl CpuPreprocessor {
    pub fn new(classification: ClassificationInput) -> Self {
        Self { classification }
    }

    pub fn classification_input(&self) -> &ClassificationInput {
        &self.classification
    }

    /// Normalize an already decoded image.
    pub fn normalize_image(
        &self,
        image: &DynamicImage,
        kind: ModelKind,
    ) -> Result<NormalizedTensor, PreprocessError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(PreprocessError::Decode(
                "image has zero width or height".to_string(),
            ));
        }
        match kind {
            ModelKind::Segmentation => Ok(segmentation_tensor(image)),
            ModelKind::Classification => classification_tensor(image, &self.classification),
        }
    }
}

impl Preprocessor for CpuPreprocessor {
    fn normalize(&self, bytes: &[u8], kind: ModelKind) -> Result<NormalizedTensor, PreprocessError> {
        let _guard = timing_guard("medsight_core::preprocess", log::Level::Debug);
        let image = decode_upload(bytes)?;
        self.normalize_image(&image, kind)
    }
}

/// Decode upload bytes, distinguishing unknown formats from corrupt data.
pub fn decode_upload(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::Decode("upload is empty".to_string()));
    }
    let format = sniff_format(bytes).ok_or_else(|| {
        PreprocessError::UnsupportedFormat("unrecognized image signature".to_string())
    })?;
    debug!("decoding {format:?} upload ({} bytes)", bytes.len());
    decode_image(bytes, format).map_err(|err| match err {
        ImageError::Unsupported(inner) => PreprocessError::UnsupportedFormat(inner.to_string()),
        other => PreprocessError::Decode(other.to_string()),
    })
}

fn segmentation_tensor(image: &DynamicImage) -> NormalizedTensor {
    let source = image.to_rgb8();
    let mut chw = rgb_to_chw(&source);
    let (mean, std) = standardize_in_place(&mut chw);
    debug!(
        "segmentation input {}x{} standardized (mean {mean:.3}, std {std:.3})",
        source.width(),
        source.height()
    );
    NormalizedTensor {
        kind: ModelKind::Segmentation,
        tensor: chw.insert_axis(Axis(0)),
        source,
        model_view: None,
    }
}

fn classification_tensor(
    image: &DynamicImage,
    input: &ClassificationInput,
) -> Result<NormalizedTensor, PreprocessError> {
    if input.size == 0 {
        return Err(PreprocessError::Tensor(
            "classification input size must be greater than zero".to_string(),
        ));
    }
    let resized = resize_image(image, input.size, input.size, FilterType::Triangle);
    let mut chw = rgb_to_chw(&resized);
    normalize_channels(&mut chw, input.mean, input.std)
        .map_err(|err| PreprocessError::Tensor(format!("{err:#}")))?;
    Ok(NormalizedTensor {
        kind: ModelKind::Classification,
        tensor: chw.insert_axis(Axis(0)),
        source: image.to_rgb8(),
        model_view: Some(resized),
    })
}
