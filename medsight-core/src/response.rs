//! Wire shapes for analysis results and their encoders.
//!
//! Images travel either as raw PNG bytes or as standard base64 PNG text inside JSON.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};

use medsight_utils::{encode_png, encode_png_base64};

use crate::dispatcher::{ClassificationResult, SegmentationResult};
use crate::engine::{LoadState, ModelDescriptor, ModelKind};
use crate::error::AnalysisError;

pub use medsight_utils::decode_png_base64;

/// JSON answer for segmentation models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationResponse {
    pub success: bool,
    pub model_used: String,
    pub num_segments: usize,
    /// Seconds.
    pub processing_time: f64,
    /// Base64 PNG per mask, in model output order.
    pub masks: Vec<String>,
    pub scores: Vec<f32>,
    /// Base64 PNG of the combined overlay.
    pub overlay_image: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBody {
    pub tb_detected: f32,
    pub normal: f32,
}

/// JSON answer for classification models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResponse {
    pub success: bool,
    pub model_used: String,
    pub prediction: String,
    pub confidence: ConfidenceBody,
    pub decision_threshold: f32,
    /// Base64 PNG; `null` for negative predictions.
    pub heatmap_image: Option<String>,
    /// Seconds.
    pub processing_time: f64,
}

/// `/models` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub segmentation_models: Vec<String>,
    pub classification_models: Vec<String>,
    pub device: String,
}

/// `/health` report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"ok"` unless some model failed to load, then `"degraded"`.
    pub status: String,
    /// Whether each configured model is loaded.
    pub models: BTreeMap<String, bool>,
    pub device: String,
}

/// Body of every error answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub category: String,
}

pub fn png_bytes(image: &RgbImage) -> Result<Vec<u8>> {
    encode_png(&DynamicImage::ImageRgb8(image.clone())).context("failed to encode PNG response")
}

pub fn png_base64(image: &RgbImage) -> Result<String> {
    encode_png_base64(&DynamicImage::ImageRgb8(image.clone()))
        .context("failed to encode base64 PNG")
}

pub fn segmentation_json(
    model_id: &str,
    processing_time: f64,
    result: &SegmentationResult,
) -> Result<SegmentationResponse> {
    let masks = result
        .per_mask
        .iter()
        .map(png_base64)
        .collect::<Result<Vec<_>>>()?;
    Ok(SegmentationResponse {
        success: true,
        model_used: model_id.to_string(),
        num_segments: result.num_segments(),
        processing_time,
        masks,
        scores: result.scores.clone(),
        overlay_image: png_base64(&result.overlay)?,
    })
}

pub fn classification_json(
    model_id: &str,
    processing_time: f64,
    result: &ClassificationResult,
) -> Result<ClassificationResponse> {
    Ok(ClassificationResponse {
        success: true,
        model_used: model_id.to_string(),
        prediction: result.label.clone(),
        confidence: ConfidenceBody {
            tb_detected: result.confidence.positive,
            normal: result.confidence.negative,
        },
        decision_threshold: result.decision_threshold,
        heatmap_image: result.heatmap.as_ref().map(png_base64).transpose()?,
        processing_time,
    })
}

/// Listing of models clients may request. Failed models are left out.
pub fn models_listing(descriptors: &[ModelDescriptor], device: &str) -> ModelsResponse {
    let ids = |kind: ModelKind| -> Vec<String> {
        descriptors
            .iter()
            .filter(|d| d.kind == kind && d.load_state != LoadState::Failed)
            .map(|d| d.id.clone())
            .collect()
    };
    ModelsResponse {
        segmentation_models: ids(ModelKind::Segmentation),
        classification_models: ids(ModelKind::Classification),
        device: device.to_string(),
    }
}

pub fn health_report(descriptors: &[ModelDescriptor], device: &str) -> HealthResponse {
    let degraded = descriptors
        .iter()
        .any(|d| d.load_state == LoadState::Failed);
    HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        models: descriptors
            .iter()
            .map(|d| (d.id.clone(), d.load_state == LoadState::Ready))
            .collect(),
        device: device.to_string(),
    }
}

pub fn error_body(err: &AnalysisError) -> ErrorResponse {
    ErrorResponse {
        success: false,
        error: err.public_message(),
        category: err.category().as_str().to_string(),
    }
}
