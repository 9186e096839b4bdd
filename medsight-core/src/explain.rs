//! Threshold decision and Grad-CAM heatmaps for binary classifiers.
//!
//! A heatmap is produced only for positive decisions. It explains the positive class: channel
//! weights are the spatial mean of the class-score gradients, the weighted activation sum is
//! rectified and min-max scaled, then upsampled to the classifier input, colored with a jet
//! palette and blended with the image the classifier saw.

use anyhow::{Context, Result, ensure};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Luma, Rgb, RgbImage};
use log::debug;
use ndarray::{Array2, Axis};
use serde::Serialize;

use medsight_utils::config::{ClassificationSettings, HeatmapSettings};
use medsight_utils::{resize_image, timing_guard};

use crate::engine::{
    ActivationMaps, ClassificationEngine, ClassificationOutput, NEGATIVE_CLASS, POSITIVE_CLASS,
};
use crate::preprocess::NormalizedTensor;

const SCALE_EPSILON: f32 = 1e-7;

/// Binary decision on the positive finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    Positive,
    Negative,
}

/// Probability for each class, as reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Confidence {
    pub positive: f32,
    pub negative: f32,
}

/// Decision, display label and optional heatmap for one classified image.
#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub diagnosis: Diagnosis,
    pub label: String,
    pub confidence: Confidence,
    pub threshold: f32,
    pub heatmap: Option<RgbImage>,
}

/// Applies the decision threshold and renders class activation heatmaps.
#[derive(Debug, Clone)]
pub struct ExplainabilityEngine {
    threshold: f32,
    positive_label: String,
    negative_label: String,
    heatmap: HeatmapSettings,
}

impl Default for ExplainabilityEngine {
    fn default() -> Self {
        Self::from_settings(&ClassificationSettings::default())
    }
}

impl ExplainabilityEngine {
    pub fn from_settings(settings: &ClassificationSettings) -> Self {
        Self {
            threshold: settings.decision_threshold,
            positive_label: settings.positive_label.clone(),
            negative_label: settings.negative_label.clone(),
            heatmap: settings.heatmap.clone(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Positive exactly when `p_positive >= threshold`.
    pub fn decide(&self, p_positive: f32) -> Diagnosis {
        if p_positive >= self.threshold {
            Diagnosis::Positive
        } else {
            Diagnosis::Negative
        }
    }

    pub fn label(&self, diagnosis: Diagnosis) -> &str {
        match diagnosis {
            Diagnosis::Positive => &self.positive_label,
            Diagnosis::Negative => &self.negative_label,
        }
    }

    /// Classify `input` and, for positive decisions, explain the positive class.
    pub fn classify(
        &self,
        engine: &mut dyn ClassificationEngine,
        input: &NormalizedTensor,
    ) -> Result<Explanation> {
        let output = engine.classify(input).context("classifier forward pass failed")?;
        self.explain(output, engine, input)
    }

    /// Turn probabilities into an [`Explanation`], asking `engine` for activations when needed.
    pub fn explain(
        &self,
        output: ClassificationOutput,
        engine: &mut dyn ClassificationEngine,
        input: &NormalizedTensor,
    ) -> Result<Explanation> {
        ensure!(
            output
                .probabilities
                .iter()
                .all(|p| p.is_finite() && (0.0..=1.0).contains(p)),
            "classifier returned invalid probabilities {:?}",
            output.probabilities
        );
        let confidence = Confidence {
            positive: output.probabilities[POSITIVE_CLASS],
            negative: output.probabilities[NEGATIVE_CLASS],
        };
        let diagnosis = self.decide(confidence.positive);
        debug!(
            "p(positive)={:.4} threshold={:.2} -> {diagnosis:?}",
            confidence.positive, self.threshold
        );

        let heatmap = match diagnosis {
            Diagnosis::Positive => {
                let maps = engine
                    .class_activation(input, POSITIVE_CLASS)
                    .context("failed to compute class activations")?;
                Some(self.render_heatmap(&maps, input)?)
            }
            Diagnosis::Negative => None,
        };

        Ok(Explanation {
            diagnosis,
            label: self.label(diagnosis).to_string(),
            confidence,
            threshold: self.threshold,
            heatmap,
        })
    }

    /// Blend a Grad-CAM map over the image the classifier saw.
    pub fn render_heatmap(
        &self,
        maps: &ActivationMaps,
        input: &NormalizedTensor,
    ) -> Result<RgbImage> {
        let _guard = timing_guard("medsight_core::grad_cam", log::Level::Debug);
        let base = match &input.model_view {
            Some(view) => view.clone(),
            None => input.source.clone(),
        };
        let (width, height) = base.dimensions();
        let cam = grad_cam(maps)?;
        let cam = upsample_bilinear(&cam, width, height)?;
        let rendered = overlay_cam(&base, &cam, self.heatmap.image_weight);

        if self.heatmap.upscale_to_original {
            let (ow, oh) = input.original_size();
            if (ow, oh) != (width, height) {
                return Ok(resize_image(
                    &DynamicImage::ImageRgb8(rendered),
                    ow,
                    oh,
                    FilterType::Triangle,
                ));
            }
        }
        Ok(rendered)
    }
}

/// Class activation map scaled to `[0, 1]` at the activation resolution.
pub fn grad_cam(maps: &ActivationMaps) -> Result<Array2<f32>> {
    ensure!(
        maps.activations.dim() == maps.gradients.dim(),
        "activation shape {:?} does not match gradient shape {:?}",
        maps.activations.dim(),
        maps.gradients.dim()
    );
    let (channels, height, width) = maps.activations.dim();
    ensure!(
        channels > 0 && height > 0 && width > 0,
        "activation maps are empty"
    );

    let weights = maps
        .gradients
        .mean_axis(Axis(2))
        .and_then(|m| m.mean_axis(Axis(1)))
        .context("failed to average gradients")?;

    let mut cam = Array2::<f32>::zeros((height, width));
    for (weight, activation) in weights.iter().zip(maps.activations.axis_iter(Axis(0))) {
        cam.scaled_add(*weight, &activation);
    }
    cam.mapv_inplace(|v| v.max(0.0));

    let min = cam.iter().copied().fold(f32::INFINITY, f32::min);
    cam.mapv_inplace(|v| v - min);
    let max = cam.iter().copied().fold(0.0f32, f32::max);
    cam.mapv_inplace(|v| v / (max + SCALE_EPSILON));
    Ok(cam)
}

/// Bilinear (triangle filter) resize of a `(rows, cols)` map to `width` x `height`.
pub fn upsample_bilinear(map: &Array2<f32>, width: u32, height: u32) -> Result<Array2<f32>> {
    let (rows, cols) = map.dim();
    ensure!(rows > 0 && cols > 0, "activation map has an empty extent");
    if (rows, cols) == (height as usize, width as usize) {
        return Ok(map.clone());
    }
    let plane: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(cols as u32, rows as u32, map.iter().copied().collect())
            .context("activation map does not fit an image plane")?;
    let resized = imageops::resize(&plane, width, height, FilterType::Triangle);
    let mut cam = Array2::from_shape_vec((height as usize, width as usize), resized.into_raw())
        .context("resized activation map has an unexpected shape")?;
    cam.mapv_inplace(|v| v.clamp(0.0, 1.0));
    Ok(cam)
}

/// Jet palette: dark blue at 0 through cyan, yellow to dark red at 1.
pub fn jet(value: f32) -> [u8; 3] {
    let v = value.clamp(0.0, 1.0);
    let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round();
    [channel(3.0) as u8, channel(2.0) as u8, channel(1.0) as u8]
}

/// `(1 - w) * heatmap + w * image`, rescaled so the brightest channel value is 255.
pub fn overlay_cam(base: &RgbImage, cam: &Array2<f32>, image_weight: f32) -> RgbImage {
    let (width, height) = base.dimensions();
    let w = image_weight.clamp(0.0, 1.0);
    let mut blended = vec![0.0f32; (width * height * 3) as usize];
    let mut peak = 0.0f32;
    for (x, y, pixel) in base.enumerate_pixels() {
        // Quantize like an 8-bit colormap lookup.
        let level = (cam[(y as usize, x as usize)] * 255.0).round() / 255.0;
        let heat = jet(level);
        let offset = ((y * width + x) * 3) as usize;
        for c in 0..3 {
            let value = (1.0 - w) * (heat[c] as f32 / 255.0) + w * (pixel[c] as f32 / 255.0);
            blended[offset + c] = value;
            peak = peak.max(value);
        }
    }
    let scale = if peak > 0.0 { 1.0 / peak } else { 0.0 };
    RgbImage::from_fn(width, height, |x, y| {
        let offset = ((y * width + x) * 3) as usize;
        let px = |c: usize| (blended[offset + c] * scale * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgb([px(0), px(1), px(2)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ModelKind;
    use ndarray::{Array3, Array4};

    struct FixedClassifier {
        p_positive: f32,
        explained: Vec<usize>,
    }

    impl ClassificationEngine for FixedClassifier {
        fn classify(&mut self, _: &NormalizedTensor) -> Result<ClassificationOutput> {
            Ok(ClassificationOutput {
                probabilities: [1.0 - self.p_positive, self.p_positive],
            })
        }

        fn class_activation(
            &mut self,
            _: &NormalizedTensor,
            target_class: usize,
        ) -> Result<ActivationMaps> {
            self.explained.push(target_class);
            let mut activations = Array3::zeros((2, 4, 4));
            activations[(0, 1, 1)] = 3.0;
            activations[(1, 2, 2)] = 1.0;
            Ok(ActivationMaps {
                activations,
                gradients: Array3::from_elem((2, 4, 4), 0.5),
            })
        }
    }

    fn input() -> NormalizedTensor {
        NormalizedTensor {
            kind: ModelKind::Classification,
            tensor: Array4::zeros((1, 3, 224, 224)),
            source: RgbImage::from_pixel(300, 200, Rgb([40, 40, 40])),
            model_view: Some(RgbImage::from_pixel(224, 224, Rgb([40, 40, 40]))),
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let engine = ExplainabilityEngine::default();
        assert_eq!(engine.threshold(), 0.85);
        assert_eq!(engine.decide(0.85), Diagnosis::Positive);
        assert_eq!(engine.decide(0.8499), Diagnosis::Negative);
        assert_eq!(engine.label(Diagnosis::Positive), "TB Detected");
        assert_eq!(engine.label(Diagnosis::Negative), "Normal");
    }

    #[test]
    fn heatmap_only_for_positive_decisions() {
        let engine = ExplainabilityEngine::default();
        let input = input();

        let mut positive = FixedClassifier {
            p_positive: 0.85,
            explained: Vec::new(),
        };
        let result = engine.classify(&mut positive, &input).unwrap();
        assert_eq!(result.diagnosis, Diagnosis::Positive);
        assert_eq!(result.heatmap.as_ref().map(|h| h.dimensions()), Some((224, 224)));
        assert_eq!(positive.explained, vec![POSITIVE_CLASS]);

        let mut negative = FixedClassifier {
            p_positive: 0.8499,
            explained: Vec::new(),
        };
        let result = engine.classify(&mut negative, &input).unwrap();
        assert_eq!(result.diagnosis, Diagnosis::Negative);
        assert_eq!(result.label, "Normal");
        assert!(result.heatmap.is_none());
        assert!(negative.explained.is_empty());
    }

    #[test]
    fn upscale_option_restores_original_size() {
        let mut settings = ClassificationSettings::default();
        settings.heatmap.upscale_to_original = true;
        let engine = ExplainabilityEngine::from_settings(&settings);
        let mut clf = FixedClassifier {
            p_positive: 0.99,
            explained: Vec::new(),
        };
        let result = engine.classify(&mut clf, &input()).unwrap();
        assert_eq!(result.heatmap.unwrap().dimensions(), (300, 200));
    }

    #[test]
    fn grad_cam_highlights_strongest_activation() {
        let mut activations = Array3::zeros((2, 3, 3));
        activations[(0, 0, 0)] = 2.0;
        activations[(1, 2, 2)] = 1.0;
        let mut gradients = Array3::zeros((2, 3, 3));
        gradients.index_axis_mut(Axis(0), 0).fill(1.0);
        gradients.index_axis_mut(Axis(0), 1).fill(-1.0);
        let cam = grad_cam(&ActivationMaps {
            activations,
            gradients,
        })
        .unwrap();
        assert!((cam[(0, 0)] - 1.0).abs() < 1e-5);
        // The negatively weighted channel is rectified away.
        assert_eq!(cam[(2, 2)], 0.0);
        assert!(cam.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn grad_cam_rejects_mismatched_maps() {
        let maps = ActivationMaps {
            activations: Array3::zeros((2, 3, 3)),
            gradients: Array3::zeros((1, 3, 3)),
        };
        assert!(grad_cam(&maps).is_err());
    }

    #[test]
    fn jet_endpoints() {
        assert_eq!(jet(0.0), [0, 0, 128]);
        assert_eq!(jet(1.0), [128, 0, 0]);
        assert_eq!(jet(0.5), [128, 255, 128]);
    }

    #[test]
    fn upsample_preserves_constant_maps() {
        let map = Array2::from_elem((14, 14), 0.25f32);
        let up = upsample_bilinear(&map, 224, 224).unwrap();
        assert_eq!(up.dim(), (224, 224));
        assert!(up.iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn upsample_interpolates_between_cells() {
        let map = ndarray::array![[0.0f32, 1.0]];
        let up = upsample_bilinear(&map, 8, 1).unwrap();
        let row: Vec<f32> = up.iter().copied().collect();
        assert!(row.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(row[0] < 0.5 && row[7] > 0.5);
        assert!(row.iter().any(|v| *v > 0.0 && *v < 1.0));
        assert!(row.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn upsample_rejects_empty_maps() {
        assert!(upsample_bilinear(&Array2::zeros((0, 4)), 8, 8).is_err());
    }

    #[test]
    fn invalid_probabilities_are_rejected() {
        let engine = ExplainabilityEngine::default();
        let mut clf = FixedClassifier {
            p_positive: f32::NAN,
            explained: Vec::new(),
        };
        assert!(engine.classify(&mut clf, &input()).is_err());
    }
}
