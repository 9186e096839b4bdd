//! ONNX backends executed with `tract-onnx`.
//!
//! Graph conventions:
//! - segmentation graphs take `image [1,3,H,W]`, `point_coords [1,N,2]` and `point_labels [1,N]`
//!   and return mask logits `[1,M,H',W']` followed by scores `[1,M]`;
//! - classification graphs take `[1,3,S,S]` and return logits `[1,2]`. Graphs exported for
//!   explanation additionally return the explained layer's activations `[1,C,h,w]` and the
//!   per-class gradients of the logits with respect to them `[2,C,h,w]`.

use std::{borrow::Cow, fmt::Write, path::Path};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use ndarray::{Array2, Array3, Array4};
use tract_onnx::prelude::{
    Framework, Graph, InferenceModelExt, IntoTensor, SimplePlan, Tensor, TypedFact, TypedOp,
};

use medsight_utils::timing_guard;

use crate::engine::{
    ActivationMaps, ClassificationEngine, ClassificationOutput, Engine, ModelDescriptor,
    ModelKind, ModelLoader, SegmentationEngine, SegmentationOutput, softmax,
};
use crate::preprocess::NormalizedTensor;
use crate::prompt::Prompts;

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Mask logits above this value are foreground.
pub const MASK_LOGIT_THRESHOLD: f32 = 0.0;

const LABEL_FOREGROUND: f32 = 1.0;
const LABEL_BOX_TOP_LEFT: f32 = 2.0;
const LABEL_BOX_BOTTOM_RIGHT: f32 = 3.0;
const LABEL_PADDING: f32 = -1.0;

/// Parse an ONNX graph, preferring the optimized plan and falling back to the decluttered one.
fn load_graph(path: &Path, label: &str) -> Result<RunnableModel> {
    anyhow::ensure!(path.exists(), "model file not found: {}", path.display());
    let _guard = timing_guard(format!("medsight_core::load[{label}]"), log::Level::Info);

    match load_runnable_model(path, true) {
        Ok(model) => {
            debug!("{label} graph {} optimized successfully", path.display());
            Ok(model)
        }
        Err(opt_err) => {
            let optimize_msg = format!("{opt_err}");
            let mut chain_msg = String::new();
            for cause in opt_err.chain() {
                let _ = writeln!(&mut chain_msg, "  - {cause}");
            }
            warn!(
                "{label} graph {} failed optimized load ({}); falling back to decluttered graph.\nError chain:\n{}",
                path.display(),
                optimize_msg,
                chain_msg.trim_end()
            );
            let decluttered = load_runnable_model(path, false).with_context(|| {
                format!("fallback to decluttered {label} graph failed after optimize error: {optimize_msg}")
            })?;
            debug!("{label} graph {} running in decluttered mode", path.display());
            Ok(decluttered)
        }
    }
}

fn load_runnable_model(path: &Path, optimized: bool) -> Result<RunnableModel> {
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to parse ONNX graph from {}", path.display()))?;

    if optimized {
        model
            .into_optimized()
            .map_err(|e| anyhow!("unable to optimize graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow!("unable to make graph runnable: {e}"))
    } else {
        model
            .into_typed()
            .map_err(|e| anyhow!("unable to type-check graph: {e}"))?
            .into_decluttered()
            .map_err(|e| anyhow!("unable to declutter graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow!("unable to make graph runnable: {e}"))
    }
}

fn array_to_tensor(array: &Array4<f32>) -> Result<Tensor> {
    let data: Cow<'_, [f32]> = match array.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(array.iter().copied().collect()),
    };
    Tensor::from_shape(array.shape(), &data).map_err(|e| anyhow!("failed to build tensor: {e}"))
}

fn run_graph(model: &RunnableModel, inputs: Vec<Tensor>, label: &str) -> Result<Vec<Tensor>> {
    let _guard = timing_guard(format!("medsight_core::infer[{label}]"), log::Level::Debug);
    let outputs = model
        .run(inputs.into_iter().map(Into::into).collect())
        .map_err(|e| anyhow!("{label} execution failed: {e}"))?;
    Ok(outputs.into_iter().map(|value| value.into_tensor()).collect())
}

fn f32_data<'a>(tensor: &'a Tensor, what: &str) -> Result<&'a [f32]> {
    tensor
        .as_slice::<f32>()
        .map_err(|e| anyhow!("{what} output is not f32: {e}"))
}

/// Trailing `(height, width)` of a tensor with at least two dimensions.
fn spatial_dims(tensor: &Tensor, what: &str) -> Result<(usize, usize)> {
    let shape = tensor.shape();
    anyhow::ensure!(
        shape.len() >= 2,
        "{what} output must have at least 2 dimensions, got {shape:?}"
    );
    Ok((shape[shape.len() - 2], shape[shape.len() - 1]))
}

/// Trailing `(channels, height, width)` of an activation tensor.
fn feature_dims(tensor: &Tensor, what: &str) -> Result<(usize, usize, usize)> {
    let shape = tensor.shape();
    anyhow::ensure!(
        shape.len() >= 3,
        "{what} output must have at least 3 dimensions, got {shape:?}"
    );
    let n = shape.len();
    Ok((shape[n - 3], shape[n - 2], shape[n - 1]))
}

/// Encode prompts the way promptable mask decoders expect: clicks carry label 1, each box
/// becomes two corner points labelled 2 and 3, and a padding point labelled -1 is appended
/// when no box is present.
pub fn encode_prompts(prompts: &Prompts) -> (Vec<f32>, Vec<f32>) {
    let mut coords = Vec::with_capacity((prompts.points.len() + prompts.boxes.len() * 2 + 1) * 2);
    let mut labels = Vec::with_capacity(prompts.points.len() + prompts.boxes.len() * 2 + 1);
    for point in &prompts.points {
        coords.extend_from_slice(&[point.x, point.y]);
        labels.push(LABEL_FOREGROUND);
    }
    for b in &prompts.boxes {
        coords.extend_from_slice(&[b.x0, b.y0, b.x1, b.y1]);
        labels.extend_from_slice(&[LABEL_BOX_TOP_LEFT, LABEL_BOX_BOTTOM_RIGHT]);
    }
    if prompts.boxes.is_empty() {
        coords.extend_from_slice(&[0.0, 0.0]);
        labels.push(LABEL_PADDING);
    }
    (coords, labels)
}

/// Promptable segmentation graph.
#[derive(Debug)]
pub struct TractSegmentationModel {
    runnable: RunnableModel,
    label: String,
}

impl TractSegmentationModel {
    pub fn load<P: AsRef<Path>>(model_path: P, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let runnable = load_graph(model_path.as_ref(), &label)?;
        Ok(Self { runnable, label })
    }
}

impl SegmentationEngine for TractSegmentationModel {
    fn segment(
        &mut self,
        input: &NormalizedTensor,
        prompts: &Prompts,
    ) -> Result<SegmentationOutput> {
        let image = array_to_tensor(&input.tensor)?;
        let (coords, labels) = encode_prompts(prompts);
        let count = labels.len();
        let coords = Tensor::from_shape(&[1, count, 2], &coords)
            .map_err(|e| anyhow!("failed to build prompt coordinates: {e}"))?;
        let labels = Tensor::from_shape(&[1, count], &labels)
            .map_err(|e| anyhow!("failed to build prompt labels: {e}"))?;

        let outputs = run_graph(&self.runnable, vec![image, coords, labels], &self.label)?;
        anyhow::ensure!(
            outputs.len() >= 2,
            "segmentation graph must return masks and scores, got {} outputs",
            outputs.len()
        );
        decode_segmentation(&outputs[0], &outputs[1])
    }
}

/// Split mask logits into per-mask arrays and threshold them.
pub(crate) fn decode_segmentation(masks: &Tensor, scores: &Tensor) -> Result<SegmentationOutput> {
    let (height, width) = spatial_dims(masks, "mask")?;
    let data = f32_data(masks, "mask")?;
    let plane = height * width;
    anyhow::ensure!(plane > 0, "mask output has an empty spatial extent");
    let count = data.len() / plane;
    let scores = f32_data(scores, "score")?.to_vec();
    anyhow::ensure!(
        scores.len() == count,
        "segmentation graph returned {count} masks but {} scores",
        scores.len()
    );

    let mut logits = Vec::with_capacity(count);
    let mut binary = Vec::with_capacity(count);
    for chunk in data.chunks_exact(plane) {
        let mask_logits = Array2::from_shape_vec((height, width), chunk.to_vec())
            .context("mask logits do not match their declared shape")?;
        binary.push(mask_logits.mapv(|v| v > MASK_LOGIT_THRESHOLD));
        logits.push(mask_logits);
    }
    Ok(SegmentationOutput {
        masks: binary,
        scores,
        logits,
    })
}

/// Binary classification graph, optionally exported with Grad-CAM outputs.
#[derive(Debug)]
pub struct TractClassificationModel {
    runnable: RunnableModel,
    label: String,
}

impl TractClassificationModel {
    pub fn load<P: AsRef<Path>>(model_path: P, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let runnable = load_graph(model_path.as_ref(), &label)?;
        Ok(Self { runnable, label })
    }

    fn run(&self, input: &NormalizedTensor) -> Result<Vec<Tensor>> {
        let tensor = array_to_tensor(&input.tensor)?;
        let outputs = run_graph(&self.runnable, vec![tensor], &self.label)?;
        anyhow::ensure!(!outputs.is_empty(), "classification graph produced no outputs");
        Ok(outputs)
    }
}

impl ClassificationEngine for TractClassificationModel {
    fn classify(&mut self, input: &NormalizedTensor) -> Result<ClassificationOutput> {
        let outputs = self.run(input)?;
        let logits = f32_data(&outputs[0], "logit")?;
        anyhow::ensure!(
            logits.len() == 2,
            "binary classifier must return 2 logits, got {}",
            logits.len()
        );
        let probs = softmax(logits);
        Ok(ClassificationOutput {
            probabilities: [probs[0], probs[1]],
        })
    }

    fn class_activation(
        &mut self,
        input: &NormalizedTensor,
        target_class: usize,
    ) -> Result<ActivationMaps> {
        let outputs = self.run(input)?;
        anyhow::ensure!(
            outputs.len() >= 3,
            "graph '{}' does not expose activations and gradients for explanation",
            self.label
        );
        decode_activation_maps(&outputs[1], &outputs[2], target_class)
    }
}

pub(crate) fn decode_activation_maps(
    activations: &Tensor,
    gradients: &Tensor,
    target_class: usize,
) -> Result<ActivationMaps> {
    let (channels, height, width) = feature_dims(activations, "activation")?;
    let block = channels * height * width;
    let act = f32_data(activations, "activation")?;
    anyhow::ensure!(
        act.len() == block,
        "activation output holds {} values, expected {block}",
        act.len()
    );
    let grads = f32_data(gradients, "gradient")?;
    anyhow::ensure!(
        block > 0 && grads.len() % block == 0,
        "gradient output does not match activation shape {channels}x{height}x{width}"
    );
    let classes = grads.len() / block;
    anyhow::ensure!(
        target_class < classes,
        "gradient output covers {classes} classes, cannot explain class {target_class}"
    );
    let start = target_class * block;
    Ok(ActivationMaps {
        activations: Array3::from_shape_vec((channels, height, width), act.to_vec())?,
        gradients: Array3::from_shape_vec(
            (channels, height, width),
            grads[start..start + block].to_vec(),
        )?,
    })
}

/// Loads ONNX weights from the configured checkpoint location.
#[derive(Debug, Default, Clone, Copy)]
pub struct TractModelLoader;

impl ModelLoader for TractModelLoader {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Engine> {
        info!(
            "loading {} model '{}' from {}",
            descriptor.kind,
            descriptor.id,
            descriptor.weights_location.display()
        );
        let path = &descriptor.weights_location;
        Ok(match descriptor.kind {
            ModelKind::Segmentation => Engine::Segmentation(Box::new(
                TractSegmentationModel::load(path, descriptor.id.as_str())?,
            )),
            ModelKind::Classification => Engine::Classification(Box::new(
                TractClassificationModel::load(path, descriptor.id.as_str())?,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoadState;
    use crate::prompt::BoxPrompt;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn descriptor(path: &Path, kind: ModelKind) -> ModelDescriptor {
        ModelDescriptor {
            id: "test".into(),
            kind,
            weights_location: path.to_path_buf(),
            load_state: LoadState::Unloaded,
            attempts: 0,
        }
    }

    #[test]
    fn loading_missing_model_fails() {
        let err = TractModelLoader
            .load(&descriptor(Path::new("missing.onnx"), ModelKind::Segmentation))
            .unwrap_err();
        assert!(format!("{err}").contains("model file not found"));
    }

    #[test]
    fn invalid_model_produces_useful_error() {
        let mut temp = NamedTempFile::new().expect("temp file");
        temp.write_all(b"not a real onnx file")
            .expect("write mock model");

        let err = TractModelLoader
            .load(&descriptor(temp.path(), ModelKind::Classification))
            .expect_err("invalid ONNX should fail");
        let message = format!("{err:#}");
        assert!(
            message.contains("failed to parse ONNX") || message.contains("unable to optimize"),
            "Unexpected error message: {message}"
        );
    }

    #[test]
    fn prompts_follow_decoder_label_convention() {
        let (coords, labels) = encode_prompts(&Prompts::point(4.0, 5.0));
        assert_eq!(coords, vec![4.0, 5.0, 0.0, 0.0]);
        assert_eq!(labels, vec![1.0, -1.0]);

        let boxed = Prompts {
            points: Vec::new(),
            boxes: vec![BoxPrompt::new(1.0, 2.0, 3.0, 4.0)],
        };
        let (coords, labels) = encode_prompts(&boxed);
        assert_eq!(coords, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(labels, vec![2.0, 3.0]);
    }

    #[test]
    fn segmentation_outputs_are_split_and_thresholded() {
        let masks = Tensor::from_shape(&[1, 2, 1, 2], &[0.5f32, -0.5, -1.0, 2.0]).unwrap();
        let scores = Tensor::from_shape(&[1, 2], &[0.9f32, 0.4]).unwrap();
        let out = decode_segmentation(&masks, &scores).unwrap();
        assert_eq!(out.masks.len(), 2);
        assert_eq!(out.masks[0].as_slice().unwrap(), &[true, false]);
        assert_eq!(out.masks[1].as_slice().unwrap(), &[false, true]);
        assert_eq!(out.scores, vec![0.9, 0.4]);
        assert_eq!(out.logits[1][(0, 1)], 2.0);

        let short_scores = Tensor::from_shape(&[1, 1], &[0.9f32]).unwrap();
        assert!(decode_segmentation(&masks, &short_scores).is_err());
    }

    #[test]
    fn activation_maps_select_target_class() {
        let activations = Tensor::from_shape(&[1, 1, 1, 2], &[1.0f32, 2.0]).unwrap();
        let gradients = Tensor::from_shape(&[2, 1, 1, 2], &[0.1f32, 0.2, 0.3, 0.4]).unwrap();
        let maps = decode_activation_maps(&activations, &gradients, 1).unwrap();
        assert_eq!(maps.gradients.as_slice().unwrap(), &[0.3, 0.4]);
        assert_eq!(maps.activations.as_slice().unwrap(), &[1.0, 2.0]);
        assert!(decode_activation_maps(&activations, &gradients, 2).is_err());
    }
}
