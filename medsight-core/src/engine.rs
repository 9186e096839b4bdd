//! Inference engine abstractions shared by the registry, dispatcher and tests.
//!
//! A loaded model is an [`Engine`]: either a segmentation or a classification backend behind a
//! trait object. The registry hands out [`ModelHandle`]s that serialize access to the engine,
//! so backends may keep mutable scratch state between calls.

use std::{
    fmt,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use anyhow::Result;
use ndarray::{Array2, Array3};
use serde::Serialize;

use crate::preprocess::NormalizedTensor;
use crate::prompt::Prompts;
pub use medsight_utils::config::ModelKind;

/// Index of the "normal" class in classifier outputs.
pub const NEGATIVE_CLASS: usize = 0;
/// Index of the positive finding class in classifier outputs.
pub const POSITIVE_CLASS: usize = 1;

/// Lifecycle of a configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

impl LoadState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Loading => "loading",
            LoadState::Ready => "ready",
            LoadState::Failed => "failed",
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub kind: ModelKind,
    pub weights_location: PathBuf,
    pub load_state: LoadState,
    /// Number of load attempts made so far. Each explicit reload starts a new attempt.
    pub attempts: u32,
}

/// Masks and scores produced by a segmentation backend.
///
/// `logits` keeps the raw per-pixel scores the masks were thresholded from; it may be empty when
/// a backend only reports binary masks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentationOutput {
    pub masks: Vec<Array2<bool>>,
    pub scores: Vec<f32>,
    pub logits: Vec<Array2<f32>>,
}

/// Class probabilities produced by a binary classifier, indexed by class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationOutput {
    pub probabilities: [f32; 2],
}

impl ClassificationOutput {
    pub fn positive(&self) -> f32 {
        self.probabilities[POSITIVE_CLASS]
    }

    pub fn negative(&self) -> f32 {
        self.probabilities[NEGATIVE_CLASS]
    }
}

/// Feature maps of the explained layer and the gradient of one class score with respect to them.
///
/// Both arrays are `(channels, height, width)` and must share a shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationMaps {
    pub activations: Array3<f32>,
    pub gradients: Array3<f32>,
}

/// Output of one inference call before post-processing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawInferenceOutput {
    Segmentation(SegmentationOutput),
    Classification(ClassificationOutput),
}

/// Prompted mask prediction.
pub trait SegmentationEngine: Send {
    fn segment(&mut self, input: &NormalizedTensor, prompts: &Prompts)
    -> Result<SegmentationOutput>;
}

/// Binary classifier that can also expose the activations needed for Grad-CAM.
pub trait ClassificationEngine: Send {
    fn classify(&mut self, input: &NormalizedTensor) -> Result<ClassificationOutput>;

    /// Activations and class-score gradients of the explained layer for `target_class`.
    fn class_activation(
        &mut self,
        input: &NormalizedTensor,
        target_class: usize,
    ) -> Result<ActivationMaps>;
}

/// A loaded backend of either kind.
pub enum Engine {
    Segmentation(Box<dyn SegmentationEngine>),
    Classification(Box<dyn ClassificationEngine>),
}

impl Engine {
    pub fn kind(&self) -> ModelKind {
        match self {
            Engine::Segmentation(_) => ModelKind::Segmentation,
            Engine::Classification(_) => ModelKind::Classification,
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Engine::{}", self.kind())
    }
}

/// Loaded model shared across requests.
///
/// Inference calls on the same handle are serialized by an internal mutex.
#[derive(Debug)]
pub struct ModelHandle {
    id: String,
    kind: ModelKind,
    engine: Mutex<Engine>,
}

impl ModelHandle {
    pub fn new(id: impl Into<String>, engine: Engine) -> Self {
        Self {
            id: id.into(),
            kind: engine.kind(),
            engine: Mutex::new(engine),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Exclusive access to the engine.
    ///
    /// A panic during an earlier inference poisons the mutex; the engine holds no invariants
    /// that a half-finished call could break, so the guard is recovered.
    pub fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Builds an [`Engine`] for a configured model. Implementations must be callable from any thread.
pub trait ModelLoader: Send + Sync {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Engine>;
}

/// Numerically stable softmax over a logit slice.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}
