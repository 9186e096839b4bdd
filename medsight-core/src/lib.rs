//! Core MedSight analysis primitives.
//!
//! This crate owns the model registry, runs segmentation and classification models with
//! `tract-onnx`, renders mask overlays and Grad-CAM heatmaps, and exposes the request handlers
//! behind a bounded worker pool.

/// Mask union and overlay rendering.
pub mod compositor;
/// Request orchestration.
pub mod dispatcher;
/// Engine traits and loaded-model handles.
pub mod engine;
/// Error taxonomy and status mapping.
pub mod error;
/// Threshold decision and Grad-CAM.
pub mod explain;
/// ONNX backends.
pub mod model;
/// Bounded worker pool.
pub mod pool;
/// Upload decoding and tensor normalization.
pub mod preprocess;
/// Segmentation prompts.
pub mod prompt;
/// Lazily loaded model table.
pub mod registry;
/// Wire shapes and encoders.
pub mod response;
/// Endpoint handlers.
pub mod service;

pub use compositor::{Composite, MaskCompositor, OverlayStyle, union_mask};
pub use dispatcher::{
    AnalysisOutcome, AnalysisRequest, AnalysisResult, ClassificationResult, InferenceDispatcher,
    SegmentationResult,
};
pub use engine::{
    ActivationMaps, ClassificationEngine, ClassificationOutput, Engine, LoadState,
    ModelDescriptor, ModelHandle, ModelKind, ModelLoader, RawInferenceOutput, SegmentationEngine,
    SegmentationOutput,
};
pub use error::{AnalysisError, ErrorCategory, PreprocessError, RegistryError};
pub use explain::{Confidence, Diagnosis, ExplainabilityEngine, Explanation};
pub use model::{TractClassificationModel, TractModelLoader, TractSegmentationModel};
pub use pool::{PendingAnalysis, WorkerPool};
pub use preprocess::{ClassificationInput, CpuPreprocessor, NormalizedTensor, Preprocessor};
pub use prompt::{BoxPrompt, Point, Prompts};
pub use registry::ModelRegistry;
pub use service::{AnalysisService, ApiResponse, ResponseBody, Upload};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
