//! Request-level orchestration: validate, resolve, preprocess, infer, post-process.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use image::RgbImage;
use log::{error, info};

use medsight_utils::config::{DefaultPrompt, ServiceSettings, UploadSettings};
use medsight_utils::{file_extension, timing_guard};

use crate::compositor::{MaskCompositor, OverlayStyle};
use crate::engine::{Engine, ModelHandle, ModelKind, RawInferenceOutput};
use crate::error::AnalysisError;
use crate::explain::{Confidence, Diagnosis, ExplainabilityEngine};
use crate::preprocess::{ClassificationInput, CpuPreprocessor, Preprocessor};
use crate::prompt::Prompts;
use crate::registry::{ModelRegistry, panic_message};

/// One analysis job.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub image_bytes: Vec<u8>,
    /// Client-supplied file name; only its extension is used.
    pub file_name: String,
    pub model_id: String,
    pub prompts: Option<Prompts>,
}

impl AnalysisRequest {
    pub fn new(
        image_bytes: Vec<u8>,
        file_name: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            image_bytes,
            file_name: file_name.into(),
            model_id: model_id.into(),
            prompts: None,
        }
    }

    pub fn with_prompts(mut self, prompts: Prompts) -> Self {
        self.prompts = Some(prompts);
        self
    }
}

/// Rendered segmentation result.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationResult {
    pub overlay: RgbImage,
    pub per_mask: Vec<RgbImage>,
    pub scores: Vec<f32>,
    /// Prompts actually handed to the model.
    pub prompts: Prompts,
}

impl SegmentationResult {
    pub fn num_segments(&self) -> usize {
        self.per_mask.len()
    }
}

/// Thresholded classification result.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub diagnosis: Diagnosis,
    pub label: String,
    pub confidence: Confidence,
    pub decision_threshold: f32,
    pub heatmap: Option<RgbImage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Segmentation(SegmentationResult),
    Classification(ClassificationResult),
}

/// Outcome plus bookkeeping for one request.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub model_id: String,
    pub processing_time: Duration,
    pub outcome: AnalysisOutcome,
}

/// Runs requests end to end against the registry's models.
#[derive(Debug)]
pub struct InferenceDispatcher {
    registry: Arc<ModelRegistry>,
    preprocessor: Arc<dyn Preprocessor>,
    compositor: MaskCompositor,
    explainer: ExplainabilityEngine,
    upload: UploadSettings,
    default_prompt: DefaultPrompt,
}

impl InferenceDispatcher {
    pub fn new(registry: Arc<ModelRegistry>, settings: &ServiceSettings) -> Self {
        let preprocessor = CpuPreprocessor::new(ClassificationInput::from(&settings.classification));
        Self::with_preprocessor(registry, Arc::new(preprocessor), settings)
    }

    pub fn with_preprocessor(
        registry: Arc<ModelRegistry>,
        preprocessor: Arc<dyn Preprocessor>,
        settings: &ServiceSettings,
    ) -> Self {
        Self {
            registry,
            preprocessor,
            compositor: MaskCompositor::new(OverlayStyle::from(&settings.segmentation)),
            explainer: ExplainabilityEngine::from_settings(&settings.classification),
            upload: settings.upload.clone(),
            default_prompt: settings.segmentation.default_prompt,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Checks that need no loaded model: presence, size, extension (narrowed by the model kind
    /// from the table), model id and prompt sanity.
    pub fn validate(&self, request: &AnalysisRequest) -> Result<(), AnalysisError> {
        if request.file_name.trim().is_empty() {
            return Err(AnalysisError::invalid_input("no file selected"));
        }
        if request.image_bytes.is_empty() {
            return Err(AnalysisError::invalid_input("uploaded file is empty"));
        }
        if request.image_bytes.len() > self.upload.max_bytes {
            return Err(AnalysisError::invalid_input(format!(
                "upload is {} bytes, limit is {} bytes",
                request.image_bytes.len(),
                self.upload.max_bytes
            )));
        }
        let extension = file_extension(&request.file_name).unwrap_or_default();
        if !self.upload.allows(&extension, None) {
            return Err(AnalysisError::invalid_input(format!(
                "file type '{}' is not allowed; accepted: {}",
                extension,
                self.upload.allowed_extensions.join(", ")
            )));
        }
        if request.model_id.trim().is_empty() {
            return Err(AnalysisError::invalid_input("model_type is required"));
        }
        let kind = self.registry.descriptor(&request.model_id).map(|d| d.kind);
        if kind == Some(ModelKind::Classification)
            && !self.upload.allows(&extension, Some(ModelKind::Classification))
        {
            return Err(AnalysisError::invalid_input(format!(
                "file type '{}' is not supported for classification; accepted: {}",
                extension,
                self.upload.classification_extensions.join(", ")
            )));
        }
        if let Some(prompts) = &request.prompts {
            prompts.validate()?;
        }
        Ok(())
    }

    /// Analyze one request.
    ///
    /// Steps run in a fixed order and the first failure wins, so a bad extension is reported
    /// before an unknown model id. Failures after the model is resolved, including undecodable
    /// uploads and panics inside engines, surface as [`AnalysisError::InferenceFailure`].
    pub fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        self.validate(request)?;

        let handle = self.registry.resolve(&request.model_id)?;

        let timer = timing_guard(
            format!("medsight_core::analyze[{}]", request.model_id),
            log::Level::Debug,
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_pipeline(&handle, request)))
            .unwrap_or_else(|payload| {
                Err(anyhow!(
                    "inference panicked: {}",
                    panic_message(payload.as_ref())
                ))
            })
            .map_err(|err| {
                error!("analysis with '{}' failed: {err:#}", request.model_id);
                AnalysisError::inference(&request.model_id, err)
            })?;

        let processing_time = timer.finish();
        info!(
            "analyzed '{}' with '{}' in {:.2?}",
            request.file_name, request.model_id, processing_time
        );
        Ok(AnalysisResult {
            model_id: request.model_id.clone(),
            processing_time,
            outcome,
        })
    }

    fn run_pipeline(
        &self,
        handle: &ModelHandle,
        request: &AnalysisRequest,
    ) -> Result<AnalysisOutcome> {
        let input = self
            .preprocessor
            .normalize(&request.image_bytes, handle.kind())
            .with_context(|| format!("failed to preprocess '{}'", request.file_name))?;

        let (width, height) = input.original_size();
        let prompts = match handle.kind() {
            ModelKind::Segmentation => {
                Prompts::resolve(request.prompts.as_ref(), width, height, self.default_prompt)
            }
            ModelKind::Classification => Prompts::default(),
        };

        let mut engine = handle.lock();
        let raw = match &mut *engine {
            Engine::Segmentation(model) => RawInferenceOutput::Segmentation(
                model
                    .segment(&input, &prompts)
                    .context("segmentation forward pass failed")?,
            ),
            Engine::Classification(model) => RawInferenceOutput::Classification(
                model
                    .classify(&input)
                    .context("classifier forward pass failed")?,
            ),
        };

        match raw {
            RawInferenceOutput::Segmentation(output) => {
                drop(engine);
                let composite = self
                    .compositor
                    .composite(&input.source, &output.masks, &output.scores)
                    .context("failed to composite masks")?;
                Ok(AnalysisOutcome::Segmentation(SegmentationResult {
                    overlay: composite.overlay,
                    per_mask: composite.per_mask,
                    scores: output.scores,
                    prompts,
                }))
            }
            RawInferenceOutput::Classification(output) => {
                let Engine::Classification(model) = &mut *engine else {
                    bail!("engine for model '{}' is not a classifier", handle.id());
                };
                let explanation = self.explainer.explain(output, model.as_mut(), &input)?;
                Ok(AnalysisOutcome::Classification(ClassificationResult {
                    diagnosis: explanation.diagnosis,
                    label: explanation.label,
                    confidence: explanation.confidence,
                    decision_threshold: explanation.threshold,
                    heatmap: explanation.heatmap,
                }))
            }
        }
    }
}
