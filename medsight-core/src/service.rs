//! Transport-neutral request handlers for the analysis endpoints.
//!
//! Each handler returns an [`ApiResponse`] holding an HTTP status and a JSON or PNG body, so a
//! web front end only has to move bytes. Errors are mapped to statuses here and nowhere else.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use medsight_utils::config::{SegmentationResponseMode, ServiceSettings};

use crate::dispatcher::{AnalysisOutcome, AnalysisRequest, AnalysisResult, InferenceDispatcher};
use crate::engine::{ModelDescriptor, ModelLoader};
use crate::error::{AnalysisError, ErrorCategory};
use crate::model::TractModelLoader;
use crate::pool::WorkerPool;
use crate::prompt::Prompts;
use crate::registry::ModelRegistry;
use crate::response::{
    classification_json, error_body, health_report, models_listing, png_bytes, segmentation_json,
};

/// Uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Png(Vec<u8>),
}

/// Status plus body, ready for any transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl ApiResponse {
    /// JSON body for responses not tied to a model, such as listings and health.
    fn json<T: Serialize>(status: u16, body: &T) -> Self {
        serde_json::to_value(body)
            .map(|value| Self {
                status,
                body: ResponseBody::Json(value),
            })
            .unwrap_or_else(|err| {
                warn!("failed to serialize response body: {err}");
                Self {
                    status: ErrorCategory::InferenceFailure.http_status(),
                    body: ResponseBody::Json(serde_json::json!({
                        "success": false,
                        "error": "failed to encode the response",
                        "category": ErrorCategory::InferenceFailure.as_str(),
                    })),
                }
            })
    }

    /// JSON body describing `model_id`; a serialization failure is reported against that model.
    fn model_json<T: Serialize>(model_id: &str, status: u16, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(value) => Self {
                status,
                body: ResponseBody::Json(value),
            },
            Err(err) => {
                warn!("failed to serialize response for '{model_id}': {err}");
                Self::error(&AnalysisError::inference(model_id, err.into()))
            }
        }
    }

    fn error(err: &AnalysisError) -> Self {
        let body = error_body(err);
        Self {
            status: err.category().http_status(),
            body: ResponseBody::Json(serde_json::json!({
                "success": body.success,
                "error": body.error,
                "category": body.category,
            })),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> &'static str {
        match self.body {
            ResponseBody::Json(_) => "application/json",
            ResponseBody::Png(_) => "image/png",
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Png(_) => None,
        }
    }
}

/// Registry, dispatcher and worker pool wired together from one settings document.
pub struct AnalysisService {
    settings: ServiceSettings,
    registry: Arc<ModelRegistry>,
    pool: WorkerPool,
}

impl std::fmt::Debug for AnalysisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisService")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .finish()
    }
}

impl AnalysisService {
    /// Build a service that loads ONNX weights from the configured checkpoints directory.
    pub fn from_settings(settings: ServiceSettings) -> Result<Self> {
        Self::with_loader(settings, Arc::new(TractModelLoader))
    }

    pub fn with_loader(settings: ServiceSettings, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        settings.validate().context("invalid service settings")?;
        let registry = Arc::new(ModelRegistry::from_settings(&settings, loader));
        let dispatcher = Arc::new(InferenceDispatcher::new(Arc::clone(&registry), &settings));
        let pool = WorkerPool::new(dispatcher, &settings.workers)?;
        Ok(Self {
            settings,
            registry,
            pool,
        })
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Load every configured model now instead of on first request.
    pub fn preload(&self) -> usize {
        self.registry.preload_all()
    }

    /// `POST /analyze`: any configured model; segmentation answers per response mode.
    pub fn analyze(
        &self,
        upload: Option<Upload>,
        model_type: Option<&str>,
        prompts: Option<Prompts>,
    ) -> ApiResponse {
        let upload = match require_upload(upload) {
            Ok(upload) => upload,
            Err(err) => return ApiResponse::error(&err),
        };
        let model_id = model_type
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| self.settings.default_model.clone());
        let Some(model_id) = model_id else {
            return ApiResponse::error(&AnalysisError::invalid_input("model_type is required"));
        };

        let mut request = AnalysisRequest::new(upload.bytes, upload.file_name, model_id);
        request.prompts = prompts;
        self.run(request)
    }

    /// `POST /vit_analyze`: the dedicated classification model.
    pub fn vit_analyze(&self, upload: Option<Upload>) -> ApiResponse {
        let upload = match require_upload(upload) {
            Ok(upload) => upload,
            Err(err) => return ApiResponse::error(&err),
        };
        let Some(model_id) = self.settings.classification_model_id() else {
            return ApiResponse::error(&AnalysisError::ModelLoadFailure {
                model_id: "classification".to_string(),
                reason: "no classification model is configured".to_string(),
            });
        };
        self.run(AnalysisRequest::new(upload.bytes, upload.file_name, model_id))
    }

    /// `GET /models`
    pub fn models(&self) -> ApiResponse {
        ApiResponse::json(
            200,
            &models_listing(&self.registry.list_available(), &self.settings.device),
        )
    }

    /// `GET /health`
    pub fn health(&self) -> ApiResponse {
        ApiResponse::json(
            200,
            &health_report(&self.registry.list_available(), &self.settings.device),
        )
    }

    /// Retry loading a model whose previous attempt failed.
    pub fn reload(&self, model_id: &str) -> ApiResponse {
        match self.registry.reload(model_id) {
            Ok(_) => match self.registry.descriptor(model_id) {
                Some(descriptor) => ApiResponse::model_json(model_id, 200, &descriptor),
                None => ApiResponse::error(&AnalysisError::ModelNotFound(model_id.to_string())),
            },
            Err(err) => ApiResponse::error(&AnalysisError::from(err)),
        }
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.registry.list_available()
    }

    fn run(&self, request: AnalysisRequest) -> ApiResponse {
        debug!(
            "analysis request: {} ({} bytes) with '{}'",
            request.file_name,
            request.image_bytes.len(),
            request.model_id
        );
        match self.pool.analyze(request) {
            Ok(result) => self.encode(&result),
            Err(err) => ApiResponse::error(&err),
        }
    }

    fn encode(&self, result: &AnalysisResult) -> ApiResponse {
        let seconds = result.processing_time.as_secs_f64();
        let encoded = match &result.outcome {
            AnalysisOutcome::Segmentation(seg) => match self.settings.segmentation.response_mode {
                SegmentationResponseMode::Png => png_bytes(&seg.overlay).map(|bytes| ApiResponse {
                    status: 200,
                    body: ResponseBody::Png(bytes),
                }),
                SegmentationResponseMode::Json => segmentation_json(&result.model_id, seconds, seg)
                    .map(|body| ApiResponse::model_json(&result.model_id, 200, &body)),
            },
            AnalysisOutcome::Classification(cls) => {
                classification_json(&result.model_id, seconds, cls)
                    .map(|body| ApiResponse::model_json(&result.model_id, 200, &body))
            }
        };
        encoded.unwrap_or_else(|err| {
            ApiResponse::error(&AnalysisError::inference(result.model_id.as_str(), err))
        })
    }
}

fn require_upload(upload: Option<Upload>) -> Result<Upload, AnalysisError> {
    let upload = upload.ok_or_else(|| AnalysisError::invalid_input("no file part in request"))?;
    if upload.file_name.trim().is_empty() {
        return Err(AnalysisError::invalid_input("no file selected"));
    }
    Ok(upload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
            Err(S::Error::custom("non-finite payload"))
        }
    }

    #[test]
    fn serialization_failure_names_the_model() {
        let response = ApiResponse::model_json("vit", 200, &Unencodable);
        assert_eq!(response.status, 500);
        let body = response.as_json().unwrap();
        assert_eq!(body["category"], "inference_failure");
        let message = body["error"].as_str().unwrap();
        assert!(message.contains("'vit'"), "{message}");
        assert!(!message.contains("response"), "{message}");
    }

    #[test]
    fn serialization_failure_without_a_model_is_generic() {
        let response = ApiResponse::json(200, &Unencodable);
        assert_eq!(response.status, 500);
        assert!(!response.is_success());
        let body = response.as_json().unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "failed to encode the response");
    }

    #[test]
    fn json_bodies_keep_their_status() {
        let response = ApiResponse::json(200, &serde_json::json!({ "status": "healthy" }));
        assert!(response.is_success());
        assert_eq!(response.content_type(), "application/json");
    }
}
