//! Error taxonomy surfaced by the analysis pipeline.
//!
//! Stage internals use `anyhow`; these enums are what crosses component boundaries. The
//! mapping to HTTP status codes lives in [`ErrorCategory::http_status`] and is only consulted
//! by the service layer.

use serde::Serialize;
use thiserror::Error;

/// Coarse error class reported to callers alongside a human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidInput,
    ModelNotFound,
    ModelLoadFailure,
    InferenceFailure,
    ServiceOverloaded,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::ModelNotFound => "model_not_found",
            ErrorCategory::ModelLoadFailure => "model_load_failure",
            ErrorCategory::InferenceFailure => "inference_failure",
            ErrorCategory::ServiceOverloaded => "service_overloaded",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorCategory::InvalidInput => 400,
            ErrorCategory::ModelNotFound => 404,
            ErrorCategory::ModelLoadFailure | ErrorCategory::ServiceOverloaded => 503,
            ErrorCategory::InferenceFailure => 500,
        }
    }

    /// Whether the same request may succeed if retried later without changes.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::ServiceOverloaded)
    }
}

/// Failures raised while resolving a model id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("model '{0}' is not configured")]
    NotFound(String),
    #[error("model '{model_id}' failed to load: {reason}")]
    LoadFailed { model_id: String, reason: String },
}

/// Failures raised while turning upload bytes into a model input.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("could not build model input: {0}")]
    Tensor(String),
}

/// Error returned by [`crate::InferenceDispatcher::analyze`] and the worker pool.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("model '{0}' not found")]
    ModelNotFound(String),
    #[error("model '{model_id}' is not loaded: {reason}")]
    ModelLoadFailure { model_id: String, reason: String },
    #[error("analysis with model '{model_id}' failed: {source:#}")]
    InferenceFailure {
        model_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{0}")]
    ServiceOverloaded(String),
}

impl AnalysisError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        AnalysisError::InvalidInput(message.into())
    }

    pub fn inference(model_id: impl Into<String>, source: anyhow::Error) -> Self {
        AnalysisError::InferenceFailure {
            model_id: model_id.into(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            AnalysisError::InvalidInput(_) => ErrorCategory::InvalidInput,
            AnalysisError::ModelNotFound(_) => ErrorCategory::ModelNotFound,
            AnalysisError::ModelLoadFailure { .. } => ErrorCategory::ModelLoadFailure,
            AnalysisError::InferenceFailure { .. } => ErrorCategory::InferenceFailure,
            AnalysisError::ServiceOverloaded(_) => ErrorCategory::ServiceOverloaded,
        }
    }

    /// Message safe to hand to remote callers. Inference causes stay in the server log.
    pub fn public_message(&self) -> String {
        match self {
            AnalysisError::InferenceFailure { model_id, .. } => {
                format!("an error occurred while analyzing the image with model '{model_id}'")
            }
            other => other.to_string(),
        }
    }
}

impl From<RegistryError> for AnalysisError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => AnalysisError::ModelNotFound(id),
            RegistryError::LoadFailed { model_id, reason } => {
                AnalysisError::ModelLoadFailure { model_id, reason }
            }
        }
    }
}
