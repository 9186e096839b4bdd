//! Shared configuration types consumed across the MedSight workspace.
//!
//! [`ServiceSettings`] is the single serialized document that drives the model table, upload
//! policy, post-processing parameters and the worker pool. Every section uses
//! `#[serde(default)]` so partial JSON files only need to name what they override.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Upload cap applied when no override is configured (16 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Closed set of analysis model categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Produces pixel masks from an image plus optional prompts.
    Segmentation,
    /// Produces a binary label with confidence.
    Classification,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Segmentation => "segmentation",
            ModelKind::Classification => "classification",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "segmentation" | "seg" => Ok(ModelKind::Segmentation),
            "classification" | "cls" => Ok(ModelKind::Classification),
            other => Err(format!(
                "invalid model kind '{other}'; expected 'segmentation' or 'classification'"
            )),
        }
    }
}

/// One entry of the static model table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelSettings {
    /// Identifier clients pass as `model_type`.
    pub id: String,
    pub kind: ModelKind,
    /// Weights file, relative to `checkpoints_dir` unless absolute.
    pub weights: String,
}

impl ModelSettings {
    pub fn new(id: impl Into<String>, kind: ModelKind, weights: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            weights: weights.into(),
        }
    }
}

/// How `/analyze` answers for segmentation models.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationResponseMode {
    /// Raw PNG bytes of the combined overlay.
    Png,
    /// JSON document with base64 per-mask images and scores.
    #[default]
    Json,
}

impl FromStr for SegmentationResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid response mode '{other}'; expected 'png' or 'json'"
            )),
        }
    }
}

/// Prompt used for segmentation requests that arrive without points or boxes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPrompt {
    /// Single foreground click at the image centre.
    #[default]
    CenterPoint,
    /// Hand the engine an empty prompt set.
    Unprompted,
}

/// Upload acceptance policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadSettings {
    pub max_bytes: usize,
    /// Extensions accepted for any model (lowercase, no dot).
    pub allowed_extensions: Vec<String>,
    /// Narrower list applied on the classification path.
    pub classification_extensions: Vec<String>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_extensions: ["png", "jpg", "jpeg", "gif", "bmp", "tiff", "dcm"]
                .map(String::from)
                .to_vec(),
            classification_extensions: ["jpg", "jpeg", "png"].map(String::from).to_vec(),
        }
    }
}

impl UploadSettings {
    /// Returns `true` when `extension` is accepted for the given model kind.
    pub fn allows(&self, extension: &str, kind: Option<ModelKind>) -> bool {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        let general = self.allowed_extensions.iter().any(|e| e == &ext);
        match kind {
            Some(ModelKind::Classification) => {
                general && self.classification_extensions.iter().any(|e| e == &ext)
            }
            _ => general,
        }
    }
}

/// Overlay rendering and prompting for segmentation models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SegmentationSettings {
    /// RGB colour painted over foreground pixels.
    pub overlay_color: [u8; 3],
    /// Overlay opacity out of 255.
    pub overlay_alpha: u8,
    pub default_prompt: DefaultPrompt,
    pub response_mode: SegmentationResponseMode,
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self {
            overlay_color: [0, 255, 0],
            overlay_alpha: 150,
            default_prompt: DefaultPrompt::CenterPoint,
            response_mode: SegmentationResponseMode::Json,
        }
    }
}

/// Grad-CAM rendering preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeatmapSettings {
    /// Weight of the input image when blending with the colour map (0..=1).
    pub image_weight: f32,
    /// Resize the 224x224 rendering back to the upload's resolution before encoding.
    pub upscale_to_original: bool,
}

impl Default for HeatmapSettings {
    fn default() -> Self {
        Self {
            image_weight: 0.5,
            upscale_to_original: false,
        }
    }
}

/// Decision policy and input statistics for the classification model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassificationSettings {
    /// `P(positive)` at or above this value is reported positive.
    pub decision_threshold: f32,
    /// Square edge the classifier consumes.
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub positive_label: String,
    pub negative_label: String,
    pub heatmap: HeatmapSettings,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            decision_threshold: 0.85,
            input_size: 224,
            mean: [0.5; 3],
            std: [0.5; 3],
            positive_label: "TB Detected".to_string(),
            negative_label: "Normal".to_string(),
            heatmap: HeatmapSettings::default(),
        }
    }
}

/// Sizing of the inference worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Concurrent inference workers. One per accelerator device is the safe choice.
    pub workers: usize,
    /// Jobs that may wait for a worker before new submissions are rejected.
    pub queue_depth: usize,
    /// How long a caller waits for its result before giving up.
    pub request_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_depth: 8,
            request_timeout_secs: 120,
        }
    }
}

impl WorkerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Whether stage timing logs are emitted.
    pub enabled: bool,
    /// Logging level for telemetry output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string into a `LevelFilter`.
    pub fn level_filter(&self) -> LevelFilter {
        self.level
            .trim()
            .parse::<LevelFilter>()
            .unwrap_or(LevelFilter::Debug)
    }
}

/// Persistent service settings consumed by the CLI and any hosting server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Directory holding model weights.
    pub checkpoints_dir: PathBuf,
    pub models: Vec<ModelSettings>,
    /// Model used by `/analyze` when the request names none.
    ///
    /// Unset when a settings file omits it, so a file with its own model table never inherits
    /// an id from the built-in one.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Model behind `/vit_analyze`; the first classification model when unset.
    pub classification_model: Option<String>,
    /// Device label reported by `/models` and `/health`.
    pub device: String,
    pub upload: UploadSettings,
    pub segmentation: SegmentationSettings,
    pub classification: ClassificationSettings,
    pub workers: WorkerSettings,
    pub telemetry: TelemetrySettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        use ModelKind::{Classification, Segmentation};
        Self {
            checkpoints_dir: PathBuf::from("checkpoints"),
            models: vec![
                ModelSettings::new("medsam2_latest", Segmentation, "MedSAM2_latest.onnx"),
                ModelSettings::new("medsam2_2411", Segmentation, "MedSAM2_2411.onnx"),
                ModelSettings::new("us_heart", Segmentation, "MedSAM2_US_Heart.onnx"),
                ModelSettings::new(
                    "mri_liver_lesion",
                    Segmentation,
                    "MedSAM2_MRI_LiverLesion.onnx",
                ),
                ModelSettings::new("ct_lesion", Segmentation, "MedSAM2_CTLesion.onnx"),
                ModelSettings::new("vit_tb_detection", Classification, "vit_tb_detection.onnx"),
            ],
            default_model: Some("medsam2_latest".to_string()),
            classification_model: None,
            device: "cpu".to_string(),
            upload: UploadSettings::default(),
            segmentation: SegmentationSettings::default(),
            classification: ClassificationSettings::default(),
            workers: WorkerSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl ServiceSettings {
    /// Load settings from a JSON file and validate them.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: ServiceSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON, overwriting any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }

    /// Reject configurations the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for model in &self.models {
            anyhow::ensure!(!model.id.trim().is_empty(), "model id must not be empty");
            anyhow::ensure!(
                seen.insert(model.id.as_str()),
                "duplicate model id '{}'",
                model.id
            );
            anyhow::ensure!(
                !model.weights.trim().is_empty(),
                "model '{}' has no weights location",
                model.id
            );
        }
        if let Some(id) = self.default_model.as_deref() {
            anyhow::ensure!(
                seen.contains(id),
                "default_model '{id}' is not in the model table"
            );
        }
        if let Some(id) = self.classification_model.as_deref() {
            anyhow::ensure!(
                self.model(id)
                    .is_some_and(|m| m.kind == ModelKind::Classification),
                "classification_model '{id}' is not a configured classification model"
            );
        }

        let cls = &self.classification;
        anyhow::ensure!(
            (0.0..=1.0).contains(&cls.decision_threshold),
            "decision_threshold must lie in [0, 1] (got {})",
            cls.decision_threshold
        );
        anyhow::ensure!(cls.input_size > 0, "classification input_size must be non-zero");
        anyhow::ensure!(
            cls.std.iter().all(|s| s.is_finite() && *s > 0.0),
            "classification std values must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&cls.heatmap.image_weight),
            "heatmap image_weight must lie in [0, 1]"
        );

        anyhow::ensure!(self.workers.workers > 0, "at least one worker is required");
        anyhow::ensure!(self.workers.queue_depth > 0, "queue_depth must be non-zero");
        anyhow::ensure!(self.upload.max_bytes > 0, "upload max_bytes must be non-zero");
        Ok(())
    }

    /// Look up a model table entry by id.
    pub fn model(&self, id: &str) -> Option<&ModelSettings> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Resolve the weights path of a model entry.
    pub fn weights_path(&self, model: &ModelSettings) -> PathBuf {
        let weights = Path::new(&model.weights);
        if weights.is_absolute() {
            weights.to_path_buf()
        } else {
            self.checkpoints_dir.join(weights)
        }
    }

    /// Model served by the dedicated classification endpoint.
    pub fn classification_model_id(&self) -> Option<&str> {
        self.classification_model.as_deref().or_else(|| {
            self.models
                .iter()
                .find(|m| m.kind == ModelKind::Classification)
                .map(|m| m.id.as_str())
        })
    }
}

/// Returns the default settings path (`config/medsight.json` under the working directory).
pub fn default_settings_path() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("config/medsight.json"))
        .unwrap_or_else(|_| PathBuf::from("config/medsight.json"))
}
