//! Configuration loading and CLI override logic.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;
use medsight_utils::{
    config::{ServiceSettings, default_settings_path},
    normalize_path,
};

use crate::args::{AnalyzeArgs, Cli, ClassifyArgs};

/// Load service settings from a file or use defaults.
pub fn load_settings(config_path: Option<&PathBuf>) -> Result<ServiceSettings> {
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        let settings = ServiceSettings::load_from_path(&resolved)?;
        info!("Loaded settings from {}", resolved.display());
        Ok(settings)
    } else {
        let default_path = default_settings_path();
        if default_path.exists() {
            let settings = ServiceSettings::load_from_path(&default_path).with_context(|| {
                format!(
                    "failed to load default settings from {}",
                    default_path.display()
                )
            })?;
            info!("Loaded settings from {}", default_path.display());
            Ok(settings)
        } else {
            Ok(ServiceSettings::default())
        }
    }
}

/// Apply global flags to loaded or default settings.
pub fn apply_global_overrides(settings: &mut ServiceSettings, cli: &Cli) {
    if let Some(dir) = cli.checkpoints.as_ref() {
        settings.checkpoints_dir = dir.clone();
    }
    if cli.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = cli.telemetry_level.as_ref() {
        let normalized = level.trim();
        if !normalized.is_empty() {
            let lower = normalized.to_ascii_lowercase();
            settings.telemetry.level = lower.clone();
            if lower == "off" {
                settings.telemetry.enabled = false;
            }
        }
    }
}

pub fn apply_analyze_overrides(settings: &mut ServiceSettings, args: &AnalyzeArgs) {
    if let Some(mode) = args.response_mode {
        settings.segmentation.response_mode = mode;
    }
}

pub fn apply_classify_overrides(settings: &mut ServiceSettings, args: &ClassifyArgs) {
    if let Some(threshold) = args.threshold {
        settings.classification.decision_threshold = threshold;
    }
}
