//! Command-line argument definitions for the `medsight` binary.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use medsight_core::{BoxPrompt, Point};
use medsight_utils::config::SegmentationResponseMode;

/// Run MedSight segmentation and classification models over medical images.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Settings JSON. Defaults to `config/medsight.json` when present, otherwise built-in values.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the directory holding model weights.
    #[arg(long, global = true, value_name = "DIR")]
    pub checkpoints: Option<PathBuf>,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, global = true, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,

    /// Increase log verbosity (`-v` debug, `-vv` trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Analyze images with any configured model (the `/analyze` endpoint).
    Analyze(AnalyzeArgs),
    /// Screen images with the classification model (the `/vit_analyze` endpoint).
    Classify(ClassifyArgs),
    /// List configured models by kind.
    Models,
    /// Report model readiness.
    Health {
        /// Load every model before reporting.
        #[arg(long)]
        preload: bool,
    },
    /// Write the effective settings to a JSON file.
    InitConfig {
        /// Destination path.
        #[arg(short, long, default_value = "config/medsight.json")]
        output: PathBuf,

        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Options shared by the analysis subcommands.
#[derive(Debug, Args)]
pub struct InputArgs {
    /// Path to an image file or a directory containing images.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Write the JSON records to a file instead of stdout.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Directory to write overlay and heatmap PNGs into.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Model id (falls back to `default_model` from settings).
    #[arg(short, long)]
    pub model: Option<String>,

    /// Foreground click as `x,y` in image pixels. Repeatable.
    #[arg(long = "point", value_name = "X,Y", value_parser = parse_point)]
    pub points: Vec<Point>,

    /// Box prompt as `x0,y0,x1,y1` in image pixels. Repeatable.
    #[arg(long = "box", value_name = "X0,Y0,X1,Y1", value_parser = parse_box)]
    pub boxes: Vec<BoxPrompt>,

    /// Segmentation answer format: `json` or `png`.
    #[arg(long, value_name = "MODE")]
    pub response_mode: Option<SegmentationResponseMode>,
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Override the positive decision threshold.
    #[arg(long)]
    pub threshold: Option<f32>,
}

fn parse_coords<const N: usize>(value: &str) -> Result<[f32; N], String> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(format!("expected {N} comma-separated numbers, got '{value}'"));
    }
    let mut coords = [0.0; N];
    for (slot, part) in coords.iter_mut().zip(parts) {
        *slot = part
            .parse::<f32>()
            .map_err(|err| format!("invalid coordinate '{part}': {err}"))?;
    }
    Ok(coords)
}

fn parse_point(value: &str) -> Result<Point, String> {
    let [x, y] = parse_coords::<2>(value)?;
    Ok(Point::new(x, y))
}

fn parse_box(value: &str) -> Result<BoxPrompt, String> {
    let [x0, y0, x1, y1] = parse_coords::<4>(value)?;
    Ok(BoxPrompt::new(x0, y0, x1, y1))
}
