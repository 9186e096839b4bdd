mod args;
mod config;
mod input;

use std::{
    fs::{self, File},
    path::Path,
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use medsight_core::{AnalysisService, ApiResponse, Prompts, ResponseBody, Upload};
use medsight_utils::{configure_telemetry, decode_png_base64, init_logging, normalize_path};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    args::{AnalyzeArgs, Cli, ClassifyArgs, Command, InputArgs},
    config::{
        apply_analyze_overrides, apply_classify_overrides, apply_global_overrides, load_settings,
    },
    input::collect_images,
};

#[derive(Debug, Serialize)]
struct ImageRecord {
    image: String,
    status: u16,
    response: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    saved: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    init_logging(level)?;

    let mut settings = load_settings(cli.config.as_ref())?;
    apply_global_overrides(&mut settings, &cli);

    match &cli.command {
        Command::Analyze(args) => {
            apply_analyze_overrides(&mut settings, args);
            configure_telemetry(&settings.telemetry);
            let service = AnalysisService::from_settings(settings)?;
            run_analyze(&service, args)
        }
        Command::Classify(args) => {
            apply_classify_overrides(&mut settings, args);
            configure_telemetry(&settings.telemetry);
            let service = AnalysisService::from_settings(settings)?;
            run_classify(&service, args)
        }
        Command::Models => {
            let service = AnalysisService::from_settings(settings)?;
            print_response(&service.models())
        }
        Command::Health { preload } => {
            configure_telemetry(&settings.telemetry);
            let service = AnalysisService::from_settings(settings)?;
            if *preload {
                let ready = service.preload();
                info!("{ready} of {} model(s) loaded", service.descriptors().len());
            }
            print_response(&service.health())
        }
        Command::InitConfig { output, force } => {
            if output.exists() && !force {
                anyhow::bail!(
                    "{} already exists; pass --force to overwrite",
                    output.display()
                );
            }
            settings.validate()?;
            settings.save_to_path(output)?;
            info!("Wrote settings to {}", output.display());
            Ok(())
        }
    }
}

fn run_analyze(service: &AnalysisService, args: &AnalyzeArgs) -> Result<()> {
    let prompts = Prompts {
        points: args.points.clone(),
        boxes: args.boxes.clone(),
    };
    let prompts = (!prompts.is_empty()).then_some(prompts);
    let model = args.model.as_deref();
    run_batch(service, &args.input, |upload| {
        service.analyze(Some(upload), model, prompts.clone())
    })
}

fn run_classify(service: &AnalysisService, args: &ClassifyArgs) -> Result<()> {
    run_batch(service, &args.input, |upload| service.vit_analyze(Some(upload)))
}

fn run_batch<F>(service: &AnalysisService, args: &InputArgs, handle: F) -> Result<()>
where
    F: Fn(Upload) -> ApiResponse,
{
    let input_path = normalize_path(&args.input)?;
    let output_dir = if let Some(dir) = args.output.as_ref() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Some(normalize_path(dir)?)
    } else {
        None
    };

    let images = collect_images(&input_path, &service.settings().upload)?;
    if images.is_empty() {
        anyhow::bail!(
            "no images found at {} (supported extensions: {})",
            input_path.display(),
            service.settings().upload.allowed_extensions.join(", ")
        );
    }

    info!("Processing {} image(s)...", images.len());
    let mut records = Vec::with_capacity(images.len());
    for image_path in images {
        let bytes = fs::read(&image_path)
            .with_context(|| format!("failed to read {}", image_path.display()))?;
        let file_name = image_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let response = handle(Upload::new(file_name, bytes));
        if response.is_success() {
            info!("{} -> {}", image_path.display(), response.status);
        } else {
            warn!(
                "{} -> {}: {}",
                image_path.display(),
                response.status,
                error_message(&response)
            );
        }

        let saved = match output_dir.as_ref() {
            Some(dir) if response.is_success() => save_images(&response, &image_path, dir)?,
            _ => Vec::new(),
        };
        records.push(ImageRecord {
            image: image_path.display().to_string(),
            status: response.status,
            response: response_json(&response),
            saved,
        });
    }

    write_records(&records, args.json.as_deref())?;

    let succeeded = records.iter().filter(|r| (200..300).contains(&r.status)).count();
    if succeeded == 0 {
        anyhow::bail!("all {} request(s) failed", records.len());
    }
    Ok(())
}

fn response_json(response: &ApiResponse) -> Value {
    match &response.body {
        ResponseBody::Json(value) => value.clone(),
        ResponseBody::Png(bytes) => json!({
            "content_type": response.content_type(),
            "bytes": bytes.len(),
        }),
    }
}

fn error_message(response: &ApiResponse) -> String {
    response
        .as_json()
        .and_then(|body| body.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("request failed")
        .to_string()
}

/// Write overlay and heatmap images next to each other as `<stem>_<kind>.png`.
fn save_images(response: &ApiResponse, source: &Path, dir: &Path) -> Result<Vec<String>> {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let mut saved = Vec::new();
    match &response.body {
        ResponseBody::Png(bytes) => {
            let path = dir.join(format!("{stem}_overlay.png"));
            fs::write(&path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            saved.push(path);
        }
        ResponseBody::Json(body) => {
            for (field, suffix) in [("overlay_image", "overlay"), ("heatmap_image", "heatmap")] {
                let Some(encoded) = body.get(field).and_then(Value::as_str) else {
                    continue;
                };
                let image = decode_png_base64(encoded)
                    .with_context(|| format!("response field '{field}' is not a PNG"))?;
                let path = dir.join(format!("{stem}_{suffix}.png"));
                image
                    .save(&path)
                    .with_context(|| format!("failed to save {}", path.display()))?;
                saved.push(path);
            }
        }
    }
    for path in &saved {
        info!("Saved {}", path.display());
    }
    Ok(saved.iter().map(|p| p.display().to_string()).collect())
}

fn write_records(records: &[ImageRecord], json_path: Option<&Path>) -> Result<()> {
    if let Some(json_path) = json_path {
        if let Some(dir) = json_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        let file = File::create(json_path)
            .with_context(|| format!("failed to create {}", json_path.display()))?;
        serde_json::to_writer_pretty(file, records)
            .with_context(|| format!("failed to write results to {}", json_path.display()))?;
        info!("Wrote results to {}", json_path.display());
    } else {
        let json = serde_json::to_string_pretty(records).context("failed to serialize results")?;
        println!("{json}");
    }
    Ok(())
}

fn print_response(response: &ApiResponse) -> Result<()> {
    let json = serde_json::to_string_pretty(&response_json(response))
        .context("failed to serialize response")?;
    println!("{json}");
    Ok(())
}
