//! Common helpers shared across MedSight crates.

/// Service settings and the static model table.
pub mod config;
/// Image decoding, resizing, and tensor conversion.
pub mod image_utils;
/// PNG encoding and base64 transport helpers.
pub mod output;
/// Stage timing for optional performance tracing.
pub mod telemetry;

use std::path::Path;

use anyhow::Result;
use log::LevelFilter;

pub use config::{ModelKind, ServiceSettings};
pub use image_utils::{
    decode_image, file_extension, normalize_channels, resize_image, rgb_to_chw, sniff_format,
    standardize_in_place,
};
pub use output::{decode_png_base64, encode_png, encode_png_base64};
pub use telemetry::{TimingGuard, configure as configure_telemetry, timing_guard};

/// Initialize logging once for CLI and server environments.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies. Telemetry records are always
/// let through at trace level so [`telemetry::configure`] alone decides whether they appear.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(telemetry::TELEMETRY_TARGET, LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
