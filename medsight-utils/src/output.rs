//! PNG and base64 helpers for shipping rendered images over text transports.

use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use image::{
    DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat,
    codecs::png::{CompressionType, FilterType, PngEncoder},
};

/// Encode an image as PNG, keeping its channel layout (RGB stays RGB, RGBA stays RGBA).
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let encoder =
        PngEncoder::new_with_quality(&mut buffer, CompressionType::Default, FilterType::Adaptive);
    match image {
        DynamicImage::ImageRgba8(rgba) => encoder
            .write_image(
                rgba.as_raw(),
                rgba.width(),
                rgba.height(),
                ExtendedColorType::Rgba8,
            )
            .context("failed to encode RGBA PNG")?,
        other => {
            let rgb = other.to_rgb8();
            encoder
                .write_image(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ExtendedColorType::Rgb8,
                )
                .context("failed to encode RGB PNG")?
        }
    }
    Ok(buffer)
}

/// Encode an image as PNG and wrap the bytes in standard base64.
pub fn encode_png_base64(image: &DynamicImage) -> Result<String> {
    Ok(BASE64.encode(encode_png(image)?))
}

/// Inverse of [`encode_png_base64`].
pub fn decode_png_base64(encoded: &str) -> Result<DynamicImage> {
    let bytes = BASE64
        .decode(encoded.trim())
        .context("payload is not valid base64")?;
    image::load(Cursor::new(bytes), ImageFormat::Png).context("payload is not a valid PNG")
}
