use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::ImageFormat;
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

pub fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Decodes any format the `image` crate understands and re-encodes it as PNG.
pub fn encode_png(image_bytes: &[u8]) -> Result<Vec<u8>> {
    let image = image::load_from_memory(image_bytes).context("unsupported or corrupt image")?;
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("failed to encode png")?;
    Ok(png)
}

pub fn png_data_url(png: &[u8]) -> String {
    format!("{PNG_DATA_URL_PREFIX}{}", STANDARD.encode(png))
}

pub fn decode_png_data_url(data_url: &str) -> Option<Vec<u8>> {
    let payload = data_url.strip_prefix(PNG_DATA_URL_PREFIX)?;
    STANDARD.decode(payload.trim()).ok()
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 90, 255]));
    let mut png = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .unwrap();
    png
}
