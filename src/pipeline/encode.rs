//! Image encoding: `DynamicImage` → JPEG/PNG bytes sized for upload.
//!
//! ## Why JPEG by default?
//!
//! OCR endpoints cap request bodies, and a 2000 px PNG scan of a dense page
//! can run to several megabytes once base64-encoded. JPEG at quality 85 is
//! a fraction of that with no measurable loss in recognition on printed text.
//! PNG stays available for fine print and line art.
//!
//! ## Payload guard
//!
//! If the base64 form still exceeds [`MAX_BASE64_PAYLOAD`], the page is
//! re-encoded: JPEG quality drops by 20 (never below 40), then the image is
//! scaled to 75 % until it fits. Sending an oversized page would only earn a
//! 413 and a permanently failed page.

use crate::config::ImageFormat;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::{debug, warn};

/// Largest base64 payload sent to the OCR service.
pub const MAX_BASE64_PAYLOAD: usize = 4 * 1024 * 1024;

const QUALITY_STEP: u8 = 20;
const QUALITY_FLOOR: u8 = 40;
const MAX_DOWNSCALES: usize = 4;

/// Bytes of one encoded page plus the parameters that produced them.
#[derive(Debug, Clone)]
pub struct EncodedPage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub quality: u8,
    pub width: u32,
    pub height: u32,
}

/// Encode `img` in `format`. `quality` applies to JPEG only.
pub fn encode_image(
    img: &DynamicImage,
    format: ImageFormat,
    quality: u8,
) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)))?;
        }
        ImageFormat::Png => {
            img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        }
    }
    Ok(buf)
}

/// Length of `n` bytes once base64-encoded.
pub fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

/// Encode `img`, shrinking it until the base64 form fits in `limit` bytes.
pub fn encode_within_limit(
    img: &DynamicImage,
    format: ImageFormat,
    quality: u8,
    limit: usize,
) -> Result<EncodedPage, image::ImageError> {
    let mut quality = quality;
    let mut bytes = encode_image(img, format, quality)?;

    if base64_len(bytes.len()) > limit && format == ImageFormat::Jpeg && quality > QUALITY_FLOOR {
        quality = quality.saturating_sub(QUALITY_STEP).max(QUALITY_FLOOR);
        warn!(quality, "Page payload over limit; lowering JPEG quality");
        bytes = encode_image(img, format, quality)?;
    }

    let mut scaled: Option<DynamicImage> = None;
    let mut rounds = 0;
    while base64_len(bytes.len()) > limit && rounds < MAX_DOWNSCALES {
        let current = scaled.as_ref().unwrap_or(img);
        let (w, h) = (current.width() * 3 / 4, current.height() * 3 / 4);
        if w < 64 || h < 64 {
            break;
        }
        warn!(width = w, height = h, "Page payload over limit; downscaling");
        let next = current.resize(w, h, FilterType::Triangle);
        bytes = encode_image(&next, format, quality)?;
        scaled = Some(next);
        rounds += 1;
    }

    let final_img = scaled.as_ref().unwrap_or(img);
    debug!(
        "Encoded page → {} bytes ({} base64)",
        bytes.len(),
        base64_len(bytes.len())
    );
    Ok(EncodedPage {
        bytes,
        format,
        quality,
        width: final_img.width(),
        height: final_img.height(),
    })
}

/// Base64 of the payload.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// `data:<mime>;base64,<payload>` for JSON request bodies.
pub fn data_uri(bytes: &[u8], format: ImageFormat) -> String {
    format!("data:{};base64,{}", format.mime_type(), to_base64(bytes))
}
