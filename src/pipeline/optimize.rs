//! Image optimizer: orientation fix, bounded downscale, JPEG re-encode.
//!
//! Every inlined image is re-encoded to baseline JPEG at the configured
//! quality, whatever its source codec. Transparent pixels are composited onto
//! white first since JPEG has no alpha channel.
//!
//! Failure here is never fatal: an undecodable or unsupported buffer is
//! returned unchanged and the caller embeds the original bytes.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader, Limits, RgbImage};
use std::io::Cursor;
use tracing::{debug, warn};

/// Largest decoded width/height accepted, in pixels.
const MAX_DECODE_DIM: u32 = 16_384;

/// Optimise one raw image buffer.
///
/// The image is rotated/flipped per its EXIF orientation, scaled down to fit
/// within `max_w × max_h` (aspect ratio kept, never enlarged), flattened onto
/// white and written as JPEG at `quality` (1–100).
///
/// On any failure the original bytes are returned and a warning is logged.
pub fn optimize(bytes: &[u8], max_w: u32, max_h: u32, quality: u8) -> Vec<u8> {
    match try_optimize(bytes, max_w, max_h, quality) {
        Ok(out) => out,
        Err(e) => {
            warn!(
                "Image optimisation failed ({} bytes), embedding original: {}",
                bytes.len(),
                e
            );
            bytes.to_vec()
        }
    }
}

fn try_optimize(
    bytes: &[u8],
    max_w: u32,
    max_h: u32,
    quality: u8,
) -> Result<Vec<u8>, image::ImageError> {
    let img = decode_oriented(bytes)?;
    let (w, h) = (img.width(), img.height());

    let img = if w > max_w.max(1) || h > max_h.max(1) {
        // `resize` fits within the box and preserves the aspect ratio.
        let scaled = img.resize(max_w.max(1), max_h.max(1), FilterType::Lanczos3);
        debug!("Resized image {}x{} → {}x{}", w, h, scaled.width(), scaled.height());
        scaled
    } else {
        img
    };

    let rgb = flatten_onto_white(&img);
    let mut out = Vec::with_capacity(bytes.len() / 2);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(&rgb)?;
    debug!("Optimised image {} → {} bytes", bytes.len(), out.len());
    Ok(out)
}

/// Decode with format sniffing and apply the embedded orientation.
fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DECODE_DIM);
    limits.max_image_height = Some(MAX_DECODE_DIM);
    reader.limits(limits);

    let mut decoder = reader.into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Composite onto an opaque white background.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in rgb.pixels_mut().zip(rgba.pixels()) {
        let a = src[3] as u32;
        for c in 0..3 {
            dst[c] = ((src[c] as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        }
    }
    rgb
}
