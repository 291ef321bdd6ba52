//! Image encoding for the recognition backends.
//!
//! The vision endpoint takes base64 JPEG in the `images` array; the OCR
//! engines take lossless PNG so binarised strokes keep hard edges.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode as base64 JPEG at `quality` (1–100).
pub fn encode_jpeg_base64(img: &DynamicImage, quality: u8) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    // JPEG has no alpha channel; canonical and enhanced images never carry one.
    match img {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => img.write_with_encoder(encoder)?,
        other => DynamicImage::ImageRgb8(other.to_rgb8()).write_with_encoder(encoder)?,
    }

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded {}x{} JPEG q{} → {} bytes base64",
        img.width(),
        img.height(),
        quality,
        b64.len()
    );
    Ok(b64)
}

/// Encode as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn jpeg_is_valid_base64_jpeg() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([255, 0, 0])));
        let b64 = encode_jpeg_base64(&img, 90).expect("encode should succeed");
        let decoded = STANDARD.decode(&b64).expect("valid base64");
        assert_eq!(&decoded[..2], &[0xFF, 0xD8], "JPEG SOI marker");
    }

    #[test]
    fn gray_and_rgba_encode() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([128])));
        assert!(encode_jpeg_base64(&gray, 50).is_ok());
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 10])));
        assert!(encode_jpeg_base64(&rgba, 50).is_ok());
    }

    #[test]
    fn png_round_trips_dimensions() {
        let img = DynamicImage::ImageLuma8(GrayImage::new(7, 5));
        let png = encode_png(&img).unwrap();
        let back = image::load_from_memory(&png).unwrap();
        assert_eq!((back.width(), back.height()), (7, 5));
    }
}
