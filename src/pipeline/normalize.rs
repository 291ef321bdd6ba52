//! Document normalisation: any supported input → one RGB8 [`CanonicalPage`].
//!
//! Images are decoded with the `image` crate; PDFs go through
//! [`super::render`]. Alpha is composited onto white and every other colour
//! mode is expanded to RGB8, so every decodable input ends up in one
//! colourspace. A dimension cap is then applied (downscale only).

use super::input::{MediaType, SourceDocument};
use super::render::{render_page, RenderOptions};
use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use tracing::{debug, info};

/// The single normalised raster page all later stages consume.
#[derive(Debug, Clone)]
pub struct CanonicalPage {
    pub image: RgbImage,
    /// Size before the dimension cap.
    pub source_width: u32,
    pub source_height: u32,
}

impl CanonicalPage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Turn the source document into a canonical page. Blocking.
pub fn normalize(
    source: &SourceDocument,
    config: &ExtractionConfig,
) -> Result<CanonicalPage, ExtractError> {
    let decoded = match source.media_type() {
        MediaType::Pdf => render_page(source.bytes(), &RenderOptions::from(config))?,
        MediaType::Image => image::load_from_memory(source.bytes())
            .map_err(|e| ExtractError::unsupported(format!("image decode failed: {e}")))?,
    };
    debug!(
        "Decoded {:?} input: {}x{} {:?}",
        source.media_type(),
        decoded.width(),
        decoded.height(),
        decoded.color()
    );
    canonicalize(decoded, config.max_dimension)
}

/// Colour conversion plus dimension cap.
pub fn canonicalize(img: DynamicImage, max_dimension: u32) -> Result<CanonicalPage, ExtractError> {
    let (source_width, source_height) = (img.width(), img.height());
    if source_width == 0 || source_height == 0 {
        return Err(ExtractError::unsupported("image has zero size"));
    }

    let rgb = if img.color().has_alpha() {
        flatten_onto_white(&img)
    } else {
        img.to_rgb8()
    };

    let image = cap_dimensions(rgb, max_dimension);
    if image.width() != source_width || image.height() != source_height {
        info!(
            "Downscaled page {}x{} → {}x{}",
            source_width,
            source_height,
            image.width(),
            image.height()
        );
    }

    Ok(CanonicalPage {
        image,
        source_width,
        source_height,
    })
}

fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let a = px[3] as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(px[0]), blend(px[1]), blend(px[2])]));
    }
    out
}

fn cap_dimensions(img: RgbImage, max_dimension: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let longest = w.max(h);
    if longest <= max_dimension {
        return img;
    }
    let scale = max_dimension as f64 / longest as f64;
    let nw = ((w as f64 * scale).round() as u32).clamp(1, max_dimension);
    let nh = ((h as f64 * scale).round() as u32).clamp(1, max_dimension);
    image::imageops::resize(&img, nw, nh, FilterType::Lanczos3)
}
