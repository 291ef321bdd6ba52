//! Per-backend image enhancement.
//!
//! Two profiles share one front end (grayscale, median denoise, CLAHE):
//!
//! * [`EnhancementProfile::Ocr`]: adaptive local binarisation, then a 1 px
//!   closing of the dark strokes. Tesseract reads clean black-on-white best.
//! * [`EnhancementProfile::Vision`]: an unsharp mask. Not binarised; vision
//!   models lose information on hard thresholds.
//!
//! Enhancement never fails. With the `cv` feature off, with enhancement
//! disabled, or if an imageproc routine panics, the canonical page is passed
//! through unchanged and [`EnhancedImage::applied`] is `false`.

use super::normalize::CanonicalPage;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Preprocessing recipe, one per backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementProfile {
    Ocr,
    Vision,
}

/// Image handed to one recognition attempt. Owned by that attempt.
#[derive(Debug, Clone)]
pub struct EnhancedImage {
    pub profile: EnhancementProfile,
    pub image: DynamicImage,
    /// `false` when the transform degraded to a pass-through.
    pub applied: bool,
}

impl EnhancedImage {
    fn passthrough(page: &CanonicalPage, profile: EnhancementProfile) -> Self {
        Self {
            profile,
            image: DynamicImage::ImageRgb8(page.image.clone()),
            applied: false,
        }
    }
}

/// Produce the image for one backend profile.
pub fn enhance(page: &CanonicalPage, profile: EnhancementProfile, enabled: bool) -> EnhancedImage {
    if !enabled {
        debug!("Enhancement disabled, passing {:?} page through", profile);
        return EnhancedImage::passthrough(page, profile);
    }
    apply(page, profile)
}

#[cfg(feature = "cv")]
fn apply(page: &CanonicalPage, profile: EnhancementProfile) -> EnhancedImage {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let start = std::time::Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| match profile {
        EnhancementProfile::Ocr => cv::ocr_profile(&page.image),
        EnhancementProfile::Vision => cv::vision_profile(&page.image),
    }));
    match result {
        Ok(gray) => {
            debug!(
                "Enhanced {:?} profile {}x{} in {} ms",
                profile,
                gray.width(),
                gray.height(),
                start.elapsed().as_millis()
            );
            EnhancedImage {
                profile,
                image: DynamicImage::ImageLuma8(gray),
                applied: true,
            }
        }
        Err(_) => {
            tracing::warn!("Enhancement panicked for {:?} profile, using original page", profile);
            EnhancedImage::passthrough(page, profile)
        }
    }
}

#[cfg(not(feature = "cv"))]
fn apply(page: &CanonicalPage, profile: EnhancementProfile) -> EnhancedImage {
    debug!("Built without `cv`, {:?} enhancement is a no-op", profile);
    EnhancedImage::passthrough(page, profile)
}

#[cfg(feature = "cv")]
pub(crate) mod cv {
    use image::{GrayImage, Luma, RgbImage};
    use imageproc::contrast::adaptive_threshold;
    use imageproc::distance_transform::Norm;
    use imageproc::filter::{gaussian_blur_f32, median_filter};
    use imageproc::morphology;

    const CLAHE_TILES: u32 = 8;
    const CLAHE_CLIP_LIMIT: f32 = 2.0;
    const UNSHARP_SIGMA: f32 = 1.0;
    const UNSHARP_AMOUNT: f32 = 1.0;

    fn front_end(rgb: &RgbImage) -> GrayImage {
        let gray = image::imageops::grayscale(rgb);
        let denoised = median_filter(&gray, 1, 1);
        clahe(&denoised, CLAHE_TILES, CLAHE_CLIP_LIMIT)
    }

    pub fn ocr_profile(rgb: &RgbImage) -> GrayImage {
        let eq = front_end(rgb);
        let radius = (eq.width().min(eq.height()) / 50).clamp(7, 25);
        let binary = adaptive_threshold(&eq, radius);
        // Strokes are dark; close them as foreground of the inverted image.
        let mut strokes = binary;
        image::imageops::invert(&mut strokes);
        let mut closed = morphology::close(&strokes, Norm::LInf, 1);
        image::imageops::invert(&mut closed);
        closed
    }

    pub fn vision_profile(rgb: &RgbImage) -> GrayImage {
        let eq = front_end(rgb);
        let blurred = gaussian_blur_f32(&eq, UNSHARP_SIGMA);
        let mut out = GrayImage::new(eq.width(), eq.height());
        for (x, y, p) in eq.enumerate_pixels() {
            let v = p[0] as f32;
            let b = blurred.get_pixel(x, y)[0] as f32;
            let sharpened = v + UNSHARP_AMOUNT * (v - b);
            out.put_pixel(x, y, Luma([sharpened.round().clamp(0.0, 255.0) as u8]));
        }
        out
    }

    /// Contrast-limited adaptive histogram equalisation.
    ///
    /// One clipped-histogram LUT per tile; each pixel bilinearly blends the
    /// four surrounding tile LUTs.
    pub fn clahe(img: &GrayImage, tiles: u32, clip_limit: f32) -> GrayImage {
        let (w, h) = img.dimensions();
        if w == 0 || h == 0 {
            return img.clone();
        }
        let tx_n = tiles.min(w).max(1);
        let ty_n = tiles.min(h).max(1);

        let mut luts = vec![[0u8; 256]; (tx_n * ty_n) as usize];
        for ty in 0..ty_n {
            let (y0, y1) = (ty * h / ty_n, (ty + 1) * h / ty_n);
            for tx in 0..tx_n {
                let (x0, x1) = (tx * w / tx_n, (tx + 1) * w / tx_n);
                luts[(ty * tx_n + tx) as usize] = tile_lut(img, x0, x1, y0, y1, clip_limit);
            }
        }

        let tile_w = w as f32 / tx_n as f32;
        let tile_h = h as f32 / ty_n as f32;
        let mut out = GrayImage::new(w, h);
        for y in 0..h {
            let (ty0, ty1, ay) = neighbours((y as f32 + 0.5) / tile_h - 0.5, ty_n);
            for x in 0..w {
                let (tx0, tx1, ax) = neighbours((x as f32 + 0.5) / tile_w - 0.5, tx_n);
                let v = img.get_pixel(x, y)[0] as usize;
                let at = |tx: u32, ty: u32| luts[(ty * tx_n + tx) as usize][v] as f32;
                let top = at(tx0, ty0) * (1.0 - ax) + at(tx1, ty0) * ax;
                let bottom = at(tx0, ty1) * (1.0 - ax) + at(tx1, ty1) * ax;
                let blended = top * (1.0 - ay) + bottom * ay;
                out.put_pixel(x, y, Luma([blended.round().clamp(0.0, 255.0) as u8]));
            }
        }
        out
    }

    fn neighbours(f: f32, n: u32) -> (u32, u32, f32) {
        let max = (n - 1) as f32;
        let f = f.clamp(0.0, max);
        let i0 = f.floor() as u32;
        let i1 = (i0 + 1).min(n - 1);
        (i0, i1, f - i0 as f32)
    }

    fn tile_lut(img: &GrayImage, x0: u32, x1: u32, y0: u32, y1: u32, clip_limit: f32) -> [u8; 256] {
        let mut hist = [0u32; 256];
        for y in y0..y1 {
            for x in x0..x1 {
                hist[img.get_pixel(x, y)[0] as usize] += 1;
            }
        }
        let area = ((x1 - x0) * (y1 - y0)).max(1);
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);

        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }
        let share = excess / 256;
        for bin in hist.iter_mut() {
            *bin += share;
        }
        // Spread the leftover evenly so no end of the tone range is favoured.
        let remainder = (excess % 256) as usize;
        if remainder > 0 {
            let step = (256 / remainder).max(1);
            for i in (0..256).step_by(step).take(remainder) {
                hist[i] += 1;
            }
        }

        let mut lut = [0u8; 256];
        let mut cdf = 0u32;
        for (i, &count) in hist.iter().enumerate() {
            cdf += count;
            lut[i] = ((cdf as f32 * 255.0 / area as f32).round()).min(255.0) as u8;
        }
        lut
    }
}
