//! Layout analysis: advisory regions of interest for the vision prompt.
//!
//! * Title block: the largest landscape, rectangle-like contour in the
//!   bottom-right quadrant, Canny edges plus contour tracing. When nothing
//!   qualifies, a fixed bottom-right 30 %×20 % region marked `estimated`.
//! * Dimension areas: after Otsu binarisation, long horizontal and vertical
//!   ink runs (dimension and extension lines) grouped into 8-connected
//!   components, padded and ranked by area.
//!
//! Analysis never fails. Without the `cv` feature, or if a routine panics,
//! the hint holds only the fallback title block.

use super::normalize::CanonicalPage;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    TitleBlock,
    DimensionArea,
}

/// Axis-aligned region in canonical-page pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutRegion {
    pub kind: RegionKind,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Proportional guess, not detected.
    pub estimated: bool,
}

impl LayoutRegion {
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

/// Advisory annotations over one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutHint {
    pub regions: Vec<LayoutRegion>,
    pub image_width: u32,
    pub image_height: u32,
}

impl LayoutHint {
    /// No regions at all; what non-drawing schemas get.
    pub fn empty(image_width: u32, image_height: u32) -> Self {
        Self {
            regions: Vec::new(),
            image_width,
            image_height,
        }
    }

    /// Only the estimated bottom-right title block.
    pub fn fallback(image_width: u32, image_height: u32) -> Self {
        Self {
            regions: vec![fallback_title_block(image_width, image_height)],
            image_width,
            image_height,
        }
    }

    pub fn title_block(&self) -> Option<&LayoutRegion> {
        self.regions.iter().find(|r| r.kind == RegionKind::TitleBlock)
    }

    pub fn dimension_areas(&self) -> impl Iterator<Item = &LayoutRegion> {
        self.regions
            .iter()
            .filter(|r| r.kind == RegionKind::DimensionArea)
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

fn fallback_title_block(w: u32, h: u32) -> LayoutRegion {
    let x = (w as f64 * 0.7).round() as u32;
    let y = (h as f64 * 0.8).round() as u32;
    LayoutRegion {
        kind: RegionKind::TitleBlock,
        x,
        y,
        w: w.saturating_sub(x),
        h: h.saturating_sub(y),
        estimated: true,
    }
}

/// Analyse the page. Blocking; never fails.
pub fn analyze(page: &CanonicalPage) -> LayoutHint {
    let (w, h) = (page.width(), page.height());

    #[cfg(feature = "cv")]
    {
        use std::panic::{catch_unwind, AssertUnwindSafe};
        match catch_unwind(AssertUnwindSafe(|| cv::analyze(page))) {
            Ok(hint) => {
                debug!(
                    "Layout: {} region(s), title block estimated = {}",
                    hint.regions.len(),
                    hint.title_block().is_some_and(|r| r.estimated)
                );
                hint
            }
            Err(_) => {
                tracing::warn!("Layout analysis panicked, using fallback title block");
                LayoutHint::fallback(w, h)
            }
        }
    }

    #[cfg(not(feature = "cv"))]
    {
        debug!("Built without `cv`, layout uses fallback title block");
        LayoutHint::fallback(w, h)
    }
}

#[cfg(feature = "cv")]
mod cv {
    use super::*;
    use image::{GrayImage, Luma};
    use imageproc::contours::find_contours;
    use imageproc::contrast::otsu_level;
    use imageproc::edges::canny;
    use imageproc::region_labelling::{connected_components, Connectivity};

    const MIN_QUADRANT_SHARE: f64 = 0.02;
    const MIN_FILL_RATIO: f64 = 0.6;
    const FRAME_SHARE: f64 = 0.9;
    const REGION_PADDING: u32 = 20;
    const MAX_DIMENSION_AREAS: usize = 10;

    pub(super) fn analyze(page: &CanonicalPage) -> LayoutHint {
        let gray = image::imageops::grayscale(&page.image);
        let (w, h) = gray.dimensions();

        let title = detect_title_block(&gray).unwrap_or_else(|| fallback_title_block(w, h));
        let mut regions = vec![title];
        regions.extend(detect_dimension_areas(&gray));

        LayoutHint {
            regions,
            image_width: w,
            image_height: h,
        }
    }

    fn detect_title_block(gray: &GrayImage) -> Option<LayoutRegion> {
        let (w, h) = gray.dimensions();
        let (qx, qy) = (w / 2, h / 2);
        let (qw, qh) = (w - qx, h - qy);
        if qw < 8 || qh < 8 {
            return None;
        }
        let quadrant = image::imageops::crop_imm(gray, qx, qy, qw, qh).to_image();
        let edges = canny(&quadrant, 50.0, 150.0);
        let min_area = (qw as f64 * qh as f64 * MIN_QUADRANT_SHARE) as u64;

        find_contours::<u32>(&edges)
            .iter()
            .filter(|c| !c.points.is_empty())
            .filter_map(|c| {
                let (min_x, min_y, max_x, max_y) = c.points.iter().fold(
                    (u32::MAX, u32::MAX, 0u32, 0u32),
                    |(a, b, cc, d), p| (a.min(p.x), b.min(p.y), cc.max(p.x), d.max(p.y)),
                );
                let bw = max_x - min_x + 1;
                let bh = max_y - min_y + 1;
                let bbox_area = bw as u64 * bh as u64;
                if bw <= bh || bbox_area < min_area.max(1) {
                    return None;
                }
                let fill = polygon_area(&c.points) / bbox_area as f64;
                (fill >= MIN_FILL_RATIO).then_some((bbox_area, min_x, min_y, bw, bh))
            })
            .max_by_key(|&(area, ..)| area)
            .map(|(_, x, y, bw, bh)| LayoutRegion {
                kind: RegionKind::TitleBlock,
                x: x + qx,
                y: y + qy,
                w: bw,
                h: bh,
                estimated: false,
            })
    }

    /// Shoelace area of a closed polygon.
    fn polygon_area(points: &[imageproc::point::Point<u32>]) -> f64 {
        if points.len() < 3 {
            return 0.0;
        }
        let mut twice = 0.0f64;
        for (i, p) in points.iter().enumerate() {
            let q = &points[(i + 1) % points.len()];
            twice += p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
        }
        twice.abs() / 2.0
    }

    fn detect_dimension_areas(gray: &GrayImage) -> Vec<LayoutRegion> {
        let (w, h) = gray.dimensions();
        let (lo, hi) = gray
            .pixels()
            .fold((u8::MAX, 0u8), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
        if hi.saturating_sub(lo) < 32 {
            return Vec::new();
        }
        let level = otsu_level(gray);
        let is_ink = |x: u32, y: u32| gray.get_pixel(x, y)[0] <= level;

        let min_h_run = (w / 20).max(2);
        let min_v_run = (h / 20).max(2);
        let mut lines = GrayImage::new(w, h);

        for y in 0..h {
            let mut start = None;
            for x in 0..=w {
                let ink = x < w && is_ink(x, y);
                match (ink, start) {
                    (true, None) => start = Some(x),
                    (false, Some(s)) => {
                        if x - s >= min_h_run {
                            for rx in s..x {
                                lines.put_pixel(rx, y, Luma([255]));
                            }
                        }
                        start = None;
                    }
                    _ => {}
                }
            }
        }
        for x in 0..w {
            let mut start = None;
            for y in 0..=h {
                let ink = y < h && is_ink(x, y);
                match (ink, start) {
                    (true, None) => start = Some(y),
                    (false, Some(s)) => {
                        if y - s >= min_v_run {
                            for ry in s..y {
                                lines.put_pixel(x, ry, Luma([255]));
                            }
                        }
                        start = None;
                    }
                    _ => {}
                }
            }
        }

        let labels = connected_components(&lines, Connectivity::Eight, Luma([0u8]));
        let mut boxes: std::collections::BTreeMap<u32, (u32, u32, u32, u32)> = Default::default();
        for (x, y, l) in labels.enumerate_pixels() {
            if l[0] == 0 {
                continue;
            }
            let b = boxes.entry(l[0]).or_insert((x, y, x, y));
            b.0 = b.0.min(x);
            b.1 = b.1.min(y);
            b.2 = b.2.max(x);
            b.3 = b.3.max(y);
        }

        let mut regions: Vec<LayoutRegion> = boxes
            .into_values()
            .filter(|&(x0, y0, x1, y1)| {
                let bw = (x1 - x0 + 1) as f64;
                let bh = (y1 - y0 + 1) as f64;
                !(bw >= w as f64 * FRAME_SHARE && bh >= h as f64 * FRAME_SHARE)
            })
            .map(|(x0, y0, x1, y1)| {
                let x = x0.saturating_sub(REGION_PADDING);
                let y = y0.saturating_sub(REGION_PADDING);
                let right = (x1 + 1 + REGION_PADDING).min(w);
                let bottom = (y1 + 1 + REGION_PADDING).min(h);
                LayoutRegion {
                    kind: RegionKind::DimensionArea,
                    x,
                    y,
                    w: right - x,
                    h: bottom - y,
                    estimated: false,
                }
            })
            .collect();

        regions.sort_by(|a, b| b.area().cmp(&a.area()).then(a.y.cmp(&b.y)).then(a.x.cmp(&b.x)));
        regions.truncate(MAX_DIMENSION_AREAS);
        regions
    }
}
