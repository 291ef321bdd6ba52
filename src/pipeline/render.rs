//! PDF rasterisation: render one page to a `DynamicImage`.
//!
//! Two libraries are tried in order. pdfium (via `pdfium-render`) is bound
//! at runtime from an explicit path, `PDFIUM_LIB_PATH`, or the system
//! library. If it cannot be bound, poppler's `pdftoppm` is run as a
//! subprocess inside a [`TempDir`]. Only when both are missing does
//! rendering fail with [`ExtractError::UnsupportedFormat`].
//!
//! Everything here blocks; callers run it inside `spawn_blocking`.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use image::DynamicImage;
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// The subset of [`ExtractionConfig`] the renderer needs.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// 1-indexed.
    pub page: usize,
    pub dpi: u32,
    pub max_dimension: u32,
    pub pdfium_library_path: Option<PathBuf>,
    pub pdftoppm_cmd: String,
}

impl From<&ExtractionConfig> for RenderOptions {
    fn from(c: &ExtractionConfig) -> Self {
        Self {
            page: c.pdf_page,
            dpi: c.pdf_dpi,
            max_dimension: c.max_dimension,
            pdfium_library_path: c.pdfium_library_path.clone(),
            pdftoppm_cmd: c.pdftoppm_cmd.clone(),
        }
    }
}

/// Why one rendering library did not produce a page.
enum RenderFailure {
    /// Library missing; try the next one.
    Unavailable(String),
    /// Library ran and rejected the document; do not fall through.
    Failed(ExtractError),
}

/// Render page `opts.page` of the PDF in `pdf`.
pub fn render_page(pdf: &[u8], opts: &RenderOptions) -> Result<DynamicImage, ExtractError> {
    let pdfium_reason = match render_with_pdfium(pdf, opts) {
        Ok(img) => return Ok(img),
        Err(RenderFailure::Failed(e)) => return Err(e),
        Err(RenderFailure::Unavailable(reason)) => reason,
    };
    warn!("pdfium unavailable ({}), falling back to pdftoppm", pdfium_reason);

    match render_with_pdftoppm(pdf, opts) {
        Ok(img) => Ok(img),
        Err(RenderFailure::Failed(e)) => Err(e),
        Err(RenderFailure::Unavailable(reason)) => Err(ExtractError::unsupported(format!(
            "no PDF rasteriser available (pdfium: {pdfium_reason}; pdftoppm: {reason})"
        ))),
    }
}

// ── pdfium ───────────────────────────────────────────────────────────────

fn bind_pdfium(opts: &RenderOptions) -> Result<Pdfium, String> {
    let explicit = opts
        .pdfium_library_path
        .clone()
        .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));

    let bindings = match explicit {
        Some(path) => {
            let lib = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            debug!("Binding pdfium from {}", lib.display());
            Pdfium::bind_to_library(&lib).map_err(|e| format!("{}: {e:?}", lib.display()))?
        }
        None => Pdfium::bind_to_system_library().map_err(|e| format!("system library: {e:?}"))?,
    };
    Ok(Pdfium::new(bindings))
}

fn render_with_pdfium(pdf: &[u8], opts: &RenderOptions) -> Result<DynamicImage, RenderFailure> {
    let pdfium = bind_pdfium(opts).map_err(RenderFailure::Unavailable)?;

    let document = pdfium.load_pdf_from_byte_slice(pdf, None).map_err(|e| {
        let detail = format!("{e:?}");
        let msg = if detail.to_ascii_lowercase().contains("password") {
            "PDF is encrypted".to_string()
        } else {
            format!("corrupt PDF: {detail}")
        };
        RenderFailure::Failed(ExtractError::unsupported(msg))
    })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    if opts.page == 0 || opts.page > total_pages {
        return Err(RenderFailure::Failed(ExtractError::PageOutOfRange {
            page: opts.page,
            total: total_pages,
        }));
    }

    let page = pages.get((opts.page - 1) as u16).map_err(|e| {
        RenderFailure::Failed(ExtractError::unsupported(format!(
            "page {}: {e:?}",
            opts.page
        )))
    })?;

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(opts.dpi as f32 / 72.0)
        .set_maximum_width(opts.max_dimension as i32)
        .set_maximum_height(opts.max_dimension as i32);

    let bitmap = page.render_with_config(&render_config).map_err(|e| {
        RenderFailure::Failed(ExtractError::unsupported(format!(
            "page {} rasterisation failed: {e:?}",
            opts.page
        )))
    })?;

    let image = bitmap.as_image();
    debug!(
        "pdfium rendered page {} → {}x{} px",
        opts.page,
        image.width(),
        image.height()
    );
    Ok(image)
}

// ── pdftoppm ─────────────────────────────────────────────────────────────

static RE_LAST_PAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"last page \((\d+)\)").unwrap());

fn render_with_pdftoppm(pdf: &[u8], opts: &RenderOptions) -> Result<DynamicImage, RenderFailure> {
    let internal = |e: std::io::Error| RenderFailure::Failed(ExtractError::Internal(e.to_string()));

    let dir = TempDir::new().map_err(internal)?;
    let input = dir.path().join("input.pdf");
    std::fs::write(&input, pdf).map_err(internal)?;
    let prefix = dir.path().join("page");

    let page = opts.page.to_string();
    let output = Command::new(&opts.pdftoppm_cmd)
        .arg("-f")
        .arg(&page)
        .arg("-l")
        .arg(&page)
        .arg("-r")
        .arg(opts.dpi.to_string())
        .arg("-png")
        .arg(&input)
        .arg(&prefix)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                RenderFailure::Unavailable(format!("'{}' not found", opts.pdftoppm_cmd))
            }
            _ => RenderFailure::Unavailable(format!("'{}': {e}", opts.pdftoppm_cmd)),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(caps) = RE_LAST_PAGE.captures(&stderr) {
            let total = caps[1].parse().unwrap_or(0);
            return Err(RenderFailure::Failed(ExtractError::PageOutOfRange {
                page: opts.page,
                total,
            }));
        }
        return Err(RenderFailure::Failed(ExtractError::unsupported(format!(
            "pdftoppm exited with {}: {}",
            output.status,
            stderr.trim()
        ))));
    }

    let png = first_png(dir.path()).ok_or_else(|| {
        // pdftoppm writes nothing for a page past the end on some versions.
        RenderFailure::Failed(ExtractError::PageOutOfRange {
            page: opts.page,
            total: 0,
        })
    })?;

    let image = image::open(&png).map_err(|e| {
        RenderFailure::Failed(ExtractError::unsupported(format!(
            "pdftoppm output unreadable: {e}"
        )))
    })?;
    debug!(
        "pdftoppm rendered page {} → {}x{} px",
        opts.page,
        image.width(),
        image.height()
    );
    Ok(image)
}

fn first_png(dir: &Path) -> Option<PathBuf> {
    let mut pngs: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
        .collect();
    pngs.sort();
    pngs.into_iter().next()
}
