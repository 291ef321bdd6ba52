//! Configuration types for field extraction.
//!
//! All job behaviour is controlled through [`ExtractionConfig`], built via
//! [`ExtractionConfigBuilder`] or read from the environment with
//! [`ExtractionConfig::from_env`].

use crate::error::ExtractError;
use crate::progress::ProgressCallback;
use crate::schema::FieldSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Configuration for a field-extraction job.
///
/// # Example
/// ```rust
/// use edgequake_docfields::{ExtractionConfig, FieldSchema};
///
/// let config = ExtractionConfig::builder()
///     .schema(FieldSchema::drawing())
///     .model("qwen2.5vl:7b")
///     .pdf_dpi(300)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    // ── Vision backend ───────────────────────────────────────────────────
    /// Base URL of the Ollama-compatible inference server. Default: `http://localhost:11434`.
    pub inference_base_url: String,

    /// Vision model name. Default: `qwen2.5vl:7b`.
    pub model: String,

    /// When false the vision backend reports itself unavailable. Default: true.
    pub vision_enabled: bool,

    /// Timeout for the single vision request. Default: 300.
    ///
    /// Local 7B vision models on CPU can take minutes for a 2000 px page.
    pub vision_timeout_secs: u64,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// JPEG quality of the uploaded page. Range: 1–100. Default: 90.
    pub jpeg_quality: u8,

    // ── OCR backend ──────────────────────────────────────────────────────
    /// Which classical OCR engine to use. Default: [`OcrEnginePreference::Auto`].
    pub ocr_engine: OcrEnginePreference,

    /// Tesseract language string. Default: `chi_sim+eng`.
    pub ocr_language: String,

    /// Executable used by the CLI engine. Default: `tesseract`.
    pub tesseract_cmd: String,

    /// An OCR attempt is accepted once one line has at least this many
    /// non-whitespace characters. Default: 2.
    pub min_ocr_line_chars: usize,

    // ── Normalisation ────────────────────────────────────────────────────
    /// 1-indexed PDF page to extract. Default: 1.
    pub pdf_page: usize,

    /// PDF rendering DPI. Range: 72–400. Default: 200.
    pub pdf_dpi: u32,

    /// Maximum width or height of the canonical page. Default: 2000.
    pub max_dimension: u32,

    /// Executable for the poppler fallback rasteriser. Default: `pdftoppm`.
    pub pdftoppm_cmd: String,

    /// Explicit pdfium library file or directory. Falls back to `PDFIUM_LIB_PATH`,
    /// then to the system library.
    pub pdfium_library_path: Option<PathBuf>,

    /// Run the image-enhancement transforms. Default: true.
    pub enhancement: bool,

    // ── Fields ───────────────────────────────────────────────────────────
    /// The document type to extract. Default: [`FieldSchema::invoice`].
    pub schema: FieldSchema,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            inference_base_url: "http://localhost:11434".to_string(),
            model: "qwen2.5vl:7b".to_string(),
            vision_enabled: true,
            vision_timeout_secs: 300,
            temperature: 0.1,
            jpeg_quality: 90,
            ocr_engine: OcrEnginePreference::default(),
            ocr_language: "chi_sim+eng".to_string(),
            tesseract_cmd: "tesseract".to_string(),
            min_ocr_line_chars: 2,
            pdf_page: 1,
            pdf_dpi: 200,
            max_dimension: 2000,
            pdftoppm_cmd: "pdftoppm".to_string(),
            pdfium_library_path: None,
            enhancement: true,
            schema: FieldSchema::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("inference_base_url", &self.inference_base_url)
            .field("model", &self.model)
            .field("vision_enabled", &self.vision_enabled)
            .field("vision_timeout_secs", &self.vision_timeout_secs)
            .field("temperature", &self.temperature)
            .field("jpeg_quality", &self.jpeg_quality)
            .field("ocr_engine", &self.ocr_engine)
            .field("ocr_language", &self.ocr_language)
            .field("pdf_page", &self.pdf_page)
            .field("pdf_dpi", &self.pdf_dpi)
            .field("max_dimension", &self.max_dimension)
            .field("enhancement", &self.enhancement)
            .field("schema", &self.schema.document_type)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ExtractionProgressCallback>"),
            )
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults overridden by `DOCFIELDS_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `DOCFIELDS_INFERENCE_URL` | `inference_base_url` |
    /// | `DOCFIELDS_MODEL` | `model` |
    /// | `DOCFIELDS_OCR_ENGINE` | `ocr_engine` |
    /// | `DOCFIELDS_VISION_TIMEOUT` | `vision_timeout_secs` |
    /// | `DOCFIELDS_SCHEMA` | `schema` (`invoice`, `drawing` or a JSON path) |
    /// | `PDFIUM_LIB_PATH` | `pdfium_library_path` |
    pub fn from_env() -> Result<Self, ExtractError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ExtractError> {
        let mut b = Self::builder();
        if let Some(url) = lookup("DOCFIELDS_INFERENCE_URL") {
            b = b.inference_base_url(url);
        }
        if let Some(model) = lookup("DOCFIELDS_MODEL") {
            b = b.model(model);
        }
        if let Some(engine) = lookup("DOCFIELDS_OCR_ENGINE") {
            b = b.ocr_engine(engine.parse()?);
        }
        if let Some(secs) = lookup("DOCFIELDS_VISION_TIMEOUT") {
            let secs = secs.trim().parse::<u64>().map_err(|_| {
                ExtractError::InvalidConfig(format!(
                    "DOCFIELDS_VISION_TIMEOUT must be a number of seconds, got {secs:?}"
                ))
            })?;
            b = b.vision_timeout_secs(secs);
        }
        if let Some(schema) = lookup("DOCFIELDS_SCHEMA") {
            b = b.schema(FieldSchema::from_name_or_path(&schema)?);
        }
        if let Some(path) = lookup("PDFIUM_LIB_PATH") {
            b = b.pdfium_library_path(path);
        }
        b.build()
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl fmt::Debug for ExtractionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionConfigBuilder {
    pub fn inference_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.inference_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn vision_enabled(mut self, v: bool) -> Self {
        self.config.vision_enabled = v;
        self
    }

    pub fn vision_timeout_secs(mut self, secs: u64) -> Self {
        self.config.vision_timeout_secs = secs;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn ocr_engine(mut self, engine: OcrEnginePreference) -> Self {
        self.config.ocr_engine = engine;
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn tesseract_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.config.tesseract_cmd = cmd.into();
        self
    }

    pub fn min_ocr_line_chars(mut self, n: usize) -> Self {
        self.config.min_ocr_line_chars = n.max(1);
        self
    }

    pub fn pdf_page(mut self, page: usize) -> Self {
        self.config.pdf_page = page;
        self
    }

    pub fn pdf_dpi(mut self, dpi: u32) -> Self {
        self.config.pdf_dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_dimension(mut self, px: u32) -> Self {
        self.config.max_dimension = px.max(100);
        self
    }

    pub fn pdftoppm_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.config.pdftoppm_cmd = cmd.into();
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    pub fn enhancement(mut self, v: bool) -> Self {
        self.config.enhancement = v;
        self
    }

    pub fn schema(mut self, schema: FieldSchema) -> Self {
        self.config.schema = schema;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating ranges and schema patterns.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.pdf_page == 0 {
            return Err(ExtractError::InvalidConfig(
                "pdf_page is 1-indexed, got 0".into(),
            ));
        }
        if c.vision_timeout_secs == 0 {
            return Err(ExtractError::InvalidConfig(
                "vision_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.vision_enabled
            && !(c.inference_base_url.starts_with("http://")
                || c.inference_base_url.starts_with("https://"))
        {
            return Err(ExtractError::InvalidConfig(format!(
                "inference_base_url must be an http(s) URL, got {:?}",
                c.inference_base_url
            )));
        }
        if c.vision_enabled && c.model.trim().is_empty() {
            return Err(ExtractError::InvalidConfig("model must not be empty".into()));
        }
        c.schema.compile()?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which classical OCR engine the OCR backend should use.
///
/// Resolved once per process into a concrete engine, or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrEnginePreference {
    /// libtesseract if compiled in, else the `tesseract` CLI if installed.
    #[default]
    Auto,
    /// libtesseract only (requires the `leptess` feature).
    Leptess,
    /// The `tesseract` executable only.
    TesseractCli,
    /// No OCR; the backend is always unavailable.
    Disabled,
}

impl FromStr for OcrEnginePreference {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "leptess" | "libtesseract" => Ok(Self::Leptess),
            "tesseract" | "cli" | "tesseract_cli" => Ok(Self::TesseractCli),
            "off" | "none" | "disabled" => Ok(Self::Disabled),
            other => Err(ExtractError::InvalidConfig(format!(
                "unknown OCR engine {other:?} (expected auto, leptess, tesseract or off)"
            ))),
        }
    }
}
