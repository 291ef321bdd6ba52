//! # edgequake-docfields
//!
//! Extract structured fields from scanned invoices and engineering drawings
//! using a local Vision Language Model, with classical OCR as fallback.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Normalize  decode or rasterise one page → RGB8, size cap (spawn_blocking)
//!  ├─ 2. Layout     title block + dimension-area hints (drawings only)
//!  ├─ 3. Recognize  vision model ─▶ OCR  (first accepted attempt wins)
//!  │                each backend gets its own enhancement profile
//!  ├─ 4. Fields     JSON parse with repair, regex recovery, validation
//!  └─ 5. Aggregate  confidence, missing fields, success flag
//! ```
//!
//! A page nobody could read still yields an [`ExtractionResult`] with
//! `method = none` and the per-attempt diagnostics in `raw_text`. Only
//! unusable input (missing file, undecodable bytes, bad page number) is an
//! `Err`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docfields::{extract, ExtractionConfig, FieldSchema};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Talks to Ollama on localhost:11434 by default
//!     let config = ExtractionConfig::builder()
//!         .schema(FieldSchema::invoice())
//!         .build()?;
//!     let result = extract("invoice.jpg", None, &config).await?;
//!     println!("{}", serde_json::to_string_pretty(&result.to_output_json())?);
//!     eprintln!("method={} confidence={:.2}", result.method(), result.confidence());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `docfields` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `cv`      | on      | imageproc-based enhancement and layout analysis; without it both are pass-through |
//! | `leptess` | off     | In-process libtesseract OCR engine (needs libtesseract/leptonica at build time) |
//!
//! Without `leptess` the OCR backend drives the `tesseract` executable.
//!
//! ## Custom document types
//!
//! A [`FieldSchema`] is plain data. Load one from JSON with
//! [`FieldSchema::from_json_file`] and the prompt, JSON lookup and regex
//! recovery all follow it.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schema;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, OcrEnginePreference};
pub use error::{BackendError, ExtractError, FieldValidationError, ParseError};
pub use extract::{extract, extract_bytes, extract_sync, Extractor};
pub use output::{AttemptSummary, ExtractionResult, FieldData, FieldValue, Method, Provenance};
pub use pipeline::enhance::{EnhancedImage, EnhancementProfile};
pub use pipeline::input::{MediaType, SourceDocument};
pub use pipeline::layout::{LayoutHint, LayoutRegion, RegionKind};
pub use pipeline::recognize::{
    AttemptOutcome, BackendKind, OcrBackend, OcrEngine, OcrLine, RawOutput, RecognitionAttempt,
    RecognitionBackend, VisionBackend,
};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use schema::{CompiledSchema, FieldKind, FieldSchema, FieldSpec};
