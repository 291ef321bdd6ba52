//! Job orchestration and library entry points.
//!
//! An [`Extractor`] owns the validated configuration, the compiled schema
//! and the recognition chain. Build it once and share it across jobs; the
//! free functions [`extract`], [`extract_bytes`] and [`extract_sync`] build
//! a throwaway one per call.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::output::ExtractionResult;
use crate::pipeline::aggregate::aggregate;
use crate::pipeline::fields::{parse_model_response, parse_ocr_lines, ParsedFields};
use crate::pipeline::input::{MediaType, SourceDocument};
use crate::pipeline::layout::{self, LayoutHint};
use crate::pipeline::normalize::normalize;
use crate::pipeline::recognize::{
    BackendKind, OcrBackend, OcrLine, RawOutput, RecognitionAttempt, RecognitionBackend,
    RecognitionChain, VisionBackend,
};
use crate::schema::CompiledSchema;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// A reusable extraction job runner. `Send + Sync`.
#[derive(Debug)]
pub struct Extractor {
    config: Arc<ExtractionConfig>,
    schema: Arc<CompiledSchema>,
    chain: RecognitionChain,
}

impl Extractor {
    /// Default chain: vision model first, then classical OCR.
    ///
    /// The OCR engine is detected on the first call in the process and
    /// reused afterwards. That first call may block on spawning the CLI.
    pub fn new(config: ExtractionConfig) -> Result<Self, ExtractError> {
        let vision = VisionBackend::new(&config)?;
        let ocr = OcrBackend::new(&config);
        let backends: Vec<Arc<dyn RecognitionBackend>> = vec![Arc::new(vision), Arc::new(ocr)];
        Self::with_backends(config, backends)
    }

    /// Use a caller-supplied chain, tried in the given order.
    pub fn with_backends(
        config: ExtractionConfig,
        backends: Vec<Arc<dyn RecognitionBackend>>,
    ) -> Result<Self, ExtractError> {
        let schema = config.schema.compile()?;
        Ok(Self {
            config: Arc::new(config),
            schema: Arc::new(schema),
            chain: RecognitionChain::new(backends),
        })
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }

    pub fn chain(&self) -> &RecognitionChain {
        &self.chain
    }

    /// Run one job.
    ///
    /// # Errors
    /// Only for input that cannot be turned into a page (missing file,
    /// undecodable data, page out of range) or an internal failure. A page
    /// no backend could read is still `Ok` with `success == false`.
    pub async fn extract(&self, source: SourceDocument) -> Result<ExtractionResult, ExtractError> {
        let start = Instant::now();
        info!(
            "Extracting '{}' fields from {:?} input ({} bytes)",
            self.schema.document_type(),
            source.media_type(),
            source.bytes().len()
        );

        // ── Step 1: Normalise ────────────────────────────────────────────
        let config = Arc::clone(&self.config);
        let page = tokio::task::spawn_blocking(move || normalize(&source, &config))
            .await
            .map_err(|e| ExtractError::Internal(format!("Normalize task panicked: {e}")))??;
        let page = Arc::new(page);
        debug!(
            "Canonical page {}x{} (source {}x{})",
            page.width(),
            page.height(),
            page.source_width,
            page.source_height
        );

        let progress = self.config.progress_callback.as_ref();
        if let Some(cb) = progress {
            cb.on_job_start(page.width(), page.height());
        }

        // ── Step 2: Layout hints ─────────────────────────────────────────
        let hints = if self.schema.schema().use_layout_hints {
            let page_ref = Arc::clone(&page);
            tokio::task::spawn_blocking(move || layout::analyze(&page_ref))
                .await
                .map_err(|e| ExtractError::Internal(format!("Layout task panicked: {e}")))?
        } else {
            LayoutHint::empty(page.width(), page.height())
        };

        // ── Step 3: Recognition chain ────────────────────────────────────
        let outcome = self
            .chain
            .run(Arc::clone(&page), &hints, self.config.enhancement, progress)
            .await?;

        // ── Step 4: Field parsing ────────────────────────────────────────
        let parsed = match &outcome.accepted {
            Some(attempt) => parse_attempt(&self.schema, attempt),
            None => ParsedFields::default(),
        };
        debug!("Parsed {} non-empty field(s)", parsed.values.len());

        // ── Step 5: Aggregate ────────────────────────────────────────────
        let result = aggregate(&self.schema, outcome, parsed, start.elapsed());
        info!(
            "Extraction finished: method={}, success={}, missing={}, {} ms",
            result.method(),
            result.success(),
            result.missing_fields().len(),
            result.duration_ms()
        );

        if let Some(cb) = progress {
            cb.on_job_complete(&result);
        }
        Ok(result)
    }
}

fn parse_attempt(schema: &CompiledSchema, attempt: &RecognitionAttempt) -> ParsedFields {
    match (attempt.kind, &attempt.output) {
        (BackendKind::Vision, output) => parse_model_response(schema, &output.to_text()),
        (BackendKind::Ocr, RawOutput::Lines(lines)) => parse_ocr_lines(schema, lines),
        (BackendKind::Ocr, output) => {
            let lines: Vec<OcrLine> = output
                .to_text()
                .lines()
                .map(|text| OcrLine {
                    text: text.to_string(),
                    confidence: 0.0,
                })
                .collect();
            parse_ocr_lines(schema, &lines)
        }
    }
}

/// Extract fields from a file on disk.
///
/// `media_type` overrides detection by extension and content sniffing.
///
/// # Example
/// ```rust,no_run
/// use edgequake_docfields::{extract, ExtractionConfig, FieldSchema};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ExtractionConfig::builder()
///     .schema(FieldSchema::drawing())
///     .build()?;
/// let result = extract("part.png", None, &config).await?;
/// println!("{}", result.to_output_json());
/// # Ok(())
/// # }
/// ```
pub async fn extract(
    path: impl AsRef<Path>,
    media_type: Option<MediaType>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractError> {
    let source = SourceDocument::from_path(path.as_ref(), media_type)?;
    build_extractor(config).await?.extract(source).await
}

/// Extract fields from bytes already in memory.
pub async fn extract_bytes(
    bytes: Vec<u8>,
    media_type: Option<MediaType>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractError> {
    let source = SourceDocument::from_bytes(bytes, media_type)?;
    build_extractor(config).await?.extract(source).await
}

/// Building an extractor may run OCR engine detection, which blocks.
async fn build_extractor(config: &ExtractionConfig) -> Result<Extractor, ExtractError> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || Extractor::new(config))
        .await
        .map_err(|e| ExtractError::Internal(format!("Extractor setup task panicked: {e}")))?
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    path: impl AsRef<Path>,
    media_type: Option<MediaType>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(path, media_type, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{FieldData, Method, Provenance};
    use crate::pipeline::enhance::{EnhancedImage, EnhancementProfile};
    use crate::schema::FieldSchema;
    use futures::future::BoxFuture;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    struct Canned {
        kind: BackendKind,
        output: RawOutput,
    }

    impl RecognitionBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }
        fn kind(&self) -> BackendKind {
            self.kind
        }
        fn profile(&self) -> EnhancementProfile {
            EnhancementProfile::Vision
        }
        fn is_available(&self) -> bool {
            true
        }
        fn attempt<'a>(
            &'a self,
            _image: &'a EnhancedImage,
            _hints: &'a LayoutHint,
        ) -> BoxFuture<'a, RecognitionAttempt> {
            Box::pin(async move { RecognitionAttempt::accepted(self, self.output.clone(), Some(0.8)) })
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(64, 48, Rgb([255, 255, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn extractor(schema: FieldSchema, backend: Canned) -> Extractor {
        let config = ExtractionConfig::builder()
            .schema(schema)
            .enhancement(false)
            .build()
            .unwrap();
        Extractor::with_backends(config, vec![Arc::new(backend)]).unwrap()
    }

    #[tokio::test]
    async fn vision_reply_flows_into_result() {
        let ex = extractor(
            FieldSchema::invoice(),
            Canned {
                kind: BackendKind::Vision,
                output: RawOutput::Text(r#"{"invoice_number": "04417652", "amount": "1,200.50"}"#.into()),
            },
        );
        let source = SourceDocument::from_bytes(png_bytes(), None).unwrap();
        let r = ex.extract(source).await.unwrap();
        assert!(r.success());
        assert_eq!(r.method(), Method::Vision);
        assert_eq!(r.document_type(), "invoice");
        let n = r.field("invoice_number").unwrap();
        assert_eq!(n.value, FieldData::Text("04417652".into()));
        assert_eq!(n.source, Some(Provenance::Vision));
        assert_eq!(r.field("amount").unwrap().value.as_text().as_deref(), Some("1,200.50"));
    }

    #[tokio::test]
    async fn ocr_text_output_is_split_into_lines() {
        let ex = extractor(
            FieldSchema::drawing(),
            Canned {
                kind: BackendKind::Ocr,
                output: RawOutput::Text("图号: GB-2024-0153\n材料: 45钢".into()),
            },
        );
        let source = SourceDocument::from_bytes(png_bytes(), Some(MediaType::Image)).unwrap();
        let r = ex.extract(source).await.unwrap();
        assert_eq!(r.method(), Method::Ocr);
        assert!(r.success());
        let dn = r.field("drawing_number").unwrap();
        assert_eq!(dn.source, Some(Provenance::Ocr));
        assert_eq!(dn.value.as_text().as_deref(), Some("GB-2024-0153"));
    }

    #[tokio::test]
    async fn empty_chain_is_fail_soft() {
        let config = ExtractionConfig::builder().enhancement(false).build().unwrap();
        let ex = Extractor::with_backends(config, Vec::new()).unwrap();
        let source = SourceDocument::from_bytes(png_bytes(), None).unwrap();
        let r = ex.extract(source).await.unwrap();
        assert_eq!(r.method(), Method::None);
        assert!(!r.success());
        assert_eq!(r.confidence(), 0.0);
    }

    #[tokio::test]
    async fn undecodable_image_is_fatal() {
        let config = ExtractionConfig::default();
        let ex = Extractor::with_backends(config, Vec::new()).unwrap();
        let source = SourceDocument::from_bytes(b"not an image".to_vec(), Some(MediaType::Image)).unwrap();
        assert!(matches!(
            ex.extract(source).await,
            Err(ExtractError::UnsupportedFormat { .. })
        ));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let config = ExtractionConfig::default();
        let err = extract("/definitely/not/here.png", None, &config).await.unwrap_err();
        assert!(matches!(err, ExtractError::FileNotFound { .. }));
    }
}
