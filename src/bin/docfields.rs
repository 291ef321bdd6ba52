//! CLI binary for edgequake-docfields.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints the result as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_docfields::{
    extract, ExtractionConfig, ExtractionProgressCallback, ExtractionResult, FieldSchema,
    OcrEnginePreference, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner on stderr with one log line per recognition attempt.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading document…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_job_start(&self, width: u32, height: u32) {
        self.bar.set_prefix("Extracting");
        self.bar.set_message(format!("page {width}x{height}"));
    }

    fn on_attempt_start(&self, backend: &str) {
        self.bar.set_message(format!("trying {backend}…"));
    }

    fn on_attempt_complete(&self, backend: &str, accepted: bool, elapsed: Duration) {
        let mark = if accepted { green("✓") } else { red("✗") };
        let verdict = if accepted { "accepted" } else { "not accepted" };
        self.bar.println(format!(
            "  {} {:<8} {:<13} {}",
            mark,
            backend,
            verdict,
            dim(&format!("{:.1}s", elapsed.as_secs_f64())),
        ));
    }

    fn on_job_complete(&self, result: &ExtractionResult) {
        self.bar.finish_and_clear();
        let filled = result.fields().len() - result.missing_fields().len();
        eprintln!(
            "{} method={}  {}/{} fields  confidence {:.2}",
            if result.success() { green("✔") } else { red("✘") },
            bold(&result.method().to_string()),
            filled,
            result.fields().len(),
            result.confidence(),
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # VAT invoice from a phone photo (stdout)
  docfields invoice.jpg

  # Engineering drawing, page 2 of a PDF, written to a file
  docfields --schema drawing --page 2 part.pdf -o part.json

  # Custom document type
  docfields --schema ./receipt-schema.json receipt.png

  # OCR only, no model server
  docfields --no-vision scan.png

  # Full diagnostic output (attempts, provenance, timings)
  docfields --full drawing.png

ENVIRONMENT VARIABLES:
  DOCFIELDS_INFERENCE_URL  Ollama-compatible base URL (default http://localhost:11434)
  DOCFIELDS_MODEL          Vision model (default qwen2.5vl:7b)
  DOCFIELDS_SCHEMA         invoice, drawing or a schema JSON path
  DOCFIELDS_OCR_ENGINE     auto, leptess, tesseract or off
  DOCFIELDS_VISION_TIMEOUT Vision request timeout in seconds
  PDFIUM_LIB_PATH          Path to libpdfium; pdftoppm is used when absent

EXIT STATUS:
  0 when every required field was found, 2 when the result is partial,
  1 on error.
"#;

/// Extract structured fields from invoices and engineering drawings.
#[derive(Parser, Debug)]
#[command(
    name = "docfields",
    version,
    about = "Extract structured fields from invoices and engineering drawings",
    long_about = "Extract structured fields from a scanned invoice or engineering drawing \
(image or PDF page) using a local vision model served by Ollama, falling back to \
Tesseract OCR with pattern-based recovery.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Image (PNG, JPEG, TIFF, …) or PDF file.
    input: PathBuf,

    /// Write JSON to this file instead of stdout.
    #[arg(short, long, env = "DOCFIELDS_OUTPUT")]
    output: Option<PathBuf>,

    /// Document type: invoice, drawing, or a path to a schema JSON file.
    #[arg(long, env = "DOCFIELDS_SCHEMA", default_value = "invoice")]
    schema: String,

    /// Base URL of the Ollama-compatible inference server.
    #[arg(long, env = "DOCFIELDS_INFERENCE_URL")]
    inference_url: Option<String>,

    /// Vision model name.
    #[arg(long, env = "DOCFIELDS_MODEL")]
    model: Option<String>,

    /// OCR engine: auto, leptess, tesseract, off.
    #[arg(long, env = "DOCFIELDS_OCR_ENGINE", default_value = "auto")]
    ocr_engine: String,

    /// Tesseract language string.
    #[arg(long, env = "DOCFIELDS_OCR_LANG")]
    ocr_lang: Option<String>,

    /// Skip the vision model and go straight to OCR.
    #[arg(long, env = "DOCFIELDS_NO_VISION")]
    no_vision: bool,

    /// Disable image enhancement.
    #[arg(long, env = "DOCFIELDS_NO_ENHANCE")]
    no_enhance: bool,

    /// 1-indexed PDF page.
    #[arg(long, env = "DOCFIELDS_PAGE", default_value_t = 1,
          value_parser = clap::value_parser!(u64).range(1..))]
    page: u64,

    /// PDF rendering DPI (72–400).
    #[arg(long, env = "DOCFIELDS_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Vision request timeout in seconds.
    #[arg(long, env = "DOCFIELDS_VISION_TIMEOUT")]
    timeout: Option<u64>,

    /// Path to an existing libpdfium.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Emit the full result (attempts, provenance, timings) instead of
    /// `{success, method, fields}`.
    #[arg(long, env = "DOCFIELDS_FULL")]
    full: bool,

    /// Disable the spinner.
    #[arg(long, env = "DOCFIELDS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCFIELDS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCFIELDS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner replaces INFO-level library logs unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Run extraction ───────────────────────────────────────────────────
    let result = extract(&cli.input, None, &config)
        .await
        .with_context(|| format!("Extraction failed for {}", cli.input.display()))?;

    let value = if cli.full {
        serde_json::to_value(&result).context("Failed to serialise result")?
    } else {
        result.to_output_json()
    };
    let json = serde_json::to_string_pretty(&value).context("Failed to serialise result")?;

    match cli.output {
        Some(ref path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            tokio::fs::write(path, format!("{json}\n"))
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!("{}  →  {}", green("✔"), bold(&path.display().to_string()));
            }
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            writeln!(handle, "{json}").context("Failed to write to stdout")?;
        }
    }

    if !cli.quiet && !show_progress {
        eprintln!(
            "method={} success={} confidence={:.2} {}ms",
            result.method(),
            result.success(),
            result.confidence(),
            result.duration_ms()
        );
    }

    if !result.success() {
        std::process::exit(2);
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let schema = FieldSchema::from_name_or_path(&cli.schema)
        .with_context(|| format!("Failed to load schema {:?}", cli.schema))?;
    let ocr_engine: OcrEnginePreference = cli
        .ocr_engine
        .parse()
        .context("Invalid --ocr-engine")?;

    let mut builder = ExtractionConfig::builder()
        .schema(schema)
        .ocr_engine(ocr_engine)
        .vision_enabled(!cli.no_vision)
        .enhancement(!cli.no_enhance)
        .pdf_page(cli.page as usize)
        .pdf_dpi(cli.dpi);

    if let Some(ref url) = cli.inference_url {
        builder = builder.inference_base_url(url);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref lang) = cli.ocr_lang {
        builder = builder.ocr_language(lang);
    }
    if let Some(secs) = cli.timeout {
        builder = builder.vision_timeout_secs(secs);
    }
    if let Some(ref path) = cli.pdfium_lib {
        builder = builder.pdfium_library_path(path);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
