//! End-to-end integration tests for edgequake-docfields.
//!
//! The vision endpoint is a mock `/api/generate` server on a local
//! `TcpListener`; OCR is a mock backend, so these run without Ollama or
//! Tesseract. PDF tests use files in `./test_cases/` and an installed
//! rasteriser, and are gated behind `E2E_ENABLED`.
//!
//! Run with:
//!   cargo test --test e2e -- --nocapture
//!
//! PDF scenarios:
//!   E2E_ENABLED=1 cargo test --test e2e pdf -- --nocapture

use edgequake_docfields::{
    extract_bytes, BackendKind, EnhancedImage, EnhancementProfile, ExtractError,
    ExtractionConfig, ExtractionProgressCallback, Extractor, FieldData, FieldSchema, LayoutHint,
    MediaType, Method, OcrEnginePreference, OcrLine, Provenance, RawOutput, RecognitionAttempt,
    RecognitionBackend, SourceDocument, VisionBackend,
};
use futures::future::BoxFuture;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

// ── Mock inference server ────────────────────────────────────────────────────

struct MockServer {
    base_url: String,
    requests: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn last_body(&self) -> serde_json::Value {
        let bodies = self.bodies.lock().unwrap();
        serde_json::from_str(bodies.last().expect("no request received")).unwrap()
    }
}

/// Serve `status` with `{"response": reply}` to every request.
async fn spawn_mock(status: u16, reply: &str) -> MockServer {
    let payload = serde_json::json!({ "model": "mock", "response": reply, "done": true }).to_string();
    spawn_raw(status, payload).await
}

async fn spawn_raw(status: u16, payload: String) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let bodies = Arc::new(Mutex::new(Vec::new()));

    let (req_count, req_bodies) = (Arc::clone(&requests), Arc::clone(&bodies));
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let req_count = Arc::clone(&req_count);
            let req_bodies = Arc::clone(&req_bodies);
            let payload = payload.clone();
            tokio::spawn(async move {
                let body = read_request_body(&mut sock).await;
                req_count.fetch_add(1, Ordering::SeqCst);
                req_bodies.lock().unwrap().push(body);
                let reason = if status == 200 { "OK" } else { "Error" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });

    MockServer {
        base_url: format!("http://{addr}"),
        requests,
        bodies,
    }
}

async fn read_request_body(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = sock.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let len = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let start = end + 4;
            if buf.len() >= start + len {
                return String::from_utf8_lossy(&buf[start..start + len]).into_owned();
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// A base URL nothing listens on.
fn refused_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

// ── Mock OCR backend ─────────────────────────────────────────────────────────

struct MockOcr {
    lines: Vec<&'static str>,
    calls: AtomicUsize,
}

impl MockOcr {
    fn new(lines: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            lines: lines.to_vec(),
            calls: AtomicUsize::new(0),
        })
    }
}

impl RecognitionBackend for MockOcr {
    fn name(&self) -> &str {
        "mock-ocr"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ocr
    }

    fn profile(&self) -> EnhancementProfile {
        EnhancementProfile::Ocr
    }

    fn is_available(&self) -> bool {
        true
    }

    fn attempt<'a>(
        &'a self,
        image: &'a EnhancedImage,
        _hints: &'a LayoutHint,
    ) -> BoxFuture<'a, RecognitionAttempt> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(image.profile, EnhancementProfile::Ocr);
            let lines: Vec<OcrLine> = self
                .lines
                .iter()
                .map(|t| OcrLine {
                    text: t.to_string(),
                    confidence: 0.82,
                })
                .collect();
            if lines.iter().any(|l| l.text.trim().chars().count() >= 2) {
                RecognitionAttempt::accepted(self, RawOutput::Lines(lines), Some(0.82))
            } else {
                RecognitionAttempt::not_accepted(self, RawOutput::Lines(lines), "no usable lines")
            }
        })
    }
}

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Route library logs through the test harness; `RUST_LOG=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

/// Skip this test if E2E_ENABLED is not set *or* no file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

/// A white page with some dark strokes so enhancement has work to do.
fn page_png() -> Vec<u8> {
    let mut img = RgbImage::from_pixel(320, 240, Rgb([250, 250, 250]));
    for x in 20..300 {
        for y in 100..104 {
            img.put_pixel(x, y, Rgb([10, 10, 10]));
        }
    }
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn config(schema: FieldSchema, base_url: &str) -> ExtractionConfig {
    ExtractionConfig::builder()
        .schema(schema)
        .inference_base_url(base_url)
        .vision_timeout_secs(10)
        .ocr_engine(OcrEnginePreference::Disabled)
        .build()
        .unwrap()
}

fn extractor_with_mock_ocr(config: ExtractionConfig, ocr: &Arc<MockOcr>) -> Extractor {
    let vision = VisionBackend::new(&config).unwrap();
    let backends: Vec<Arc<dyn RecognitionBackend>> =
        vec![Arc::new(vision), Arc::clone(ocr) as Arc<dyn RecognitionBackend>];
    Extractor::with_backends(config, backends).unwrap()
}

fn text_of(result: &edgequake_docfields::ExtractionResult, field: &str) -> Option<String> {
    result.field(field).and_then(|f| f.value.as_text())
}

// ── Scenario 1: vision success ───────────────────────────────────────────────

#[tokio::test]
async fn vision_success_returns_parsed_fields() {
    init_tracing();
    let reply = r#"```json
{"invoice_number": "04417652", "invoice_date": "2024年3月5日", "total_amount": "1,130.00", "seller_name": "上海某某科技有限公司"}
```"#;
    let server = spawn_mock(200, reply).await;
    let ocr = MockOcr::new(&["never used"]);
    let ex = extractor_with_mock_ocr(config(FieldSchema::invoice(), &server.base_url), &ocr);

    let source = SourceDocument::from_bytes(page_png(), None).unwrap();
    let result = ex.extract(source).await.unwrap();

    assert!(result.success());
    assert_eq!(result.method(), Method::Vision);
    assert_eq!(result.confidence(), 0.9);
    assert_eq!(text_of(&result, "invoice_number").as_deref(), Some("04417652"));
    assert_eq!(text_of(&result, "invoice_date").as_deref(), Some("2024年3月5日"));
    assert_eq!(text_of(&result, "total_amount").as_deref(), Some("1,130.00"));
    assert_eq!(
        result.field("seller_name").unwrap().source,
        Some(Provenance::Vision)
    );
    assert!(result.missing_fields().contains(&"buyer_tax_id".to_string()));
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);

    assert_eq!(server.request_count(), 1);
    let body = server.last_body();
    assert_eq!(body["model"], "qwen2.5vl:7b");
    assert_eq!(body["stream"], false);
    assert_eq!(body["images"].as_array().unwrap().len(), 1);
    assert!(body["prompt"].as_str().unwrap().contains("\"invoice_number\""));

    let out = result.to_output_json();
    assert_eq!(out["method"], "vision");
    assert_eq!(out["fields"]["invoice_number"], "04417652");
    assert!(out["fields"]["buyer_name"].is_null());
}

// ── Scenario 2: vision down → OCR ────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    started: Mutex<Vec<String>>,
    completed: Mutex<Vec<(String, bool)>>,
    finished: AtomicUsize,
}

impl ExtractionProgressCallback for Recorder {
    fn on_attempt_start(&self, backend: &str) {
        self.started.lock().unwrap().push(backend.to_string());
    }

    fn on_attempt_complete(&self, backend: &str, accepted: bool, _elapsed: Duration) {
        self.completed
            .lock()
            .unwrap()
            .push((backend.to_string(), accepted));
    }

    fn on_job_complete(&self, _result: &edgequake_docfields::ExtractionResult) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn vision_unreachable_falls_through_to_ocr() {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let config = ExtractionConfig::builder()
        .schema(FieldSchema::invoice())
        .inference_base_url(refused_url())
        .vision_timeout_secs(5)
        .progress_callback(Arc::clone(&recorder) as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();
    let ocr = MockOcr::new(&[
        "增值税专用发票",
        "发票代码: 044031900111  发票号码: 12345678",
        "开票日期: 2024年03月15日",
        "价税合计(大写) 壹仟元整 (小写) ¥1,000.00",
    ]);
    let ex = extractor_with_mock_ocr(config, &ocr);

    let source = SourceDocument::from_bytes(page_png(), Some(MediaType::Image)).unwrap();
    let result = ex.extract(source).await.unwrap();

    assert_eq!(result.method(), Method::Ocr);
    assert!(result.success());
    assert!((result.confidence() - 0.82).abs() < 1e-6);
    assert_eq!(text_of(&result, "invoice_number").as_deref(), Some("12345678"));
    assert_eq!(text_of(&result, "invoice_code").as_deref(), Some("044031900111"));
    assert_eq!(text_of(&result, "invoice_date").as_deref(), Some("2024-03-15"));
    assert_eq!(text_of(&result, "total_amount").as_deref(), Some("1000.00"));
    assert_eq!(
        result.field("invoice_number").unwrap().source,
        Some(Provenance::Ocr)
    );

    let attempts = result.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].backend, "vision");
    assert!(!attempts[0].accepted);
    assert!(attempts[1].accepted);
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);

    assert_eq!(*recorder.started.lock().unwrap(), vec!["vision", "mock-ocr"]);
    assert_eq!(
        *recorder.completed.lock().unwrap(),
        vec![("vision".to_string(), false), ("mock-ocr".to_string(), true)]
    );
    assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn vision_http_error_is_not_retried() {
    init_tracing();
    let server = spawn_raw(500, r#"{"error":"model crashed"}"#.to_string()).await;
    let ocr = MockOcr::new(&["图号: GB-2024-0153", "材料: 45#"]);
    let ex = extractor_with_mock_ocr(config(FieldSchema::drawing(), &server.base_url), &ocr);

    let source = SourceDocument::from_bytes(page_png(), None).unwrap();
    let result = ex.extract(source).await.unwrap();

    assert_eq!(server.request_count(), 1);
    assert_eq!(result.method(), Method::Ocr);
    assert_eq!(text_of(&result, "drawing_number").as_deref(), Some("GB-2024-0153"));
    assert_eq!(text_of(&result, "material").as_deref(), Some("45#"));
    let reason = result.attempts()[0].reason.clone().unwrap();
    assert!(reason.contains("500"), "{reason}");
}

// ── Scenario 3: nothing accepted ─────────────────────────────────────────────

#[tokio::test]
async fn all_backends_failing_is_fail_soft() {
    init_tracing();
    let server = spawn_mock(200, "   ").await;
    let config = config(FieldSchema::invoice(), &server.base_url);
    let ex = Extractor::new(config).unwrap();

    let result = extract_via(&ex).await;

    assert!(!result.success());
    assert_eq!(result.method(), Method::None);
    assert_eq!(result.confidence(), 0.0);
    assert_eq!(result.missing_fields().len(), FieldSchema::invoice().fields.len());
    assert!(result.fields().values().all(|f| f.value == FieldData::Empty));

    let raw = result.raw_text();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2, "{raw}");
    assert!(lines[0].starts_with("[vision] not accepted:"), "{raw}");
    assert_eq!(lines[1], "[ocr] not accepted: unavailable");
}

async fn extract_via(ex: &Extractor) -> edgequake_docfields::ExtractionResult {
    let source = SourceDocument::from_bytes(page_png(), None).unwrap();
    ex.extract(source).await.unwrap()
}

// ── Scenario 4: gap-filling from the raw reply ───────────────────────────────

#[tokio::test]
async fn empty_json_field_is_gap_filled_from_reply_text() {
    init_tracing();
    let reply = r#"Here is the title block:
```json
{"drawing_number": "GB-2024-0153", "part_name": "传动轴", "outer_diameter": "", "material": "45#"}
```
The main shaft section is marked Φ45.5 h7."#;
    let server = spawn_mock(200, reply).await;
    let ex = Extractor::new(config(FieldSchema::drawing(), &server.base_url)).unwrap();

    let result = extract_via(&ex).await;

    assert!(result.success());
    assert_eq!(result.method(), Method::Vision);
    let od = result.field("outer_diameter").unwrap();
    assert_eq!(od.value.as_text().as_deref(), Some("45.5"));
    assert_eq!(od.source, Some(Provenance::RegexRecovered));
    assert_eq!(
        result.field("part_name").unwrap().source,
        Some(Provenance::Vision)
    );
    assert_eq!(result.confidence(), 0.9);

    // drawings send layout hints with the prompt
    let prompt = server.last_body()["prompt"].as_str().unwrap().to_string();
    assert!(prompt.contains("\"drawing_number\""));
    assert!(prompt.contains("Layout hints"), "{prompt}");
}

#[tokio::test]
async fn unparseable_reply_recovers_by_pattern() {
    init_tracing();
    let reply = "图号：ZJ-0087  材料：Q235  外径 Φ120";
    let server = spawn_mock(200, reply).await;
    let ex = Extractor::new(config(FieldSchema::drawing(), &server.base_url)).unwrap();

    let result = extract_via(&ex).await;

    assert_eq!(result.method(), Method::Vision);
    assert!(result.success());
    assert_eq!(result.confidence(), 0.5);
    assert_eq!(text_of(&result, "drawing_number").as_deref(), Some("ZJ-0087"));
    assert_eq!(text_of(&result, "outer_diameter").as_deref(), Some("120"));
    assert!(result
        .fields()
        .values()
        .filter(|f| !f.is_empty())
        .all(|f| f.source == Some(Provenance::RegexRecovered)));
}

// ── OCR engine detection ─────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn ocr_engine_is_detected_once_across_requests() {
    init_tracing();
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("version-calls.log");
    let script = dir.path().join("tesseract");
    // `--version` is logged; recognition prints no TSV, so OCR is not accepted.
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\n[ \"$1\" = \"--version\" ] && echo version >> '{}'\nexit 0\n",
            log.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = ExtractionConfig::builder()
        .vision_enabled(false)
        .ocr_engine(OcrEnginePreference::TesseractCli)
        .tesseract_cmd(script.to_string_lossy())
        .build()
        .unwrap();
    for _ in 0..3 {
        let result = extract_bytes(page_png(), None, &config).await.unwrap();
        assert_eq!(result.method(), Method::None);
    }

    let calls = std::fs::read_to_string(&log).unwrap();
    assert_eq!(calls.lines().count(), 1, "{calls}");
}

// ── Input errors ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn declared_pdf_without_header_is_rejected() {
    init_tracing();
    let config = config(FieldSchema::invoice(), &refused_url());
    let err = extract_bytes(page_png(), Some(MediaType::Pdf), &config)
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::UnsupportedFormat { .. }), "{err}");
}

#[tokio::test]
async fn fatal_backend_aborts_the_job() {
    init_tracing();
    struct Broken;
    impl RecognitionBackend for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn kind(&self) -> BackendKind {
            BackendKind::Ocr
        }
        fn profile(&self) -> EnhancementProfile {
            EnhancementProfile::Ocr
        }
        fn is_available(&self) -> bool {
            true
        }
        fn attempt<'a>(
            &'a self,
            _image: &'a EnhancedImage,
            _hints: &'a LayoutHint,
        ) -> BoxFuture<'a, RecognitionAttempt> {
            Box::pin(async move { RecognitionAttempt::fatal(self, "engine crashed") })
        }
    }

    let config = config(FieldSchema::invoice(), &refused_url());
    let ex = Extractor::with_backends(config, vec![Arc::new(Broken)]).unwrap();
    let source = SourceDocument::from_bytes(page_png(), None).unwrap();
    let err = ex.extract(source).await.unwrap_err();
    assert!(matches!(err, ExtractError::Internal(_)), "{err}");
}

// ── PDF scenarios (need a rasteriser) ────────────────────────────────────────

#[tokio::test]
async fn pdf_first_page_goes_through_the_chain() {
    init_tracing();
    let path = e2e_skip_unless_ready!(test_cases_dir().join("drawing.pdf"));
    let server = spawn_mock(200, r#"{"drawing_number": "GB-2024-0153"}"#).await;
    let config = config(FieldSchema::drawing(), &server.base_url);

    let result = edgequake_docfields::extract(&path, None, &config).await.unwrap();
    println!("{}", serde_json::to_string_pretty(&result.to_output_json()).unwrap());

    assert_eq!(result.method(), Method::Vision);
    assert_eq!(text_of(&result, "drawing_number").as_deref(), Some("GB-2024-0153"));
}

#[tokio::test]
async fn pdf_page_out_of_range_is_an_error() {
    init_tracing();
    let path = e2e_skip_unless_ready!(test_cases_dir().join("drawing.pdf"));
    let config = ExtractionConfig::builder()
        .schema(FieldSchema::drawing())
        .inference_base_url(refused_url())
        .pdf_page(999)
        .build()
        .unwrap();

    let err = edgequake_docfields::extract(&path, None, &config)
        .await
        .unwrap_err();
    assert!(
        matches!(err, ExtractError::PageOutOfRange { page: 999, .. }),
        "{err}"
    );
}
