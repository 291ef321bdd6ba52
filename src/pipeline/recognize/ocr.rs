//! Classical OCR backend.
//!
//! The engine is chosen by [`OcrEngine::detect`], once per process for each
//! (preference, command, language) triple; later extractors reuse the
//! cached answer through [`OcrEngine::detect_cached`]:
//!
//! | Preference     | Result |
//! |----------------|--------|
//! | `Auto`         | libtesseract (feature `leptess`) if it initialises, else the `tesseract` CLI if it runs |
//! | `Leptess`      | libtesseract or nothing |
//! | `TesseractCli` | the CLI or nothing |
//! | `Disabled`     | nothing |
//!
//! With no engine the backend reports itself unavailable.

use super::{BackendKind, OcrLine, RawOutput, RecognitionAttempt, RecognitionBackend};
use crate::config::{ExtractionConfig, OcrEnginePreference};
use crate::error::BackendError;
use crate::pipeline::encode::encode_png;
use crate::pipeline::enhance::{EnhancedImage, EnhancementProfile};
use crate::pipeline::layout::LayoutHint;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

type DetectionKey = (OcrEnginePreference, String, String);

static DETECTED: Lazy<Mutex<HashMap<DetectionKey, Option<OcrEngine>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A concrete, detected OCR engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcrEngine {
    /// libtesseract linked through `leptess`.
    #[cfg(feature = "leptess")]
    Leptess,
    /// The `tesseract` executable, TSV output on stdout.
    TesseractCli { cmd: String },
}

impl OcrEngine {
    /// Resolve a preference into an installed engine.
    pub fn detect(pref: OcrEnginePreference, tesseract_cmd: &str, language: &str) -> Option<Self> {
        let engine = match pref {
            OcrEnginePreference::Disabled => None,
            OcrEnginePreference::Leptess => Self::probe_leptess(language),
            OcrEnginePreference::TesseractCli => Self::probe_cli(tesseract_cmd),
            OcrEnginePreference::Auto => {
                Self::probe_leptess(language).or_else(|| Self::probe_cli(tesseract_cmd))
            }
        };
        match &engine {
            Some(e) => info!("OCR engine: {}", e.name()),
            None if pref != OcrEnginePreference::Disabled => {
                warn!("No OCR engine available for preference {:?}", pref)
            }
            None => debug!("OCR disabled"),
        }
        engine
    }

    /// [`OcrEngine::detect`] memoised for the life of the process.
    ///
    /// Blocking on the first call for a given key (it may spawn the CLI).
    pub fn detect_cached(
        pref: OcrEnginePreference,
        tesseract_cmd: &str,
        language: &str,
    ) -> Option<Self> {
        let key = (pref, tesseract_cmd.to_string(), language.to_string());
        // Held across detection so concurrent first calls detect only once.
        let mut cache = DETECTED.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(engine) = cache.get(&key) {
            debug!("OCR engine for {:?} already detected", pref);
            return engine.clone();
        }
        let engine = Self::detect(pref, tesseract_cmd, language);
        cache.insert(key, engine.clone());
        engine
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "leptess")]
            OcrEngine::Leptess => "leptess",
            OcrEngine::TesseractCli { .. } => "tesseract-cli",
        }
    }

    #[cfg(feature = "leptess")]
    fn probe_leptess(language: &str) -> Option<Self> {
        match leptess::LepTess::new(None, language) {
            Ok(_) => Some(OcrEngine::Leptess),
            Err(e) => {
                warn!("libtesseract cannot initialise '{}': {}", language, e);
                None
            }
        }
    }

    #[cfg(not(feature = "leptess"))]
    fn probe_leptess(_language: &str) -> Option<Self> {
        debug!("Built without `leptess`");
        None
    }

    fn probe_cli(cmd: &str) -> Option<Self> {
        let ok = Command::new(cmd)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        ok.then(|| OcrEngine::TesseractCli {
            cmd: cmd.to_string(),
        })
    }

    /// Recognise PNG bytes into lines. Blocking.
    pub fn recognize(&self, png: &[u8], language: &str) -> Result<Vec<OcrLine>, BackendError> {
        match self {
            #[cfg(feature = "leptess")]
            OcrEngine::Leptess => recognize_leptess(png, language),
            OcrEngine::TesseractCli { cmd } => recognize_cli(cmd, png, language),
        }
    }
}

#[cfg(feature = "leptess")]
fn recognize_leptess(png: &[u8], language: &str) -> Result<Vec<OcrLine>, BackendError> {
    use leptess::LepTess;

    let engine_err = |detail: String| BackendError::Engine {
        engine: "leptess".into(),
        detail,
    };

    let mut lt = LepTess::new(None, language).map_err(|e| engine_err(e.to_string()))?;
    lt.set_image_from_mem(png)
        .map_err(|e| engine_err(format!("set image: {e}")))?;

    let boxes = match lt.get_component_boxes(leptess::capi::TessPageIteratorLevel_RIL_TEXTLINE, true)
    {
        Some(boxes) => boxes,
        None => return Ok(Vec::new()),
    };

    let mut lines = Vec::new();
    for bbox in &boxes {
        let geom = bbox.get_geometry();
        lt.set_rectangle(geom.x, geom.y, geom.w, geom.h);
        let text = lt.get_utf8_text().unwrap_or_default().trim().to_string();
        if text.is_empty() {
            continue;
        }
        let confidence = (lt.mean_text_conf() as f32 / 100.0).clamp(0.0, 1.0);
        lines.push(OcrLine { text, confidence });
    }
    Ok(lines)
}

fn recognize_cli(cmd: &str, png: &[u8], language: &str) -> Result<Vec<OcrLine>, BackendError> {
    let engine_err = |detail: String| BackendError::Engine {
        engine: "tesseract-cli".into(),
        detail,
    };

    let mut tmp = tempfile::Builder::new()
        .prefix("docfields-ocr-")
        .suffix(".png")
        .tempfile()
        .map_err(|e| engine_err(format!("temp file: {e}")))?;
    tmp.write_all(png)
        .and_then(|_| tmp.flush())
        .map_err(|e| engine_err(format!("temp file: {e}")))?;

    let output = Command::new(cmd)
        .arg(tmp.path())
        .arg("stdout")
        .arg("-l")
        .arg(language)
        .arg("tsv")
        .output()
        .map_err(|e| engine_err(format!("spawn '{cmd}': {e}")))?;

    if !output.status.success() {
        return Err(engine_err(format!(
            "exit {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
}

/// Group tesseract TSV words into lines keyed by (block, paragraph, line).
///
/// Columns: level page block par line word left top width height conf text.
/// Only word rows (level 5) with non-negative confidence are used.
fn parse_tsv(tsv: &str) -> Vec<OcrLine> {
    let mut lines: BTreeMap<(u32, u32, u32), (Vec<String>, Vec<f32>)> = BTreeMap::new();
    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.splitn(12, '\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let key = match (cols[2].parse(), cols[3].parse(), cols[4].parse()) {
            (Ok(b), Ok(p), Ok(l)) => (b, p, l),
            _ => continue,
        };
        let conf: f32 = cols[10].trim().parse().unwrap_or(-1.0);
        let text = cols[11].trim();
        if conf < 0.0 || text.is_empty() {
            continue;
        }
        let entry = lines.entry(key).or_default();
        entry.0.push(text.to_string());
        entry.1.push(conf);
    }
    lines
        .into_values()
        .map(|(words, confs)| OcrLine {
            text: words.join(" "),
            confidence: (confs.iter().sum::<f32>() / confs.len() as f32 / 100.0).clamp(0.0, 1.0),
        })
        .collect()
}

/// OCR backend bound to the engine detected at construction.
pub struct OcrBackend {
    engine: Option<OcrEngine>,
    language: String,
    min_line_chars: usize,
}

impl OcrBackend {
    /// Uses the process-wide engine for `config.ocr_engine`, detecting it on
    /// first use.
    pub fn new(config: &ExtractionConfig) -> Self {
        let engine =
            OcrEngine::detect_cached(config.ocr_engine, &config.tesseract_cmd, &config.ocr_language);
        Self::with_engine(engine, config)
    }

    pub fn with_engine(engine: Option<OcrEngine>, config: &ExtractionConfig) -> Self {
        Self {
            engine,
            language: config.ocr_language.clone(),
            min_line_chars: config.min_ocr_line_chars,
        }
    }

    pub fn engine(&self) -> Option<&OcrEngine> {
        self.engine.as_ref()
    }
}

/// Accept iff some line has at least `min_chars` non-whitespace characters.
pub(crate) fn lines_acceptable(lines: &[OcrLine], min_chars: usize) -> bool {
    lines
        .iter()
        .any(|l| l.text.chars().filter(|c| !c.is_whitespace()).count() >= min_chars)
}

/// Mean line confidence, 0 for no lines.
pub(crate) fn mean_confidence(lines: &[OcrLine]) -> f64 {
    if lines.is_empty() {
        return 0.0;
    }
    lines.iter().map(|l| l.confidence as f64).sum::<f64>() / lines.len() as f64
}

impl RecognitionBackend for OcrBackend {
    fn name(&self) -> &str {
        "ocr"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ocr
    }

    fn profile(&self) -> EnhancementProfile {
        EnhancementProfile::Ocr
    }

    fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    fn attempt<'a>(
        &'a self,
        image: &'a EnhancedImage,
        _hints: &'a LayoutHint,
    ) -> BoxFuture<'a, RecognitionAttempt> {
        Box::pin(async move {
            let Some(engine) = self.engine.clone() else {
                return RecognitionAttempt::not_accepted(self, RawOutput::Empty, "unavailable");
            };
            let png = match encode_png(&image.image) {
                Ok(png) => png,
                Err(e) => {
                    return RecognitionAttempt::not_accepted(
                        self,
                        RawOutput::Empty,
                        format!("PNG encode failed: {e}"),
                    )
                }
            };
            let language = self.language.clone();

            let result =
                tokio::task::spawn_blocking(move || engine.recognize(&png, &language)).await;
            let lines = match result {
                Ok(Ok(lines)) => lines,
                Ok(Err(e)) => {
                    return RecognitionAttempt::not_accepted(self, RawOutput::Empty, e.to_string())
                }
                Err(e) => {
                    return RecognitionAttempt::fatal(self, format!("OCR task panicked: {e}"))
                }
            };

            debug!("OCR produced {} line(s)", lines.len());
            if lines_acceptable(&lines, self.min_line_chars) {
                let confidence = mean_confidence(&lines);
                RecognitionAttempt::accepted(self, RawOutput::Lines(lines), Some(confidence))
            } else {
                let reason = format!(
                    "no line with ≥ {} non-whitespace characters",
                    self.min_line_chars
                );
                RecognitionAttempt::not_accepted(self, RawOutput::Lines(lines), reason)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t
4\t1\t1\t1\t1\t0\t10\t10\t200\t20\t-1\t
5\t1\t1\t1\t1\t1\t10\t10\t40\t20\t90\t图号
5\t1\t1\t1\t1\t2\t60\t10\t80\t20\t80\tGB-2024-0153
5\t1\t1\t1\t2\t1\t10\t40\t40\t20\t70\t材料
5\t1\t1\t1\t2\t2\t60\t40\t40\t20\t-1\t
5\t1\t1\t1\t2\t3\t60\t40\t40\t20\t50\t45#
";

    #[test]
    fn tsv_words_group_into_lines() {
        let lines = parse_tsv(TSV);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "图号 GB-2024-0153");
        assert!((lines[0].confidence - 0.85).abs() < 1e-4);
        assert_eq!(lines[1].text, "材料 45#");
        assert!((lines[1].confidence - 0.60).abs() < 1e-4);
    }

    #[test]
    fn tsv_header_only_is_empty() {
        assert!(parse_tsv("level\tpage_num\n").is_empty());
        assert!(parse_tsv("").is_empty());
    }

    #[test]
    fn acceptance_needs_long_enough_line() {
        let line = |t: &str| OcrLine {
            text: t.into(),
            confidence: 0.5,
        };
        assert!(!lines_acceptable(&[line("a"), line(" b ")], 2));
        assert!(lines_acceptable(&[line("a"), line("ab")], 2));
        assert!(!lines_acceptable(&[], 1));
    }

    #[test]
    fn mean_confidence_of_lines() {
        let lines = vec![
            OcrLine {
                text: "x".into(),
                confidence: 0.4,
            },
            OcrLine {
                text: "y".into(),
                confidence: 0.8,
            },
        ];
        assert!((mean_confidence(&lines) - 0.6).abs() < 1e-6);
        assert_eq!(mean_confidence(&[]), 0.0);
    }

    #[test]
    fn disabled_preference_detects_nothing() {
        assert!(OcrEngine::detect(OcrEnginePreference::Disabled, "tesseract", "eng").is_none());
        let config = ExtractionConfig::builder()
            .ocr_engine(OcrEnginePreference::Disabled)
            .build()
            .unwrap();
        assert!(!OcrBackend::new(&config).is_available());
    }

    #[cfg(unix)]
    #[test]
    fn engine_detection_runs_once_per_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let script = dir.path().join("fake-tesseract");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n[ \"$1\" = \"--version\" ] && echo version >> '{}'\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let cmd = script.to_string_lossy().to_string();

        let config = ExtractionConfig::builder()
            .ocr_engine(OcrEnginePreference::TesseractCli)
            .tesseract_cmd(cmd.as_str())
            .build()
            .unwrap();
        for _ in 0..3 {
            assert!(OcrBackend::new(&config).is_available());
        }
        assert_eq!(
            OcrEngine::detect_cached(OcrEnginePreference::TesseractCli, &cmd, &config.ocr_language),
            Some(OcrEngine::TesseractCli { cmd: cmd.clone() })
        );
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }

    #[test]
    fn missing_cli_detects_nothing() {
        assert!(OcrEngine::detect(
            OcrEnginePreference::TesseractCli,
            "definitely-not-tesseract-xyz",
            "eng"
        )
        .is_none());
    }
}
