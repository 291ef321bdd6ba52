//! Recognition strategy chain.
//!
//! Every way of reading the page (vision model, classical OCR, a caller's
//! own engine) implements [`RecognitionBackend`]. [`RecognitionChain`] runs
//! them in priority order and stops at the first accepted attempt:
//!
//! ```text
//! for backend in chain:
//!     unavailable  → record "unavailable", skip (not called)
//!     enhance page for backend.profile()
//!     attempt      → Accepted     → stop
//!                  → NotAccepted  → record reason, continue
//!                  → Fatal        → abort the job
//! nothing accepted → ChainOutcome { accepted: None, .. }
//! ```
//!
//! Each backend is called at most once per job and nothing is retried.

pub mod ocr;
pub mod vision;

use super::enhance::{enhance, EnhancedImage, EnhancementProfile};
use super::layout::LayoutHint;
use super::normalize::CanonicalPage;
use crate::error::ExtractError;
use crate::output::AttemptSummary;
use crate::progress::ProgressCallback;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub use ocr::{OcrBackend, OcrEngine};
pub use vision::VisionBackend;

/// Backend family; decides how the raw output is parsed into fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Free-form model reply, expected to contain a JSON object.
    Vision,
    /// Recognised text lines with confidences.
    Ocr,
}

/// One recognised text line. `confidence` is in 0–1.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    Text(String),
    Lines(Vec<OcrLine>),
    Empty,
}

impl RawOutput {
    /// Plain-text rendering; OCR lines are joined with `\n`.
    pub fn to_text(&self) -> String {
        match self {
            RawOutput::Text(s) => s.clone(),
            RawOutput::Lines(lines) => lines
                .iter()
                .map(|l| l.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            RawOutput::Empty => String::new(),
        }
    }
}

/// Tri-state result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Accepted,
    /// Fall through to the next backend.
    NotAccepted { reason: String },
    /// Abort the job with [`ExtractError::Internal`].
    Fatal { reason: String },
}

/// Everything one backend produced for one page.
#[derive(Debug, Clone)]
pub struct RecognitionAttempt {
    pub backend: String,
    pub kind: BackendKind,
    pub profile: EnhancementProfile,
    pub output: RawOutput,
    /// Engine-reported confidence (OCR mean line confidence), 0–1.
    pub confidence: Option<f64>,
    pub outcome: AttemptOutcome,
    /// Set by the chain.
    pub duration_ms: u64,
    /// Set by the chain.
    pub enhanced: bool,
}

impl RecognitionAttempt {
    fn from_backend<B: RecognitionBackend + ?Sized>(
        backend: &B,
        output: RawOutput,
        confidence: Option<f64>,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            backend: backend.name().to_string(),
            kind: backend.kind(),
            profile: backend.profile(),
            output,
            confidence,
            outcome,
            duration_ms: 0,
            enhanced: false,
        }
    }

    pub fn accepted<B: RecognitionBackend + ?Sized>(
        backend: &B,
        output: RawOutput,
        confidence: Option<f64>,
    ) -> Self {
        Self::from_backend(backend, output, confidence, AttemptOutcome::Accepted)
    }

    pub fn not_accepted<B: RecognitionBackend + ?Sized>(
        backend: &B,
        output: RawOutput,
        reason: impl Into<String>,
    ) -> Self {
        Self::from_backend(
            backend,
            output,
            None,
            AttemptOutcome::NotAccepted {
                reason: reason.into(),
            },
        )
    }

    pub fn fatal<B: RecognitionBackend + ?Sized>(backend: &B, reason: impl Into<String>) -> Self {
        Self::from_backend(
            backend,
            RawOutput::Empty,
            None,
            AttemptOutcome::Fatal {
                reason: reason.into(),
            },
        )
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome == AttemptOutcome::Accepted
    }

    pub fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            backend: self.backend.clone(),
            kind: self.kind,
            profile: self.profile,
            accepted: self.is_accepted(),
            reason: match &self.outcome {
                AttemptOutcome::Accepted => None,
                AttemptOutcome::NotAccepted { reason } | AttemptOutcome::Fatal { reason } => {
                    Some(reason.clone())
                }
            },
            enhanced: self.enhanced,
            duration_ms: self.duration_ms,
        }
    }
}

/// A way of reading the page.
///
/// `attempt` must not panic or return errors: every failure is expressed as
/// an [`AttemptOutcome`].
pub trait RecognitionBackend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Enhancement recipe the chain prepares before calling `attempt`.
    fn profile(&self) -> EnhancementProfile;

    /// Unavailable backends are skipped without being called.
    fn is_available(&self) -> bool;

    fn attempt<'a>(
        &'a self,
        image: &'a EnhancedImage,
        hints: &'a LayoutHint,
    ) -> BoxFuture<'a, RecognitionAttempt>;
}

/// Result of running the chain over one page.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub accepted: Option<RecognitionAttempt>,
    /// One entry per backend in chain order, up to and including the accepted one.
    pub attempts: Vec<AttemptSummary>,
}

/// Ordered, short-circuiting list of backends.
#[derive(Clone)]
pub struct RecognitionChain {
    backends: Vec<Arc<dyn RecognitionBackend>>,
}

impl std::fmt::Debug for RecognitionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|b| b.name()))
            .finish()
    }
}

impl RecognitionChain {
    pub fn new(backends: Vec<Arc<dyn RecognitionBackend>>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &[Arc<dyn RecognitionBackend>] {
        &self.backends
    }

    /// Run backends in order until one is accepted.
    pub async fn run(
        &self,
        page: Arc<CanonicalPage>,
        hints: &LayoutHint,
        enhancement: bool,
        progress: Option<&ProgressCallback>,
    ) -> Result<ChainOutcome, ExtractError> {
        let mut attempts = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            if !backend.is_available() {
                info!("Backend '{}' unavailable, skipping", backend.name());
                attempts.push(AttemptSummary {
                    backend: backend.name().to_string(),
                    kind: backend.kind(),
                    profile: backend.profile(),
                    accepted: false,
                    reason: Some("unavailable".into()),
                    enhanced: false,
                    duration_ms: 0,
                });
                continue;
            }

            if let Some(cb) = progress {
                cb.on_attempt_start(backend.name());
            }

            let profile = backend.profile();
            let page_ref = Arc::clone(&page);
            let image =
                tokio::task::spawn_blocking(move || enhance(&page_ref, profile, enhancement))
                    .await
                    .map_err(|e| ExtractError::Internal(format!("Enhance task panicked: {e}")))?;

            let start = Instant::now();
            let mut attempt = backend.attempt(&image, hints).await;
            let elapsed = start.elapsed();
            attempt.duration_ms = elapsed.as_millis() as u64;
            attempt.enhanced = image.applied;
            drop(image);

            if let Some(cb) = progress {
                cb.on_attempt_complete(backend.name(), attempt.is_accepted(), elapsed);
            }

            match &attempt.outcome {
                AttemptOutcome::Accepted => {
                    info!(
                        "Backend '{}' accepted in {} ms",
                        backend.name(),
                        attempt.duration_ms
                    );
                    attempts.push(attempt.summary());
                    return Ok(ChainOutcome {
                        accepted: Some(attempt),
                        attempts,
                    });
                }
                AttemptOutcome::NotAccepted { reason } => {
                    warn!("Backend '{}' not accepted: {}", backend.name(), reason);
                    attempts.push(attempt.summary());
                }
                AttemptOutcome::Fatal { reason } => {
                    return Err(ExtractError::Internal(format!(
                        "backend '{}' failed: {reason}",
                        backend.name()
                    )));
                }
            }
        }

        warn!("No backend accepted the page ({} tried)", attempts.len());
        Ok(ChainOutcome {
            accepted: None,
            attempts,
        })
    }
}
