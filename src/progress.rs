//! Progress-callback trait for extraction-job events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to observe
//! each recognition attempt as the chain runs.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docfields::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     attempts: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_attempt_start(&self, backend: &str) {
//!         let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("attempt {n}: {backend}");
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { attempts: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::ExtractionResult;
use std::sync::Arc;
use std::time::Duration;

/// Called by the extractor as a job progresses.
///
/// Implementations must be `Send + Sync`: one [`crate::Extractor`] may run
/// several jobs at once. All methods default to no-ops.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once the document has been normalised into a page.
    ///
    /// # Arguments
    /// * `width`, `height`: canonical page size in pixels
    fn on_job_start(&self, width: u32, height: u32) {
        let _ = (width, height);
    }

    /// Called before a backend is invoked. Unavailable backends are skipped
    /// without this event.
    fn on_attempt_start(&self, backend: &str) {
        let _ = backend;
    }

    /// Called after a backend returns.
    fn on_attempt_complete(&self, backend: &str, accepted: bool, elapsed: Duration) {
        let _ = (backend, accepted, elapsed);
    }

    /// Called once with the final result.
    fn on_job_complete(&self, result: &ExtractionResult) {
        let _ = result;
    }
}

/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        accepted: AtomicUsize,
        backends: Mutex<Vec<String>>,
    }

    impl ExtractionProgressCallback for TrackingCallback {
        fn on_attempt_start(&self, backend: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.backends.lock().unwrap().push(backend.to_string());
        }

        fn on_attempt_complete(&self, _backend: &str, accepted: bool, _elapsed: Duration) {
            if accepted {
                self.accepted.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_job_start(800, 600);
        cb.on_attempt_start("vision");
        cb.on_attempt_complete("vision", false, Duration::from_millis(5));
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_attempt_start("vision");
        tracker.on_attempt_complete("vision", false, Duration::ZERO);
        tracker.on_attempt_start("ocr");
        tracker.on_attempt_complete("ocr", true, Duration::ZERO);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(*tracker.backends.lock().unwrap(), vec!["vision", "ocr"]);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_attempt_start("ocr");
    }
}
