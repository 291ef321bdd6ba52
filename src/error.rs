//! Error types for the edgequake-docfields library.
//!
//! Four error types map onto four failure modes, and only the first one ever
//! reaches the caller:
//!
//! * [`ExtractError`] (fatal): the job cannot produce a page at all
//!   (missing file, undecodable image, no PDF rasteriser, bad config).
//!   Returned as `Err(ExtractError)` from the `extract*` entry points.
//!
//! * [`BackendError`]: a recognition backend could not run or answered
//!   with nothing usable (connection refused, HTTP 500, timeout, engine
//!   missing). Converted into a "not accepted" attempt; the chain moves on.
//!
//! * [`ParseError`]: the vision model's reply did not contain a parsable
//!   JSON object. Recovered by regex extraction over the raw reply.
//!
//! * [`FieldValidationError`]: one field's value failed its declared
//!   format. That field is left empty; every other field is unaffected.
//!
//! A well-formed input therefore always yields an
//! [`crate::output::ExtractionResult`]; `success == false` is the signal for
//! "the identifying field was not found".

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docfields library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The document could not be turned into a raster page: undecodable
    /// image bytes, a corrupt PDF, or no PDF rendering backend available.
    #[error("Unsupported or undecodable document: {detail}")]
    UnsupportedFormat { detail: String },

    /// The configured PDF page does not exist in the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or schema validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (task panic, fatal backend outcome).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtractError {
    pub(crate) fn unsupported(detail: impl Into<String>) -> Self {
        ExtractError::UnsupportedFormat {
            detail: detail.into(),
        }
    }
}

/// A non-fatal failure of one recognition backend.
///
/// Never returned to the caller: the chain records it as the reason of a
/// not-accepted attempt and falls through to the next backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The inference endpoint answered with a non-200 status.
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// The request exceeded the configured timeout.
    #[error("request to {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    /// The endpoint could not be reached (refused, DNS, TLS).
    #[error("cannot reach {url}: {detail}")]
    Connection { url: String, detail: String },

    /// HTTP 200 but the `response` field was missing or blank.
    #[error("empty response from model '{model}'")]
    EmptyResponse { model: String },

    /// HTTP 200 but the body was not the expected JSON envelope.
    #[error("malformed response body: {0}")]
    MalformedResponse(String),

    /// The OCR engine ran but failed.
    #[error("OCR engine '{engine}' failed: {detail}")]
    Engine { engine: String, detail: String },
}

/// The model reply could not be read as a JSON object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON object found in {candidates} candidate segment(s)")]
    NoJsonObject { candidates: usize },
}

/// A single field failed validation and is dropped to empty.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FieldValidationError {
    #[error("field '{field}': {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("field '{field}': {value:?} is not a number")]
    NotANumber { field: String, value: String },

    #[error("field '{field}': {value:?} is not a recognisable date")]
    InvalidDate { field: String, value: String },

    #[error("field '{field}': {value:?} does not match the declared format")]
    PatternMismatch { field: String, value: String },

    #[error("field '{field}': unsupported JSON value shape ({shape})")]
    UnsupportedShape { field: String, shape: &'static str },
}
