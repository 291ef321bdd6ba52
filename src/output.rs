//! Output types for a field-extraction job.

use crate::pipeline::enhance::EnhancementProfile;
use crate::pipeline::recognize::BackendKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A cleaned field value. Serialises as a JSON string, number or `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldData {
    Text(String),
    Number(f64),
    #[default]
    Empty,
}

impl FieldData {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldData::Empty => true,
            FieldData::Text(s) => s.is_empty(),
            FieldData::Number(_) => false,
        }
    }

    /// The value as text, if any (`Number` is rendered without trailing `.0`).
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldData::Text(s) if !s.is_empty() => Some(s.clone()),
            FieldData::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Which route produced a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Key found in the vision model's JSON reply.
    Vision,
    /// Recovered from classical OCR text.
    Ocr,
    /// Recovered by pattern matching over the raw vision reply.
    RegexRecovered,
}

/// One field of the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: FieldData,
    pub source: Option<Provenance>,
}

impl FieldValue {
    pub fn new(value: FieldData, source: Provenance) -> Self {
        Self {
            value,
            source: Some(source),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// The backend family that produced the accepted output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Vision,
    Ocr,
    /// No backend was accepted.
    None,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Method::Vision => "vision",
            Method::Ocr => "ocr",
            Method::None => "none",
        })
    }
}

impl From<BackendKind> for Method {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Vision => Method::Vision,
            BackendKind::Ocr => Method::Ocr,
        }
    }
}

/// Diagnostic record of one recognition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub backend: String,
    pub kind: BackendKind,
    pub profile: EnhancementProfile,
    pub accepted: bool,
    /// Why the attempt was not accepted; `None` when accepted.
    pub reason: Option<String>,
    /// Whether the enhancement transform actually ran.
    pub enhanced: bool,
    pub duration_ms: u64,
}

impl AttemptSummary {
    /// One-line rendering used for diagnostic `raw_text`.
    pub fn diagnostic_line(&self) -> String {
        match &self.reason {
            Some(reason) => format!("[{}] not accepted: {reason}", self.backend),
            None => format!("[{}] accepted", self.backend),
        }
    }
}

/// Complete outcome of one extraction job.
///
/// Built once by the aggregator; read through accessors.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub(crate) success: bool,
    pub(crate) method: Method,
    pub(crate) fields: BTreeMap<String, FieldValue>,
    pub(crate) confidence: f64,
    pub(crate) raw_text: String,
    pub(crate) document_type: String,
    pub(crate) missing_fields: Vec<String>,
    pub(crate) attempts: Vec<AttemptSummary>,
    pub(crate) duration_ms: u64,
}

impl ExtractionResult {
    /// `true` iff every required field was found.
    pub fn success(&self) -> bool {
        self.success
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Every declared field, keyed by name.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    /// Declared fields left empty.
    pub fn missing_fields(&self) -> &[String] {
        &self.missing_fields
    }

    pub fn attempts(&self) -> &[AttemptSummary] {
        &self.attempts
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Compact output: `{success, method, fields, confidence, raw_text}`
    /// with each field rendered as a string, number or `null`.
    pub fn to_output_json(&self) -> serde_json::Value {
        let fields: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(name, fv)| {
                let v = match &fv.value {
                    FieldData::Text(s) if !s.is_empty() => serde_json::Value::String(s.clone()),
                    FieldData::Number(n) => serde_json::json!(n),
                    _ => serde_json::Value::Null,
                };
                (name.clone(), v)
            })
            .collect();
        serde_json::json!({
            "success": self.success,
            "method": self.method,
            "fields": fields,
            "confidence": self.confidence,
            "raw_text": self.raw_text,
        })
    }
}
