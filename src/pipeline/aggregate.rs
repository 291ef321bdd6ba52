//! Result aggregation: chain outcome + parsed fields → [`ExtractionResult`].

use super::fields::ParsedFields;
use super::recognize::{BackendKind, ChainOutcome};
use crate::output::{ExtractionResult, FieldValue, Method, Provenance};
use crate::schema::CompiledSchema;
use std::collections::BTreeMap;
use std::time::Duration;

/// Confidence of a vision reply whose JSON yielded at least one field.
pub const VISION_CONFIDENCE: f64 = 0.9;
/// Confidence of a vision reply whose fields were all pattern-recovered.
pub const REGEX_CONFIDENCE: f64 = 0.5;
/// Confidence of an accepted vision reply that yielded no field at all.
pub const EMPTY_CONFIDENCE: f64 = 0.0;

/// Build the final result. Every declared field is present in the output.
pub fn aggregate(
    schema: &CompiledSchema,
    outcome: ChainOutcome,
    parsed: ParsedFields,
    duration: Duration,
) -> ExtractionResult {
    let ChainOutcome { accepted, attempts } = outcome;
    let ParsedFields {
        values: mut parsed_values,
        structured,
    } = parsed;

    let mut fields = BTreeMap::new();
    let mut missing_fields = Vec::new();
    for field in schema.fields() {
        let value = parsed_values
            .remove(field.name())
            .filter(|v| !v.is_empty())
            .unwrap_or_default();
        if value.is_empty() {
            missing_fields.push(field.name().to_string());
        }
        fields.insert(field.name().to_string(), value);
    }

    let success = schema
        .fields()
        .iter()
        .filter(|f| f.spec.required)
        .all(|f| fields.get(f.name()).is_some_and(|v: &FieldValue| !v.is_empty()));

    let (method, confidence, raw_text) = match &accepted {
        Some(attempt) => {
            let confidence = match attempt.kind {
                BackendKind::Vision => {
                    let from_json = fields
                        .values()
                        .any(|v| v.source == Some(Provenance::Vision));
                    if structured && from_json {
                        VISION_CONFIDENCE
                    } else if missing_fields.len() < fields.len() {
                        REGEX_CONFIDENCE
                    } else {
                        EMPTY_CONFIDENCE
                    }
                }
                BackendKind::Ocr => attempt.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            };
            // Earlier failures first, then the accepted output.
            let mut dump: Vec<String> = attempts
                .iter()
                .filter(|a| !a.accepted)
                .map(|a| a.diagnostic_line())
                .collect();
            dump.push(attempt.output.to_text());
            (Method::from(attempt.kind), confidence, dump.join("\n"))
        }
        None => {
            let diagnostics = attempts
                .iter()
                .map(|a| a.diagnostic_line())
                .collect::<Vec<_>>()
                .join("\n");
            (Method::None, 0.0, diagnostics)
        }
    };

    ExtractionResult {
        success,
        method,
        fields,
        confidence,
        raw_text,
        document_type: schema.document_type().to_string(),
        missing_fields,
        attempts,
        duration_ms: duration.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{AttemptSummary, FieldData};
    use crate::pipeline::enhance::EnhancementProfile;
    use crate::pipeline::recognize::{AttemptOutcome, OcrLine, RawOutput, RecognitionAttempt};
    use crate::schema::FieldSchema;

    fn attempt(kind: BackendKind, output: RawOutput, confidence: Option<f64>) -> RecognitionAttempt {
        RecognitionAttempt {
            backend: format!("{kind:?}").to_lowercase(),
            kind,
            profile: EnhancementProfile::Vision,
            output,
            confidence,
            outcome: AttemptOutcome::Accepted,
            duration_ms: 5,
            enhanced: true,
        }
    }

    fn with(values: &[(&str, &str, Provenance)], structured: bool) -> ParsedFields {
        ParsedFields {
            values: values
                .iter()
                .map(|(k, v, p)| (k.to_string(), FieldValue::new(FieldData::Text(v.to_string()), *p)))
                .collect(),
            structured,
        }
    }

    #[test]
    fn every_field_present_and_success_on_required() {
        let schema = FieldSchema::drawing().compile().unwrap();
        let a = attempt(BackendKind::Vision, RawOutput::Text("{..}".into()), None);
        let outcome = ChainOutcome {
            attempts: vec![a.summary()],
            accepted: Some(a),
        };
        let parsed = with(&[("drawing_number", "GB-1", Provenance::Vision)], true);
        let r = aggregate(&schema, outcome, parsed, Duration::from_millis(40));

        assert!(r.success());
        assert_eq!(r.method(), Method::Vision);
        assert_eq!(r.confidence(), VISION_CONFIDENCE);
        assert_eq!(r.fields().len(), schema.fields().len());
        assert!(r.field("material").unwrap().source.is_none());
        assert!(r.missing_fields().contains(&"material".to_string()));
        assert_eq!(r.raw_text(), "{..}");
        assert_eq!(r.duration_ms(), 40);
    }

    #[test]
    fn regex_only_vision_gets_lower_confidence() {
        let schema = FieldSchema::drawing().compile().unwrap();
        let a = attempt(BackendKind::Vision, RawOutput::Text("图号 GB-1".into()), None);
        let outcome = ChainOutcome {
            attempts: vec![a.summary()],
            accepted: Some(a),
        };
        let parsed = with(&[("drawing_number", "GB-1", Provenance::RegexRecovered)], false);
        let r = aggregate(&schema, outcome, parsed, Duration::ZERO);
        assert_eq!(r.confidence(), REGEX_CONFIDENCE);
        assert!(r.success());
    }

    #[test]
    fn vision_reply_with_nothing_extracted_has_zero_confidence() {
        let schema = FieldSchema::invoice().compile().unwrap();
        let a = attempt(BackendKind::Vision, RawOutput::Text("{}".into()), None);
        let outcome = ChainOutcome {
            attempts: vec![a.summary()],
            accepted: Some(a),
        };
        let r = aggregate(&schema, outcome, with(&[], true), Duration::ZERO);
        assert_eq!(r.method(), Method::Vision);
        assert_eq!(r.confidence(), EMPTY_CONFIDENCE);
        assert!(!r.success());
    }

    #[test]
    fn raw_text_keeps_earlier_failures() {
        let schema = FieldSchema::drawing().compile().unwrap();
        let failed = AttemptSummary {
            backend: "vision".into(),
            kind: BackendKind::Vision,
            profile: EnhancementProfile::Vision,
            accepted: false,
            reason: Some("cannot reach http://localhost:11434".into()),
            enhanced: true,
            duration_ms: 3,
        };
        let lines = vec![OcrLine {
            text: "图号 GB-1".into(),
            confidence: 0.9,
        }];
        let a = attempt(BackendKind::Ocr, RawOutput::Lines(lines), Some(0.9));
        let outcome = ChainOutcome {
            attempts: vec![failed, a.summary()],
            accepted: Some(a),
        };
        let parsed = with(&[("drawing_number", "GB-1", Provenance::Ocr)], false);
        let r = aggregate(&schema, outcome, parsed, Duration::ZERO);
        assert_eq!(r.method(), Method::Ocr);
        assert_eq!(
            r.raw_text(),
            "[vision] not accepted: cannot reach http://localhost:11434\n图号 GB-1"
        );
    }

    #[test]
    fn ocr_confidence_is_engine_mean() {
        let schema = FieldSchema::invoice().compile().unwrap();
        let lines = vec![OcrLine {
            text: "发票号码 12345678".into(),
            confidence: 0.7,
        }];
        let a = attempt(BackendKind::Ocr, RawOutput::Lines(lines), Some(0.7));
        let outcome = ChainOutcome {
            attempts: vec![a.summary()],
            accepted: Some(a),
        };
        let r = aggregate(&schema, outcome, with(&[], false), Duration::ZERO);
        assert_eq!(r.method(), Method::Ocr);
        assert!((r.confidence() - 0.7).abs() < 1e-9);
        assert!(!r.success());
        assert_eq!(r.raw_text(), "发票号码 12345678");
    }

    #[test]
    fn no_accepted_attempt_carries_diagnostics() {
        let schema = FieldSchema::invoice().compile().unwrap();
        let summary = |backend: &str, reason: &str| AttemptSummary {
            backend: backend.into(),
            kind: BackendKind::Vision,
            profile: EnhancementProfile::Vision,
            accepted: false,
            reason: Some(reason.into()),
            enhanced: false,
            duration_ms: 0,
        };
        let outcome = ChainOutcome {
            accepted: None,
            attempts: vec![summary("vision", "HTTP 500"), summary("ocr", "unavailable")],
        };
        let r = aggregate(&schema, outcome, ParsedFields::default(), Duration::ZERO);
        assert_eq!(r.method(), Method::None);
        assert_eq!(r.confidence(), 0.0);
        assert!(!r.success());
        assert_eq!(
            r.raw_text(),
            "[vision] not accepted: HTTP 500\n[ocr] not accepted: unavailable"
        );
        assert_eq!(r.missing_fields().len(), schema.fields().len());
    }
}
