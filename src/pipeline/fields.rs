//! Field extraction from raw backend output.
//!
//! Vision replies are parsed as JSON in layers, each tried only if the one
//! before it failed:
//!
//! 1. strip Markdown fences and parse directly;
//! 2. split on ```` ``` ```` and try every segment plus the whole text, each
//!    as-is, as its first balanced `{…}`, then after lenient repair;
//! 3. give up on JSON and recover every field from the raw text.
//!
//! After a successful parse, fields still empty are gap-filled from the raw
//! text. OCR output skips straight to recovery. Both recovery paths run
//! [`fill_from_text`] over the same compiled `(field, [patterns])` table.

use super::recognize::OcrLine;
use crate::error::ParseError;
use crate::output::{FieldValue, Provenance};
use crate::schema::{CompiledField, CompiledSchema};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Field values recovered from one backend output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFields {
    /// Only non-empty values; the aggregator fills in the rest.
    pub values: BTreeMap<String, FieldValue>,
    /// A JSON object was found in the reply.
    pub structured: bool,
}

impl ParsedFields {
    pub fn count_from(&self, provenance: Provenance) -> usize {
        self.values
            .values()
            .filter(|v| v.source == Some(provenance))
            .count()
    }

    fn is_filled(&self, name: &str) -> bool {
        self.values.get(name).is_some_and(|v| !v.is_empty())
    }
}

/// Parse a vision model reply.
pub fn parse_model_response(schema: &CompiledSchema, raw: &str) -> ParsedFields {
    let mut parsed = ParsedFields::default();

    match parse_json_object(raw) {
        Ok(obj) => {
            parsed.structured = true;
            let obj = unwrap_single_wrapper(schema, obj);
            for field in schema.fields() {
                let Some(value) = lookup(&obj, field) else {
                    continue;
                };
                match field.clean_json(value) {
                    Ok(Some(v)) => {
                        parsed
                            .values
                            .insert(field.name().to_string(), FieldValue::new(v, Provenance::Vision));
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping vision value: {}", e),
                }
            }
            debug!(
                "Vision JSON yielded {} of {} field(s)",
                parsed.values.len(),
                schema.fields().len()
            );
        }
        Err(e) => warn!("Vision reply is not JSON ({}), recovering by pattern", e),
    }

    let before = parsed.values.len();
    fill_from_text(schema, raw, &mut parsed, Provenance::RegexRecovered);
    if parsed.values.len() > before {
        debug!(
            "Recovered {} field(s) from raw reply text",
            parsed.values.len() - before
        );
    }
    parsed
}

/// Parse OCR lines (joined with `\n`).
pub fn parse_ocr_lines(schema: &CompiledSchema, lines: &[OcrLine]) -> ParsedFields {
    let text = lines
        .iter()
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let mut parsed = ParsedFields::default();
    fill_from_text(schema, &text, &mut parsed, Provenance::Ocr);
    parsed
}

/// Fill every still-empty field from `text` using the field's recovery
/// patterns, first valid match wins.
pub fn fill_from_text(
    schema: &CompiledSchema,
    text: &str,
    parsed: &mut ParsedFields,
    provenance: Provenance,
) {
    for field in schema.fields() {
        if parsed.is_filled(field.name()) {
            continue;
        }
        if let Some(v) = recover_field(field, text) {
            parsed
                .values
                .insert(field.name().to_string(), FieldValue::new(v, provenance));
        }
    }
}

fn recover_field(field: &CompiledField, text: &str) -> Option<crate::output::FieldData> {
    for pattern in field.patterns() {
        for caps in pattern.captures_iter(text) {
            let Some(m) = caps.iter().skip(1).flatten().find(|m| !m.as_str().trim().is_empty())
            else {
                continue;
            };
            match field.clean_recovered(m.as_str()) {
                Ok(Some(v)) => return Some(v),
                Ok(None) => {}
                Err(e) => debug!("Rejected candidate: {}", e),
            }
        }
    }
    None
}

// ── JSON location and repair ─────────────────────────────────────────────

/// Find a JSON object in a free-form reply.
pub fn parse_json_object(raw: &str) -> Result<Map<String, Value>, ParseError> {
    if let Some(obj) = as_object(strip_fences(raw)) {
        return Ok(obj);
    }

    let mut candidates: Vec<&str> = raw.split("```").map(drop_language_tag).collect();
    candidates.push(raw);
    let candidates: Vec<&str> = candidates
        .into_iter()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();

    for candidate in &candidates {
        let balanced = first_balanced_object(candidate);
        let attempts = [Some(*candidate), balanced];
        for text in attempts.iter().flatten() {
            if let Some(obj) = as_object(text) {
                return Ok(obj);
            }
        }
        for text in attempts.iter().flatten() {
            if let Some(obj) = as_object(&repair(text)) {
                debug!("Vision JSON parsed after repair");
                return Ok(obj);
            }
        }
    }

    Err(ParseError::NoJsonObject {
        candidates: candidates.len(),
    })
}

fn as_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

fn strip_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if s.starts_with("```") {
        s = match s.find('\n') {
            Some(i) => &s[i + 1..],
            None => s.trim_start_matches('`'),
        };
    }
    if let Some(stripped) = s.trim_end().strip_suffix("```") {
        s = stripped;
    }
    s.trim()
}

/// Drop a leading ` json` style language tag from a fence segment.
fn drop_language_tag(segment: &str) -> &str {
    let trimmed = segment.trim_start_matches([' ', '\t']);
    match trimmed.find('\n') {
        Some(i) if trimmed[..i].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            &trimmed[i + 1..]
        }
        _ => segment,
    }
}

/// First `{…}` with balanced braces, ignoring braces inside strings.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());
static RE_PY_NONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bNone\b").unwrap());
static RE_PY_TRUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTrue\b").unwrap());
static RE_PY_FALSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bFalse\b").unwrap());

/// Lenient fixes for near-JSON model output.
fn repair(text: &str) -> String {
    let mut s = text.replace(['“', '”', '„', '＂'], "\"").replace(['‘', '’'], "'");
    if !s.contains('"') && s.contains('\'') {
        s = s.replace('\'', "\"");
    }
    let s = RE_TRAILING_COMMA.replace_all(&s, "$1");
    let s = RE_PY_NONE.replace_all(&s, "null");
    let s = RE_PY_TRUE.replace_all(&s, "true");
    RE_PY_FALSE.replace_all(&s, "false").into_owned()
}

// ── Key lookup ───────────────────────────────────────────────────────────

fn key_matches(key: &str, candidate: &str) -> bool {
    key.trim().to_lowercase() == candidate.to_lowercase()
}

fn is_declared_key(schema: &CompiledSchema, key: &str) -> bool {
    schema.fields().iter().any(|f| {
        std::iter::once(&f.spec.name)
            .chain(f.spec.aliases.iter())
            .any(|c| key_matches(key, c))
    })
}

/// Descend into `{"data": {...}}` style single-key wrappers.
fn unwrap_single_wrapper(schema: &CompiledSchema, obj: Map<String, Value>) -> Map<String, Value> {
    let descend = obj.len() == 1
        && obj
            .iter()
            .next()
            .is_some_and(|(k, v)| v.is_object() && !is_declared_key(schema, k));
    if !descend {
        return obj;
    }
    match obj.into_iter().next() {
        Some((_, Value::Object(inner))) => inner,
        _ => Map::new(),
    }
}

/// Value by field name, then by alias, case-insensitively.
fn lookup<'a>(obj: &'a Map<String, Value>, field: &CompiledField) -> Option<&'a Value> {
    if let Some(v) = obj.get(&field.spec.name) {
        return Some(v);
    }
    std::iter::once(&field.spec.name)
        .chain(field.spec.aliases.iter())
        .find_map(|candidate| {
            obj.iter()
                .find(|(k, _)| key_matches(k, candidate))
                .map(|(_, v)| v)
        })
}
