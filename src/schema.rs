//! Per-document-type field schemas.
//!
//! A [`FieldSchema`] names the fields a document type carries, how each one
//! is validated, and the regex vocabulary used to recover it from raw text.
//! It is plain serde data so deployments can ship their own document types
//! as JSON; [`FieldSchema::invoice`] and [`FieldSchema::drawing`] are the
//! built-in presets.
//!
//! [`CompiledSchema`] is the runtime form. Each field owns exactly one
//! ordered list of recovery patterns: generated JSON-key patterns for the
//! field name and its aliases first, then the declared label patterns. The
//! vision repair path and the OCR text path both read that list, so the two
//! fallback routes cannot drift apart.

use crate::error::{ExtractError, FieldValidationError};
use crate::output::FieldData;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// How a field's raw value is cleaned and checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text; whitespace runs are collapsed.
    #[default]
    Text,
    /// Identifier (invoice number, tax ID, drawing number); all internal
    /// whitespace is removed.
    Code,
    /// Numeric quantity, range-checked (inclusive).
    Number { min: f64, max: f64 },
    /// Calendar date, normalised to `YYYY-MM-DD`.
    Date,
}

/// Declaration of one extractable field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// JSON key the model is asked to emit and the key in the result.
    pub name: String,
    /// Human description used in the extraction prompt.
    pub description: String,
    /// A document without this field is reported as `success = false`.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub kind: FieldKind,
    /// Alternative JSON keys models tend to use (localised labels, camelCase).
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Anchored format check applied after cleaning.
    #[serde(default)]
    pub validate: Option<String>,
    /// Recovery regexes; the first non-empty capture group is the value.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Example value shown in the prompt's JSON template.
    #[serde(default)]
    pub example: Option<String>,
}

impl FieldSpec {
    fn new(name: &str, description: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: false,
            kind,
            aliases: Vec::new(),
            validate: None,
            patterns: Vec::new(),
            example: None,
        }
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|s| s.to_string()).collect();
        self
    }

    fn validate(mut self, re: &str) -> Self {
        self.validate = Some(re.to_string());
        self
    }

    fn patterns(mut self, patterns: &[&str]) -> Self {
        self.patterns = patterns.iter().map(|s| s.to_string()).collect();
        self
    }

    fn example(mut self, example: &str) -> Self {
        self.example = Some(example.to_string());
        self
    }
}

/// The field vocabulary of one document type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Short identifier, e.g. `"invoice"`; echoed in the result.
    pub document_type: String,
    /// What the document is, phrased for the prompt ("a VAT invoice").
    pub description: String,
    pub fields: Vec<FieldSpec>,
    /// Whether layout hints (title block, dimension bands) are worth
    /// computing and passing to the vision model.
    #[serde(default)]
    pub use_layout_hints: bool,
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self::invoice()
    }
}

impl FieldSchema {
    /// Chinese VAT invoice (增值税发票).
    pub fn invoice() -> Self {
        const MONEY: FieldKind = FieldKind::Number {
            min: 0.0,
            max: 1.0e12,
        };
        Self {
            document_type: "invoice".into(),
            description: "a Chinese VAT invoice (增值税发票)".into(),
            use_layout_hints: false,
            fields: vec![
                FieldSpec::new("invoice_number", "invoice number (发票号码)", FieldKind::Code)
                    .required()
                    .aliases(&["发票号码", "invoiceNumber", "invoice_no"])
                    .validate(r"^[0-9A-Za-z\-]{6,24}$")
                    .patterns(&[
                        r"发\s*票\s*号\s*码\s*[:：]?\s*([0-9]{8,20})",
                        r"(?i)invoice\s*(?:no\.?|number|#)\s*[:：]?\s*([A-Z0-9\-]{6,24})",
                        r"No\s*[.:：]\s*([0-9]{8,20})",
                    ])
                    .example("12345678"),
                FieldSpec::new("invoice_code", "invoice code (发票代码)", FieldKind::Code)
                    .aliases(&["发票代码", "invoiceCode"])
                    .validate(r"^\d{10,12}$")
                    .patterns(&[r"发\s*票\s*代\s*码\s*[:：]?\s*(\d{10,12})"])
                    .example("044031900111"),
                FieldSpec::new("invoice_date", "issue date (开票日期)", FieldKind::Date)
                    .aliases(&["开票日期", "date", "invoiceDate"])
                    .patterns(&[
                        r"开\s*票\s*日\s*期\s*[:：]?\s*(\d{4}\s*年\s*\d{1,2}\s*月\s*\d{1,2}\s*日?)",
                        r"开\s*票\s*日\s*期\s*[:：]?\s*(\d{4}[-/.]\d{1,2}[-/.]\d{1,2})",
                        r"(?i)\bdate\s*[:：]\s*(\d{4}[-/.]\d{1,2}[-/.]\d{1,2})",
                    ])
                    .example("2024-03-15"),
                FieldSpec::new("buyer_name", "buyer name (购买方名称)", FieldKind::Text)
                    .aliases(&["购买方名称", "buyer"])
                    .patterns(&[r"购\s*买\s*方[\s\S]{0,12}?名\s*称\s*[:：]\s*([^\s:：]{2,60})"]),
                FieldSpec::new(
                    "buyer_tax_id",
                    "buyer taxpayer ID (购买方纳税人识别号)",
                    FieldKind::Code,
                )
                .aliases(&["购买方纳税人识别号", "buyerTaxId"])
                .validate(r"^[0-9A-Z]{15,20}$")
                .patterns(&[
                    r"购\s*买\s*方[\s\S]{0,80}?(?:纳税人识别号|统一社会信用代码)[^:：\n]{0,20}[:：]?\s*([0-9A-Z]{15,20})",
                ])
                .example("91310000MA1FL0XX0X"),
                FieldSpec::new("seller_name", "seller name (销售方名称)", FieldKind::Text)
                    .aliases(&["销售方名称", "seller"])
                    .patterns(&[r"销\s*售\s*方[\s\S]{0,12}?名\s*称\s*[:：]\s*([^\s:：]{2,60})"]),
                FieldSpec::new(
                    "seller_tax_id",
                    "seller taxpayer ID (销售方纳税人识别号)",
                    FieldKind::Code,
                )
                .aliases(&["销售方纳税人识别号", "sellerTaxId"])
                .validate(r"^[0-9A-Z]{15,20}$")
                .patterns(&[
                    r"销\s*售\s*方[\s\S]{0,80}?(?:纳税人识别号|统一社会信用代码)[^:：\n]{0,20}[:：]?\s*([0-9A-Z]{15,20})",
                ]),
                FieldSpec::new("amount", "amount before tax (合计金额)", MONEY)
                    .aliases(&["金额", "合计金额"])
                    .patterns(&[r"合\s*计\s*[¥￥]\s*([\d,]+\.\d{2})"])
                    .example("884.96"),
                FieldSpec::new("tax_amount", "tax amount (合计税额)", MONEY)
                    .aliases(&["税额", "合计税额"])
                    .patterns(&[
                        r"合\s*计\s*[¥￥]\s*[\d,]+\.\d{2}\s*[¥￥]\s*([\d,]+\.\d{2})",
                        r"税\s*额\s*[:：]\s*[¥￥]?\s*([\d,]+\.\d{2})",
                    ])
                    .example("115.04"),
                FieldSpec::new("total_amount", "total including tax (价税合计)", MONEY)
                    .aliases(&["价税合计", "total"])
                    .patterns(&[
                        r"价\s*税\s*合\s*计[^¥￥\d]{0,40}[¥￥]\s*([\d,]+\.\d{2})",
                        r"[(（]\s*小\s*写\s*[)）]\s*[¥￥]?\s*([\d,]+\.\d{2})",
                        r"(?i)\btotal\s*(?:amount)?\s*[:：]\s*[¥￥$]?\s*([\d,]+\.\d{2})",
                    ])
                    .example("1000.00"),
            ],
        }
    }

    /// Mechanical engineering drawing (工程图纸); title block plus dimensions.
    pub fn drawing() -> Self {
        Self {
            document_type: "drawing".into(),
            description: "a mechanical engineering drawing (工程图纸)".into(),
            use_layout_hints: true,
            fields: vec![
                FieldSpec::new("drawing_number", "drawing number (图号)", FieldKind::Code)
                    .required()
                    .aliases(&["图号", "drawing_no", "drawingNumber"])
                    .validate(r"^[A-Za-z0-9][A-Za-z0-9._\-/]{2,40}$")
                    .patterns(&[
                        r"图\s*号\s*[:：]?\s*([A-Za-z0-9][A-Za-z0-9._\-/]{2,40})",
                        r"(?i)drawing\s*(?:no\.?|number)\s*[:：]?\s*([A-Z0-9][A-Z0-9._\-/]{2,40})",
                    ])
                    .example("GB-2024-0153"),
                FieldSpec::new("part_name", "part name (零件名称)", FieldKind::Text)
                    .aliases(&["零件名称", "名称", "name"])
                    .patterns(&[r"零\s*件\s*名\s*称\s*[:：]?\s*([^\s:：]{1,40})"])
                    .example("传动轴"),
                FieldSpec::new("material", "material grade (材料)", FieldKind::Text)
                    .aliases(&["材料", "材质"])
                    .patterns(&[
                        r"材\s*[料质]\s*[:：]?\s*([A-Za-z0-9\p{Han}#\-.]{2,30})",
                        r"(?i)\bmaterial\s*[:：]\s*([A-Za-z0-9#\-.]{2,30})",
                    ])
                    .example("45#"),
                FieldSpec::new(
                    "outer_diameter",
                    "outer diameter in mm, the number after Φ (外径)",
                    FieldKind::Number {
                        min: 0.0,
                        max: 10_000.0,
                    },
                )
                .aliases(&["外径", "diameter"])
                .patterns(&[
                    r"[ΦφØø⌀]\s*(\d+(?:\.\d+)?)",
                    r"外\s*径\s*[:：]?\s*(\d+(?:\.\d+)?)",
                ])
                .example("45.5"),
                FieldSpec::new(
                    "length",
                    "overall length in mm (长度)",
                    FieldKind::Number {
                        min: 0.0,
                        max: 100_000.0,
                    },
                )
                .aliases(&["长度", "总长"])
                .patterns(&[
                    r"(?:长\s*度|总\s*长)\s*[:：=]?\s*(\d+(?:\.\d+)?)",
                    r"(?i)\blength\s*[:：=]\s*(\d+(?:\.\d+)?)",
                ])
                .example("120"),
                FieldSpec::new("tolerance", "general tolerance (公差)", FieldKind::Text)
                    .aliases(&["公差"])
                    .patterns(&[
                        r"公\s*差\s*[:：]?\s*([^\s,，]{1,20})",
                        r"(±\s*\d+(?:\.\d+)?)",
                        r"(?i)\btolerance\s*[:：]\s*([^\s,]{1,20})",
                    ])
                    .example("±0.05"),
                FieldSpec::new(
                    "surface_treatment",
                    "surface treatment (表面处理)",
                    FieldKind::Text,
                )
                .aliases(&["表面处理"])
                .patterns(&[r"表\s*面\s*处\s*理\s*[:：]?\s*([^\s,，]{1,30})"]),
                FieldSpec::new("scale", "drawing scale such as 1:2 (比例)", FieldKind::Code)
                    .aliases(&["比例"])
                    .validate(r"^\d+(?:\.\d+)?[:：]\d+(?:\.\d+)?$")
                    .patterns(&[r"比\s*例\s*[:：]?\s*(\d+\s*[:：]\s*\d+)"])
                    .example("1:1"),
            ],
        }
    }

    /// Resolve a preset name (`invoice`, `drawing`) or load a JSON file.
    pub fn from_name_or_path(spec: &str) -> Result<Self, ExtractError> {
        match spec.to_ascii_lowercase().as_str() {
            "invoice" => Ok(Self::invoice()),
            "drawing" => Ok(Self::drawing()),
            _ => Self::from_json_file(spec),
        }
    }

    /// Load a custom schema from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExtractError::InvalidConfig(format!("cannot read schema '{}': {e}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            ExtractError::InvalidConfig(format!("invalid schema '{}': {e}", path.display()))
        })
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Compile every regex, rejecting empty or duplicate field names.
    pub fn compile(&self) -> Result<CompiledSchema, ExtractError> {
        if self.fields.is_empty() {
            return Err(ExtractError::InvalidConfig(format!(
                "schema '{}' declares no fields",
                self.document_type
            )));
        }
        let mut fields = Vec::with_capacity(self.fields.len());
        for spec in &self.fields {
            if spec.name.trim().is_empty() {
                return Err(ExtractError::InvalidConfig(
                    "schema field with empty name".into(),
                ));
            }
            if fields
                .iter()
                .any(|f: &CompiledField| f.spec.name == spec.name)
            {
                return Err(ExtractError::InvalidConfig(format!(
                    "duplicate field '{}'",
                    spec.name
                )));
            }
            fields.push(CompiledField::compile(spec)?);
        }
        Ok(CompiledSchema {
            schema: self.clone(),
            fields,
        })
    }
}

// ── Compiled form ────────────────────────────────────────────────────────

/// A [`FieldSchema`] with all regexes compiled.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    schema: FieldSchema,
    fields: Vec<CompiledField>,
}

impl CompiledSchema {
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn document_type(&self) -> &str {
        &self.schema.document_type
    }

    pub fn fields(&self) -> &[CompiledField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&CompiledField> {
        self.fields.iter().find(|f| f.spec.name == name)
    }
}

/// One field with its validation regex and recovery table compiled.
#[derive(Debug, Clone)]
pub struct CompiledField {
    pub spec: FieldSpec,
    validate: Option<Regex>,
    patterns: Vec<Regex>,
}

fn compile_regex(field: &str, re: &str) -> Result<Regex, ExtractError> {
    Regex::new(re).map_err(|e| {
        ExtractError::InvalidConfig(format!("field '{field}': bad pattern {re:?}: {e}"))
    })
}

/// Pattern matching `"key": "value"` or `"key": 123` anywhere in text.
fn json_key_pattern(key: &str) -> String {
    format!(
        r#"(?i)"{}"\s*[:：]\s*(?:"((?:[^"\\]|\\.)*)"|(-?\d+(?:\.\d+)?))"#,
        regex::escape(key)
    )
}

impl CompiledField {
    fn compile(spec: &FieldSpec) -> Result<Self, ExtractError> {
        let validate = spec
            .validate
            .as_deref()
            .map(|re| compile_regex(&spec.name, re))
            .transpose()?;

        let mut patterns = Vec::with_capacity(1 + spec.aliases.len() + spec.patterns.len());
        for key in std::iter::once(&spec.name).chain(spec.aliases.iter()) {
            patterns.push(compile_regex(&spec.name, &json_key_pattern(key))?);
        }
        for re in &spec.patterns {
            patterns.push(compile_regex(&spec.name, re)?);
        }

        Ok(Self {
            spec: spec.clone(),
            validate,
            patterns,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Ordered recovery table: JSON-key patterns, then label patterns.
    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    /// Clean a value taken from a parsed JSON object.
    ///
    /// `Ok(None)` means "present but empty" (null, blank, `"N/A"`).
    pub fn clean_json(&self, value: &Value) -> Result<Option<FieldData>, FieldValidationError> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => self.clean_text(s),
            Value::Number(n) => match self.spec.kind {
                FieldKind::Number { .. } => {
                    let f = n.as_f64().ok_or_else(|| FieldValidationError::NotANumber {
                        field: self.spec.name.clone(),
                        value: n.to_string(),
                    })?;
                    self.check_range(f)?;
                    self.check_format(&n.to_string())?;
                    Ok(Some(FieldData::Number(f)))
                }
                _ => self.clean_text(&n.to_string()),
            },
            Value::Array(items) => {
                let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                if parts.len() != items.len() {
                    return Err(FieldValidationError::UnsupportedShape {
                        field: self.spec.name.clone(),
                        shape: "array",
                    });
                }
                self.clean_text(&parts.join("; "))
            }
            Value::Bool(_) => Err(FieldValidationError::UnsupportedShape {
                field: self.spec.name.clone(),
                shape: "bool",
            }),
            Value::Object(_) => Err(FieldValidationError::UnsupportedShape {
                field: self.spec.name.clone(),
                shape: "object",
            }),
        }
    }

    /// Clean a string the model returned as a field value.
    ///
    /// The value is validated in its canonical form but kept as written,
    /// apart from trimming and quote stripping.
    pub fn clean_text(&self, raw: &str) -> Result<Option<FieldData>, FieldValidationError> {
        let Some(trimmed) = strip_value(raw) else {
            return Ok(None);
        };
        self.canonical(trimmed)?;
        Ok(Some(FieldData::Text(trimmed.to_string())))
    }

    /// Clean a regex capture taken from free text into its canonical form.
    pub fn clean_recovered(&self, raw: &str) -> Result<Option<FieldData>, FieldValidationError> {
        let Some(trimmed) = strip_value(raw) else {
            return Ok(None);
        };
        self.canonical(trimmed).map(|v| Some(FieldData::Text(v)))
    }

    fn canonical(&self, trimmed: &str) -> Result<String, FieldValidationError> {
        let cleaned = match &self.spec.kind {
            FieldKind::Text => RE_WHITESPACE.replace_all(trimmed, " ").into_owned(),
            FieldKind::Code => trimmed.chars().filter(|c| !c.is_whitespace()).collect(),
            FieldKind::Number { .. } => {
                let without_sep = trimmed.replace([',', '，'], "");
                let m = RE_NUMBER.find(&without_sep).ok_or_else(|| {
                    FieldValidationError::NotANumber {
                        field: self.spec.name.clone(),
                        value: trimmed.to_string(),
                    }
                })?;
                let number = m.as_str();
                let f: f64 = number
                    .parse()
                    .map_err(|_| FieldValidationError::NotANumber {
                        field: self.spec.name.clone(),
                        value: trimmed.to_string(),
                    })?;
                self.check_range(f)?;
                number.to_string()
            }
            FieldKind::Date => normalise_date(trimmed).ok_or_else(|| {
                FieldValidationError::InvalidDate {
                    field: self.spec.name.clone(),
                    value: trimmed.to_string(),
                }
            })?,
        };

        self.check_format(&cleaned)?;
        Ok(cleaned)
    }

    fn check_range(&self, value: f64) -> Result<(), FieldValidationError> {
        if let FieldKind::Number { min, max } = self.spec.kind {
            if !value.is_finite() || value < min || value > max {
                return Err(FieldValidationError::OutOfRange {
                    field: self.spec.name.clone(),
                    value,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }

    fn check_format(&self, value: &str) -> Result<(), FieldValidationError> {
        match &self.validate {
            Some(re) if !re.is_match(value) => Err(FieldValidationError::PatternMismatch {
                field: self.spec.name.clone(),
                value: value.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").unwrap());
static RE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})\s*[年\-/.]\s*(\d{1,2})\s*[月\-/.]\s*(\d{1,2})").unwrap()
});

/// Trim whitespace and wrapping quotes; `None` for blanks and null tokens.
fn strip_value(raw: &str) -> Option<&str> {
    let trimmed = raw
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '`'))
        .trim();
    (!trimmed.is_empty() && !is_null_token(trimmed)).then_some(trimmed)
}

/// Placeholder strings models and OCR emit for "nothing here".
fn is_null_token(s: &str) -> bool {
    const NULL_TOKENS: &[&str] = &[
        "null", "none", "nil", "n/a", "na", "unknown", "-", "--", "—", "/", "无", "未知", "空",
    ];
    let lower = s.to_lowercase();
    NULL_TOKENS.iter().any(|t| *t == lower)
}

fn normalise_date(s: &str) -> Option<String> {
    let caps = RE_DATE.captures(s)?;
    let year: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let day: u32 = caps[3].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(format!("{year:04}-{month:02}-{day:02}"))
}
