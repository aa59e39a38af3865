//! Schema-constrained structured generation.
//!
//! The template schema becomes a flat value schema keyed by cell address. The generator
//! is called at most [`MAX_ATTEMPTS`] times: a response that fails validation earns one
//! corrective re-prompt, and if that also fails the result degrades to placeholders
//! rather than failing the request. Only an unreachable generator is an error.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::models::extraction::{CellValue, ExtractedText, ExtractionResult, ResultQuality};
use crate::models::schema::{TemplateSchema, ValueType};

/// Generator calls per request: the initial prompt plus one corrective re-prompt.
pub const MAX_ATTEMPTS: usize = 2;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d %B %Y",
    "%B %d, %Y",
    "%d %b %Y",
    "%b %d, %Y",
];

/// One field of the value schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueField {
    /// The template cell address the value belongs to.
    pub key: String,
    /// Human-readable meaning built from the cell's labels.
    pub description: String,
    pub value_type: ValueType,
}

/// Flat field set the generator must fill, in template order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValueSchema {
    pub fields: Vec<ValueField>,
}

impl ValueSchema {
    pub fn from_template(schema: &TemplateSchema) -> Self {
        let fields = schema
            .iter()
            .map(|cell| {
                let mut description = format!("{} | {}", cell.row_label, cell.column_label);
                if cell.cell_address.contains('!') {
                    description.push_str(&format!(" (sheet {})", cell.sheet));
                }
                ValueField {
                    key: cell.cell_address.clone(),
                    description,
                    value_type: cell.expected_value_type,
                }
            })
            .collect();
        Self { fields }
    }
}

/// A single structured-generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub schema: ValueSchema,
    /// Concatenated document text.
    pub context: String,
    pub instructions: String,
    /// 1-based attempt number.
    pub attempt: usize,
}

/// An external model that fills a value schema from context text.
///
/// Returns the raw response body. Anything received counts as a response, however
/// malformed; errors are reserved for failing to get one.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError>;
}

/// Transport-level generator failure.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generator request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generator returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generator did not respond within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("external generator unreachable after {attempts} attempts: {last}")]
    Unreachable {
        attempts: usize,
        #[source]
        last: GeneratorError,
    },
}

/// A way in which a response failed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    NotJson(String),
    NotObject,
    Missing {
        key: String,
    },
    WrongType {
        key: String,
        expected: ValueType,
        found: String,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NotJson(e) => write!(f, "the response was not valid JSON ({e})"),
            Violation::NotObject => write!(f, "the response was not a JSON object"),
            Violation::Missing { key } => write!(f, "field \"{key}\" is missing"),
            Violation::WrongType {
                key,
                expected,
                found,
            } => write!(f, "field \"{key}\" must be a {expected} but was {found}"),
        }
    }
}

/// Fills a template schema through a [`Generator`].
pub struct GenerationClient {
    generator: Arc<dyn Generator>,
    timeout: Duration,
    max_context_chars: usize,
}

impl GenerationClient {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration, max_context_chars: usize) -> Self {
        Self {
            generator,
            timeout,
            max_context_chars,
        }
    }

    pub async fn fill(
        &self,
        schema: &TemplateSchema,
        text: &ExtractedText,
    ) -> Result<ExtractionResult, GenerationError> {
        if schema.is_empty() {
            return Ok(ExtractionResult::empty());
        }

        let value_schema = ValueSchema::from_template(schema);
        let context = build_context(text, self.max_context_chars);
        let base_instructions = instructions(&value_schema);

        let mut violations: Vec<Violation> = Vec::new();
        let mut last_transport: Option<GeneratorError> = None;
        let mut transport_failures = 0usize;

        for attempt in 1..=MAX_ATTEMPTS {
            let corrective = !violations.is_empty();
            let instructions = if corrective {
                format!("{base_instructions}\n\n{}", corrective_instructions(&violations))
            } else {
                base_instructions.clone()
            };
            let request = GenerationRequest {
                schema: value_schema.clone(),
                context: context.clone(),
                instructions,
                attempt,
            };

            let start = Instant::now();
            let outcome = tokio::time::timeout(self.timeout, self.generator.generate(&request))
                .await
                .unwrap_or(Err(GeneratorError::Timeout(self.timeout)));

            match outcome {
                Err(e) => {
                    warn!(
                        generator = self.generator.name(),
                        attempt,
                        error = %e,
                        "Generator unreachable"
                    );
                    transport_failures += 1;
                    last_transport = Some(e);
                }
                Ok(raw) => match validate(&value_schema, &raw) {
                    Ok(values) => {
                        let quality = if corrective {
                            ResultQuality::Repaired
                        } else {
                            ResultQuality::Generated
                        };
                        info!(
                            generator = self.generator.name(),
                            attempt,
                            fields = values.len(),
                            duration_ms = start.elapsed().as_millis() as u64,
                            quality = %quality,
                            "Generator response validated"
                        );
                        return Ok(ExtractionResult { values, quality });
                    }
                    Err(found) => {
                        warn!(
                            generator = self.generator.name(),
                            attempt,
                            violations = found.len(),
                            first = %found[0],
                            "Generator response failed validation"
                        );
                        violations = found;
                    }
                },
            }
        }

        if transport_failures == MAX_ATTEMPTS {
            if let Some(last) = last_transport {
                return Err(GenerationError::Unreachable {
                    attempts: MAX_ATTEMPTS,
                    last,
                });
            }
        }

        warn!(
            fields = schema.len(),
            "No valid generator response, using placeholder values"
        );
        Ok(ExtractionResult::placeholder(schema))
    }
}

/// Concatenates successfully extracted documents, in order, capped at `max_chars`.
pub fn build_context(text: &ExtractedText, max_chars: usize) -> String {
    let mut context = String::new();
    for doc in text.succeeded() {
        let _ = writeln!(context, "--- Start of {} ---", doc.source_name);
        let _ = writeln!(context, "{}", doc.text);
        let _ = writeln!(context, "--- End of {} ---", doc.source_name);
    }
    if let Some((cut, _)) = context.char_indices().nth(max_chars) {
        context.truncate(cut);
    }
    context
}

fn instructions(schema: &ValueSchema) -> String {
    let mut out = String::from(
        "You are an expert financial analyst. Extract values from the document text to \
         populate a spreadsheet template.\n\
         \n\
         INSTRUCTIONS:\n\
         1. Read the document text carefully.\n\
         2. Produce a value for every field listed below; each field is one template cell \
         described as \"row label | column label\".\n\
         3. If a value is stated explicitly, use it.\n\
         4. If a value can be calculated from stated values (e.g. a total), calculate it.\n\
         5. If a value is not present, use null.\n\
         6. Numbers must be plain JSON numbers, dates must be YYYY-MM-DD strings.\n\
         7. Respond with one JSON object whose keys are exactly the field keys.\n\
         \n\
         FIELDS:\n",
    );
    for field in &schema.fields {
        let _ = writeln!(
            out,
            "- {}: {} ({})",
            field.key, field.description, field.value_type
        );
    }
    out
}

fn corrective_instructions(violations: &[Violation]) -> String {
    let mut out =
        String::from("Your previous response did not match the required schema:\n");
    for violation in violations {
        let _ = writeln!(out, "- {violation}");
    }
    out.push_str(
        "Respond again with a single JSON object containing every listed field, \
         using null where a value is not present in the documents.",
    );
    out
}

/// Checks a raw response against the schema, repairing what can be repaired.
pub fn validate(
    schema: &ValueSchema,
    raw: &str,
) -> Result<BTreeMap<String, CellValue>, Vec<Violation>> {
    let parsed: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| vec![Violation::NotJson(e.to_string())])?;
    let object = parsed.as_object().ok_or_else(|| vec![Violation::NotObject])?;

    let mut values = BTreeMap::new();
    let mut violations = Vec::new();
    for field in &schema.fields {
        match object.get(&field.key) {
            None => violations.push(Violation::Missing {
                key: field.key.clone(),
            }),
            Some(value) => match coerce(value, field.value_type) {
                Some(cell) => {
                    values.insert(field.key.clone(), cell);
                }
                None => violations.push(Violation::WrongType {
                    key: field.key.clone(),
                    expected: field.value_type,
                    found: describe(value),
                }),
            },
        }
    }

    if violations.is_empty() {
        Ok(values)
    } else {
        Err(violations)
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn coerce(value: &Value, value_type: ValueType) -> Option<CellValue> {
    if value.is_null() {
        return Some(CellValue::Blank);
    }
    match value_type {
        ValueType::Number => coerce_number(value).map(CellValue::Number),
        ValueType::Date => coerce_date(value).map(CellValue::Date),
        ValueType::Text => match value {
            Value::String(s) => Some(CellValue::Text(s.clone())),
            Value::Number(n) => Some(CellValue::Text(n.to_string())),
            Value::Bool(b) => Some(CellValue::Text(b.to_string())),
            _ => None,
        },
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_numeric_text(s),
        _ => None,
    }
}

/// Accepts `1,234.5`, `$12`, `(40)` (negative) and similar report notation.
fn parse_numeric_text(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let (negative, inner) = match trimmed
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
    {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };
    let cleaned: String = inner
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | ' ' | '\u{a0}'))
        .collect();
    let number: f64 = cleaned.parse().ok()?;
    number
        .is_finite()
        .then_some(if negative { -number } else { number })
}

fn coerce_date(value: &Value) -> Option<NaiveDate> {
    let text = value.as_str()?.trim();
    if let Some((date, _time)) = text.split_once('T') {
        if let Ok(d) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            return Some(d);
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) if s.chars().count() > 40 => {
            let head: String = s.chars().take(40).collect();
            format!("the string \"{head}...\"")
        }
        Value::String(s) => format!("the string \"{s}\""),
        Value::Number(n) => format!("the number {n}"),
        Value::Bool(b) => format!("the boolean {b}"),
        Value::Array(_) => "an array".to_string(),
        Value::Object(_) => "an object".to_string(),
        Value::Null => "null".to_string(),
    }
}
