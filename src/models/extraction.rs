use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::schema::{TemplateSchema, ValueType};

/// Text pulled from one input document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedDocument {
    pub source_name: String,
    pub text: String,
    pub extraction_succeeded: bool,
    /// Why extraction failed, when it did.
    pub failure: Option<String>,
}

impl ExtractedDocument {
    pub fn succeeded(source_name: impl Into<String>, text: String) -> Self {
        Self {
            source_name: source_name.into(),
            text,
            extraction_succeeded: true,
            failure: None,
        }
    }

    pub fn failed(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            text: String::new(),
            extraction_succeeded: false,
            failure: Some(reason.into()),
        }
    }

    pub fn outcome(&self) -> DocumentOutcome {
        DocumentOutcome {
            source_name: self.source_name.clone(),
            extraction_succeeded: self.extraction_succeeded,
            failure: self.failure.clone(),
        }
    }
}

/// Per-document extraction flags persisted on the request for higher layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentOutcome {
    pub source_name: String,
    pub extraction_succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Document texts in input order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedText {
    pub documents: Vec<ExtractedDocument>,
}

impl ExtractedText {
    pub fn succeeded(&self) -> impl Iterator<Item = &ExtractedDocument> {
        self.documents.iter().filter(|d| d.extraction_succeeded)
    }

    pub fn failed_count(&self) -> usize {
        self.documents
            .iter()
            .filter(|d| !d.extraction_succeeded)
            .count()
    }

    pub fn outcomes(&self) -> Vec<DocumentOutcome> {
        self.documents.iter().map(ExtractedDocument::outcome).collect()
    }
}

/// A typed value destined for one template cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Date(NaiveDate),
    /// No value found; written as an empty cell.
    Blank,
}

impl CellValue {
    /// Placeholder used when generation cannot be validated.
    pub fn placeholder(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Number => CellValue::Number(0.0),
            ValueType::Text => CellValue::Text(String::new()),
            ValueType::Date => CellValue::Date(NaiveDate::default()),
        }
    }

    pub fn conforms_to(&self, value_type: ValueType) -> bool {
        matches!(
            (self, value_type),
            (CellValue::Blank, _)
                | (CellValue::Number(_), ValueType::Number)
                | (CellValue::Text(_), ValueType::Text)
                | (CellValue::Date(_), ValueType::Date)
        )
    }
}

/// How an [`ExtractionResult`] was obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResultQuality {
    /// First generator response validated.
    Generated,
    /// Validated after the corrective re-prompt.
    Repaired,
    /// Placeholder values; no response could be validated.
    Fallback,
    /// Schema was empty; nothing was generated.
    Empty,
}

/// Values keyed by `cell_address`, conformant to a [`TemplateSchema`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub values: BTreeMap<String, CellValue>,
    pub quality: ResultQuality,
}

impl ExtractionResult {
    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
            quality: ResultQuality::Empty,
        }
    }

    /// Type-appropriate defaults for every schema cell.
    pub fn placeholder(schema: &TemplateSchema) -> Self {
        let values = schema
            .iter()
            .map(|cell| {
                (
                    cell.cell_address.clone(),
                    CellValue::placeholder(cell.expected_value_type),
                )
            })
            .collect();
        Self {
            values,
            quality: ResultQuality::Fallback,
        }
    }

    pub fn get(&self, cell_address: &str) -> Option<&CellValue> {
        self.values.get(cell_address)
    }

    pub fn is_degraded(&self) -> bool {
        self.quality == ResultQuality::Fallback
    }

    /// True when every schema cell has a value of the expected type.
    pub fn conforms_to(&self, schema: &TemplateSchema) -> bool {
        schema.iter().all(|cell| {
            self.values
                .get(&cell.cell_address)
                .is_some_and(|v| v.conforms_to(cell.expected_value_type))
        })
    }
}
