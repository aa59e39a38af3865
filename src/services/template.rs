//! Template schema extraction.
//!
//! A template is read as a label grid: the first non-empty row carries column labels
//! and the first non-empty column beneath it carries row labels. Every labeled
//! row × labeled column intersection is a data cell, unless it is hidden under a merged
//! range or computed by a formula.

use serde::Deserialize;
use strum::{Display, EnumString};
use tracing::debug;

use crate::models::schema::{CellDescriptor, TemplateSchema, ValueType};
use crate::services::workbook::{
    cell_ref, CellKind, FormatClass, Workbook, WorkbookError, Worksheet,
};

/// Which worksheets contribute data cells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SheetScope {
    /// Only the first sheet in workbook order.
    #[default]
    First,
    All,
}

/// Knobs for label detection.
#[derive(Debug, Clone, Default)]
pub struct SchemaOptions {
    pub sheets: SheetScope,
    /// Fixed 1-based header row; detected when `None`.
    pub header_row: Option<u32>,
    /// Fixed 1-based label column; detected when `None`.
    pub label_column: Option<u32>,
    /// Type of empty, unformatted data cells.
    pub default_value_type: ValueType,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("template not found at {0}")]
    Missing(String),

    #[error("template is not a readable spreadsheet: {0}")]
    Unreadable(#[from] WorkbookError),

    #[error("template contains no worksheets")]
    NoSheets,

    #[error("template has no identifiable label structure")]
    NoLabels,
}

/// Label positions found on one sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Layout {
    pub header_row: u32,
    pub label_column: u32,
    /// `(column, label)` pairs right of the label column.
    pub columns: Vec<(u32, String)>,
    /// `(row, label)` pairs below the header row.
    pub rows: Vec<(u32, String)>,
}

/// Derives the ordered schema of data cells from template bytes.
pub fn extract_schema(bytes: &[u8], options: &SchemaOptions) -> Result<TemplateSchema, ParseError> {
    let mut workbook = Workbook::open(bytes)?;
    if workbook.sheets.is_empty() {
        return Err(ParseError::NoSheets);
    }

    let sheet_count = match options.sheets {
        SheetScope::First => 1,
        SheetScope::All => workbook.sheets.len(),
    };

    let mut cells = Vec::new();
    let mut labeled_sheets = 0usize;
    for index in 0..sheet_count {
        let sheet = workbook.worksheet(index)?;
        let name = workbook.sheets[index].name.clone();
        let Some(layout) = detect_layout(&sheet, options) else {
            debug!(sheet = %name, "Sheet has no content, skipping");
            continue;
        };
        labeled_sheets += 1;

        debug!(
            sheet = %name,
            header_row = layout.header_row,
            label_column = layout.label_column,
            rows = layout.rows.len(),
            columns = layout.columns.len(),
            "Detected label layout"
        );

        for (row, row_label) in &layout.rows {
            for (column, column_label) in &layout.columns {
                let (row, column) = (*row, *column);
                if sheet.is_merged_away(row, column) {
                    continue;
                }
                if sheet.cell(row, column).is_some_and(|c| c.formula) {
                    continue;
                }
                cells.push(CellDescriptor {
                    sheet: name.clone(),
                    row_label: row_label.clone(),
                    column_label: column_label.clone(),
                    cell_address: qualified_address(index, &name, row, column),
                    row,
                    column,
                    expected_value_type: infer_type(
                        &workbook,
                        &sheet,
                        row,
                        column,
                        options.default_value_type,
                    ),
                });
            }
        }
    }

    if labeled_sheets == 0 {
        return Err(ParseError::NoLabels);
    }
    Ok(TemplateSchema::new(cells))
}

/// Finds the header row, label column and labels of a sheet; `None` for a blank sheet.
pub(crate) fn detect_layout(sheet: &Worksheet, options: &SchemaOptions) -> Option<Layout> {
    let first_row = sheet.non_empty().next().map(|((row, _), _)| row)?;
    let header_row = options.header_row.unwrap_or(first_row);

    let label_column = options
        .label_column
        .or_else(|| {
            sheet
                .non_empty()
                .filter(|((row, _), _)| *row > header_row)
                .map(|((_, column), _)| column)
                .min()
        })
        .unwrap_or(1);

    let columns = sheet
        .non_empty()
        .filter(|((row, column), _)| *row == header_row && *column > label_column)
        .map(|((_, column), label)| (column, label.to_string()))
        .collect();
    let rows = sheet
        .non_empty()
        .filter(|((row, column), _)| *column == label_column && *row > header_row)
        .map(|((row, _), label)| (row, label.to_string()))
        .collect();

    Some(Layout {
        header_row,
        label_column,
        columns,
        rows,
    })
}

/// Schema key of a cell: plain `B2` on the first sheet, `Sheet!B2` elsewhere.
pub fn qualified_address(sheet_index: usize, sheet_name: &str, row: u32, column: u32) -> String {
    let reference = cell_ref(row, column);
    if sheet_index == 0 {
        return reference;
    }
    if sheet_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        format!("{sheet_name}!{reference}")
    } else {
        format!("'{}'!{reference}", sheet_name.replace('\'', "''"))
    }
}

fn infer_type(
    workbook: &Workbook<'_>,
    sheet: &Worksheet,
    row: u32,
    column: u32,
    default: ValueType,
) -> ValueType {
    let cell = sheet.cell(row, column);
    if cell.is_some_and(|c| c.kind == CellKind::Date) {
        return ValueType::Date;
    }

    let style = cell
        .and_then(|c| c.style)
        .or_else(|| sheet.column_style(column));
    match style.map(|s| workbook.format_class(s)) {
        Some(FormatClass::Date) => return ValueType::Date,
        Some(FormatClass::Numeric) => return ValueType::Number,
        Some(FormatClass::Text) => return ValueType::Text,
        _ => {}
    }

    match cell.filter(|c| c.value.is_some()).map(|c| c.kind) {
        Some(CellKind::Number) => ValueType::Number,
        Some(_) => ValueType::Text,
        None => default,
    }
}
