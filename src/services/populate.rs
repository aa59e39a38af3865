//! Writes extraction results back into the template.
//!
//! Sheet XML is edited in place: only the targeted `<c>` elements are rewritten and
//! missing `<row>`/`<c>` elements are inserted in document order. Every other byte of the
//! sheet, and every other package part, is carried over untouched.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::models::extraction::{CellValue, ExtractionResult};
use crate::models::schema::{CellDescriptor, TemplateSchema};
use crate::services::workbook::{
    attr, cell_position, cell_ref, date_serial, parse_worksheet, row_number, FormatClass,
    Workbook, WorkbookError, STYLES_PART, WORKBOOK_PART,
};

/// Built-in `m/d/yyyy` number format.
const SHORT_DATE_FORMAT: u32 = 14;

/// `workbook.xml` children that must follow `calcPr`.
const AFTER_CALC_PR: &[&[u8]] = &[
    b"oleSize",
    b"customWorkbookViews",
    b"pivotCaches",
    b"smartTagPr",
    b"smartTagTypes",
    b"webPublishing",
    b"fileRecoveryPr",
    b"webPublishObjects",
    b"extLst",
];

#[derive(Debug, thiserror::Error)]
pub enum PopulationError {
    #[error("template has no sheet named {0:?}")]
    SheetMissing(String),

    #[error("cell {address} is not writable: {reason}")]
    NotWritable {
        address: String,
        reason: &'static str,
    },

    #[error("no value for cell {0}")]
    MissingValue(String),

    #[error(transparent)]
    Workbook(#[from] WorkbookError),

    #[error("failed to write xlsx package: {0}")]
    Zip(#[from] ZipError),

    #[error("failed to write xlsx package: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct CellWrite {
    value: CellValue,
    /// Style for a cell that does not exist yet.
    style: Option<u32>,
    /// Replace an existing cell's style with `style`.
    restyle: bool,
}

/// Produces a copy of the template with every schema cell set from `result`.
pub fn populate(
    template: &[u8],
    schema: &TemplateSchema,
    result: &ExtractionResult,
) -> Result<Vec<u8>, PopulationError> {
    if schema.is_empty() {
        return Ok(template.to_vec());
    }

    let mut workbook = Workbook::open(template)?;
    let mut by_sheet: BTreeMap<usize, Vec<&CellDescriptor>> = BTreeMap::new();
    for cell in schema.iter() {
        let index = workbook
            .sheet_index(&cell.sheet)
            .ok_or_else(|| PopulationError::SheetMissing(cell.sheet.clone()))?;
        by_sheet.entry(index).or_default().push(cell);
    }

    // Appended on demand for dates landing in cells without a date format.
    let mut date_style: Option<u32> = None;
    let mut replaced: HashMap<String, String> = HashMap::new();
    for (index, cells) in by_sheet {
        let xml = workbook.sheet_xml(index)?;
        let sheet = parse_worksheet(&xml, &[])?;

        let mut writes = BTreeMap::new();
        for cell in cells {
            let not_writable = |reason| PopulationError::NotWritable {
                address: cell.cell_address.clone(),
                reason,
            };
            if sheet.is_merged_away(cell.row, cell.column) {
                return Err(not_writable("covered by a merged range"));
            }
            if sheet.cell(cell.row, cell.column).is_some_and(|c| c.formula) {
                return Err(not_writable("holds a formula"));
            }
            let value = result
                .get(&cell.cell_address)
                .ok_or_else(|| PopulationError::MissingValue(cell.cell_address.clone()))?;

            let mut write = CellWrite {
                value: value.clone(),
                style: sheet.column_style(cell.column),
                restyle: false,
            };
            let current = match sheet.cell(cell.row, cell.column) {
                Some(existing) => existing.style,
                None => write.style,
            };
            let shows_dates =
                current.is_some_and(|s| workbook.format_class(s) == FormatClass::Date);
            let has_styles = workbook.cell_format_count() > 0;
            if matches!(value, CellValue::Date(_)) && !shows_dates && has_styles {
                let style = *date_style.get_or_insert(workbook.cell_format_count() as u32);
                write.style = Some(style);
                write.restyle = true;
            }
            writes.insert((cell.row, cell.column), write);
        }

        let part = workbook.sheets[index].part.clone();
        debug!(part = %part, cells = writes.len(), "Writing sheet cells");
        replaced.insert(part, splice_sheet(&xml, writes, workbook.date1904)?);
    }

    if let Some(style) = date_style {
        let styles_xml = workbook.part(STYLES_PART)?;
        replaced.insert(STYLES_PART.to_string(), append_date_style(&styles_xml, style)?);
    }

    // Cached formula results are stale once inputs change.
    let workbook_xml = workbook.part(WORKBOOK_PART)?;
    replaced.insert(
        WORKBOOK_PART.to_string(),
        request_full_recalculation(&workbook_xml)?,
    );

    rewrite_package(template, &replaced)
}

fn rewrite_package(
    template: &[u8],
    replaced: &HashMap<String, String>,
) -> Result<Vec<u8>, PopulationError> {
    let mut archive = ZipArchive::new(Cursor::new(template))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(template.len())));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        match replaced.get(file.name()) {
            Some(xml) => {
                let name = file.name().to_string();
                drop(file);
                writer.start_file(name, options)?;
                writer.write_all(xml.as_bytes())?;
            }
            None => writer.raw_copy_file(file)?,
        }
    }
    Ok(writer.finish()?.into_inner())
}

/// Accumulates the output of an in-place edit of `source`.
struct Splice<'x> {
    source: &'x str,
    out: String,
    cursor: usize,
}

impl<'x> Splice<'x> {
    fn new(source: &'x str) -> Self {
        Self {
            source,
            out: String::with_capacity(source.len() + 1024),
            cursor: 0,
        }
    }

    fn insert(&mut self, at: usize, text: &str) {
        self.replace(at, at, text);
    }

    fn replace(&mut self, start: usize, end: usize, text: &str) {
        self.out.push_str(&self.source[self.cursor..start]);
        self.out.push_str(text);
        self.cursor = end;
    }

    fn finish(mut self) -> String {
        self.out.push_str(&self.source[self.cursor..]);
        self.out
    }
}

fn splice_sheet(
    xml: &str,
    writes: BTreeMap<(u32, u32), CellWrite>,
    date1904: bool,
) -> Result<String, WorkbookError> {
    let mut rows: BTreeMap<u32, BTreeMap<u32, CellWrite>> = BTreeMap::new();
    for ((row, column), write) in writes {
        rows.entry(row).or_default().insert(column, write);
    }

    let mut reader = Reader::from_str(xml);
    let mut splice = Splice::new(xml);
    let mut prefix = String::new();
    let mut in_sheet_data = false;
    let mut row = 0u32;
    let mut column = 0u32;
    let mut active: Option<BTreeMap<u32, CellWrite>> = None;
    // Start offset and replacement of the cell element being skipped.
    let mut replacing: Option<(usize, String)> = None;

    loop {
        let start = reader.buffer_position() as usize;
        let event = reader.read_event()?;
        let end = reader.buffer_position() as usize;
        let empty = matches!(event, Event::Empty(_));

        if replacing.is_some() {
            if matches!(&event, Event::End(e) if e.local_name().as_ref() == b"c") {
                if let Some((from, cell)) = replacing.take() {
                    splice.replace(from, end, &cell);
                }
            }
            continue;
        }

        match &event {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheetData" => {
                prefix = prefix_of(e.name().as_ref());
                if empty {
                    let body = render_rows(&prefix, std::mem::take(&mut rows), date1904);
                    splice.replace(start, end, &format!("<{prefix}sheetData>{body}</{prefix}sheetData>"));
                } else {
                    in_sheet_data = true;
                }
            }
            Event::End(e) if in_sheet_data && e.local_name().as_ref() == b"sheetData" => {
                splice.insert(start, &render_rows(&prefix, std::mem::take(&mut rows), date1904));
                in_sheet_data = false;
            }
            Event::Start(e) | Event::Empty(e) if in_sheet_data && e.local_name().as_ref() == b"row" => {
                let explicit = attr(e, b"r")?.is_some();
                row = row_number(e, row)?;
                column = 0;

                let later = rows.split_off(&row);
                let earlier = std::mem::replace(&mut rows, later);
                if !earlier.is_empty() {
                    splice.insert(start, &render_rows(&prefix, earlier, date1904));
                }

                active = rows.remove(&row);
                match active.take() {
                    Some(cells) if empty => {
                        let tag = rebuild_tag(e, &format!(r#" r="{row}""#), &[b"r", b"spans"], "", false)?;
                        let body = render_cells(&prefix, row, cells, date1904);
                        splice.replace(start, end, &format!("{tag}{body}</{prefix}row>"));
                    }
                    Some(cells) => {
                        let tag = rebuild_tag(e, &format!(r#" r="{row}""#), &[b"r", b"spans"], "", false)?;
                        splice.replace(start, end, &tag);
                        active = Some(cells);
                    }
                    None if !explicit => {
                        let tag = rebuild_tag(e, &format!(r#" r="{row}""#), &[b"r"], "", empty)?;
                        splice.replace(start, end, &tag);
                    }
                    None => {}
                }
            }
            Event::End(e) if in_sheet_data && e.local_name().as_ref() == b"row" => {
                if let Some(cells) = active.take() {
                    splice.insert(start, &render_cells(&prefix, row, cells, date1904));
                }
            }
            Event::Start(e) | Event::Empty(e) if in_sheet_data && e.local_name().as_ref() == b"c" => {
                let Some(cells) = active.as_mut() else {
                    (row, column) = cell_position(e, row, column)?;
                    continue;
                };
                let explicit = attr(e, b"r")?.is_some();
                (row, column) = cell_position(e, row, column)?;

                let later = cells.split_off(&column);
                let earlier = std::mem::replace(cells, later);
                if !earlier.is_empty() {
                    splice.insert(start, &render_cells(&prefix, row, earlier, date1904));
                }

                if let Some(write) = cells.remove(&column) {
                    let kept = match write.style.filter(|_| write.restyle) {
                        Some(style) => {
                            let rest = kept_attributes(e, &[b"r", b"t", b"s"])?;
                            format!(r#" s="{style}"{rest}"#)
                        }
                        None => kept_attributes(e, &[b"r", b"t"])?,
                    };
                    let cell = render_cell(&prefix, row, column, &kept, &write.value, date1904);
                    if empty {
                        splice.replace(start, end, &cell);
                    } else {
                        replacing = Some((start, cell));
                    }
                } else if !explicit {
                    let reference = cell_ref(row, column);
                    let tag = rebuild_tag(e, &format!(r#" r="{reference}""#), &[b"r"], "", empty)?;
                    splice.replace(start, end, &tag);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(splice.finish())
}

/// Sets `fullCalcOnLoad` on the workbook's `calcPr`, adding the element if needed.
fn request_full_recalculation(xml: &str) -> Result<String, WorkbookError> {
    let mut reader = Reader::from_str(xml);
    let mut splice = Splice::new(xml);
    let mut prefix = String::new();
    let mut depth = 0usize;

    loop {
        let start = reader.buffer_position() as usize;
        let event = reader.read_event()?;
        let end = reader.buffer_position() as usize;
        match &event {
            Event::Start(e) | Event::Empty(e) => {
                let name = e.local_name();
                if depth == 0 {
                    prefix = prefix_of(e.name().as_ref());
                } else if depth == 1 && name.as_ref() == b"calcPr" {
                    let empty = matches!(event, Event::Empty(_));
                    let tag = rebuild_tag(e, "", &[b"fullCalcOnLoad"], r#" fullCalcOnLoad="1""#, empty)?;
                    splice.replace(start, end, &tag);
                    break;
                } else if depth == 1 && AFTER_CALC_PR.contains(&name.as_ref()) {
                    splice.insert(start, &format!(r#"<{prefix}calcPr fullCalcOnLoad="1"/>"#));
                    break;
                }
                if matches!(event, Event::Start(_)) {
                    depth += 1;
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    splice.insert(start, &format!(r#"<{prefix}calcPr fullCalcOnLoad="1"/>"#));
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(splice.finish())
}

/// Appends a short-date entry to `cellXfs`; `index` is the position it takes.
fn append_date_style(xml: &str, index: u32) -> Result<String, WorkbookError> {
    let mut reader = Reader::from_str(xml);
    let mut splice = Splice::new(xml);
    let mut prefix = String::new();

    loop {
        let start = reader.buffer_position() as usize;
        let event = reader.read_event()?;
        let end = reader.buffer_position() as usize;
        match &event {
            Event::Start(e) if e.local_name().as_ref() == b"cellXfs" => {
                prefix = prefix_of(e.name().as_ref());
                let count = format!(r#" count="{}""#, index + 1);
                splice.replace(start, end, &rebuild_tag(e, &count, &[b"count"], "", false)?);
            }
            Event::End(e) if e.local_name().as_ref() == b"cellXfs" => {
                splice.insert(
                    start,
                    &format!(
                        r#"<{prefix}xf numFmtId="{SHORT_DATE_FORMAT}" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/>"#
                    ),
                );
                break;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(splice.finish())
}

/// `x:` for `x:sheetData`, empty for an unprefixed name.
fn prefix_of(qualified: &[u8]) -> String {
    let name = String::from_utf8_lossy(qualified);
    match name.split_once(':') {
        Some((prefix, _)) => format!("{prefix}:"),
        None => String::new(),
    }
}

/// Source attributes of an element, minus `skip`, each with a leading space.
fn kept_attributes(e: &BytesStart, skip: &[&[u8]]) -> Result<String, WorkbookError> {
    let mut out = String::new();
    for a in e.attributes() {
        let a = a?;
        if skip.contains(&a.key.as_ref()) {
            continue;
        }
        let value = String::from_utf8_lossy(&a.value).replace('"', "&quot;");
        out.push_str(&format!(
            r#" {}="{value}""#,
            String::from_utf8_lossy(a.key.as_ref())
        ));
    }
    Ok(out)
}

fn rebuild_tag(
    e: &BytesStart,
    leading: &str,
    skip: &[&[u8]],
    trailing: &str,
    self_closing: bool,
) -> Result<String, WorkbookError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let kept = kept_attributes(e, skip)?;
    let close = if self_closing { "/>" } else { ">" };
    Ok(format!("<{name}{leading}{kept}{trailing}{close}"))
}

fn render_rows(prefix: &str, rows: BTreeMap<u32, BTreeMap<u32, CellWrite>>, date1904: bool) -> String {
    rows.into_iter()
        .map(|(row, cells)| {
            format!(
                r#"<{prefix}row r="{row}">{}</{prefix}row>"#,
                render_cells(prefix, row, cells, date1904)
            )
        })
        .collect()
}

fn render_cells(prefix: &str, row: u32, cells: BTreeMap<u32, CellWrite>, date1904: bool) -> String {
    cells
        .into_iter()
        .map(|(column, write)| {
            let style = write
                .style
                .map(|s| format!(r#" s="{s}""#))
                .unwrap_or_default();
            render_cell(prefix, row, column, &style, &write.value, date1904)
        })
        .collect()
}

fn render_cell(
    p: &str,
    row: u32,
    column: u32,
    attributes: &str,
    value: &CellValue,
    date1904: bool,
) -> String {
    let reference = cell_ref(row, column);
    match value {
        CellValue::Number(n) if n.is_finite() => format!(
            r#"<{p}c r="{reference}"{attributes}><{p}v>{}</{p}v></{p}c>"#,
            format_number(*n)
        ),
        CellValue::Date(d) => format!(
            r#"<{p}c r="{reference}"{attributes}><{p}v>{}</{p}v></{p}c>"#,
            date_serial(*d, date1904)
        ),
        CellValue::Text(text) if !text.is_empty() => {
            let text: String = text
                .chars()
                .filter(|c| matches!(c, '\t' | '\n' | '\r') || *c >= ' ')
                .collect();
            let space = if text.trim() != text {
                r#" xml:space="preserve""#
            } else {
                ""
            };
            format!(
                r#"<{p}c r="{reference}"{attributes} t="inlineStr"><{p}is><{p}t{space}>{}</{p}t></{p}is></{p}c>"#,
                escape(text.as_str())
            )
        }
        _ => format!(r#"<{p}c r="{reference}"{attributes}/>"#),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
