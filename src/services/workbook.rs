//! Read-only view over an xlsx package.
//!
//! Only the parts needed to locate and type data cells are decoded: the sheet list,
//! relationship targets, shared strings, the `cellXfs` number formats and each
//! worksheet's cell grid, merged ranges and column default styles.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};

use chrono::NaiveDate;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zip::result::ZipError;
use zip::ZipArchive;

pub const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
pub const STYLES_PART: &str = "xl/styles.xml";

/// Broad class of an Excel number format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatClass {
    General,
    Numeric,
    Date,
    Text,
}

/// Cell type as declared by the `t` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Number,
    SharedString,
    InlineString,
    FormulaString,
    Boolean,
    Error,
    Date,
}

impl CellKind {
    fn from_attr(t: Option<&str>) -> Self {
        match t {
            Some("s") => CellKind::SharedString,
            Some("inlineStr") => CellKind::InlineString,
            Some("str") => CellKind::FormulaString,
            Some("b") => CellKind::Boolean,
            Some("e") => CellKind::Error,
            Some("d") => CellKind::Date,
            _ => CellKind::Number,
        }
    }
}

/// A decoded worksheet cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub style: Option<u32>,
    pub kind: CellKind,
    /// Resolved display value (shared strings looked up); `None` when the cell is empty.
    pub value: Option<String>,
    pub formula: bool,
}

impl Cell {
    /// Trimmed, non-empty text of the cell.
    pub fn text(&self) -> Option<&str> {
        self.value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Inclusive rectangular range of cells, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub first_row: u32,
    pub first_column: u32,
    pub last_row: u32,
    pub last_column: u32,
}

impl CellRange {
    /// Parses `A1:C3` or a single reference `B2`.
    pub fn parse(reference: &str) -> Result<Self, WorkbookError> {
        let invalid = || WorkbookError::InvalidReference(reference.to_string());
        let (start, end) = reference.split_once(':').unwrap_or((reference, reference));
        let (r1, c1) = parse_cell_ref(start).ok_or_else(invalid)?;
        let (r2, c2) = parse_cell_ref(end).ok_or_else(invalid)?;
        Ok(Self {
            first_row: r1.min(r2),
            first_column: c1.min(c2),
            last_row: r1.max(r2),
            last_column: c1.max(c2),
        })
    }

    pub fn contains(&self, row: u32, column: u32) -> bool {
        (self.first_row..=self.last_row).contains(&row)
            && (self.first_column..=self.last_column).contains(&column)
    }

    pub fn is_anchor(&self, row: u32, column: u32) -> bool {
        self.first_row == row && self.first_column == column
    }
}

#[derive(Debug, Clone, Copy)]
struct ColumnStyle {
    min: u32,
    max: u32,
    style: u32,
}

/// Cell grid of one worksheet.
#[derive(Debug, Clone, Default)]
pub struct Worksheet {
    /// Cells keyed by `(row, column)`, 1-based, in row-major order.
    pub cells: BTreeMap<(u32, u32), Cell>,
    pub merges: Vec<CellRange>,
    columns: Vec<ColumnStyle>,
}

impl Worksheet {
    pub fn cell(&self, row: u32, column: u32) -> Option<&Cell> {
        self.cells.get(&(row, column))
    }

    /// Default style of a column from `<cols>`, if declared.
    pub fn column_style(&self, column: u32) -> Option<u32> {
        self.columns
            .iter()
            .find(|c| (c.min..=c.max).contains(&column))
            .map(|c| c.style)
    }

    /// True when the cell lies inside a merged range without being its anchor.
    pub fn is_merged_away(&self, row: u32, column: u32) -> bool {
        self.merges
            .iter()
            .any(|m| m.contains(row, column) && !m.is_anchor(row, column))
    }

    /// Cells holding non-blank text, row-major.
    pub fn non_empty(&self) -> impl Iterator<Item = ((u32, u32), &str)> {
        self.cells
            .iter()
            .filter_map(|(pos, cell)| cell.text().map(|t| (*pos, t)))
    }
}

/// A worksheet entry from `workbook.xml`, with its resolved part path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    pub name: String,
    pub part: String,
}

/// An opened xlsx package.
pub struct Workbook<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    pub sheets: Vec<SheetEntry>,
    pub date1904: bool,
    shared_strings: Vec<String>,
    cell_formats: Vec<FormatClass>,
}

impl<'a> Workbook<'a> {
    pub fn open(bytes: &'a [u8]) -> Result<Self, WorkbookError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;

        let workbook_xml = read_part(&mut archive, WORKBOOK_PART)?
            .ok_or_else(|| WorkbookError::MissingPart(WORKBOOK_PART.to_string()))?;
        let rels_xml = read_part(&mut archive, WORKBOOK_RELS_PART)?
            .ok_or_else(|| WorkbookError::MissingPart(WORKBOOK_RELS_PART.to_string()))?;

        let (declared, date1904) = parse_workbook(&workbook_xml)?;
        let targets = parse_relationships(&rels_xml)?;
        let sheets = declared
            .into_iter()
            .map(|(name, rel_id)| {
                let target = targets
                    .get(&rel_id)
                    .ok_or_else(|| WorkbookError::MissingPart(format!("relationship {rel_id}")))?;
                Ok(SheetEntry {
                    name,
                    part: resolve_target(target),
                })
            })
            .collect::<Result<Vec<_>, WorkbookError>>()?;

        let shared_strings = match read_part(&mut archive, SHARED_STRINGS_PART)? {
            Some(xml) => parse_shared_strings(&xml)?,
            None => Vec::new(),
        };
        let cell_formats = match read_part(&mut archive, STYLES_PART)? {
            Some(xml) => parse_styles(&xml)?,
            None => Vec::new(),
        };

        Ok(Self {
            archive,
            sheets,
            date1904,
            shared_strings,
            cell_formats,
        })
    }

    pub fn sheet_index(&self, name: &str) -> Option<usize> {
        self.sheets.iter().position(|s| s.name == name)
    }

    /// Number of `cellXfs` entries in the stylesheet.
    pub fn cell_format_count(&self) -> usize {
        self.cell_formats.len()
    }

    /// Number format class of a `cellXfs` style index.
    pub fn format_class(&self, style: u32) -> FormatClass {
        self.cell_formats
            .get(style as usize)
            .copied()
            .unwrap_or(FormatClass::General)
    }

    pub fn worksheet(&mut self, index: usize) -> Result<Worksheet, WorkbookError> {
        let xml = self.sheet_xml(index)?;
        parse_worksheet(&xml, &self.shared_strings)
    }

    /// Raw XML of a worksheet part.
    pub fn sheet_xml(&mut self, index: usize) -> Result<String, WorkbookError> {
        let entry = self
            .sheets
            .get(index)
            .ok_or_else(|| WorkbookError::MissingPart(format!("sheet #{index}")))?;
        let part = entry.part.clone();
        self.part(&part)
    }

    /// Raw XML of any package part.
    pub fn part(&mut self, name: &str) -> Result<String, WorkbookError> {
        read_part(&mut self.archive, name)?
            .ok_or_else(|| WorkbookError::MissingPart(name.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkbookError {
    #[error("not a readable xlsx package: {0}")]
    Zip(#[from] ZipError),

    #[error("failed to read package part: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed XML attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    #[error("package part missing: {0}")]
    MissingPart(String),

    #[error("invalid cell reference: {0}")]
    InvalidReference(String),
}

// ── Cell references ─────────────────────────────────────────────────────

/// `A` → 1, `AB` → 28.
pub fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    letters.chars().try_fold(0u32, |acc, ch| {
        let ch = ch.to_ascii_uppercase();
        ch.is_ascii_uppercase()
            .then(|| acc * 26 + (ch as u32 - 'A' as u32 + 1))
    })
}

/// 1 → `A`, 28 → `AB`.
pub fn column_letters(mut index: u32) -> String {
    let mut letters = Vec::new();
    while index > 0 {
        let rem = (index - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        index = (index - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Parses `B12` (or `$B$12`) into `(row, column)`.
pub fn parse_cell_ref(reference: &str) -> Option<(u32, u32)> {
    let cleaned: String = reference.chars().filter(|c| *c != '$').collect();
    let split = cleaned.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cleaned.split_at(split);
    let column = column_index(letters)?;
    let row: u32 = digits.parse().ok()?;
    (row > 0).then_some((row, column))
}

pub fn cell_ref(row: u32, column: u32) -> String {
    format!("{}{}", column_letters(column), row)
}

// ── Number formats ──────────────────────────────────────────────────────

/// Classifies a number format by its id and, for custom ids, its format code.
pub fn classify_format(id: u32, code: Option<&str>) -> FormatClass {
    if let Some(code) = code {
        return classify_format_code(code);
    }
    match id {
        1..=13 | 37..=44 | 48 => FormatClass::Numeric,
        14..=22 | 45..=47 => FormatClass::Date,
        49 => FormatClass::Text,
        _ => FormatClass::General,
    }
}

fn classify_format_code(code: &str) -> FormatClass {
    if code.eq_ignore_ascii_case("general") {
        return FormatClass::General;
    }

    // Drop quoted literals, escaped characters and bracketed sections
    // (colors, conditions, locales) before looking for format tokens.
    let mut tokens = String::new();
    let mut chars = code.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                for c in chars.by_ref() {
                    if c == '"' {
                        break;
                    }
                }
            }
            '\\' | '_' | '*' => {
                chars.next();
            }
            '[' => {
                let mut section = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    section.push(c);
                }
                // Elapsed-time sections like [h] or [mm] are date/time tokens.
                if !section.is_empty()
                    && section.chars().all(|c| matches!(c, 'h' | 'H' | 'm' | 'M' | 's' | 'S'))
                {
                    tokens.push('h');
                }
            }
            other => tokens.push(other.to_ascii_lowercase()),
        }
    }

    if tokens.contains('@') {
        FormatClass::Text
    } else if tokens.chars().any(|c| matches!(c, 'y' | 'd' | 'h' | 's' | 'm')) {
        FormatClass::Date
    } else if tokens.chars().any(|c| matches!(c, '0' | '#' | '?')) {
        FormatClass::Numeric
    } else {
        FormatClass::General
    }
}

/// Excel serial day number of a date.
pub fn date_serial(date: NaiveDate, date1904: bool) -> i64 {
    let epoch = if date1904 {
        NaiveDate::from_ymd_opt(1904, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(1899, 12, 30)
    }
    .unwrap_or_default();
    (date - epoch).num_days()
}

// ── Part parsing ────────────────────────────────────────────────────────

pub(crate) fn read_part(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, WorkbookError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut xml = String::new();
    file.read_to_string(&mut xml)?;
    Ok(Some(xml))
}

/// Value of the attribute whose qualified or local name is `name`.
pub(crate) fn attr(e: &BytesStart, name: &[u8]) -> Result<Option<String>, WorkbookError> {
    for a in e.attributes() {
        let a = a?;
        if a.key.as_ref() == name || a.key.local_name().as_ref() == name {
            return Ok(Some(a.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn resolve_target(target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = vec!["xl"];
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Sheet `(name, relationship id)` pairs in workbook order, and the 1904 flag.
fn parse_workbook(xml: &str) -> Result<(Vec<(String, String)>, bool), WorkbookError> {
    let mut reader = Reader::from_str(xml);
    let mut sheets = Vec::new();
    let mut date1904 = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"sheet" => {
                    let name = attr(&e, b"name")?.unwrap_or_default();
                    if let Some(rel_id) = attr(&e, b"id")? {
                        sheets.push((name, rel_id));
                    }
                }
                b"workbookPr" => {
                    date1904 = matches!(attr(&e, b"date1904")?.as_deref(), Some("1" | "true"));
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok((sheets, date1904))
}

fn parse_relationships(xml: &str) -> Result<HashMap<String, String>, WorkbookError> {
    let mut reader = Reader::from_str(xml);
    let mut targets = HashMap::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id")?, attr(&e, b"Target")?) {
                    targets.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(targets)
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>, WorkbookError> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut phonetic_depth = 0u32;
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => phonetic_depth += 1,
                b"t" => in_text = phonetic_depth == 0,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(t) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"rPh" => phonetic_depth = phonetic_depth.saturating_sub(1),
                b"t" => in_text = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(strings)
}

/// Format class for every `cellXfs` entry, indexed by style id.
fn parse_styles(xml: &str) -> Result<Vec<FormatClass>, WorkbookError> {
    let mut reader = Reader::from_str(xml);
    let mut custom: HashMap<u32, String> = HashMap::new();
    let mut xf_format_ids = Vec::new();
    let mut in_cell_xfs = false;
    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"numFmt" => {
                    let id = attr(e, b"numFmtId")?.and_then(|v| v.parse().ok());
                    if let (Some(id), Some(code)) = (id, attr(e, b"formatCode")?) {
                        custom.insert(id, code);
                    }
                }
                b"cellXfs" => in_cell_xfs = matches!(event, Event::Start(_)),
                b"xf" if in_cell_xfs => {
                    let id = attr(e, b"numFmtId")?
                        .and_then(|v| v.parse::<u32>().ok())
                        .unwrap_or(0);
                    xf_format_ids.push(id);
                }
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"cellXfs" => in_cell_xfs = false,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(xf_format_ids
        .into_iter()
        .map(|id| classify_format(id, custom.get(&id).map(String::as_str)))
        .collect())
}

enum Capture {
    Value,
    InlineText,
}

struct PendingCell {
    position: (u32, u32),
    style: Option<u32>,
    kind: CellKind,
    raw: String,
    inline: String,
    formula: bool,
}

impl PendingCell {
    fn start(e: &BytesStart, position: (u32, u32)) -> Result<Self, WorkbookError> {
        Ok(Self {
            position,
            style: attr(e, b"s")?.and_then(|s| s.parse().ok()),
            kind: CellKind::from_attr(attr(e, b"t")?.as_deref()),
            raw: String::new(),
            inline: String::new(),
            formula: false,
        })
    }

    fn finish(self, shared: &[String]) -> ((u32, u32), Cell) {
        let value = match self.kind {
            CellKind::SharedString => self
                .raw
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| shared.get(i).cloned()),
            CellKind::InlineString => Some(self.inline),
            _ => Some(self.raw),
        }
        .filter(|v| !v.is_empty());
        (
            self.position,
            Cell {
                style: self.style,
                kind: self.kind,
                value,
                formula: self.formula,
            },
        )
    }
}

/// Row number from `<row r=..>`, defaulting to the row after `previous`.
pub(crate) fn row_number(e: &BytesStart, previous: u32) -> Result<u32, WorkbookError> {
    Ok(attr(e, b"r")?
        .and_then(|r| r.parse().ok())
        .unwrap_or(previous + 1))
}

/// Position from `<c r=..>`, defaulting to the column after `previous` in `row`.
pub(crate) fn cell_position(
    e: &BytesStart,
    row: u32,
    previous_column: u32,
) -> Result<(u32, u32), WorkbookError> {
    match attr(e, b"r")? {
        Some(r) => parse_cell_ref(&r).ok_or(WorkbookError::InvalidReference(r)),
        None => Ok((row, previous_column + 1)),
    }
}

pub(crate) fn parse_worksheet(xml: &str, shared: &[String]) -> Result<Worksheet, WorkbookError> {
    let mut reader = Reader::from_str(xml);
    let mut sheet = Worksheet::default();
    let mut row = 0u32;
    let mut column = 0u32;
    let mut pending: Option<PendingCell> = None;
    let mut capture: Option<Capture> = None;
    let mut phonetic_depth = 0u32;

    loop {
        let event = reader.read_event()?;
        let empty = matches!(event, Event::Empty(_));
        match &event {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"row" => {
                    row = row_number(e, row)?;
                    column = 0;
                }
                b"c" => {
                    let position = cell_position(e, row, column)?;
                    (row, column) = position;
                    let cell = PendingCell::start(e, position)?;
                    if empty {
                        let (pos, cell) = cell.finish(shared);
                        sheet.cells.insert(pos, cell);
                    } else {
                        pending = Some(cell);
                    }
                }
                b"f" => {
                    if let Some(cell) = pending.as_mut() {
                        cell.formula = true;
                    }
                }
                b"v" if !empty => capture = Some(Capture::Value),
                b"t" if !empty && pending.is_some() && phonetic_depth == 0 => {
                    capture = Some(Capture::InlineText)
                }
                b"rPh" if !empty => phonetic_depth += 1,
                b"mergeCell" => {
                    if let Some(reference) = attr(e, b"ref")? {
                        sheet.merges.push(CellRange::parse(&reference)?);
                    }
                }
                b"col" => {
                    let min = attr(e, b"min")?.and_then(|v| v.parse().ok());
                    let max = attr(e, b"max")?.and_then(|v| v.parse().ok());
                    let style = attr(e, b"style")?.and_then(|v| v.parse().ok());
                    if let (Some(min), Some(max), Some(style)) = (min, max, style) {
                        sheet.columns.push(ColumnStyle { min, max, style });
                    }
                }
                _ => {}
            },
            Event::Text(t) => {
                if let (Some(cap), Some(cell)) = (&capture, pending.as_mut()) {
                    let text = t.unescape()?;
                    match cap {
                        Capture::Value => cell.raw.push_str(&text),
                        Capture::InlineText => cell.inline.push_str(&text),
                    }
                }
            }
            Event::CData(t) => {
                if let (Some(cap), Some(cell)) = (&capture, pending.as_mut()) {
                    let text = String::from_utf8_lossy(t);
                    match cap {
                        Capture::Value => cell.raw.push_str(&text),
                        Capture::InlineText => cell.inline.push_str(&text),
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = None,
                b"rPh" => phonetic_depth = phonetic_depth.saturating_sub(1),
                b"c" => {
                    if let Some(cell) = pending.take() {
                        let (pos, cell) = cell.finish(shared);
                        sheet.cells.insert(pos, cell);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(sheet)
}
