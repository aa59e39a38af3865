//! Test fixtures: xlsx templates and PDFs built in memory.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use template_spreader::services::workbook::{parse_cell_ref, Cell, Workbook};

/// `cellXfs` indices available in every built workbook.
pub const STYLE_GENERAL: u32 = 0;
/// `#,##0`
pub const STYLE_NUMBER: u32 = 1;
/// `m/d/yyyy`
pub const STYLE_DATE: u32 = 2;
/// `@`
pub const STYLE_TEXT: u32 = 3;

pub const CORE_PROPERTIES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:creator>Finance</dc:creator></cp:coreProperties>"#;

#[derive(Debug, Clone)]
enum CellEntry {
    Shared(String),
    Inline(String),
    Number(f64, u32),
    Styled(u32),
    Formula(String, f64),
    IsoDate(String),
}

#[derive(Debug, Clone)]
pub struct SheetBuilder {
    name: String,
    cells: BTreeMap<(u32, u32), CellEntry>,
    merges: Vec<String>,
    columns: Vec<(u32, u32, u32)>,
}

impl SheetBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cells: BTreeMap::new(),
            merges: Vec::new(),
            columns: Vec::new(),
        }
    }

    fn set(mut self, reference: &str, entry: CellEntry) -> Self {
        let position = parse_cell_ref(reference).expect("valid cell reference");
        self.cells.insert(position, entry);
        self
    }

    /// Shared-string text cell.
    pub fn text(self, reference: &str, value: &str) -> Self {
        self.set(reference, CellEntry::Shared(value.to_string()))
    }

    pub fn inline(self, reference: &str, value: &str) -> Self {
        self.set(reference, CellEntry::Inline(value.to_string()))
    }

    pub fn number(self, reference: &str, value: f64, style: u32) -> Self {
        self.set(reference, CellEntry::Number(value, style))
    }

    /// Empty cell carrying a style.
    pub fn styled(self, reference: &str, style: u32) -> Self {
        self.set(reference, CellEntry::Styled(style))
    }

    /// `t="d"` cell holding an ISO 8601 date, with no style.
    pub fn iso_date(self, reference: &str, value: &str) -> Self {
        self.set(reference, CellEntry::IsoDate(value.to_string()))
    }

    pub fn formula(self, reference: &str, formula: &str, cached: f64) -> Self {
        self.set(reference, CellEntry::Formula(formula.to_string(), cached))
    }

    pub fn merge(mut self, range: &str) -> Self {
        self.merges.push(range.to_string());
        self
    }

    pub fn column_style(mut self, min: u32, max: u32, style: u32) -> Self {
        self.columns.push((min, max, style));
        self
    }

    fn xml(&self, shared: &mut Vec<String>) -> String {
        let mut out = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><dimension ref="A1"/>"#,
        );
        if !self.columns.is_empty() {
            out.push_str("<cols>");
            for (min, max, style) in &self.columns {
                out.push_str(&format!(
                    r#"<col min="{min}" max="{max}" width="14" style="{style}" customWidth="1"/>"#
                ));
            }
            out.push_str("</cols>");
        }

        out.push_str("<sheetData>");
        let mut current_row = None;
        for ((row, column), entry) in &self.cells {
            if current_row != Some(*row) {
                if current_row.is_some() {
                    out.push_str("</row>");
                }
                out.push_str(&format!(r#"<row r="{row}">"#));
                current_row = Some(*row);
            }
            let reference = template_spreader::services::workbook::cell_ref(*row, *column);
            let cell = match entry {
                CellEntry::Shared(text) => {
                    let index = shared.iter().position(|s| s == text).unwrap_or_else(|| {
                        shared.push(text.clone());
                        shared.len() - 1
                    });
                    format!(r#"<c r="{reference}" t="s"><v>{index}</v></c>"#)
                }
                CellEntry::Inline(text) => {
                    format!(r#"<c r="{reference}" t="inlineStr"><is><t>{text}</t></is></c>"#)
                }
                CellEntry::Number(value, style) => {
                    format!(r#"<c r="{reference}" s="{style}"><v>{value}</v></c>"#)
                }
                CellEntry::Styled(style) => format!(r#"<c r="{reference}" s="{style}"/>"#),
                CellEntry::Formula(formula, cached) => {
                    format!(r#"<c r="{reference}" s="1"><f>{formula}</f><v>{cached}</v></c>"#)
                }
                CellEntry::IsoDate(value) => {
                    format!(r#"<c r="{reference}" t="d"><v>{value}</v></c>"#)
                }
            };
            out.push_str(&cell);
        }
        if current_row.is_some() {
            out.push_str("</row>");
        }
        out.push_str("</sheetData>");

        if !self.merges.is_empty() {
            out.push_str(&format!(r#"<mergeCells count="{}">"#, self.merges.len()));
            for range in &self.merges {
                out.push_str(&format!(r#"<mergeCell ref="{range}"/>"#));
            }
            out.push_str("</mergeCells>");
        }
        out.push_str(r#"<pageMargins left="0.7" right="0.7" top="0.75" bottom="0.75" header="0.3" footer="0.3"/></worksheet>"#);
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct XlsxBuilder {
    sheets: Vec<SheetBuilder>,
    date1904: bool,
}

impl XlsxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sheet(mut self, sheet: SheetBuilder) -> Self {
        self.sheets.push(sheet);
        self
    }

    pub fn date1904(mut self) -> Self {
        self.date1904 = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut shared = Vec::new();
        let sheet_xml: Vec<String> = self.sheets.iter().map(|s| s.xml(&mut shared)).collect();
        let count = self.sheets.len();

        let mut content_types = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/><Override PartName="/xl/sharedStrings.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml"/><Override PartName="/docProps/core.xml" ContentType="application/vnd.openxmlformats-package.core-properties+xml"/>"#,
        );
        for i in 1..=count {
            content_types.push_str(&format!(
                r#"<Override PartName="/xl/worksheets/sheet{i}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#
            ));
        }
        content_types.push_str("</Types>");

        let root_rels = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties" Target="docProps/core.xml"/></Relationships>"#;

        let mut workbook = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">"#,
        );
        if self.date1904 {
            workbook.push_str(r#"<workbookPr date1904="1"/>"#);
        }
        workbook.push_str("<sheets>");
        for (i, sheet) in self.sheets.iter().enumerate() {
            workbook.push_str(&format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                sheet.name,
                i + 1,
                i + 1
            ));
        }
        workbook.push_str("</sheets></workbook>");

        let mut workbook_rels = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        );
        for i in 1..=count {
            workbook_rels.push_str(&format!(
                r#"<Relationship Id="rId{i}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{i}.xml"/>"#
            ));
        }
        workbook_rels.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/><Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings" Target="sharedStrings.xml"/></Relationships>"#,
            count + 1,
            count + 2
        ));

        let styles = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="1"><fill><patternFill patternType="none"/></fill></fills><borders count="1"><border/></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="4"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="3" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/><xf numFmtId="14" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/><xf numFmtId="49" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/></cellXfs></styleSheet>"#;

        let mut strings = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="{0}" uniqueCount="{0}">"#,
            shared.len()
        );
        for s in &shared {
            strings.push_str(&format!("<si><t>{s}</t></si>"));
        }
        strings.push_str("</sst>");

        let mut parts: Vec<(String, String)> = vec![
            ("[Content_Types].xml".into(), content_types),
            ("_rels/.rels".into(), root_rels.into()),
            ("docProps/core.xml".into(), CORE_PROPERTIES.into()),
            ("xl/workbook.xml".into(), workbook),
            ("xl/_rels/workbook.xml.rels".into(), workbook_rels),
            ("xl/styles.xml".into(), styles.into()),
            ("xl/sharedStrings.xml".into(), strings),
        ];
        for (i, xml) in sheet_xml.into_iter().enumerate() {
            parts.push((format!("xl/worksheets/sheet{}.xml", i + 1), xml));
        }
        zip_parts(&parts)
    }
}

/// Zips `(name, content)` pairs in order.
pub fn zip_parts(parts: &[(String, String)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, content) in parts {
        writer.start_file(name.as_str(), options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// The revenue template: years across row 1, "Revenue" in A2, numeric B2:C2 to fill,
/// and an unlabeled note in D3.
pub fn revenue_template() -> Vec<u8> {
    XlsxBuilder::new()
        .sheet(
            SheetBuilder::new("Summary")
                .text("A1", "Metric")
                .text("B1", "2023")
                .text("C1", "2024")
                .text("A2", "Revenue")
                .styled("B2", STYLE_NUMBER)
                .styled("C2", STYLE_NUMBER)
                .text("D3", "Prepared by finance"),
        )
        .build()
}

/// Header and labels but no labeled intersections.
pub fn header_only_template() -> Vec<u8> {
    XlsxBuilder::new()
        .sheet(SheetBuilder::new("Summary").text("A1", "Metric").text("A2", "Revenue"))
        .build()
}

/// Raw content of a package part.
pub fn read_part(xlsx: &[u8], name: &str) -> String {
    let mut archive = ZipArchive::new(Cursor::new(xlsx)).unwrap();
    let mut file = archive.by_name(name).unwrap();
    let mut content = String::new();
    file.read_to_string(&mut content).unwrap();
    content
}

pub fn part_names(xlsx: &[u8]) -> Vec<String> {
    let archive = ZipArchive::new(Cursor::new(xlsx)).unwrap();
    archive.file_names().map(str::to_string).collect::<Vec<_>>()
}

/// Decoded cells of the sheet at `index`.
pub fn sheet_cells(xlsx: &[u8], index: usize) -> BTreeMap<(u32, u32), Cell> {
    let mut workbook = Workbook::open(xlsx).unwrap();
    workbook.worksheet(index).unwrap().cells
}

/// Single-page PDF, one text object per line.
pub fn pdf_with_text(lines: &[&str]) -> Vec<u8> {
    save_pdf(pdf_document(lines))
}

/// Like [`pdf_with_text`], with a standard security handler declared in the trailer.
pub fn encrypted_pdf_with_text(lines: &[&str]) -> Vec<u8> {
    let mut doc = pdf_document(lines);
    let encrypt_id = doc.add_object(dictionary! {
        "Filter" => "Standard",
        "V" => 1,
        "R" => 2,
        "O" => Object::string_literal(vec![0u8; 32]),
        "U" => Object::string_literal(vec![0u8; 32]),
        "P" => -4,
    });
    doc.trailer.set("Encrypt", encrypt_id);
    save_pdf(doc)
}

fn save_pdf(mut doc: Document) -> Vec<u8> {
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

fn pdf_document(lines: &[&str]) -> Document {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut operations = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tf", vec!["F1".into(), 12.into()]));
        operations.push(Operation::new(
            "Td",
            vec![50.into(), (760 - 16 * i as i64).into()],
        ));
        operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
        operations.push(Operation::new("ET", vec![]));
    }
    let content = Content { operations };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc
}
