//! Document text extraction.
//!
//! Each document is handled on its own; a failure is recorded on that document's entry
//! and the batch carries on. Only a batch in which no document yields text is an error.

use lopdf::Document;
use tracing::{debug, warn};

use crate::models::extraction::{ExtractedDocument, ExtractedText};

const PDF_MAGIC: &[u8] = b"%PDF";
const TEXT_EXTENSIONS: &[&str] = &["txt", "csv", "md", "json"];

/// One input document. `bytes` is `None` when the blob was missing from storage.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub source_name: String,
    pub bytes: Option<Vec<u8>>,
}

impl DocumentInput {
    pub fn new(source_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source_name: source_name.into(),
            bytes: Some(bytes),
        }
    }

    pub fn missing(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            bytes: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("no input documents were provided")]
    NoDocuments,

    #[error("none of the {count} input documents yielded text")]
    AllFailed { count: usize },
}

/// Why a single document produced no text.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document not found in storage")]
    Missing,

    #[error("unreadable PDF: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("PDF is encrypted")]
    Encrypted,

    #[error("unsupported document format")]
    Unsupported,

    #[error("no extractable text")]
    NoText,
}

/// Extracts text from every document, in order.
pub fn extract_texts(documents: &[DocumentInput]) -> Result<ExtractedText, ExtractionError> {
    if documents.is_empty() {
        return Err(ExtractionError::NoDocuments);
    }

    let documents: Vec<ExtractedDocument> = documents
        .iter()
        .map(|doc| match extract_document(doc) {
            Ok(text) => {
                debug!(
                    source = %doc.source_name,
                    chars = text.chars().count(),
                    "Extracted document text"
                );
                ExtractedDocument::succeeded(&doc.source_name, text)
            }
            Err(e) => {
                warn!(source = %doc.source_name, error = %e, "Document text extraction failed");
                ExtractedDocument::failed(&doc.source_name, e.to_string())
            }
        })
        .collect();

    if documents.iter().all(|d| !d.extraction_succeeded) {
        return Err(ExtractionError::AllFailed {
            count: documents.len(),
        });
    }
    Ok(ExtractedText { documents })
}

fn extract_document(doc: &DocumentInput) -> Result<String, DocumentError> {
    let bytes = doc.bytes.as_deref().ok_or(DocumentError::Missing)?;
    let text = if bytes.starts_with(PDF_MAGIC) {
        extract_pdf_text(bytes)?
    } else if is_text_document(&doc.source_name) {
        std::str::from_utf8(bytes)
            .map_err(|_| DocumentError::Unsupported)?
            .to_string()
    } else {
        return Err(DocumentError::Unsupported);
    };

    if text.trim().is_empty() {
        return Err(DocumentError::NoText);
    }
    Ok(text)
}

/// Text of all pages in page order. Pages whose content cannot be decoded are skipped.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String, DocumentError> {
    let document = Document::load_mem(bytes)?;
    if document.is_encrypted() {
        return Err(DocumentError::Encrypted);
    }

    let mut text = String::new();
    for page in document.get_pages().into_keys() {
        match document.extract_text(&[page]) {
            Ok(page_text) => text.push_str(&page_text),
            Err(e) => debug!(page, error = %e, "Skipping undecodable PDF page"),
        }
    }
    Ok(text)
}

fn is_text_document(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}
