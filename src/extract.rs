use bytes::Bytes;
use docx_rs::DocumentChild;

use crate::models::DocumentKind;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("invalid PDF: {0}")]
    Pdf(String),
    #[error("invalid DOCX: {0}")]
    Docx(String),
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("parser crashed: {0}")]
    Panicked(String),
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Pull plain text out of a document. Unknown suffixes yield an empty string.
pub fn extract_text(bytes: &[u8], filename: &str) -> Result<String, ExtractionError> {
    match DocumentKind::from_filename(filename) {
        Some(DocumentKind::Pdf) => extract_pdf(bytes),
        Some(DocumentKind::Docx) => extract_docx(bytes),
        Some(DocumentKind::Txt) => Ok(String::from_utf8(bytes.to_vec())?),
        None => Ok(String::new()),
    }
}

/// Extraction as seen by the prompt: failures become a visible marker instead
/// of an error. Parsing runs on the blocking pool so a slow or crashing
/// parser never stalls the runtime.
pub async fn extract_or_marker(bytes: Bytes, filename: &str) -> String {
    let name = filename.to_string();
    let result = tokio::task::spawn_blocking(move || extract_text(&bytes, &name))
        .await
        .unwrap_or_else(|e| Err(ExtractionError::Panicked(e.to_string())));

    match result {
        Ok(text) => {
            tracing::debug!(filename, chars = text.len(), "extracted document text");
            text
        }
        Err(e) => {
            tracing::warn!(filename, error = %e, "document extraction failed");
            error_marker(filename, &e)
        }
    }
}

pub fn error_marker(filename: &str, err: &ExtractionError) -> String {
    format!("[Error reading file {}: {}]", filename, err)
}

// ── Format readers ───────────────────────────────────────────────────────────

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractionError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractionError::Pdf(e.to_string()))?;
    let mut text = String::new();
    for page in pages {
        text.push_str(&page);
        text.push('\n');
    }
    Ok(text)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractionError> {
    let docx = docx_rs::read_docx(bytes).map_err(|e| ExtractionError::Docx(e.to_string()))?;
    let mut text = String::new();
    for child in &docx.document.children {
        if let DocumentChild::Paragraph(p) = child {
            text.push_str(&p.raw_text());
            text.push('\n');
        }
    }
    Ok(text)
}
