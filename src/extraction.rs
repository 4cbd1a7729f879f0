//! Text extraction from stored documents.
//!
//! Plain text and Markdown are decoded as UTF-8; PDFs go through `pdf-extract`. Both yield
//! pages split on form feeds (`\x0C`), numbered from 1. Every failure here is permanent: the
//! same bytes will fail the same way on every attempt.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Content types accepted for upload and extraction.
pub const SUPPORTED_CONTENT_TYPES: [&str; 3] = ["text/plain", "text/markdown", "application/pdf"];

const PAGE_BREAK: char = '\u{000C}';

/// One page of extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// 1-based page number.
    pub number: u32,
    /// Extracted text.
    pub text: String,
}

/// Errors raised while extracting text.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// No extractor handles this content type.
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),
    /// Text document was not valid UTF-8.
    #[error("document is not valid UTF-8: {0}")]
    InvalidEncoding(String),
    /// The PDF could not be parsed.
    #[error("failed to parse PDF: {0}")]
    Pdf(String),
    /// The document contains no extractable text.
    #[error("document contains no extractable text")]
    Empty,
}

/// Turns stored bytes into pages of text.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract pages from `bytes` of the given MIME type.
    async fn extract(&self, content_type: &str, bytes: Bytes) -> Result<Vec<Page>, ExtractionError>;
}

/// Whether a declared MIME type is supported. Parameters such as `charset` are ignored.
pub fn is_supported(content_type: &str) -> bool {
    SUPPORTED_CONTENT_TYPES.contains(&essence(content_type).as_str())
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Extractor for text, Markdown and PDF documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl DefaultExtractor {
    /// Construct the extractor.
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for DefaultExtractor {
    async fn extract(&self, content_type: &str, bytes: Bytes) -> Result<Vec<Page>, ExtractionError> {
        let text = match essence(content_type).as_str() {
            "text/plain" | "text/markdown" => String::from_utf8(bytes.to_vec())
                .map_err(|err| ExtractionError::InvalidEncoding(err.to_string()))?,
            "application/pdf" => tokio::task::spawn_blocking(move || {
                pdf_extract::extract_text_from_mem(&bytes)
                    .map_err(|err| ExtractionError::Pdf(err.to_string()))
            })
            .await
            .map_err(|err| ExtractionError::Pdf(err.to_string()))??,
            other => return Err(ExtractionError::UnsupportedContentType(other.to_string())),
        };

        let pages = split_pages(&text);
        if pages.is_empty() {
            return Err(ExtractionError::Empty);
        }
        tracing::debug!(content_type, pages = pages.len(), "Extracted document text");
        Ok(pages)
    }
}

/// Split text on form feeds, dropping blank pages but keeping original page numbers.
pub fn split_pages(text: &str) -> Vec<Page> {
    text.split(PAGE_BREAK)
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(index, page)| Page {
            number: u32::try_from(index + 1).unwrap_or(u32::MAX),
            text: page.trim().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_documents_split_on_form_feed() {
        let pages = DefaultExtractor::new()
            .extract(
                "text/plain; charset=utf-8",
                Bytes::from("first page\u{000C}\u{000C}third page"),
            )
            .await
            .expect("extract");
        assert_eq!(
            pages,
            vec![
                Page {
                    number: 1,
                    text: "first page".into()
                },
                Page {
                    number: 3,
                    text: "third page".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn unsupported_and_broken_inputs_fail() {
        let extractor = DefaultExtractor::new();
        assert!(matches!(
            extractor.extract("image/png", Bytes::from_static(b"x")).await,
            Err(ExtractionError::UnsupportedContentType(_))
        ));
        assert!(matches!(
            extractor
                .extract("text/plain", Bytes::from_static(&[0xff, 0xfe, 0xfd]))
                .await,
            Err(ExtractionError::InvalidEncoding(_))
        ));
        assert!(matches!(
            extractor.extract("text/markdown", Bytes::from_static(b"  \n ")).await,
            Err(ExtractionError::Empty)
        ));
        assert!(matches!(
            extractor
                .extract("application/pdf", Bytes::from_static(b"not a pdf"))
                .await,
            Err(ExtractionError::Pdf(_))
        ));
    }

    #[test]
    fn content_type_support_ignores_parameters_and_case() {
        assert!(is_supported("Text/Markdown; charset=utf-8"));
        assert!(is_supported("application/pdf"));
        assert!(!is_supported("application/zip"));
    }
}
