//! Document standardizer (C6 stage 1): dispatches on file extension to produce structure-
//! marked plain text, per §4.6.1. The PDF/presentation/word-processing parsers themselves
//! are external collaborators (per spec §1 scope) — this module defines the pluggable
//! extractor traits and the cascade/dispatch logic around them, not the parsers.

use std::path::Path;
use std::sync::Arc;

use scraper::Html;

use crate::error::{Error, Result};

/// The tagged variant over file extension driving standardizer dispatch (§9 design note:
/// "dynamic dispatch over document types ... a tagged variant ... with a default reject
/// arm").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Markdown,
    Html,
    Pdf,
    Presentation,
    WordProcessing,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Some(match ext.as_str() {
            "txt" => DocumentKind::PlainText,
            "md" => DocumentKind::Markdown,
            "html" | "htm" => DocumentKind::Html,
            "pdf" => DocumentKind::Pdf,
            "ppt" | "pptx" => DocumentKind::Presentation,
            "doc" | "docx" => DocumentKind::WordProcessing,
            _ => return None,
        })
    }
}

/// One page's extracted text, keyed by 1-based page number. An extractor that cannot read a
/// particular page still contributes an entry with empty text, so page numbering stays
/// stable for the chunker's marker-split stage (§4.6.1).
pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<String>>;
}

/// A slide's extracted content: an optional detected title, plus body text.
pub struct Slide {
    pub title: Option<String>,
    pub body: String,
}

pub trait PresentationExtractor: Send + Sync {
    fn extract_slides(&self, bytes: &[u8]) -> Result<Vec<Slide>>;
}

/// A paragraph's extracted content: heading level 1-6 if the paragraph used a heading
/// style, `None` for body text.
pub struct Paragraph {
    pub heading_level: Option<u8>,
    pub text: String,
}

pub trait WordProcessingExtractor: Send + Sync {
    fn extract_paragraphs(&self, bytes: &[u8]) -> Result<Vec<Paragraph>>;
}

/// Tries each extractor in order, keeping the first one that yields non-empty pages —
/// mirrors the original source's PyPDF2 → PyMuPDF → pdfminer cascade (§4.6.1 "cascade of
/// extractors, primary with fallbacks").
pub struct CascadingPdfExtractor {
    extractors: Vec<Arc<dyn PdfExtractor>>,
}

impl CascadingPdfExtractor {
    pub fn new(extractors: Vec<Arc<dyn PdfExtractor>>) -> Self {
        Self { extractors }
    }
}

impl PdfExtractor for CascadingPdfExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<String>> {
        for extractor in &self.extractors {
            if let Ok(pages) = extractor.extract_pages(bytes) {
                if pages.iter().any(|p| !p.trim().is_empty()) {
                    return Ok(pages);
                }
            }
        }
        Ok(Vec::new())
    }
}

/// The set of pluggable parsers the standardizer dispatches to. Constructed once by the
/// caller (the Orchestrator's wiring code) and shared across every ingestion run.
pub struct Standardizer {
    pub pdf: Arc<dyn PdfExtractor>,
    pub presentation: Arc<dyn PresentationExtractor>,
    pub word_processing: Arc<dyn WordProcessingExtractor>,
}

impl Standardizer {
    /// Produces structure-marked text for `path`, or `Err(ParseError)` for an unrecognized
    /// extension / empty result. Caller (the ingestion pipeline) treats an empty string as
    /// "skip this file" per §4.6 stage 1.
    pub async fn standardize(&self, path: &Path) -> Result<String> {
        let kind = DocumentKind::from_path(path).ok_or_else(|| {
            Error::parse(path.display().to_string(), "unrecognized document extension")
        })?;

        let text = match kind {
            DocumentKind::PlainText | DocumentKind::Markdown => {
                let bytes = tokio::fs::read(path).await?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            DocumentKind::Html => {
                let bytes = tokio::fs::read(path).await?;
                let html = String::from_utf8_lossy(&bytes);
                html_to_text(&html)
            }
            DocumentKind::Pdf => {
                let bytes = tokio::fs::read(path).await?;
                let pages = self
                    .pdf
                    .extract_pages(&bytes)
                    .map_err(|e| Error::parse(path.display().to_string(), e.to_string()))?;
                render_pages(&pages)
            }
            DocumentKind::Presentation => {
                let bytes = tokio::fs::read(path).await?;
                let slides = self
                    .presentation
                    .extract_slides(&bytes)
                    .map_err(|e| Error::parse(path.display().to_string(), e.to_string()))?;
                render_slides(&slides)
            }
            DocumentKind::WordProcessing => {
                let bytes = tokio::fs::read(path).await?;
                let paragraphs = self
                    .word_processing
                    .extract_paragraphs(&bytes)
                    .map_err(|e| Error::parse(path.display().to_string(), e.to_string()))?;
                render_paragraphs(&paragraphs)
            }
        };

        if text.trim().is_empty() {
            return Err(Error::parse(path.display().to_string(), "standardizer produced no text"));
        }
        Ok(text)
    }
}

fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_pages(pages: &[String]) -> String {
    let mut out = String::new();
    for (idx, page) in pages.iter().enumerate() {
        out.push_str(&format!("=== Page {} ===\n", idx + 1));
        out.push_str(page);
        out.push('\n');
    }
    out
}

fn render_slides(slides: &[Slide]) -> String {
    let mut out = String::new();
    for (idx, slide) in slides.iter().enumerate() {
        out.push_str(&format!("=== Slide {} ===\n", idx + 1));
        if let Some(title) = &slide.title {
            out.push_str(&format!("# {title}\n"));
        }
        out.push_str(&slide.body);
        out.push('\n');
    }
    out
}

fn render_paragraphs(paragraphs: &[Paragraph]) -> String {
    let mut out = String::new();
    for paragraph in paragraphs {
        if let Some(level) = paragraph.heading_level {
            let level = level.clamp(1, 6) as usize;
            out.push_str(&"#".repeat(level));
            out.push(' ');
        }
        out.push_str(&paragraph.text);
        out.push('\n');
    }
    out
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A deterministic stand-in used where tests need an extractor but don't have a real
    /// PDF/PPTX/DOCX parser wired in — returns whatever pages/slides/paragraphs it was
    /// constructed with.
    pub struct FixedPdfExtractor(pub Vec<String>);
    impl PdfExtractor for FixedPdfExtractor {
        fn extract_pages(&self, _bytes: &[u8]) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    pub struct EmptyPdfExtractor;
    impl PdfExtractor for EmptyPdfExtractor {
        fn extract_pages(&self, _bytes: &[u8]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    pub struct FixedPresentationExtractor(pub Vec<Slide>);
    impl PresentationExtractor for FixedPresentationExtractor {
        fn extract_slides(&self, _bytes: &[u8]) -> Result<Vec<Slide>> {
            Ok(self.0.iter().map(|s| Slide { title: s.title.clone(), body: s.body.clone() }).collect())
        }
    }

    pub struct FixedWordExtractor(pub Vec<(Option<u8>, String)>);
    impl WordProcessingExtractor for FixedWordExtractor {
        fn extract_paragraphs(&self, _bytes: &[u8]) -> Result<Vec<Paragraph>> {
            Ok(self
                .0
                .iter()
                .map(|(level, text)| Paragraph { heading_level: *level, text: text.clone() })
                .collect())
        }
    }
}
