use std::path::Path;

use mupdf::{Document, TextPageFlags};

use scansplit_core::{Page, PdfBackend, StoreError};

/// Reads the text layer of a scanned PDF, one [`Page`] per PDF page.
///
/// Only this crate links mupdf (AGPL-3.0); everything else sees the
/// [`PdfBackend`] trait.
///
/// Headers and footers are kept: printed page numbers live there. Scans
/// without a text layer yield pages with empty text.
#[derive(Debug, Default, Clone, Copy)]
pub struct MupdfBackend;

impl MupdfBackend {
    pub fn new() -> Self {
        Self
    }
}

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl PdfBackend for MupdfBackend {
    fn extract_pages(&self, path: &Path) -> Result<Vec<Page>, StoreError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| StoreError::Backend(format!("invalid path encoding: {}", path.display())))?;

        let document = Document::open(path_str).map_err(backend_err)?;

        let mut pages = Vec::new();
        for (page_result, number) in document.pages().map_err(backend_err)?.zip(1u32..) {
            let page = page_result.map_err(backend_err)?;
            let text_page = page
                .to_text_page(TextPageFlags::empty())
                .map_err(backend_err)?;

            // Block/line iteration keeps one output line per text line.
            let mut text = String::new();
            for block in text_page.blocks() {
                for line in block.lines() {
                    let line_text: String = line
                        .chars()
                        .map(|c| c.char().unwrap_or('\u{FFFD}'))
                        .collect();
                    text.push_str(&line_text);
                    text.push('\n');
                }
            }
            if text.trim().is_empty() {
                tracing::debug!(path = %path.display(), page = number, "page has no text layer");
            }
            pages.push(Page::new(number, text));
        }

        tracing::debug!(path = %path.display(), pages = pages.len(), "extracted PDF pages");
        Ok(pages)
    }
}
