//! Where page texts come from.
//!
//! Stores are synchronous (PDF extraction and file reads are blocking); the
//! pipeline calls them from `spawn_blocking`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use thiserror::Error;

use crate::{Page, ScanId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("scan {0} not found")]
    NotFound(ScanId),
    #[error("scan {scan} has no pages")]
    Empty { scan: ScanId },
    #[error("scan {scan}: page numbers start at 1")]
    InvalidPage { scan: ScanId },
    #[error("scan {scan}: page {page} appears more than once")]
    DuplicatePage { scan: ScanId, page: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

/// Source of OCR'd page texts, keyed by scan.
pub trait PageTextStore: Send + Sync {
    fn get_pages(&self, scan_id: &ScanId) -> Result<Vec<Page>, StoreError>;
}

/// Text extraction from a scanned PDF.
pub trait PdfBackend: Send + Sync {
    /// One [`Page`] per PDF page, numbered from 1 in file order.
    fn extract_pages(&self, path: &Path) -> Result<Vec<Page>, StoreError>;
}

/// Sort `pages` by physical number and reject empty scans, page 0 and
/// repeated page numbers.
pub fn check_pages(scan_id: &ScanId, mut pages: Vec<Page>) -> Result<Vec<Page>, StoreError> {
    if pages.is_empty() {
        return Err(StoreError::Empty {
            scan: scan_id.clone(),
        });
    }
    pages.sort_by_key(|p| p.physical_number);
    if pages[0].physical_number == 0 {
        return Err(StoreError::InvalidPage {
            scan: scan_id.clone(),
        });
    }
    if let Some(w) = pages
        .windows(2)
        .find(|w| w[0].physical_number == w[1].physical_number)
    {
        return Err(StoreError::DuplicatePage {
            scan: scan_id.clone(),
            page: w[0].physical_number,
        });
    }
    Ok(pages)
}

/// A [`PageTextStore`] backed by a map, for tests and embedding.
#[derive(Default)]
pub struct InMemoryPageStore {
    scans: RwLock<HashMap<ScanId, Vec<Page>>>,
}

impl InMemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, scan_id: impl Into<ScanId>, pages: Vec<Page>) {
        self.scans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scan_id.into(), pages);
    }

    /// Convenience: pages numbered 1.. from `texts`.
    pub fn insert_texts<S: Into<String>>(
        &self,
        scan_id: impl Into<ScanId>,
        texts: impl IntoIterator<Item = S>,
    ) {
        let pages = texts
            .into_iter()
            .zip(1u32..)
            .map(|(text, n)| Page::new(n, text))
            .collect();
        self.insert(scan_id, pages);
    }
}

impl PageTextStore for InMemoryPageStore {
    fn get_pages(&self, scan_id: &ScanId) -> Result<Vec<Page>, StoreError> {
        self.scans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(scan_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(scan_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_pages_sorts() {
        let scan = ScanId::from("s");
        let pages = check_pages(&scan, vec![Page::new(3, "c"), Page::new(1, "a")]).unwrap();
        assert_eq!(
            pages.iter().map(|p| p.physical_number).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn check_pages_rejects_bad_input() {
        let scan = ScanId::from("s");
        assert!(matches!(
            check_pages(&scan, vec![]),
            Err(StoreError::Empty { .. })
        ));
        assert!(matches!(
            check_pages(&scan, vec![Page::new(0, "x")]),
            Err(StoreError::InvalidPage { .. })
        ));
        assert!(matches!(
            check_pages(&scan, vec![Page::new(2, "x"), Page::new(2, "y")]),
            Err(StoreError::DuplicatePage { page: 2, .. })
        ));
    }

    #[test]
    fn memory_store_lookup() {
        let store = InMemoryPageStore::new();
        store.insert_texts("scan-a", ["one", "two"]);
        let pages = store.get_pages(&ScanId::from("scan-a")).unwrap();
        assert_eq!(pages[1], Page::new(2, "two"));
        assert!(matches!(
            store.get_pages(&ScanId::from("missing")),
            Err(StoreError::NotFound(_))
        ));
    }
}
