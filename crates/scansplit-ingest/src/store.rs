use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use scansplit_core::{Page, PageTextStore, ScanId, StoreError};

use crate::{IngestError, read_pages};

/// A [`PageTextStore`] over scan files on disk.
///
/// Scans are registered by path; the scan id is the file stem, suffixed
/// `-2`, `-3`, ... when two inputs share a stem. Pages are read on first
/// use and cached.
#[derive(Default)]
pub struct FileScanStore {
    sources: RwLock<HashMap<ScanId, PathBuf>>,
    cache: RwLock<HashMap<ScanId, Vec<Page>>>,
}

impl FileScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scan input and return its id.
    pub fn register(&self, path: impl Into<PathBuf>) -> ScanId {
        let path = path.into();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("scan")
            .to_string();

        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        let mut id = ScanId::new(stem.clone());
        let mut n = 2;
        while sources.contains_key(&id) {
            id = ScanId::new(format!("{stem}-{n}"));
            n += 1;
        }
        tracing::debug!(scan = %id, path = %path.display(), "registered scan");
        sources.insert(id.clone(), path);
        id
    }

    /// Path a scan was registered from.
    pub fn source_path(&self, scan_id: &ScanId) -> Option<PathBuf> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(scan_id)
            .cloned()
    }

    fn load(&self, scan_id: &ScanId, path: &Path) -> Result<Vec<Page>, StoreError> {
        let pages = read_pages(path).map_err(|e| match e {
            IngestError::Pdf(e) => e,
            IngestError::Io { source, .. } => StoreError::Io(source),
            other => StoreError::Backend(other.to_string()),
        })?;
        tracing::info!(scan = %scan_id, pages = pages.len(), "read scan");
        Ok(pages)
    }
}

impl PageTextStore for FileScanStore {
    fn get_pages(&self, scan_id: &ScanId) -> Result<Vec<Page>, StoreError> {
        if let Some(pages) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(scan_id)
        {
            return Ok(pages.clone());
        }

        let path = self
            .source_path(scan_id)
            .ok_or_else(|| StoreError::NotFound(scan_id.clone()))?;
        let pages = self.load(scan_id, &path)?;
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scan_id.clone(), pages.clone());
        Ok(pages)
    }
}
