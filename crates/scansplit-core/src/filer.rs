//! Destination of finalized documents.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::{LogicalDocument, ScanId};

/// What the filer did with one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub document_id: String,
    /// Where it lives now (a path, a key, ...).
    pub location: String,
    /// The identical document had already been filed by an earlier run.
    pub already_present: bool,
}

#[derive(Error, Debug)]
pub enum FilerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("document {id} already filed at {location} with different content")]
    Conflict { id: String, location: String },
    #[error("source of scan {0} is unknown")]
    SourceMissing(ScanId),
    #[error("{0}")]
    Other(String),
}

/// Files finalized documents.
///
/// `commit` must be idempotent per document id: committing a document that
/// is already present with the same content succeeds without duplicating it.
pub trait Filer: Send + Sync {
    fn commit(&self, document: &LogicalDocument, scan_id: &ScanId)
    -> Result<CommitReceipt, FilerError>;

    /// Move the source scan out of the intake area once every document of it
    /// is filed.
    fn archive_source(&self, _scan_id: &ScanId) -> Result<(), FilerError> {
        Ok(())
    }
}

/// A [`Filer`] that keeps documents in memory. Used for dry runs and tests.
#[derive(Default)]
pub struct MemoryFiler {
    documents: Mutex<HashMap<String, LogicalDocument>>,
    archived: Mutex<HashSet<ScanId>>,
    commit_calls: AtomicUsize,
}

impl MemoryFiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `commit` calls, including idempotent repeats.
    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Filed documents, sorted by id.
    pub fn documents(&self) -> Vec<LogicalDocument> {
        let mut docs: Vec<LogicalDocument> = self
            .documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    pub fn is_archived(&self, scan_id: &ScanId) -> bool {
        self.archived
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(scan_id)
    }
}

impl Filer for MemoryFiler {
    fn commit(
        &self,
        document: &LogicalDocument,
        _scan_id: &ScanId,
    ) -> Result<CommitReceipt, FilerError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let location = format!("memory://{}/{}", document.label, document.id);
        let mut docs = self.documents.lock().unwrap_or_else(|e| e.into_inner());

        let already_present = match docs.get(&document.id) {
            Some(existing) if existing == document => true,
            Some(_) => {
                return Err(FilerError::Conflict {
                    id: document.id.clone(),
                    location,
                });
            }
            None => {
                docs.insert(document.id.clone(), document.clone());
                false
            }
        };

        Ok(CommitReceipt {
            document_id: document.id.clone(),
            location,
            already_present,
        })
    }

    fn archive_source(&self, scan_id: &ScanId) -> Result<(), FilerError> {
        self.archived
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scan_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OrderSource;

    fn doc(title: &str) -> LogicalDocument {
        LogicalDocument {
            id: "scan-001".into(),
            scan_id: ScanId::from("scan"),
            category: "lease".into(),
            label: "Leases".into(),
            title: title.into(),
            ordered_pages: vec![2, 1],
            order_source: OrderSource::Model,
        }
    }

    #[test]
    fn repeat_commit_is_idempotent() {
        let filer = MemoryFiler::new();
        let scan = ScanId::from("scan");
        let first = filer.commit(&doc("Lease"), &scan).unwrap();
        let second = filer.commit(&doc("Lease"), &scan).unwrap();
        assert!(!first.already_present);
        assert!(second.already_present);
        assert_eq!(filer.documents().len(), 1);
        assert_eq!(filer.commit_calls(), 2);
    }

    #[test]
    fn same_id_different_content_conflicts() {
        let filer = MemoryFiler::new();
        let scan = ScanId::from("scan");
        filer.commit(&doc("Lease"), &scan).unwrap();
        assert!(matches!(
            filer.commit(&doc("Other"), &scan),
            Err(FilerError::Conflict { .. })
        ));
    }
}
