//! Files finalized documents as JSON records on disk.
//!
//! Layout: `<output>/<label>/<document id>.json`, one record per document
//! holding its metadata and the page texts in reading order. Records are
//! written to a temp file in the destination directory and persisted
//! without clobbering, so a crashed run never leaves a half-written record
//! and a resumed run recognizes what it already filed.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use scansplit_core::{
    CommitReceipt, Filer, FilerError, LogicalDocument, Page, PageTextStore, ScanId,
};

/// Finds the on-disk source of a scan for archiving.
pub type SourceLocator = Arc<dyn Fn(&ScanId) -> Option<PathBuf> + Send + Sync>;

#[derive(Serialize)]
struct FiledRecord<'a> {
    #[serde(flatten)]
    document: &'a LogicalDocument,
    pages: Vec<&'a Page>,
}

pub struct FsFiler {
    output_dir: PathBuf,
    pages: Arc<dyn PageTextStore>,
    archive: Option<(PathBuf, SourceLocator)>,
}

impl FsFiler {
    /// File under `output_dir`, reading page texts from `pages`.
    pub fn new(output_dir: impl Into<PathBuf>, pages: Arc<dyn PageTextStore>) -> Self {
        Self {
            output_dir: output_dir.into(),
            pages,
            archive: None,
        }
    }

    /// Move each fully filed scan's source into `archive_dir`.
    pub fn with_archive(mut self, archive_dir: impl Into<PathBuf>, locate: SourceLocator) -> Self {
        self.archive = Some((archive_dir.into(), locate));
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Where `document` is (or would be) filed.
    pub fn record_path(&self, document: &LogicalDocument) -> PathBuf {
        self.output_dir
            .join(sanitize(&document.label))
            .join(format!("{}.json", sanitize(&document.id)))
    }

    fn render(&self, document: &LogicalDocument, scan_id: &ScanId) -> Result<Vec<u8>, FilerError> {
        let scan_pages = self
            .pages
            .get_pages(scan_id)
            .map_err(|e| FilerError::Other(format!("cannot read pages of {scan_id}: {e}")))?;
        let by_number: HashMap<u32, &Page> =
            scan_pages.iter().map(|p| (p.physical_number, p)).collect();

        let pages = document
            .ordered_pages
            .iter()
            .map(|n| {
                by_number.get(n).copied().ok_or_else(|| {
                    FilerError::Other(format!("scan {scan_id} has no page {n}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut bytes = serde_json::to_vec_pretty(&FiledRecord { document, pages })?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

impl Filer for FsFiler {
    fn commit(
        &self,
        document: &LogicalDocument,
        scan_id: &ScanId,
    ) -> Result<CommitReceipt, FilerError> {
        let path = self.record_path(document);
        let location = path.display().to_string();
        let bytes = self.render(document, scan_id)?;

        let receipt = |already_present| CommitReceipt {
            document_id: document.id.clone(),
            location: location.clone(),
            already_present,
        };

        if path.exists() {
            return compare_existing(&path, &bytes, document).map(|()| receipt(true));
        }

        let dir = path
            .parent()
            .ok_or_else(|| FilerError::Other(format!("{location} has no parent directory")))?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                tracing::debug!(document = %document.id, path = %location, "record written");
                Ok(receipt(false))
            }
            // Lost a race with another writer of the same id.
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                compare_existing(&path, &bytes, document).map(|()| receipt(true))
            }
            Err(e) => Err(FilerError::Io(e.error)),
        }
    }

    fn archive_source(&self, scan_id: &ScanId) -> Result<(), FilerError> {
        let Some((archive_dir, locate)) = &self.archive else {
            return Ok(());
        };
        let source = locate(scan_id).ok_or_else(|| FilerError::SourceMissing(scan_id.clone()))?;
        let name = source
            .file_name()
            .ok_or_else(|| FilerError::SourceMissing(scan_id.clone()))?;
        let dest = archive_dir.join(name);

        if !source.exists() {
            if dest.exists() {
                // Archived by an earlier run.
                return Ok(());
            }
            return Err(FilerError::SourceMissing(scan_id.clone()));
        }
        if dest.exists() {
            return Err(FilerError::Conflict {
                id: scan_id.to_string(),
                location: dest.display().to_string(),
            });
        }

        std::fs::create_dir_all(archive_dir)?;
        if std::fs::rename(&source, &dest).is_err() {
            // Different filesystem: copy, then remove the original.
            copy_all(&source, &dest)?;
            if source.is_dir() {
                std::fs::remove_dir_all(&source)?;
            } else {
                std::fs::remove_file(&source)?;
            }
        }
        tracing::info!(scan = %scan_id, to = %dest.display(), "source archived");
        Ok(())
    }
}

fn compare_existing(path: &Path, bytes: &[u8], document: &LogicalDocument) -> Result<(), FilerError> {
    let existing = std::fs::read(path)?;
    if existing == bytes {
        tracing::debug!(document = %document.id, "record already present");
        Ok(())
    } else {
        Err(FilerError::Conflict {
            id: document.id.clone(),
            location: path.display().to_string(),
        })
    }
}

fn copy_all(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_all(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(from, to).map(|_| ())
    }
}

/// A single safe path component.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | ' ' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim().to_string();
    if cleaned.is_empty() {
        "unfiled".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_separators_and_dots() {
        assert_eq!(sanitize("Leases"), "Leases");
        assert_eq!(sanitize("Tax / 2024"), "Tax _ 2024");
        assert_eq!(sanitize("../etc"), "_etc");
        assert_eq!(sanitize("   "), "unfiled");
        assert_eq!(sanitize(".hidden"), "hidden");
    }
}
