use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod formats;
pub mod store;

pub use scansplit_core::{Page, ScanId};
pub use store::FileScanStore;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid page sidecar {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("PDF extraction error: {0}")]
    Pdf(#[from] scansplit_core::StoreError),
    #[error("{0}: page file names must end in a page number")]
    UnnumberedPageFile(PathBuf),
    #[error("unsupported scan input {0} (expected .pdf, .json, .txt or a directory of .txt pages)")]
    Unsupported(PathBuf),
    #[cfg(not(feature = "pdf"))]
    #[error("PDF support not compiled in (enable the `pdf` feature of scansplit-ingest)")]
    NoPdfSupport,
}

impl IngestError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Whether `path` looks like something [`read_pages`] can ingest.
pub fn is_scan_path(path: &Path) -> bool {
    if path.is_dir() {
        return true;
    }
    matches!(extension(path).as_str(), "pdf" | "json" | "txt")
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Read the pages of one scan.
///
/// Dispatches on the input:
/// - directory → one `.txt` file per page, numbered by trailing digits
/// - `.json` → page sidecar (see [`formats::parse_json_pages`])
/// - `.txt` → pages separated by form feeds
/// - `.pdf` → text layer via MuPDF (requires `pdf` feature)
pub fn read_pages(path: &Path) -> Result<Vec<Page>, IngestError> {
    if path.is_dir() {
        return formats::read_page_dir(path);
    }
    match extension(path).as_str() {
        "json" => {
            let content = std::fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
            formats::parse_json_pages(&content).map_err(|source| IngestError::Json {
                path: path.to_path_buf(),
                source,
            })
        }
        "txt" => {
            let content = std::fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
            Ok(formats::split_form_feeds(&content))
        }
        "pdf" => extract_pdf(path),
        _ => Err(IngestError::Unsupported(path.to_path_buf())),
    }
}

#[cfg(feature = "pdf")]
fn extract_pdf(path: &Path) -> Result<Vec<Page>, IngestError> {
    use scansplit_core::PdfBackend;
    Ok(scansplit_pdf_mupdf::MupdfBackend::new().extract_pages(path)?)
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(_path: &Path) -> Result<Vec<Page>, IngestError> {
    Err(IngestError::NoPdfSupport)
}
