//! Plain-text page formats produced by OCR tools.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::IngestError;
use scansplit_core::Page;

static TRAILING_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)$").unwrap());

#[derive(Deserialize)]
#[serde(untagged)]
enum SidecarPage {
    Numbered { physical_number: u32, text: String },
    Text(String),
}

/// Parse a JSON page sidecar.
///
/// Either an array of `{"physical_number": n, "text": "..."}` objects, or an
/// array of strings numbered 1.. in array order. Mixing both is allowed;
/// plain strings take their array position as page number.
pub fn parse_json_pages(content: &str) -> Result<Vec<Page>, serde_json::Error> {
    let raw: Vec<SidecarPage> = serde_json::from_str(content)?;
    Ok(raw
        .into_iter()
        .zip(1u32..)
        .map(|(page, position)| match page {
            SidecarPage::Numbered {
                physical_number,
                text,
            } => Page::new(physical_number, text),
            SidecarPage::Text(text) => Page::new(position, text),
        })
        .collect())
}

/// Split a text dump on form feeds, one page per segment.
///
/// A trailing form feed does not start an extra page.
pub fn split_form_feeds(content: &str) -> Vec<Page> {
    let content = content.strip_suffix('\n').unwrap_or(content);
    let content = content.strip_suffix('\x0c').unwrap_or(content);
    content
        .split('\x0c')
        .zip(1u32..)
        .map(|(text, n)| Page::new(n, text.trim_start_matches('\n')))
        .collect()
}

/// Read a directory holding one `.txt` file per page.
///
/// The page number is the run of digits ending the file stem, so
/// `scan_p007.txt` is page 7. Other files are ignored.
pub fn read_page_dir(dir: &Path) -> Result<Vec<Page>, IngestError> {
    let entries = std::fs::read_dir(dir).map_err(|e| IngestError::io(dir, e))?;

    let mut pages = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| IngestError::io(dir, e))?.path();
        let is_txt = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("txt"));
        if !path.is_file() || !is_txt {
            continue;
        }

        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|stem| TRAILING_NUMBER.captures(stem))
            .and_then(|c| c[1].parse::<u32>().ok())
            .ok_or_else(|| IngestError::UnnumberedPageFile(path.clone()))?;
        let text = std::fs::read_to_string(&path).map_err(|e| IngestError::io(&path, e))?;
        pages.push(Page::new(number, text));
    }

    pages.sort_by_key(|p| p.physical_number);
    tracing::debug!(dir = %dir.display(), pages = pages.len(), "read page directory");
    Ok(pages)
}
