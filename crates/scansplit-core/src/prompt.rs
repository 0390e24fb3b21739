//! Instruction text for the grouping and ordering steps.
//!
//! Everything here is a pure function of its inputs: the same taxonomy,
//! policy and pages always render the same prompt, byte for byte. Page texts
//! travel separately as the *context* of a model call (see [`page_context`]).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::taxonomy::{CategoryTaxonomy, GroupingPolicy};
use crate::{CoreError, Page};

const GROUPING_TEMPLATE: &str = r#"You are sorting the pages of one scanned batch that contains several unrelated documents.
The batch has {page_count} pages. Their physical page numbers are: {page_numbers}.
The page texts are supplied separately; each page starts with a "=== PAGE n ===" line carrying its physical page number.

Split the pages into logical documents.
{grouping_policy}

Assign every document exactly one category from this list: {categories}
Category guide:
{category_guide}

Rules:
- Every physical page number must appear in exactly one document.
- Pages of one document do not need to be adjacent in the scan.
- Give each document a short descriptive title of at most 10 words.
- Use the category keys exactly as listed above.

Respond with JSON only, without commentary, in exactly this shape:
[{"category": "<category key>", "title": "<title>", "pages": [<physical page numbers>]}]"#;

const ORDERING_TEMPLATE: &str = r#"The following {page_count} pages belong to one document but may have been scanned out of order.
Their physical page numbers, in scan order, are: {page_numbers}.
The page texts are supplied separately; each page starts with a "=== PAGE n ===" line carrying its physical page number.

Determine the reading order with exactly this procedure:
1. Classify every page as numbered or unnumbered. A page is numbered only if it shows an explicit printed page indicator, such as "Page 1 of 5", "3/10", or a standalone integer near the top or bottom of the page.
2. Sort the numbered pages ascending by their printed number. When two pages show the same printed number, keep them in physical scan order.
3. Append the unnumbered pages after the numbered pages, keeping their original scan order.
4. Report the result using physical page numbers, never printed numbers.

Every physical page number listed above must appear exactly once.
Respond with JSON only, without commentary, in exactly this shape:
{"page_order": [<physical page numbers>]}"#;

/// Render the grouping instructions for `pages` under `taxonomy` and `policy`.
pub fn build_grouping_prompt(
    taxonomy: &CategoryTaxonomy,
    policy: &GroupingPolicy,
    pages: &[Page],
) -> Result<String, CoreError> {
    if taxonomy.is_empty() {
        return Err(CoreError::Config(
            "cannot build a grouping prompt with an empty category taxonomy".into(),
        ));
    }

    let categories = taxonomy.keys().collect::<Vec<_>>().join(", ");
    let guide = taxonomy
        .iter()
        .map(|c| format!("- {}: {}", c.key, c.label))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(GROUPING_TEMPLATE
        .replace("{page_count}", &pages.len().to_string())
        .replace("{page_numbers}", &page_numbers(pages))
        .replace("{grouping_policy}", policy.description().trim())
        .replace("{categories}", &categories)
        .replace("{category_guide}", &guide))
}

/// Render the ordering instructions for the pages of one logical document.
pub fn build_ordering_prompt(pages: &[Page]) -> String {
    ORDERING_TEMPLATE
        .replace("{page_count}", &pages.len().to_string())
        .replace("{page_numbers}", &page_numbers(pages))
}

static PAGE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^=== PAGE (\d+) ===$").unwrap());

/// Render page texts as the context of a model call, in physical order.
///
/// A text line that would read as a page header is indented by one space,
/// so only the headers written here delimit pages.
pub fn page_context(pages: &[Page]) -> String {
    let mut sorted: Vec<&Page> = pages.iter().collect();
    sorted.sort_by_key(|p| p.physical_number);

    let mut out = String::new();
    for page in sorted {
        out.push_str(&format!("=== PAGE {} ===\n", page.physical_number));
        for line in page.text.trim_end().split('\n') {
            if PAGE_HEADER.is_match(line) {
                out.push(' ');
            }
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// Inverse of [`page_context`]. Text before the first header is ignored.
pub fn parse_page_context(context: &str) -> Vec<Page> {
    let headers: Vec<(u32, usize, usize)> = PAGE_HEADER
        .captures_iter(context)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let number = caps[1].parse().ok()?;
            Some((number, whole.start(), whole.end()))
        })
        .collect();

    headers
        .iter()
        .enumerate()
        .map(|(i, &(number, _, body_start))| {
            let body_end = headers
                .get(i + 1)
                .map(|&(_, next_start, _)| next_start)
                .unwrap_or(context.len());
            Page::new(number, context[body_start..body_end].trim_matches('\n'))
        })
        .collect()
}

fn page_numbers(pages: &[Page]) -> String {
    let mut numbers: Vec<u32> = pages.iter().map(|p| p.physical_number).collect();
    numbers.sort_unstable();
    numbers
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
