//! Strict validation of grouping and ordering responses.
//!
//! A response is either accepted as a whole or rejected with the first
//! failing check; nothing is repaired. Checks run in this order: shape,
//! categories, page references, then completeness.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Number, Value};
use thiserror::Error;

use crate::GroupProposal;
use crate::taxonomy::CategoryTaxonomy;

/// Longest title accepted from the grouping step, in words.
pub const MAX_TITLE_WORDS: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unknown category {0:?}")]
    UnknownCategory(String),
    #[error("unknown page reference(s) {0:?}")]
    UnknownPageReference(Vec<i128>),
    #[error("incomplete partition, pages not assigned: {0:?}")]
    IncompletePartition(Vec<u32>),
    #[error("pages assigned more than once: {0:?}")]
    DuplicatePageAssignment(Vec<u32>),
    #[error("incomplete order, pages missing: {0:?}")]
    IncompleteOrder(Vec<u32>),
    #[error("pages repeated in order: {0:?}")]
    DuplicateInOrder(Vec<u32>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    category: String,
    title: String,
    pages: Vec<Number>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOrder {
    page_order: Vec<Number>,
}

/// Page entries as integers of any size; fractions are a shape error.
fn page_refs(numbers: &[Number], whose: &str) -> Result<Vec<i128>, ValidationError> {
    numbers
        .iter()
        .map(|n| {
            n.as_i64()
                .map(i128::from)
                .or_else(|| n.as_u64().map(i128::from))
                .ok_or_else(|| {
                    ValidationError::MalformedResponse(format!(
                        "{whose}: page {n} is not an integer"
                    ))
                })
        })
        .collect()
}

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A```[A-Za-z0-9_-]*[ \t]*\n(.*?)\n?[ \t]*```\z").unwrap());

/// Strip surrounding whitespace and a single enclosing markdown code fence.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    match CODE_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

fn parse_json(raw: &str) -> Result<Value, ValidationError> {
    serde_json::from_str(strip_fence(raw))
        .map_err(|e| ValidationError::MalformedResponse(format!("not valid JSON: {e}")))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Validate a grouping response against every physical page of the scan.
///
/// Returned proposals keep the response order; each proposal's pages are
/// ascending.
pub fn validate_grouping(
    raw: &str,
    all_pages: &[u32],
    taxonomy: &CategoryTaxonomy,
) -> Result<Vec<GroupProposal>, ValidationError> {
    let items = match parse_json(raw)? {
        Value::Array(items) => items,
        Value::Object(map) => {
            let mut arrays = map.into_iter().filter(|(_, v)| v.is_array());
            match (arrays.next(), arrays.next()) {
                (Some((_, Value::Array(items))), None) => items,
                (None, _) => {
                    return Err(ValidationError::MalformedResponse(
                        "object has no array-valued field".into(),
                    ));
                }
                _ => {
                    return Err(ValidationError::MalformedResponse(
                        "object has more than one array-valued field".into(),
                    ));
                }
            }
        }
        other => {
            return Err(ValidationError::MalformedResponse(format!(
                "expected an array of documents, got {}",
                kind(&other)
            )));
        }
    };

    if items.is_empty() {
        return Err(ValidationError::MalformedResponse(
            "response lists no documents".into(),
        ));
    }

    let mut groups = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let group: RawGroup = serde_json::from_value(item).map_err(|e| {
            ValidationError::MalformedResponse(format!("document {}: {e}", i + 1))
        })?;
        let words = group.title.split_whitespace().count();
        if words == 0 {
            return Err(ValidationError::MalformedResponse(format!(
                "document {} has an empty title",
                i + 1
            )));
        }
        if words > MAX_TITLE_WORDS {
            return Err(ValidationError::MalformedResponse(format!(
                "document {} title has {words} words (max {MAX_TITLE_WORDS})",
                i + 1
            )));
        }
        if group.pages.is_empty() {
            return Err(ValidationError::MalformedResponse(format!(
                "document {} has no pages",
                i + 1
            )));
        }
        let pages = page_refs(&group.pages, &format!("document {}", i + 1))?;
        groups.push((group, pages));
    }

    if let Some((g, _)) = groups.iter().find(|(g, _)| !taxonomy.contains(&g.category)) {
        return Err(ValidationError::UnknownCategory(g.category.clone()));
    }

    let known: BTreeSet<u32> = all_pages.iter().copied().collect();
    let counts = count_pages(groups.iter().flat_map(|(_, p)| p.iter().copied()), &known)?;

    let missing: Vec<u32> = known
        .iter()
        .copied()
        .filter(|p| !counts.contains_key(p))
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::IncompletePartition(missing));
    }

    let duplicated = repeated(&counts);
    if !duplicated.is_empty() {
        return Err(ValidationError::DuplicatePageAssignment(duplicated));
    }

    Ok(groups
        .into_iter()
        .map(|(g, refs)| {
            // All entries are known pages at this point.
            let mut pages: Vec<u32> = refs.into_iter().map(|p| p as u32).collect();
            pages.sort_unstable();
            GroupProposal {
                category: g.category,
                title: g.title.split_whitespace().collect::<Vec<_>>().join(" "),
                pages,
            }
        })
        .collect())
}

/// Validate an ordering response for the pages of one group.
///
/// The accepted order must be a permutation of exactly `group_pages`.
pub fn validate_ordering(raw: &str, group_pages: &[u32]) -> Result<Vec<u32>, ValidationError> {
    let value = parse_json(raw)?;
    if !value.is_object() {
        return Err(ValidationError::MalformedResponse(format!(
            "expected an object with `page_order`, got {}",
            kind(&value)
        )));
    }
    let order: RawOrder = serde_json::from_value(value)
        .map_err(|e| ValidationError::MalformedResponse(e.to_string()))?;
    let refs = page_refs(&order.page_order, "page_order")?;

    let known: BTreeSet<u32> = group_pages.iter().copied().collect();
    let counts = count_pages(refs.iter().copied(), &known)?;

    let missing: Vec<u32> = known
        .iter()
        .copied()
        .filter(|p| !counts.contains_key(p))
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::IncompleteOrder(missing));
    }

    let duplicated = repeated(&counts);
    if !duplicated.is_empty() {
        return Err(ValidationError::DuplicateInOrder(duplicated));
    }

    Ok(refs.into_iter().map(|p| p as u32).collect())
}

/// Count occurrences of each page, rejecting any page outside `known`.
fn count_pages(
    pages: impl Iterator<Item = i128>,
    known: &BTreeSet<u32>,
) -> Result<BTreeMap<u32, usize>, ValidationError> {
    let mut counts = BTreeMap::new();
    let mut unknown = BTreeSet::new();
    for p in pages {
        match u32::try_from(p) {
            Ok(n) if known.contains(&n) => *counts.entry(n).or_insert(0) += 1,
            _ => {
                unknown.insert(p);
            }
        }
    }
    if unknown.is_empty() {
        Ok(counts)
    } else {
        Err(ValidationError::UnknownPageReference(
            unknown.into_iter().collect(),
        ))
    }
}

fn repeated(counts: &BTreeMap<u32, usize>) -> Vec<u32> {
    counts
        .iter()
        .filter(|&(_, &n)| n > 1)
        .map(|(&p, _)| p)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxonomy() -> CategoryTaxonomy {
        CategoryTaxonomy::from_pairs([("invoice", "Invoices"), ("letter", "Letters")]).unwrap()
    }

    const ALL: [u32; 5] = [1, 2, 3, 4, 5];

    // ── grouping ───────────────────────────────────────────────────────

    #[test]
    fn accepts_exact_partition() {
        let raw = r#"[
            {"category": "invoice", "title": "ACME invoice 4411", "pages": [3, 1]},
            {"category": "letter", "title": "Letter from the bank", "pages": [5, 2, 4]}
        ]"#;
        let groups = validate_grouping(raw, &ALL, &taxonomy()).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].pages, vec![1, 3]);
        assert_eq!(groups[1].pages, vec![2, 4, 5]);
        assert_eq!(groups[1].title, "Letter from the bank");
    }

    #[test]
    fn accepts_array_wrapped_in_object_and_code_fence() {
        let raw = "```json\n{\"documents\": [{\"category\": \"letter\", \"title\": \"All\", \"pages\": [1,2,3,4,5]}]}\n```";
        let groups = validate_grouping(raw, &ALL, &taxonomy()).unwrap();
        assert_eq!(groups[0].category, "letter");
    }

    #[test]
    fn missing_page_is_incomplete_partition() {
        let raw = r#"[{"category": "invoice", "title": "Invoice", "pages": [1, 2, 3, 5]}]"#;
        assert_eq!(
            validate_grouping(raw, &ALL, &taxonomy()),
            Err(ValidationError::IncompletePartition(vec![4]))
        );
    }

    #[test]
    fn page_in_two_groups_is_duplicate_assignment() {
        let raw = r#"[
            {"category": "invoice", "title": "Invoice", "pages": [1, 2, 3]},
            {"category": "letter", "title": "Letter", "pages": [3, 4, 5]}
        ]"#;
        assert_eq!(
            validate_grouping(raw, &ALL, &taxonomy()),
            Err(ValidationError::DuplicatePageAssignment(vec![3]))
        );
    }

    #[test]
    fn unknown_category_rejected_before_pages() {
        let raw = r#"[{"category": "receipt", "title": "Receipt", "pages": [1, 2, 3, 4, 99]}]"#;
        assert_eq!(
            validate_grouping(raw, &ALL, &taxonomy()),
            Err(ValidationError::UnknownCategory("receipt".into()))
        );
    }

    #[test]
    fn out_of_range_pages_are_unknown_references() {
        let raw = r#"[{"category": "invoice", "title": "Invoice", "pages": [1, 2, 3, 4, 5, 0, -2, 6]}]"#;
        assert_eq!(
            validate_grouping(raw, &ALL, &taxonomy()),
            Err(ValidationError::UnknownPageReference(vec![-2, 0, 6]))
        );
    }

    #[test]
    fn shape_errors_are_malformed() {
        let cases = [
            "not json at all",
            r#"{"category": "invoice"}"#,
            r#"{"a": [], "b": []}"#,
            "[]",
            r#"[{"category": "invoice", "pages": [1, 2, 3, 4, 5]}]"#,
            r#"[{"category": "invoice", "title": "x", "pages": ["1", 2, 3, 4, 5]}]"#,
            r#"[{"category": "invoice", "title": "x", "pages": [1.5, 2, 3, 4, 5]}]"#,
            r#"[{"category": "invoice", "title": "   ", "pages": [1, 2, 3, 4, 5]}]"#,
            r#"[{"category": "invoice", "title": "x", "pages": []}, {"category": "letter", "title": "y", "pages": [1, 2, 3, 4, 5]}]"#,
            r#"[{"category": "invoice", "title": "one two three four five six seven eight nine ten eleven", "pages": [1, 2, 3, 4, 5]}]"#,
            r#"[{"category": "invoice", "title": "x", "pages": [1, 2, 3, 4, 5], "confidence": 0.2}]"#,
        ];
        for raw in cases {
            assert!(
                matches!(
                    validate_grouping(raw, &ALL, &taxonomy()),
                    Err(ValidationError::MalformedResponse(_))
                ),
                "expected MalformedResponse for {raw}"
            );
        }
    }

    #[test]
    fn ten_word_title_is_accepted() {
        let raw = r#"[{"category": "invoice", "title": "one two three four five six seven eight nine ten", "pages": [1, 2, 3, 4, 5]}]"#;
        assert!(validate_grouping(raw, &ALL, &taxonomy()).is_ok());
    }

    #[test]
    fn huge_page_numbers_are_unknown_references() {
        let raw = r#"[{"category": "invoice", "title": "x", "pages": [1, 2, 3, 4, 5, 18446744073709551615]}]"#;
        assert_eq!(
            validate_grouping(raw, &ALL, &taxonomy()),
            Err(ValidationError::UnknownPageReference(vec![18446744073709551615]))
        );
        assert_eq!(
            validate_ordering(r#"{"page_order": [12, 10, 5, 8, 4294967297]}"#, &GROUP),
            Err(ValidationError::UnknownPageReference(vec![4294967297]))
        );
    }

    // ── ordering ───────────────────────────────────────────────────────

    const GROUP: [u32; 4] = [5, 8, 10, 12];

    #[test]
    fn accepts_permutation() {
        let order = validate_ordering(r#"{"page_order": [12, 10, 5, 8]}"#, &GROUP).unwrap();
        assert_eq!(order, vec![12, 10, 5, 8]);
    }

    #[test]
    fn foreign_page_rejected() {
        assert_eq!(
            validate_ordering(r#"{"page_order": [5, 8, 10, 13]}"#, &GROUP),
            Err(ValidationError::UnknownPageReference(vec![13]))
        );
    }

    #[test]
    fn dropped_page_is_incomplete_order() {
        assert_eq!(
            validate_ordering(r#"{"page_order": [12, 10, 5]}"#, &GROUP),
            Err(ValidationError::IncompleteOrder(vec![8]))
        );
    }

    #[test]
    fn repeated_page_is_duplicate_in_order() {
        assert_eq!(
            validate_ordering(r#"{"page_order": [12, 10, 5, 8, 5]}"#, &GROUP),
            Err(ValidationError::DuplicateInOrder(vec![5]))
        );
    }

    #[test]
    fn ordering_shape_errors_are_malformed() {
        for raw in [
            "[12, 10, 5, 8]",
            r#"{"order": [12, 10, 5, 8]}"#,
            r#"{"page_order": "12,10,5,8"}"#,
            r#"{"page_order": [12, 10, 5, 8], "reasoning": "page 12 says Page 1"}"#,
            r#"{"page_order": [12, 10, 5, 8.0]}"#,
            "",
        ] {
            assert!(
                matches!(
                    validate_ordering(raw, &GROUP),
                    Err(ValidationError::MalformedResponse(_))
                ),
                "expected MalformedResponse for {raw:?}"
            );
        }
    }
}
