//! Category taxonomy and grouping policy supplied by configuration.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// One category: the key the model must answer with, and where documents
/// of that category are filed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub key: String,
    pub label: String,
}

/// Ordered mapping from category key to destination label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryTaxonomy {
    categories: Vec<Category>,
}

impl CategoryTaxonomy {
    /// Build a taxonomy, rejecting blank or repeated keys.
    ///
    /// An empty list is accepted here; prompt rendering rejects it.
    pub fn new(categories: Vec<Category>) -> Result<Self, CoreError> {
        let mut seen = HashSet::new();
        for c in &categories {
            let key = c.key.trim();
            if key.is_empty() {
                return Err(CoreError::Config("category key must not be blank".into()));
            }
            if key != c.key {
                return Err(CoreError::Config(format!(
                    "category key {:?} has surrounding whitespace",
                    c.key
                )));
            }
            if key.contains(',') {
                return Err(CoreError::Config(format!(
                    "category key {:?} must not contain a comma",
                    c.key
                )));
            }
            if !seen.insert(key.to_string()) {
                return Err(CoreError::Config(format!(
                    "category key {:?} is defined twice",
                    c.key
                )));
            }
        }
        Ok(Self { categories })
    }

    pub fn from_pairs<I, K, L>(pairs: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = (K, L)>,
        K: Into<String>,
        L: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(key, label)| Category {
                    key: key.into(),
                    label: label.into(),
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|c| c.key.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.categories.iter().any(|c| c.key == key)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.categories
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.label.as_str())
    }
}

/// How the grouping step decides where one document ends and the next begins.
///
/// Deployments use different rules and none is canonical, so the policy is
/// always chosen explicitly and rendered into the grouping prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupingPolicy {
    /// Pages of one real-world packet or transaction stay together.
    Packet,
    /// Every distinct title starts a new document.
    DistinctTitle,
    /// Free-form instructions from configuration.
    Custom(String),
}

const PACKET_RULES: &str = "Group pages that belong to the same real-world packet or \
transaction into one document, even when individual pages carry different headings \
(for example an invoice together with its remittance slip and attached statement). \
Start a new document only when the sender, subject, or transaction clearly changes.";

const DISTINCT_TITLE_RULES: &str = "Treat every distinct document title or heading as \
its own document. Continuation pages and attachments without their own title belong \
to the document they continue. Two pages with different titles never share a document.";

impl GroupingPolicy {
    pub fn name(&self) -> &str {
        match self {
            GroupingPolicy::Packet => "packet",
            GroupingPolicy::DistinctTitle => "distinct-title",
            GroupingPolicy::Custom(_) => "custom",
        }
    }

    /// The rule text embedded in the grouping prompt.
    pub fn description(&self) -> &str {
        match self {
            GroupingPolicy::Packet => PACKET_RULES,
            GroupingPolicy::DistinctTitle => DISTINCT_TITLE_RULES,
            GroupingPolicy::Custom(text) => text.as_str(),
        }
    }
}

impl FromStr for GroupingPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "packet" => Ok(GroupingPolicy::Packet),
            "distinct-title" | "distinct_title" => Ok(GroupingPolicy::DistinctTitle),
            other => Err(CoreError::Config(format!(
                "unknown grouping policy {other:?} (expected `packet` or `distinct-title`)"
            ))),
        }
    }
}
