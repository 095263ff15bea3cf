//! Category registry: maps event kinds to named categories.
//!
//! A category entry is an exact kind or a prefix pattern ending in `*`
//! (`task.*`). The table is built once at startup and never mutated, so it is
//! shared behind an `Arc` without locking.

use std::collections::{BTreeMap, BTreeSet};

/// Default category table used when configuration supplies none.
///
/// Expected payload keys per kind are documented on the typed data structs
/// in `agentbus_protocol::event_bus`.
const DEFAULT_CATEGORIES: &[(&str, &[&str])] = &[
    ("workflow", &["workflow.*"]),
    ("task", &["task.*"]),
    ("collaboration", &["collaboration.*", "task.*"]),
    ("agent", &["agent.*"]),
    ("requirements", &["requirement.*", "user_story.*"]),
    ("development", &["code.*", "api.*"]),
    ("quality", &["test.*", "review.*"]),
];

#[derive(Debug, Clone, Default)]
pub struct CategoryRegistry {
    categories: BTreeMap<String, Vec<String>>,
}

impl CategoryRegistry {
    pub fn new(categories: BTreeMap<String, Vec<String>>) -> Self {
        let categories = categories
            .into_iter()
            .map(|(name, kinds)| {
                let mut seen = BTreeSet::new();
                let kinds = kinds
                    .into_iter()
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty() && seen.insert(k.clone()))
                    .collect();
                (name, kinds)
            })
            .collect();
        Self { categories }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_CATEGORIES
                .iter()
                .map(|(name, kinds)| {
                    (
                        name.to_string(),
                        kinds.iter().map(|k| k.to_string()).collect(),
                    )
                })
                .collect(),
        )
    }

    /// Categories containing `kind`. Unknown kinds classify to the empty set.
    pub fn classify(&self, kind: &str) -> BTreeSet<&str> {
        self.categories
            .iter()
            .filter(|(_, patterns)| patterns.iter().any(|p| kind_matches(p, kind)))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Whether `category` contains `kind`.
    pub fn includes(&self, category: &str, kind: &str) -> bool {
        self.categories
            .get(category)
            .is_some_and(|patterns| patterns.iter().any(|p| kind_matches(p, kind)))
    }

    pub fn contains(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    /// Kinds and patterns of a category, in definition order.
    pub fn kinds(&self, category: &str) -> Option<&[String]> {
        self.categories.get(category).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }
}

/// Exact match, or prefix match for patterns ending in `*`.
pub fn kind_matches(pattern: &str, kind: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => kind.starts_with(prefix),
        None => pattern == kind,
    }
}
