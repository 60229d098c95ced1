//! Category registry for targeted invalidation.
//!
//! A generated key is filed under the first category whose marker appears in
//! the upper-cased query text. Rules are checked in a fixed order; a query
//! touching several subjects lands in the earliest one.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

/// `(marker, category)` rules in match order.
pub const DEFAULT_RULES: &[(&str, &str)] = &[
    ("BALANCE", "balance"),
    ("STAMP", "stamp"),
    ("SRC20", "src20"),
    ("DISPENSER", "dispenser"),
    ("BLOCK", "block"),
    ("TRANSACTION", "transaction"),
];

#[derive(Debug)]
pub struct CacheKeyRegistry {
    rules: Vec<(String, String)>,
    categories: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for CacheKeyRegistry {
    fn default() -> Self {
        Self::with_rules(DEFAULT_RULES.iter().copied())
    }
}

impl CacheKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules<'a>(rules: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let rules: Vec<(String, String)> = rules
            .into_iter()
            .map(|(marker, category)| (marker.to_uppercase(), category.to_string()))
            .collect();
        let categories = rules
            .iter()
            .map(|(_, category)| (category.clone(), HashSet::new()))
            .collect();
        Self {
            rules,
            categories: Mutex::new(categories),
        }
    }

    /// Category for `query`, first match wins.
    pub fn categorize(&self, query: &str) -> Option<&str> {
        let normalized = query.to_uppercase();
        self.rules
            .iter()
            .find(|(marker, _)| normalized.contains(marker.as_str()))
            .map(|(_, category)| category.as_str())
    }

    /// Files `key` under the category of `query`, if any.
    pub fn register(&self, key: &str, query: &str) -> Option<&str> {
        let category = self.categorize(query)?;
        let inserted = self
            .categories
            .lock()
            .entry(category.to_string())
            .or_default()
            .insert(key.to_string());
        if inserted {
            debug!(category, key, "Registered cache key");
        }
        Some(category)
    }

    pub fn keys(&self, category: &str) -> Vec<String> {
        self.categories
            .lock()
            .get(category)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Empties the set for `category` and returns what it held. The category
    /// itself stays registered.
    pub fn take(&self, category: &str) -> Vec<String> {
        self.categories
            .lock()
            .get_mut(category)
            .map(|keys| keys.drain().collect())
            .unwrap_or_default()
    }

    pub fn contains_category(&self, category: &str) -> bool {
        self.categories.lock().contains_key(category)
    }

    /// Keys registered across all categories.
    pub fn len(&self) -> usize {
        self.categories.lock().values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_wins() {
        let registry = CacheKeyRegistry::new();
        assert_eq!(
            registry.categorize("select * from balances where address = ?"),
            Some("balance")
        );
        // Mentions both stamps and blocks; STAMP comes first.
        assert_eq!(
            registry.categorize("SELECT s.* FROM StampTableV4 s JOIN blocks b USING (block_index)"),
            Some("stamp")
        );
        assert_eq!(registry.categorize("SELECT * FROM dispensers"), Some("dispenser"));
        assert_eq!(registry.categorize("SELECT NOW()"), None);
    }

    #[test]
    fn test_register_and_take_clears_but_keeps_category() {
        let registry = CacheKeyRegistry::new();
        assert_eq!(registry.register("k1", "SELECT * FROM balances"), Some("balance"));
        assert_eq!(registry.register("k2", "SELECT amt FROM balances"), Some("balance"));
        assert_eq!(registry.register("k3", "SELECT 1"), None);
        assert_eq!(registry.len(), 2);

        let mut taken = registry.take("balance");
        taken.sort();
        assert_eq!(taken, vec!["k1".to_string(), "k2".to_string()]);
        assert!(registry.keys("balance").is_empty());
        assert!(registry.contains_category("balance"));
        assert!(registry.take("unknown").is_empty());
    }

    #[test]
    fn test_custom_rules() {
        let registry = CacheKeyRegistry::with_rules([("collection", "collection")]);
        assert_eq!(registry.categorize("select * from collections"), Some("collection"));
        assert_eq!(registry.categorize("SELECT * FROM balances"), None);
    }
}
