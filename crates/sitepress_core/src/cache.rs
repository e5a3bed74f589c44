use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::debug;

use crate::remote::ListItem;

/// Lower-cased identity used for every cache lookup.
pub fn normalize_key(value: &str) -> String {
    value.to_lowercase()
}

/// Memoized facts for one publish run. Nothing expires and nothing is
/// persisted; a new run starts from an empty cache.
#[derive(Debug, Default)]
pub struct ResourceCache {
    checked: HashSet<String>,
    processed: HashMap<String, Option<i64>>,
    processed_order: Vec<String>,
    listings: HashMap<String, Vec<ListItem>>,
    list_ids: HashMap<String, String>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_checked(&self, key: &str) -> bool {
        self.checked.contains(&normalize_key(key))
    }

    pub fn mark_checked(&mut self, key: &str) {
        self.checked.insert(normalize_key(key));
    }

    /// Record a handled resource. A known identifier is never replaced by an
    /// unknown one.
    pub fn record_processed(&mut self, key: &str, id: Option<i64>) {
        let key = normalize_key(key);
        match self.processed.get_mut(&key) {
            Some(existing) => {
                if id.is_some() {
                    *existing = id;
                }
            }
            None => {
                self.processed_order.push(key.clone());
                self.processed.insert(key, id);
            }
        }
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.processed.contains_key(&normalize_key(key))
    }

    pub fn processed_id(&self, key: &str) -> Option<i64> {
        self.processed.get(&normalize_key(key)).copied().flatten()
    }

    /// Processed keys in the order they were first recorded.
    pub fn processed_keys(&self) -> &[String] {
        &self.processed_order
    }

    /// Listing for `scope`, fetched on first use and reused for the rest of
    /// the run even after later writes change the remote side.
    pub fn cached_listing<F>(&mut self, scope: &str, fetch: F) -> Result<&[ListItem]>
    where
        F: FnOnce() -> Result<Vec<ListItem>>,
    {
        let key = normalize_key(scope);
        if !self.listings.contains_key(&key) {
            let items = fetch()?;
            debug!(scope = %key, items = items.len(), "cached remote listing");
            self.listings.insert(key.clone(), items);
        }
        Ok(self
            .listings
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    /// Listing for `scope` if it has been fetched already.
    pub fn listing(&self, scope: &str) -> Option<&[ListItem]> {
        self.listings.get(&normalize_key(scope)).map(Vec::as_slice)
    }

    pub fn cached_list_id<F>(&mut self, scope: &str, fetch: F) -> Result<Option<String>>
    where
        F: FnOnce() -> Result<Option<String>>,
    {
        let key = normalize_key(scope);
        if let Some(id) = self.list_ids.get(&key) {
            return Ok(Some(id.clone()));
        }
        let fetched = fetch()?;
        if let Some(id) = &fetched {
            self.list_ids.insert(key, id.clone());
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::{ResourceCache, normalize_key};
    use crate::remote::ListItem;

    fn item(id: i64, file_ref: &str) -> ListItem {
        ListItem {
            id,
            title: None,
            file_ref: Some(file_ref.to_string()),
        }
    }

    #[test]
    fn keys_are_case_insensitive() {
        let mut cache = ResourceCache::new();
        cache.mark_checked("Docs/Image One.png-SiteAssets");
        assert!(cache.has_checked("docs/image one.png-siteassets"));
        assert_eq!(normalize_key("Guide/Intro.ASPX"), "guide/intro.aspx");
    }

    #[test]
    fn processed_ids_are_append_only() {
        let mut cache = ResourceCache::new();
        cache.record_processed("Guide/Intro.aspx", None);
        assert!(cache.is_processed("guide/intro.aspx"));
        assert_eq!(cache.processed_id("guide/intro.aspx"), None);

        cache.record_processed("guide/intro.aspx", Some(12));
        cache.record_processed("GUIDE/INTRO.aspx", None);
        assert_eq!(cache.processed_id("guide/intro.aspx"), Some(12));
        assert_eq!(cache.processed_keys(), ["guide/intro.aspx"]);
    }

    #[test]
    fn listing_is_fetched_once_per_scope() {
        let mut cache = ResourceCache::new();
        let fetches = Cell::new(0);
        for _ in 0..3 {
            let items = cache
                .cached_listing("SitePages", || {
                    fetches.set(fetches.get() + 1);
                    Ok(vec![item(1, "/sites/docs/SitePages/home.aspx")])
                })
                .expect("listing");
            assert_eq!(items.len(), 1);
        }
        assert_eq!(fetches.get(), 1);
        assert!(cache.listing("sitepages").is_some());
        assert!(cache.listing("other").is_none());
    }

    #[test]
    fn failed_listing_fetch_is_not_cached() {
        let mut cache = ResourceCache::new();
        let error = cache
            .cached_listing("sitepages", || anyhow::bail!("offline"))
            .expect_err("fetch fails");
        assert!(error.to_string().contains("offline"));
        assert!(cache.listing("sitepages").is_none());
    }

    #[test]
    fn list_id_is_memoized_only_when_found() {
        let mut cache = ResourceCache::new();
        assert_eq!(cache.cached_list_id("web", || Ok(None)).expect("lookup"), None);
        assert_eq!(
            cache
                .cached_list_id("web", || Ok(Some("abc".to_string())))
                .expect("lookup"),
            Some("abc".to_string())
        );
        assert_eq!(
            cache
                .cached_list_id("WEB", || anyhow::bail!("should not refetch"))
                .expect("cached"),
            Some("abc".to_string())
        );
    }
}
