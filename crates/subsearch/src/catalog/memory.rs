//! Deterministic in-process catalog.
//!
//! Backs integration tests and offline dry runs. Supports failure
//! injection per query and a hook that fires each time a listing yields
//! an item.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{CandidateItem, CatalogClient, CatalogError, Listing, Moderator};

type YieldHook = Arc<dyn Fn(&CandidateItem) + Send + Sync>;

/// How an injected failure manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The listing cannot be opened at all.
    OnOpen,
    /// The listing yields this many items, then a transient error.
    AfterItems(usize),
}

/// Call counters, one per catalog operation.
#[derive(Debug, Default)]
pub struct CallStats {
    pub search: AtomicUsize,
    pub search_by_name: AtomicUsize,
    pub popular: AtomicUsize,
    pub newest: AtomicUsize,
    pub moderators: AtomicUsize,
    pub latest_post: AtomicUsize,
    pub user_activity: AtomicUsize,
}

impl CallStats {
    pub fn lookups(&self) -> usize {
        self.moderators.load(Ordering::SeqCst)
            + self.latest_post.load(Ordering::SeqCst)
            + self.user_activity.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct State {
    items: Vec<CandidateItem>,
    moderators: HashMap<String, Vec<Moderator>>,
    latest_post: HashMap<String, i64>,
    user_activity: HashMap<String, i64>,
    search_failures: HashMap<String, Failure>,
    lookup_failures: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryCatalog {
    state: RwLock<State>,
    calls: CallStats,
    on_yield: RwLock<Option<YieldHook>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = CandidateItem>) -> Self {
        let catalog = Self::new();
        catalog.write().items.extend(items);
        catalog
    }

    pub fn add_item(&self, item: CandidateItem) {
        self.write().items.push(item);
    }

    /// Drops every item. Scripted lookups and failures are kept.
    pub fn clear_items(&self) {
        self.write().items.clear();
    }

    pub fn set_moderators(&self, name: &str, moderators: &[&str]) {
        self.write().moderators.insert(
            name.to_lowercase(),
            moderators.iter().map(|m| Moderator::new(*m)).collect(),
        );
    }

    pub fn set_latest_post(&self, name: &str, utc: i64) {
        self.write().latest_post.insert(name.to_lowercase(), utc);
    }

    pub fn set_user_activity(&self, user: &str, utc: i64) {
        self.write().user_activity.insert(user.to_lowercase(), utc);
    }

    /// Injects a failure for `search` or `search_by_name` with this exact query.
    pub fn fail_query(&self, query: &str, failure: Failure) {
        self.write()
            .search_failures
            .insert(query.to_lowercase(), failure);
    }

    /// Makes every supplementary lookup for this item fail.
    pub fn fail_lookups_for(&self, name: &str) {
        self.write().lookup_failures.insert(name.to_lowercase());
    }

    /// Registers a callback invoked for every item a listing yields.
    pub fn on_yield(&self, hook: impl Fn(&CandidateItem) + Send + Sync + 'static) {
        let mut guard = match self.on_yield.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Arc::new(hook));
    }

    pub fn calls(&self) -> &CallStats {
        &self.calls
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        match self.state.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        match self.state.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn hook(&self) -> Option<YieldHook> {
        match self.on_yield.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn into_listing(
        &self,
        query: &str,
        items: Vec<CandidateItem>,
    ) -> Result<Listing, CatalogError> {
        let failure = self
            .read()
            .search_failures
            .get(&query.to_lowercase())
            .copied();

        let fail_after = match failure {
            Some(Failure::OnOpen) => {
                return Err(CatalogError::Transient(format!(
                    "injected failure for '{}'",
                    query
                )))
            }
            Some(Failure::AfterItems(n)) => Some(n),
            None => None,
        };

        let hook = self.hook();
        let query = query.to_string();
        let mut yielded = 0usize;
        let mut items = items.into_iter();
        let mut failed = false;

        Ok(Box::new(std::iter::from_fn(move || {
            if failed {
                return None;
            }
            if fail_after == Some(yielded) {
                failed = true;
                return Some(Err(CatalogError::Transient(format!(
                    "injected mid-stream failure for '{}'",
                    query
                ))));
            }
            let item = items.next()?;
            yielded += 1;
            if let Some(hook) = &hook {
                hook(&item);
            }
            Some(Ok(item))
        })))
    }

    fn lookup_failed(&self, name: &str) -> bool {
        self.read().lookup_failures.contains(&name.to_lowercase())
    }
}

impl CatalogClient for InMemoryCatalog {
    fn search(&self, query: &str, limit: usize) -> Result<Listing, CatalogError> {
        self.calls.search.fetch_add(1, Ordering::SeqCst);
        let needle = query.to_lowercase();
        let matches = self
            .read()
            .items
            .iter()
            .filter(|item| item.mentions(&needle))
            .take(limit)
            .cloned()
            .collect();
        self.into_listing(query, matches)
    }

    fn search_by_name(&self, query: &str) -> Result<Listing, CatalogError> {
        self.calls.search_by_name.fetch_add(1, Ordering::SeqCst);
        let needle = query.to_lowercase();
        let matches = self
            .read()
            .items
            .iter()
            .filter(|item| !needle.is_empty() && item.key().contains(&needle))
            .cloned()
            .collect();
        self.into_listing(query, matches)
    }

    fn popular(&self, limit: usize) -> Result<Listing, CatalogError> {
        self.calls.popular.fetch_add(1, Ordering::SeqCst);
        let mut items = self.read().items.clone();
        items.sort_by(|a, b| b.subscribers.unwrap_or(0).cmp(&a.subscribers.unwrap_or(0)));
        items.truncate(limit);
        self.into_listing("__popular__", items)
    }

    fn newest(&self, limit: usize) -> Result<Listing, CatalogError> {
        self.calls.newest.fetch_add(1, Ordering::SeqCst);
        let items = self.read().items.iter().rev().take(limit).cloned().collect();
        self.into_listing("__newest__", items)
    }

    fn moderators(&self, name: &str) -> Result<Vec<Moderator>, CatalogError> {
        self.calls.moderators.fetch_add(1, Ordering::SeqCst);
        if self.lookup_failed(name) {
            return Err(CatalogError::Forbidden(format!("r/{}", name)));
        }
        Ok(self
            .read()
            .moderators
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    fn latest_post_utc(&self, name: &str) -> Result<Option<i64>, CatalogError> {
        self.calls.latest_post.fetch_add(1, Ordering::SeqCst);
        if self.lookup_failed(name) {
            return Err(CatalogError::Forbidden(format!("r/{}", name)));
        }
        Ok(self.read().latest_post.get(&name.to_lowercase()).copied())
    }

    fn user_latest_activity_utc(&self, user: &str) -> Result<Option<i64>, CatalogError> {
        self.calls.user_activity.fetch_add(1, Ordering::SeqCst);
        Ok(self.read().user_activity.get(&user.to_lowercase()).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, subscribers: u64) -> CandidateItem {
        CandidateItem {
            subscribers: Some(subscribers),
            ..CandidateItem::new(name)
        }
    }

    fn names(listing: Listing) -> Vec<String> {
        listing.map(|r| r.unwrap().name).collect()
    }

    #[test]
    fn test_search_respects_limit() {
        let catalog = InMemoryCatalog::with_items((0..20).map(|i| item(&format!("cats{}", i), i)));
        assert_eq!(names(catalog.search("cats", 5).unwrap()).len(), 5);
        assert_eq!(catalog.calls().search.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_popular_orders_by_subscribers() {
        let catalog = InMemoryCatalog::with_items([item("a", 1), item("b", 50), item("c", 10)]);
        assert_eq!(names(catalog.popular(2).unwrap()), vec!["b", "c"]);
        assert_eq!(names(catalog.newest(2).unwrap()), vec!["c", "b"]);
    }

    #[test]
    fn test_injected_failures() {
        let catalog = InMemoryCatalog::with_items([item("dogs", 1), item("dogsofreddit", 2)]);
        catalog.fail_query("dogs", Failure::AfterItems(1));

        let results: Vec<_> = catalog.search("dogs", 10).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());

        catalog.fail_query("dogs", Failure::OnOpen);
        assert!(catalog.search("dogs", 10).is_err());
    }

    #[test]
    fn test_yield_hook_fires_per_item() {
        let catalog = InMemoryCatalog::with_items([item("x1", 1), item("x2", 2)]);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        catalog.on_yield(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let _ = names(catalog.search("x", 10).unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lookups() {
        let catalog = InMemoryCatalog::new();
        catalog.set_moderators("Quiet", &["AutoModerator"]);
        catalog.set_latest_post("quiet", 1_700_000_000);
        catalog.fail_lookups_for("broken");

        assert_eq!(catalog.moderators("quiet").unwrap().len(), 1);
        assert_eq!(catalog.latest_post_utc("QUIET").unwrap(), Some(1_700_000_000));
        assert!(catalog.moderators("broken").is_err());
        assert_eq!(catalog.calls().lookups(), 3);
    }
}
