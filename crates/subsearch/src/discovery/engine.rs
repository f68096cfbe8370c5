use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, warn};

use super::strategy::{plan, tokenize, PlanSettings, Strategy};
use crate::catalog::{CandidateItem, CatalogClient, Listing};

/// Item keys already yielded during one discovery run.
#[derive(Debug, Default)]
pub struct SeenSet {
    keys: HashSet<String>,
}

impl SeenSet {
    /// Records the name and returns whether it was new (case-insensitive).
    pub fn insert(&mut self, name: &str) -> bool {
        self.keys.insert(name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys.contains(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Counters for one discovery run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub strategies_run: usize,
    pub strategies_failed: usize,
    pub duplicates_dropped: usize,
    pub yielded: usize,
}

/// Expands keywords into strategy plans and runs them against the catalog.
#[derive(Clone)]
pub struct DiscoveryEngine {
    client: Arc<dyn CatalogClient>,
    settings: PlanSettings,
}

impl DiscoveryEngine {
    pub fn new(client: Arc<dyn CatalogClient>, settings: PlanSettings) -> Self {
        Self { client, settings }
    }

    /// Starts a discovery run. Nothing is fetched until the iterator is polled.
    pub fn discover(&self, keyword: &str, result_cap: usize, breadth: u8) -> Discovery {
        let strategies = plan(keyword, result_cap, breadth, &self.settings);
        let mut needles = vec![keyword.trim().to_lowercase()];
        for token in tokenize(keyword, self.settings.min_token_len) {
            if !needles.contains(&token) {
                needles.push(token);
            }
        }

        debug!(
            "Discovery for '{}' planned {} strategies at breadth {}",
            keyword,
            strategies.len(),
            breadth
        );

        Discovery {
            client: Arc::clone(&self.client),
            pending: strategies.into(),
            current: None,
            seen: SeenSet::default(),
            needles,
            stats: DiscoveryStats::default(),
        }
    }
}

struct ActiveStrategy {
    strategy: Strategy,
    listing: Listing,
}

/// Lazy, finite, non-restartable sequence of deduplicated candidates.
///
/// A strategy that fails to open or errors mid-stream is logged and
/// abandoned; the remaining strategies still run.
pub struct Discovery {
    client: Arc<dyn CatalogClient>,
    pending: VecDeque<Strategy>,
    current: Option<ActiveStrategy>,
    seen: SeenSet,
    needles: Vec<String>,
    stats: DiscoveryStats,
}

impl Discovery {
    pub fn stats(&self) -> &DiscoveryStats {
        &self.stats
    }

    fn start_next(&mut self) -> bool {
        while let Some(strategy) = self.pending.pop_front() {
            self.stats.strategies_run += 1;
            let span = tracing::info_span!("strategy", kind = strategy.kind());
            let opened = span.in_scope(|| strategy.open(self.client.as_ref()));
            match opened {
                Ok(listing) => {
                    debug!("Running discovery strategy {}", strategy);
                    self.current = Some(ActiveStrategy { strategy, listing });
                    return true;
                }
                Err(e) => {
                    self.stats.strategies_failed += 1;
                    warn!("Discovery strategy {} failed to start: {}", strategy, e);
                }
            }
        }
        false
    }
}

fn mentions_any(item: &CandidateItem, needles: &[String]) -> bool {
    needles.iter().any(|needle| item.mentions(needle))
}

impl Iterator for Discovery {
    type Item = CandidateItem;

    fn next(&mut self) -> Option<CandidateItem> {
        loop {
            if self.current.is_none() && !self.start_next() {
                return None;
            }
            let active = self.current.as_mut()?;

            match active.listing.next() {
                None => {
                    self.current = None;
                }
                Some(Err(e)) => {
                    self.stats.strategies_failed += 1;
                    warn!(
                        "Discovery strategy {} aborted mid-stream: {}",
                        active.strategy, e
                    );
                    self.current = None;
                }
                Some(Ok(item)) => {
                    if active.strategy.needs_local_match() && !mentions_any(&item, &self.needles)
                    {
                        continue;
                    }
                    if !self.seen.insert(&item.name) {
                        self.stats.duplicates_dropped += 1;
                        continue;
                    }
                    self.stats.yielded += 1;
                    return Some(item);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Failure, InMemoryCatalog};

    fn item(name: &str, title: &str, subscribers: u64) -> CandidateItem {
        CandidateItem {
            title: Some(title.to_string()),
            subscribers: Some(subscribers),
            ..CandidateItem::new(name)
        }
    }

    fn engine(catalog: InMemoryCatalog) -> (DiscoveryEngine, Arc<InMemoryCatalog>) {
        let catalog = Arc::new(catalog);
        let engine = DiscoveryEngine::new(catalog.clone(), PlanSettings::default());
        (engine, catalog)
    }

    #[test]
    fn test_seen_set_is_case_insensitive() {
        let mut seen = SeenSet::default();
        assert!(seen.insert("Rust"));
        assert!(!seen.insert("rust"));
        assert!(seen.contains("RUST"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_overlapping_strategies_never_repeat_an_item() {
        let (engine, _) = engine(InMemoryCatalog::with_items([
            item("boardgames", "Board games", 500),
            item("BoardGames_irl", "board games irl", 20),
            item("askboardgames", "Ask about board games", 10),
            item("games", "Games of all kinds", 9000),
        ]));

        let names: Vec<String> = engine.discover("board games", 100, 5).map(|c| c.name).collect();
        let unique: HashSet<String> = names.iter().map(|n| n.to_lowercase()).collect();
        assert_eq!(names.len(), unique.len());
        assert!(unique.contains("askboardgames"));
        assert!(unique.contains("games"));
    }

    #[test]
    fn test_primary_only_at_breadth_one() {
        let (engine, catalog) = engine(InMemoryCatalog::with_items([item("cats", "Cats", 1)]));
        let found: Vec<_> = engine.discover("cats", 10, 1).collect();
        assert_eq!(found.len(), 1);

        use std::sync::atomic::Ordering;
        assert_eq!(catalog.calls().search.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.calls().search_by_name.load(Ordering::SeqCst), 0);
        assert_eq!(catalog.calls().popular.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_strategy_does_not_end_discovery() {
        let catalog = InMemoryCatalog::with_items([
            item("synthwave", "Synthwave", 100),
            item("synthwavemusic", "Synthwave music", 50),
        ]);
        catalog.fail_query("synthwave", Failure::OnOpen);
        let (engine, _) = engine(catalog);

        // Both the full-text and the name query for "synthwave" fail; sampling still finds it.
        let mut discovery = engine.discover("synthwave", 10, 5);
        let names: Vec<String> = discovery.by_ref().map(|c| c.name).collect();

        assert!(names.contains(&"synthwavemusic".to_string()));
        assert!(discovery.stats().strategies_failed >= 2);
    }

    #[test]
    fn test_mid_stream_failure_keeps_earlier_items() {
        let catalog = InMemoryCatalog::with_items([
            item("vinyl", "Vinyl", 10),
            item("vinylcollectors", "Vinyl collectors", 5),
        ]);
        catalog.fail_query("vinyl", Failure::AfterItems(1));
        let (engine, _) = engine(catalog);

        let names: Vec<String> = engine.discover("vinyl", 10, 1).map(|c| c.name).collect();
        assert_eq!(names, vec!["vinyl"]);
    }

    #[test]
    fn test_sampling_filters_locally() {
        let (engine, _) = engine(InMemoryCatalog::with_items([
            item("aquariums", "Fish tanks", 10),
            item("funny", "Funny things", 1_000_000),
            item("plantedtank", "Planted aquariums", 50),
        ]));

        let mut discovery = engine.discover("aquariums", 50, 5);
        let names: Vec<String> = discovery.by_ref().map(|c| c.name).collect();
        assert!(names.contains(&"plantedtank".to_string()));
        assert!(!names.contains(&"funny".to_string()));
        assert_eq!(discovery.stats().yielded, names.len());
    }

    #[test]
    fn test_discovery_is_lazy() {
        let (engine, catalog) = engine(InMemoryCatalog::with_items([item("x", "x", 1)]));
        let _discovery = engine.discover("x", 10, 5);

        use std::sync::atomic::Ordering;
        assert_eq!(catalog.calls().search.load(Ordering::SeqCst), 0);
    }
}
