//! Per-candidate enrichment and filtering.
//!
//! Supplementary lookups are separate catalog calls that share the
//! discovery rate limit, so each one runs only when its filter is active
//! and only after every cheaper predicate has passed.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use moka::sync::Cache;

use crate::catalog::{CandidateItem, CatalogClient};
use crate::config::CrawlConfig;
use crate::job::{ActivityFilter, JobParams};

/// The active filter predicates for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemFilters {
    pub exclude_nsfw: bool,
    pub min_subscribers: u64,
    pub activity: ActivityFilter,
    pub unmoderated_only: bool,
}

impl From<&JobParams> for ItemFilters {
    fn from(params: &JobParams) -> Self {
        Self {
            exclude_nsfw: params.exclude_nsfw,
            min_subscribers: params.min_subscribers,
            activity: params.activity,
            unmoderated_only: params.unmoderated_only,
        }
    }
}

/// The first predicate a candidate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Nsfw,
    Popularity,
    Activity,
    Moderation,
}

/// Result of evaluating one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub passes: bool,
    pub item: CandidateItem,
    pub rejected_by: Option<Rejection>,
}

impl Evaluation {
    fn pass(item: CandidateItem) -> Self {
        Self {
            passes: true,
            item,
            rejected_by: None,
        }
    }

    fn reject(item: CandidateItem, reason: Rejection) -> Self {
        Self {
            passes: false,
            item,
            rejected_by: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvaluatorSettings {
    /// Look up recent moderator activity when the moderation filter runs.
    pub mod_activity: bool,
    pub mod_activity_sample: usize,
    pub cache_capacity: u64,
    pub cache_ttl: Duration,
    /// Moderator-activity fetches allowed per job.
    pub fetch_limit: usize,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self::from(&CrawlConfig::default())
    }
}

impl From<&CrawlConfig> for EvaluatorSettings {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            // Moderator activity is only gathered for staffed items, which the
            // moderation filter rejects. It is only worth the calls when
            // rejected items are kept.
            mod_activity: config.mod_activity && config.persist_rejected,
            mod_activity_sample: config.mod_activity_sample,
            cache_capacity: config.mod_activity_cache_capacity,
            cache_ttl: Duration::from_secs(config.mod_activity_ttl_secs),
            fetch_limit: config.mod_activity_fetch_limit,
        }
    }
}

/// Remaining moderator-activity fetches for one job. Cache hits are free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityBudget {
    remaining: usize,
}

impl ActivityBudget {
    pub fn new(limit: usize) -> Self {
        Self { remaining: limit }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

pub struct ItemEvaluator {
    client: Arc<dyn CatalogClient>,
    settings: EvaluatorSettings,
    /// Latest activity per moderator, keyed by lower-cased name. Failed
    /// lookups are cached as `None` too.
    mod_activity: Cache<String, Option<i64>>,
}

impl ItemEvaluator {
    pub fn new(client: Arc<dyn CatalogClient>, settings: EvaluatorSettings) -> Self {
        let mod_activity = Cache::builder()
            .max_capacity(settings.cache_capacity)
            .time_to_live(settings.cache_ttl)
            .build();
        Self {
            client,
            settings,
            mod_activity,
        }
    }

    /// A fresh fetch allowance for one job.
    pub fn budget(&self) -> ActivityBudget {
        ActivityBudget::new(self.settings.fetch_limit)
    }

    /// Applies the filters in cost order: adult content, popularity,
    /// activity window, moderation.
    pub fn evaluate(
        &self,
        mut item: CandidateItem,
        filters: &ItemFilters,
        budget: &mut ActivityBudget,
    ) -> Evaluation {
        if filters.exclude_nsfw && item.over18 {
            return Evaluation::reject(item, Rejection::Nsfw);
        }

        if filters.min_subscribers > 0 {
            match item.subscribers {
                Some(count) if count >= filters.min_subscribers => {}
                _ => return Evaluation::reject(item, Rejection::Popularity),
            }
        }

        if filters.activity.is_active() {
            item.last_activity_utc = self.latest_post(&item.name);
            let matches = match (filters.activity, item.last_activity_utc) {
                (_, None) => false,
                (ActivityFilter::ActiveAfter(threshold), Some(ts)) => ts >= threshold,
                (ActivityFilter::InactiveBefore(threshold), Some(ts)) => ts < threshold,
                (ActivityFilter::Any, Some(_)) => true,
            };
            if !matches {
                return Evaluation::reject(item, Rejection::Activity);
            }
        }

        if filters.unmoderated_only {
            self.enrich_moderation(&mut item, budget);
            if item.mod_count != Some(0) {
                return Evaluation::reject(item, Rejection::Moderation);
            }
        }

        Evaluation::pass(item)
    }

    fn latest_post(&self, name: &str) -> Option<i64> {
        match self.client.latest_post_utc(name) {
            Ok(ts) => ts,
            Err(e) => {
                debug!("Activity lookup for r/{} failed: {}", name, e);
                None
            }
        }
    }

    fn enrich_moderation(&self, item: &mut CandidateItem, budget: &mut ActivityBudget) {
        let roster = match self.client.moderators(&item.name) {
            Ok(roster) => roster,
            Err(e) => {
                debug!("Moderator lookup for r/{} failed: {}", item.name, e);
                item.mod_count = None;
                return;
            }
        };

        let humans: Vec<_> = roster.into_iter().filter(|m| m.is_human()).collect();
        item.mod_count = Some(humans.len().min(u32::MAX as usize) as u32);

        if !self.settings.mod_activity || self.settings.mod_activity_sample == 0 {
            return;
        }
        item.last_mod_activity_utc = humans
            .iter()
            .take(self.settings.mod_activity_sample)
            .filter_map(|m| self.moderator_activity(&m.name, budget))
            .max();
    }

    fn moderator_activity(&self, user: &str, budget: &mut ActivityBudget) -> Option<i64> {
        let key = user.trim().to_lowercase();
        if let Some(cached) = self.mod_activity.get(&key) {
            return cached;
        }
        if !budget.take() {
            debug!("Moderator activity budget spent, skipping u/{}", user);
            return None;
        }
        let ts = match self.client.user_latest_activity_utc(user) {
            Ok(ts) => ts,
            Err(e) => {
                debug!("Activity lookup for u/{} failed: {}", user, e);
                None
            }
        };
        self.mod_activity.insert(key, ts);
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use std::sync::atomic::Ordering;

    fn candidate(name: &str, subscribers: Option<u64>, over18: bool) -> CandidateItem {
        CandidateItem {
            subscribers,
            over18,
            ..CandidateItem::new(name)
        }
    }

    fn evaluator(catalog: Arc<InMemoryCatalog>) -> ItemEvaluator {
        ItemEvaluator::new(catalog, EvaluatorSettings::default())
    }

    /// Evaluates with a fresh per-job budget.
    fn check(eval: &ItemEvaluator, item: CandidateItem, filters: &ItemFilters) -> Evaluation {
        eval.evaluate(item, filters, &mut eval.budget())
    }

    fn unmoderated() -> ItemFilters {
        ItemFilters {
            unmoderated_only: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_filters_means_no_lookups() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let eval = evaluator(catalog.clone());
        let result = check(&eval, candidate("a", None, true), &ItemFilters::default());
        assert!(result.passes);
        assert_eq!(result.item.mod_count, None);
        assert_eq!(catalog.calls().lookups(), 0);
    }

    #[test]
    fn test_cheap_predicates_short_circuit_lookups() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let eval = evaluator(catalog.clone());
        let filters = ItemFilters {
            exclude_nsfw: true,
            min_subscribers: 100,
            activity: ActivityFilter::ActiveAfter(0),
            unmoderated_only: true,
        };

        let nsfw = check(&eval, candidate("a", Some(1000), true), &filters);
        assert_eq!(nsfw.rejected_by, Some(Rejection::Nsfw));

        let small = check(&eval, candidate("b", Some(10), false), &filters);
        assert_eq!(small.rejected_by, Some(Rejection::Popularity));

        assert_eq!(catalog.calls().lookups(), 0);
    }

    #[test]
    fn test_missing_popularity_fails_threshold() {
        let eval = evaluator(Arc::new(InMemoryCatalog::new()));
        let filters = ItemFilters {
            min_subscribers: 1,
            ..Default::default()
        };
        assert!(!check(&eval, candidate("a", None, false), &filters).passes);
        assert!(check(&eval, candidate("a", None, false), &ItemFilters::default()).passes);
    }

    #[test]
    fn test_activity_window() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.set_latest_post("fresh", 2_000);
        catalog.set_latest_post("stale", 500);
        let eval = evaluator(catalog.clone());

        let active = ItemFilters {
            activity: ActivityFilter::ActiveAfter(1_000),
            ..Default::default()
        };
        let result = check(&eval, candidate("fresh", Some(1), false), &active);
        assert!(result.passes);
        assert_eq!(result.item.last_activity_utc, Some(2_000));
        assert!(!check(&eval, candidate("stale", Some(1), false), &active).passes);
        // No posts at all is not a match in either direction.
        assert!(!check(&eval, candidate("empty", Some(1), false), &active).passes);

        let inactive = ItemFilters {
            activity: ActivityFilter::InactiveBefore(1_000),
            ..Default::default()
        };
        assert!(check(&eval, candidate("stale", Some(1), false), &inactive).passes);
        assert!(!check(&eval, candidate("empty", Some(1), false), &inactive).passes);
        // Moderation was never requested.
        assert_eq!(catalog.calls().moderators.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unmoderated_requires_confirmed_zero() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.set_moderators("bots_only", &["AutoModerator"]);
        catalog.set_moderators("staffed", &["alice", "AutoModerator", "bob"]);
        catalog.fail_lookups_for("private");
        catalog.set_user_activity("alice", 100);
        catalog.set_user_activity("bob", 300);
        let eval = evaluator(catalog.clone());
        let filters = ItemFilters {
            unmoderated_only: true,
            ..Default::default()
        };

        let bots = check(&eval, candidate("bots_only", Some(5), false), &filters);
        assert!(bots.passes);
        assert_eq!(bots.item.mod_count, Some(0));

        let staffed = check(&eval, candidate("staffed", Some(5), false), &filters);
        assert_eq!(staffed.rejected_by, Some(Rejection::Moderation));
        assert_eq!(staffed.item.mod_count, Some(2));
        assert_eq!(staffed.item.last_mod_activity_utc, Some(300));

        let unknown = check(&eval, candidate("private", Some(5), false), &filters);
        assert!(!unknown.passes);
        assert_eq!(unknown.item.mod_count, None);
    }

    #[test]
    fn test_moderator_activity_is_cached() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.set_moderators("one", &["carol"]);
        catalog.set_moderators("two", &["Carol"]);
        let eval = evaluator(catalog.clone());
        let filters = ItemFilters {
            unmoderated_only: true,
            ..Default::default()
        };

        check(&eval, candidate("one", None, false), &filters);
        check(&eval, candidate("two", None, false), &filters);
        assert_eq!(catalog.calls().user_activity.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_moderator_activity_expires() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.set_moderators("one", &["carol"]);
        catalog.set_user_activity("carol", 100);
        let settings = EvaluatorSettings {
            cache_ttl: Duration::from_millis(50),
            ..EvaluatorSettings::default()
        };
        let eval = ItemEvaluator::new(catalog.clone(), settings);

        let first = check(&eval, candidate("one", None, false), &unmoderated());
        assert_eq!(first.item.last_mod_activity_utc, Some(100));

        catalog.set_user_activity("carol", 9999);
        std::thread::sleep(Duration::from_millis(150));
        let later = check(&eval, candidate("one", None, false), &unmoderated());
        assert_eq!(later.item.last_mod_activity_utc, Some(9999));
        assert_eq!(catalog.calls().user_activity.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fetch_limit_applies_per_job() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.set_moderators("one", &["alice", "bob", "carol"]);
        catalog.set_user_activity("alice", 10);
        catalog.set_user_activity("bob", 20);
        catalog.set_user_activity("carol", 30);
        let settings = EvaluatorSettings {
            fetch_limit: 2,
            ..EvaluatorSettings::default()
        };
        let eval = ItemEvaluator::new(catalog.clone(), settings);

        let mut budget = eval.budget();
        let first = eval.evaluate(candidate("one", None, false), &unmoderated(), &mut budget);
        assert_eq!(first.item.mod_count, Some(3));
        assert_eq!(first.item.last_mod_activity_utc, Some(20));
        assert_eq!(budget.remaining(), 0);
        assert_eq!(catalog.calls().user_activity.load(Ordering::SeqCst), 2);

        // The next job starts with a full allowance; cached users cost nothing.
        let mut next = eval.budget();
        let second = eval.evaluate(candidate("one", None, false), &unmoderated(), &mut next);
        assert_eq!(second.item.last_mod_activity_utc, Some(30));
        assert_eq!(next.remaining(), 1);
        assert_eq!(catalog.calls().user_activity.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_moderator_activity_skipped_when_rejects_are_dropped() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.set_moderators("staffed", &["alice"]);
        catalog.set_user_activity("alice", 100);
        let config = CrawlConfig {
            persist_rejected: false,
            ..CrawlConfig::default()
        };
        let eval = ItemEvaluator::new(catalog.clone(), EvaluatorSettings::from(&config));

        let result = check(&eval, candidate("staffed", None, false), &unmoderated());
        assert_eq!(result.rejected_by, Some(Rejection::Moderation));
        assert_eq!(result.item.mod_count, Some(1));
        assert_eq!(result.item.last_mod_activity_utc, None);
        assert_eq!(catalog.calls().user_activity.load(Ordering::SeqCst), 0);
    }
}
