//! Narrow interface to the external subreddit catalog.
//!
//! Listings are lazy, paginated, and finite. Each listing item is a
//! `Result` so a page failure can surface mid-stream without tearing
//! down the caller.

pub mod error;
pub mod memory;
pub mod reddit;

use serde::{Deserialize, Serialize};

pub use error::CatalogError;
pub use memory::{CallStats, Failure, InMemoryCatalog};
pub use reddit::RedditCatalog;

/// A lazy, finite sequence of catalog items.
pub type Listing = Box<dyn Iterator<Item = Result<CandidateItem, CatalogError>> + Send>;

/// Account names that are bots, not human moderators.
const AUTOMATED_MODERATORS: &[&str] = &["automoderator"];

/// One potential match surfaced by discovery.
///
/// The enrichment fields (`mod_count`, `last_activity_utc`,
/// `last_mod_activity_utc`) stay `None` until the evaluator fetches them,
/// and remain `None` when the lookup was skipped or failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateItem {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name_prefixed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub subscribers: Option<u64>,
    #[serde(default)]
    pub over18: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_utc: Option<i64>,
    pub mod_count: Option<u32>,
    pub last_activity_utc: Option<i64>,
    pub last_mod_activity_utc: Option<i64>,
}

impl CandidateItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Case-insensitive identity used for dedup and storage.
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    /// `Some(true)` once at least one human moderator has been observed.
    pub fn has_moderator(&self) -> Option<bool> {
        self.mod_count.map(|count| count > 0)
    }

    /// Case-insensitive substring match on name, title, and description.
    pub fn mentions(&self, needle_lower: &str) -> bool {
        if needle_lower.is_empty() {
            return false;
        }
        [
            Some(self.name.as_str()),
            self.title.as_deref(),
            self.description.as_deref(),
        ]
        .iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(needle_lower))
    }
}

/// A moderator entry from the roster lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moderator {
    pub name: String,
}

impl Moderator {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// False for automation accounts and blank names.
    pub fn is_human(&self) -> bool {
        let name = self.name.trim().to_lowercase();
        !name.is_empty() && !AUTOMATED_MODERATORS.contains(&name.as_str())
    }
}

/// Paginated catalog access plus per-item supplementary lookups.
///
/// Implementations are expected to handle their own rate limiting,
/// including 429 backoff, before reporting an error.
pub trait CatalogClient: Send + Sync {
    /// Full-text community search.
    fn search(&self, query: &str, limit: usize) -> Result<Listing, CatalogError>;

    /// Partial name match.
    fn search_by_name(&self, query: &str) -> Result<Listing, CatalogError>;

    /// Globally popular communities, most popular first.
    fn popular(&self, limit: usize) -> Result<Listing, CatalogError>;

    /// Most recently created communities.
    fn newest(&self, limit: usize) -> Result<Listing, CatalogError>;

    /// The moderator roster, newest first.
    fn moderators(&self, name: &str) -> Result<Vec<Moderator>, CatalogError>;

    /// Creation time (unix seconds) of the community's newest post.
    fn latest_post_utc(&self, name: &str) -> Result<Option<i64>, CatalogError>;

    /// Time (unix seconds) of a user's most recent post or comment.
    fn user_latest_activity_utc(&self, user: &str) -> Result<Option<i64>, CatalogError>;
}
