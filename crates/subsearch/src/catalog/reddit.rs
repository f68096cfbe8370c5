//! Reddit API client.
//!
//! Calls are made with an async `reqwest::Client` on a small private tokio
//! runtime and exposed synchronously, because job execution runs on plain
//! threads. Never call these methods from inside another tokio runtime.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{CandidateItem, CatalogClient, CatalogError, Listing, Moderator};
use crate::config::CatalogConfig;
use crate::secrets::SecretRef;

/// Largest page the listing endpoints accept.
const PAGE_SIZE: usize = 100;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Refresh the access token this long before it actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// ─── Wire types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Thing<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    after: Option<String>,
    #[serde(default = "Vec::new")]
    children: Vec<Thing<T>>,
}

#[derive(Debug, Deserialize)]
struct SubredditData {
    display_name: Option<String>,
    display_name_prefixed: Option<String>,
    title: Option<String>,
    public_description: Option<String>,
    url: Option<String>,
    subscribers: Option<u64>,
    over18: Option<bool>,
    created_utc: Option<f64>,
}

impl SubredditData {
    fn into_candidate(self) -> Option<CandidateItem> {
        let name = self.display_name.filter(|n| !n.is_empty())?;
        Some(CandidateItem {
            name,
            display_name_prefixed: self.display_name_prefixed,
            title: self.title.filter(|t| !t.is_empty()),
            description: self.public_description.filter(|d| !d.is_empty()),
            url: self.url,
            subscribers: self.subscribers,
            over18: self.over18.unwrap_or(false),
            created_utc: self.created_utc.map(|t| t as i64),
            ..Default::default()
        })
    }
}

#[derive(Debug, Deserialize)]
struct CreatedData {
    created_utc: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ModeratorData {
    name: String,
}

/// The moderator roster is a `UserList` whose children are bare user objects.
#[derive(Debug, Deserialize)]
struct RosterData {
    #[serde(default)]
    children: Vec<ModeratorData>,
}

#[derive(Debug, Deserialize)]
struct NameSearchResponse {
    #[serde(default)]
    names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    3600
}

// ─── Client ─────────────────────────────────────────────────────────────────

struct AccessToken {
    value: SecretString,
    expires_at: Instant,
}

struct Credentials {
    client_id: String,
    client_secret: SecretString,
}

struct Inner {
    http: Client,
    runtime: tokio::runtime::Runtime,
    base_url: String,
    auth_url: String,
    credentials: Option<Credentials>,
    max_retries: u32,
    token: Mutex<Option<AccessToken>>,
}

/// Catalog client backed by the Reddit JSON API.
///
/// Without credentials, requests go out unauthenticated, which only works
/// against the public `www.reddit.com` host.
#[derive(Clone)]
pub struct RedditCatalog {
    inner: Arc<Inner>,
}

impl RedditCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CatalogError::Setup(format!("Failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("catalog-http")
            .enable_all()
            .build()
            .map_err(|e| CatalogError::Setup(format!("Failed to start HTTP runtime: {}", e)))?;

        let secret = SecretRef::new(
            config.client_secret.as_deref(),
            config.client_secret_file.as_deref(),
            config.client_secret_env.as_deref(),
        )
        .resolve_optional()
        .map_err(|e| CatalogError::Setup(e.to_string()))?;

        let credentials = match (config.client_id.as_deref(), secret) {
            (Some(id), Some(secret)) if !id.is_empty() => Some(Credentials {
                client_id: id.to_string(),
                client_secret: secret,
            }),
            (Some(_), None) => {
                return Err(CatalogError::Setup(
                    "catalog.clientId is set but no client secret is configured".to_string(),
                ))
            }
            _ => None,
        };

        if credentials.is_none() {
            info!("No catalog credentials configured, using unauthenticated requests");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                runtime,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                auth_url: config.auth_url.clone(),
                credentials,
                max_retries: config.max_retries,
                token: Mutex::new(None),
            }),
        })
    }

    fn listing(&self, path: String, query: Vec<(&'static str, String)>, limit: usize) -> Listing {
        Box::new(ListingPager {
            inner: Arc::clone(&self.inner),
            path,
            query,
            remaining: limit,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }
}

impl Inner {
    fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, CatalogError> {
        self.runtime.block_on(self.get_async(path, query))
    }

    async fn get_async<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, CatalogError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let can_retry = attempt <= self.max_retries;

            let mut request = self.http.get(&url).query(query);
            if let Some(token) = self.bearer_token().await? {
                request = request.bearer_auth(token.expose_secret());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if can_retry && (e.is_timeout() || e.is_connect()) => {
                    let wait = backoff(attempt);
                    warn!("Request to {} failed ({}), retrying in {:?}", path, e, wait);
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if status.is_success() {
                let body = response.bytes().await?;
                return Ok(serde_json::from_slice(&body)?);
            }

            match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = retry_after(response.headers());
                    if !can_retry {
                        return Err(CatalogError::RateLimited { retry_after });
                    }
                    let wait = retry_after.unwrap_or_else(|| backoff(attempt)).min(MAX_BACKOFF);
                    warn!("Rate limited on {}, sleeping {:?}", path, wait);
                    tokio::time::sleep(wait).await;
                }
                StatusCode::UNAUTHORIZED if self.credentials.is_some() && can_retry => {
                    debug!("Access token rejected, refreshing");
                    self.clear_token();
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(CatalogError::Auth(format!("{} returned 401", path)));
                }
                StatusCode::FORBIDDEN => return Err(CatalogError::Forbidden(path.to_string())),
                StatusCode::NOT_FOUND => return Err(CatalogError::NotFound(path.to_string())),
                s if s.is_server_error() && can_retry => {
                    let wait = backoff(attempt);
                    warn!("{} returned {}, retrying in {:?}", path, s, wait);
                    tokio::time::sleep(wait).await;
                }
                s if s.is_server_error() => {
                    return Err(CatalogError::Transient(format!("{} returned {}", path, s)));
                }
                s => {
                    return Err(CatalogError::Status {
                        status: s.as_u16(),
                        path: path.to_string(),
                    })
                }
            }
        }
    }

    async fn bearer_token(&self) -> Result<Option<SecretString>, CatalogError> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };

        if let Some(token) = self.lock_token().as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(Some(token.value.clone()));
            }
        }

        let response = self
            .http
            .post(&self.auth_url)
            .basic_auth(
                &credentials.client_id,
                Some(credentials.client_secret.expose_secret()),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| CatalogError::Auth(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Auth(format!(
                "Token request failed ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CatalogError::Auth(format!("Failed to parse token response: {}", e)))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        let value = SecretString::from(token.access_token);
        *self.lock_token() = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        debug!("Obtained catalog access token valid for {:?}", lifetime);

        Ok(Some(value))
    }

    fn clear_token(&self) {
        *self.lock_token() = None;
    }

    fn lock_token(&self) -> std::sync::MutexGuard<'_, Option<AccessToken>> {
        match self.token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Catalog token lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn about(&self, name: &str) -> Result<CandidateItem, CatalogError> {
        let thing: Thing<SubredditData> = self.get(&format!("/r/{}/about.json", name), &[])?;
        thing
            .data
            .into_candidate()
            .ok_or_else(|| CatalogError::Decode(format!("r/{} has no display name", name)))
    }

    fn newest_created(&self, path: &str) -> Result<Option<i64>, CatalogError> {
        let listing: Thing<ListingData<CreatedData>> =
            self.get(path, &[("limit", "1".to_string()), ("raw_json", "1".to_string())])?;
        Ok(listing
            .data
            .children
            .into_iter()
            .next()
            .and_then(|child| child.data.created_utc)
            .map(|t| t as i64))
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt)).min(MAX_BACKOFF)
}

/// Reads `Retry-After`, falling back to Reddit's `x-ratelimit-reset`.
/// Never longer than [`MAX_BACKOFF`].
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    ["retry-after", "x-ratelimit-reset"].iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Duration::from_secs_f64(secs.ceil().min(MAX_BACKOFF.as_secs_f64())))
    })
}

impl CatalogClient for RedditCatalog {
    fn search(&self, query: &str, limit: usize) -> Result<Listing, CatalogError> {
        Ok(self.listing(
            "/subreddits/search.json".to_string(),
            vec![("q", query.to_string()), ("include_over_18", "on".to_string())],
            limit,
        ))
    }

    fn search_by_name(&self, query: &str) -> Result<Listing, CatalogError> {
        let response: NameSearchResponse = self.inner.get(
            "/api/search_reddit_names.json",
            &[
                ("query", query.to_string()),
                ("exact", "false".to_string()),
                ("include_over_18", "true".to_string()),
            ],
        )?;

        let inner = Arc::clone(&self.inner);
        let items = response
            .names
            .into_iter()
            .filter_map(move |name| match inner.about(&name) {
                Ok(item) => Some(Ok(item)),
                Err(CatalogError::NotFound(_)) | Err(CatalogError::Forbidden(_)) => {
                    debug!("Skipping inaccessible r/{}", name);
                    None
                }
                Err(e) => Some(Err(e)),
            });
        Ok(Box::new(items))
    }

    fn popular(&self, limit: usize) -> Result<Listing, CatalogError> {
        Ok(self.listing("/subreddits/popular.json".to_string(), Vec::new(), limit))
    }

    fn newest(&self, limit: usize) -> Result<Listing, CatalogError> {
        Ok(self.listing("/subreddits/new.json".to_string(), Vec::new(), limit))
    }

    fn moderators(&self, name: &str) -> Result<Vec<Moderator>, CatalogError> {
        let roster: Thing<RosterData> = self
            .inner
            .get(&format!("/r/{}/about/moderators.json", name), &[])?;
        Ok(roster
            .data
            .children
            .into_iter()
            .map(|m| Moderator::new(m.name))
            .collect())
    }

    fn latest_post_utc(&self, name: &str) -> Result<Option<i64>, CatalogError> {
        self.inner.newest_created(&format!("/r/{}/new.json", name))
    }

    fn user_latest_activity_utc(&self, user: &str) -> Result<Option<i64>, CatalogError> {
        self.inner
            .newest_created(&format!("/user/{}/overview.json", user))
    }
}

/// Follows `after` cursors until the limit is reached or a page comes back empty.
struct ListingPager {
    inner: Arc<Inner>,
    path: String,
    query: Vec<(&'static str, String)>,
    remaining: usize,
    after: Option<String>,
    buffer: VecDeque<CandidateItem>,
    exhausted: bool,
}

impl ListingPager {
    fn fetch_page(&mut self) -> Result<(), CatalogError> {
        let mut query = self.query.clone();
        query.push(("limit", self.remaining.min(PAGE_SIZE).to_string()));
        query.push(("raw_json", "1".to_string()));
        if let Some(after) = &self.after {
            query.push(("after", after.clone()));
        }

        let page: Thing<ListingData<SubredditData>> = self.inner.get(&self.path, &query)?;
        self.after = page.data.after;
        self.buffer.extend(
            page.data
                .children
                .into_iter()
                .filter_map(|child| child.data.into_candidate()),
        );

        if self.after.is_none() || self.buffer.is_empty() {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for ListingPager {
    type Item = Result<CandidateItem, CatalogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }

        let item = self.buffer.pop_front()?;
        self.remaining -= 1;
        Some(Ok(item))
    }
}
