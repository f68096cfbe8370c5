//! Best-effort forwarding of written items to an upstream aggregator.

use std::thread::JoinHandle;
use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use url::Url;

use crate::config::MirrorConfig;
use crate::db::item_repo::ItemRow;
use crate::error::{ConfigError, Result};
use crate::secrets::SecretRef;

#[derive(Debug, Serialize)]
pub struct MirrorPayload<'a> {
    pub source: &'a str,
    pub count: usize,
    pub items: &'a [ItemRow],
}

/// Posts batches to the configured endpoint on a detached thread.
///
/// Every failure is logged at warn and swallowed; the crawl that produced
/// the items never sees it.
pub struct Mirror {
    endpoint: Url,
    token: Option<SecretString>,
    client: Client,
    batch_max: usize,
    source_label: String,
}

impl Mirror {
    /// Builds the mirror, or `None` when no endpoint is configured.
    pub fn from_config(config: &MirrorConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
            return Ok(None);
        };
        let endpoint = Url::parse(endpoint).map_err(|e| ConfigError::Validation {
            message: format!("mirror.endpoint '{}' is not a valid URL: {}", endpoint, e),
        })?;
        let token = SecretRef::new(
            config.token.as_deref(),
            config.token_file.as_deref(),
            config.token_env.as_deref(),
        )
        .resolve_optional()?;

        // Each dispatch runs on its own short-lived runtime, so pooled
        // connections must not outlive it.
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ConfigError::Validation {
                message: format!("failed to build mirror HTTP client: {}", e),
            })?;

        Ok(Some(Self {
            endpoint,
            token,
            client,
            batch_max: config.batch_max.max(1),
            source_label: config.source_label.clone(),
        }))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Request bodies for `items`, at most `batch_max` items each.
    pub fn payloads<'a>(&'a self, items: &'a [ItemRow]) -> Vec<MirrorPayload<'a>> {
        items
            .chunks(self.batch_max)
            .map(|chunk| MirrorPayload {
                source: &self.source_label,
                count: chunk.len(),
                items: chunk,
            })
            .collect()
    }

    /// Fires the POSTs, one per chunk, and returns immediately.
    pub fn dispatch(&self, items: Vec<ItemRow>) -> Option<JoinHandle<()>> {
        if items.is_empty() {
            return None;
        }
        let mut bodies = Vec::new();
        for payload in self.payloads(&items) {
            match serde_json::to_vec(&payload) {
                Ok(body) => bodies.push((payload.count, body)),
                Err(e) => log::warn!("Mirror payload could not be encoded: {}", e),
            }
        }
        if bodies.is_empty() {
            return None;
        }
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let token = self
            .token
            .as_ref()
            .map(|t| SecretString::from(t.expose_secret().to_string()));

        let spawned = std::thread::Builder::new()
            .name("mirror".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::warn!("Mirror runtime could not start: {}", e);
                        return;
                    }
                };
                rt.block_on(async move {
                    for (count, body) in bodies {
                        let mut request = client
                            .post(endpoint.clone())
                            .header(reqwest::header::CONTENT_TYPE, "application/json")
                            .body(body);
                        if let Some(token) = &token {
                            request = request.bearer_auth(token.expose_secret());
                        }
                        match request.send().await {
                            Ok(resp) if resp.status().is_success() => {
                                log::debug!("Mirrored {} items to {}", count, endpoint);
                            }
                            Ok(resp) => {
                                log::warn!(
                                    "Mirror endpoint {} returned {} for {} items",
                                    endpoint,
                                    resp.status(),
                                    count
                                );
                            }
                            Err(e) => {
                                log::warn!("Mirror request to {} failed: {}", endpoint, e);
                                break;
                            }
                        }
                    }
                });
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("Mirror thread could not start: {}", e);
                None
            }
        }
    }
}
