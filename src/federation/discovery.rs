//! Remote endpoint discovery
//!
//! Two-hop lookup for a remote account:
//! 1. `GET http://{host}/.well-known/host-meta` (JSON) lists server-wide links,
//!    including the `lrdd` template and the client `registration_endpoint`.
//! 2. The `lrdd` template, with `{uri}` replaced by the account handle, yields
//!    per-user links such as `activity-inbox`.
//!
//! Results are persisted on the remote user row and never re-fetched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use super::identity::{Handle, RemoteIdentity};
use crate::data::Database;
use crate::error::AppError;
use crate::metrics;

/// Links indexed by `rel`
pub type LinkIndex = BTreeMap<String, Link>;

/// One entry of a host-meta or lrdd `links` array
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Link {
    pub rel: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// JRD-style document returned by host-meta and lrdd
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LinksDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// Discovered endpoints for one remote account
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoints {
    pub host_meta: LinkIndex,
    /// `None` when the server advertises no `lrdd` template
    pub user: Option<LinkIndex>,
}

impl Endpoints {
    /// `href` of the server's client registration endpoint
    pub fn registration_endpoint(&self) -> Option<&str> {
        self.host_meta
            .get("registration_endpoint")
            .and_then(|link| link.href.as_deref())
    }

    /// `href` of the user's inbox
    pub fn activity_inbox(&self) -> Option<&str> {
        self.user
            .as_ref()
            .and_then(|links| links.get("activity-inbox"))
            .and_then(|link| link.href.as_deref())
    }
}

/// Index links by `rel`.
///
/// When a rel appears twice, the first link wins unless a later one is typed
/// `application/json` and the first is not.
pub fn index_links(links: Vec<Link>) -> LinkIndex {
    let mut index = LinkIndex::new();
    for link in links {
        let is_json = link.link_type.as_deref() == Some("application/json");
        match index.get(&link.rel) {
            Some(existing) if existing.link_type.as_deref() == Some("application/json") => {}
            Some(_) if !is_json => {}
            _ => {
                index.insert(link.rel.clone(), link);
            }
        }
    }
    index
}

/// Discovery client
///
/// Only issues GETs; failures are returned to the caller without retry.
#[derive(Clone)]
pub struct DiscoveryClient {
    http_client: reqwest::Client,
    db: Arc<Database>,
}

impl DiscoveryClient {
    pub fn new(http_client: reqwest::Client, db: Arc<Database>) -> Self {
        Self { http_client, db }
    }

    /// Discover (or return cached) endpoints for a remote account.
    ///
    /// On success the endpoints are stored on `remote` and persisted.
    ///
    /// # Errors
    /// `AppError::Discovery` if host-meta or lrdd is unreachable, non-200, or
    /// not JSON
    pub async fn discover(&self, remote: &mut RemoteIdentity) -> Result<Endpoints, AppError> {
        if let Some(endpoints) = &remote.endpoints {
            metrics::CACHE_HITS_TOTAL
                .with_label_values(&["endpoints"])
                .inc();
            return Ok(endpoints.clone());
        }
        metrics::CACHE_MISSES_TOTAL
            .with_label_values(&["endpoints"])
            .inc();

        let handle = Handle::parse(&remote.webfinger)
            .map_err(|e| AppError::Discovery(e.to_string()))?;

        let host_meta_url = format!("http://{}/.well-known/host-meta", handle.host);
        let host_meta = index_links(self.fetch_links("host_meta", &host_meta_url).await?.links);

        let user = match host_meta.get("lrdd").and_then(|link| link.template.as_deref()) {
            Some(template) => {
                let lrdd_url =
                    template.replace("{uri}", &urlencoding::encode(&remote.webfinger));
                Some(index_links(self.fetch_links("lrdd", &lrdd_url).await?.links))
            }
            None => {
                tracing::debug!(
                    webfinger = %remote.webfinger,
                    "host-meta has no lrdd template, skipping user lookup"
                );
                None
            }
        };

        let endpoints = Endpoints { host_meta, user };
        let encoded = serde_json::to_string(&endpoints)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode endpoints: {}", e)))?;
        self.db.update_remote_endpoints(&remote.id, &encoded).await?;
        remote.endpoints = Some(endpoints.clone());

        tracing::info!(webfinger = %remote.webfinger, "Discovered remote endpoints");
        Ok(endpoints)
    }

    async fn fetch_links(&self, kind: &str, url: &str) -> Result<LinksDocument, AppError> {
        let started = Instant::now();

        let response = self
            .http_client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                metrics::observe_federation_request(kind, "error", started.elapsed());
                AppError::Discovery(format!("GET {} failed: {}", url, e))
            })?;

        let status = response.status();
        metrics::observe_federation_request(kind, status.as_str(), started.elapsed());

        if status != reqwest::StatusCode::OK {
            return Err(AppError::Discovery(format!(
                "GET {} returned HTTP {}",
                url, status
            )));
        }

        response
            .json::<LinksDocument>()
            .await
            .map_err(|e| AppError::Discovery(format!("GET {} returned invalid JSON: {}", url, e)))
    }
}
