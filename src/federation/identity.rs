//! Recipient identities
//!
//! An identity is either a user hosted here or one hosted elsewhere. Raw
//! pump.io audience objects are classified into one or the other; unseen
//! remote accounts are created on first reference.

use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::audience::AudienceEntry;
use super::discovery::Endpoints;
use crate::config::{ServerConfig, normalize_host};
use crate::data::{Database, LocalUser, RemoteProfile, RemoteUser};
use crate::error::{AppError, AudienceError};

/// Account handle split into local part and host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub localpart: String,
    pub host: String,
}

impl Handle {
    /// Parse `acct:user@host` or `user@host`.
    ///
    /// Splits at the last `@`; the host is lower-cased.
    pub fn parse(raw: &str) -> Result<Self, AudienceError> {
        let trimmed = raw.trim();
        let address = trimmed.strip_prefix("acct:").unwrap_or(trimmed);

        let (localpart, host) = address
            .rsplit_once('@')
            .ok_or_else(|| AudienceError::InvalidHandle(raw.to_string()))?;

        if localpart.is_empty() || host.is_empty() {
            return Err(AudienceError::InvalidHandle(raw.to_string()));
        }

        Ok(Self {
            localpart: localpart.to_string(),
            host: normalize_host(host),
        })
    }

    /// `localpart@host` as stored: the host is normalized, the local part
    /// keeps its case for servers with case-sensitive usernames.
    pub fn address(&self) -> String {
        format!("{}@{}", self.localpart, self.host)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.localpart, self.host)
    }
}

/// A user served by this node
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub id: String,
    pub username: String,
    /// Serving host
    pub host: String,
    pub inbox_id: String,
}

impl LocalIdentity {
    pub fn from_user(user: &LocalUser, host: &str) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            host: normalize_host(host),
            inbox_id: user.inbox_id.clone(),
        }
    }

    /// `username@host`, the handle peers know this user by
    pub fn webfinger(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// A user hosted on another server
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
    pub id: String,
    pub webfinger: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub bio: Option<String>,
    /// Cached discovery result
    pub endpoints: Option<Endpoints>,
}

impl From<RemoteUser> for RemoteIdentity {
    fn from(user: RemoteUser) -> Self {
        let endpoints = user.endpoints.as_deref().and_then(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| {
                    tracing::warn!(
                        webfinger = %user.webfinger,
                        error = %e,
                        "Ignoring undecodable cached endpoints"
                    );
                })
                .ok()
        });

        Self {
            id: user.id,
            webfinger: user.webfinger,
            name: user.name,
            url: user.url,
            bio: user.bio,
            endpoints,
        }
    }
}

/// Concrete recipient
///
/// Equality and hashing use the canonical handle only, so the same account
/// reached through different paths collapses to one entry in a set.
#[derive(Debug, Clone)]
pub enum Identity {
    Local(LocalIdentity),
    Remote(RemoteIdentity),
}

impl Identity {
    /// Canonical (lower-cased) handle
    pub fn handle(&self) -> String {
        match self {
            Identity::Local(local) => local.webfinger().to_lowercase(),
            Identity::Remote(remote) => remote.webfinger.to_lowercase(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Identity::Local(_))
    }

    /// Store ID of the underlying user row
    pub fn id(&self) -> &str {
        match self {
            Identity::Local(local) => &local.id,
            Identity::Remote(remote) => &remote.id,
        }
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.handle() == other.handle()
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle().hash(state);
    }
}

/// Classifies raw audience objects and loads identities from the store
#[derive(Clone)]
pub struct IdentityClassifier {
    db: Arc<Database>,
    domain: String,
}

impl IdentityClassifier {
    pub fn new(db: Arc<Database>, server: &ServerConfig) -> Self {
        Self {
            db,
            domain: normalize_host(&server.domain),
        }
    }

    fn is_local_host(&self, host: &str) -> bool {
        normalize_host(host) == self.domain
    }

    /// Classify one raw pump.io audience object.
    ///
    /// # Returns
    /// - `Ok(Some(identity))` for a resolvable person
    /// - `Ok(None)` for a placeholder person without an account handle
    ///
    /// # Errors
    /// One `AudienceError` describing why the entry cannot be used
    pub async fn classify(&self, raw: &Value) -> Result<Option<Identity>, AudienceError> {
        let object_type = raw
            .get("objectType")
            .and_then(Value::as_str)
            .ok_or(AudienceError::MissingType)?;

        match object_type {
            "person" => {}
            "collection" => return Err(AudienceError::UnsupportedCollection),
            other => return Err(AudienceError::UnknownType(other.to_string())),
        }

        let id = raw.get("id").and_then(Value::as_str).unwrap_or_default();
        if !id.contains('@') {
            // Some servers inject a phoney person with a URL id; not addressable
            tracing::debug!(id = %id, "Skipping placeholder person in audience");
            return Ok(None);
        }

        let handle = Handle::parse(id)?;

        if self.is_local_host(&handle.host) {
            let user = self
                .db
                .get_local_user_by_username(&handle.localpart)
                .await?
                .ok_or_else(|| AudienceError::UnknownLocalUser(handle.localpart.clone()))?;
            return Ok(Some(Identity::Local(LocalIdentity::from_user(
                &user,
                &self.domain,
            ))));
        }

        let profile = RemoteProfile {
            name: string_field(raw, "displayName"),
            url: string_field(raw, "url"),
            bio: string_field(raw, "summary"),
        };
        let remote = self
            .db
            .get_or_create_remote_user(&handle.address(), &profile)
            .await?;

        Ok(Some(Identity::Remote(remote.into())))
    }

    /// Map a raw JSON audience array to audience entries.
    ///
    /// Entries that fail classification are reported and left out.
    pub async fn audience_from_raw(
        &self,
        raw: &[Value],
    ) -> (Vec<AudienceEntry>, Vec<AudienceError>) {
        let mut entries = Vec::with_capacity(raw.len());
        let mut errors = Vec::new();

        for object in raw {
            match self.classify(object).await {
                Ok(Some(identity)) => entries.push(AudienceEntry::Identity(identity)),
                Ok(None) => entries.push(AudienceEntry::Placeholder),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping audience entry");
                    errors.push(e);
                }
            }
        }

        (entries, errors)
    }

    /// Convert a comma-separated address list (`"alice, bob@remote.example"`).
    ///
    /// Addresses with `@` are remote accounts and are created if unseen.
    /// Bare names are local usernames; unknown ones are skipped.
    pub async fn audience_from_addresses(&self, addresses: &str) -> Result<Vec<Identity>, AppError> {
        let mut identities = Vec::new();

        for address in addresses.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            if address.contains('@') {
                let handle = Handle::parse(address)
                    .map_err(|e| AppError::Validation(e.to_string()))?;
                if self.is_local_host(&handle.host) {
                    if let Some(local) = self.local_by_username(&handle.localpart).await? {
                        identities.push(Identity::Local(local));
                    }
                    continue;
                }
                let remote = self
                    .db
                    .get_or_create_remote_user(&handle.address(), &RemoteProfile::default())
                    .await?;
                identities.push(Identity::Remote(remote.into()));
            } else {
                match self.local_by_username(address).await? {
                    Some(local) => identities.push(Identity::Local(local)),
                    None => tracing::debug!(username = %address, "Skipping unknown local user"),
                }
            }
        }

        Ok(identities)
    }

    pub async fn local_by_username(&self, username: &str) -> Result<Option<LocalIdentity>, AppError> {
        Ok(self
            .db
            .get_local_user_by_username(username)
            .await?
            .map(|user| LocalIdentity::from_user(&user, &self.domain)))
    }

    pub async fn local_by_id(&self, id: &str) -> Result<Option<LocalIdentity>, AppError> {
        Ok(self
            .db
            .get_local_user(id)
            .await?
            .map(|user| LocalIdentity::from_user(&user, &self.domain)))
    }

    pub async fn remote_by_id(&self, id: &str) -> Result<Option<RemoteIdentity>, AppError> {
        Ok(self.db.get_remote_user(id).await?.map(RemoteIdentity::from))
    }

    pub async fn remote_by_webfinger(
        &self,
        webfinger: &str,
    ) -> Result<Option<RemoteIdentity>, AppError> {
        Ok(self
            .db
            .get_remote_user_by_webfinger(webfinger)
            .await?
            .map(RemoteIdentity::from))
    }
}

fn string_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(ToString::to_string)
}
