//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Users
// =============================================================================

/// A user hosted on this node
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalUser {
    pub id: String,
    /// Unique within this node
    pub username: String,
    pub display_name: Option<String>,
    /// Collection receiving activities addressed to this user
    pub inbox_id: String,
    /// Collection of activities this user authored
    pub outbox_id: String,
    pub created_at: DateTime<Utc>,
}

/// A user hosted elsewhere, created lazily on first reference
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteUser {
    pub id: String,
    /// Global handle (localpart@host)
    pub webfinger: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub bio: Option<String>,
    /// JSON encoded endpoints, NULL until discovered
    pub endpoints: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Display metadata copied from a raw audience object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteProfile {
    pub name: Option<String>,
    pub url: Option<String>,
    pub bio: Option<String>,
}

// =============================================================================
// Collections
// =============================================================================

/// Collection types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    Inbox,
    Outbox,
    /// A user-curated list of people or other lists
    UserDefined,
    /// Audience tiers and distribution records
    AudienceTargetting,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "core-inbox",
            Self::Outbox => "core-outbox",
            Self::UserDefined => "core-user-defined",
            Self::AudienceTargetting => "core-audience-targetting",
        }
    }
}

/// An ordered, possibly nested, list of items
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Collection {
    pub id: String,
    pub collection_type: String,
    pub title: Option<String>,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What a collection item points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    LocalUser,
    RemoteUser,
    Collection,
    Activity,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalUser => "local_user",
            Self::RemoteUser => "remote_user",
            Self::Collection => "collection",
            Self::Activity => "activity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local_user" => Some(Self::LocalUser),
            "remote_user" => Some(Self::RemoteUser),
            "collection" => Some(Self::Collection),
            "activity" => Some(Self::Activity),
            _ => None,
        }
    }
}

/// One member of a collection
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionItem {
    pub collection_id: String,
    pub item_kind: String,
    pub item_id: String,
    pub position: i64,
    pub added_at: DateTime<Utc>,
}

// =============================================================================
// Activities
// =============================================================================

/// Provenance tag of an activity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Generator {
    pub id: String,
    pub name: String,
    /// "service" for this node, "client" for API clients
    pub object_type: String,
    pub created_at: DateTime<Utc>,
}

/// A stored activity
///
/// Each audience tier is a collection of type `core-audience-targetting`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityRecord {
    pub id: String,
    pub verb: String,
    pub actor_id: String,
    /// JSON object
    pub object: Option<String>,
    /// JSON object
    pub target: Option<String>,
    pub generator_id: Option<String>,
    pub content: Option<String>,
    pub to_collection: Option<String>,
    pub cc_collection: Option<String>,
    pub bto_collection: Option<String>,
    pub bcc_collection: Option<String>,
    /// Distribution record, set on first federation
    pub distribution_id: Option<String>,
    pub published_at: DateTime<Utc>,
}

// =============================================================================
// Client credentials
// =============================================================================

/// OAuth client credentials issued to one of our users by a remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClientCredential {
    pub user_id: String,
    pub host: String,
    pub client_id: String,
    pub client_secret: String,
    pub created_at: DateTime<Utc>,
}
