//! Audience resolution
//!
//! Expands audience entries (identities and possibly nested, possibly
//! self-referencing collections) into a flat set of recipients.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::sync::Arc;

use super::identity::{Identity, IdentityClassifier};
use crate::data::{Database, ItemKind};
use crate::error::{AppError, AudienceError};

/// Reference to a stored collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRef {
    pub id: String,
    pub title: Option<String>,
}

/// One entry in an audience tier
#[derive(Debug, Clone)]
pub enum AudienceEntry {
    Identity(Identity),
    Collection(CollectionRef),
    /// Degenerate entry with no addressable handle; skipped silently
    Placeholder,
    /// Entry that could not be interpreted, with a description
    Unresolvable(String),
}

/// Visibility tier of an audience
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudienceTier {
    To,
    Cc,
    /// Blind: delivered to but never serialized
    Bto,
    /// Blind: delivered to but never serialized
    Bcc,
}

impl AudienceTier {
    pub const ALL: [AudienceTier; 4] = [Self::To, Self::Cc, Self::Bto, Self::Bcc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bto => "bto",
            Self::Bcc => "bcc",
        }
    }

    pub fn is_blind(&self) -> bool {
        matches!(self, Self::Bto | Self::Bcc)
    }
}

/// Source of collection members
#[async_trait]
pub trait MemberSource: Send + Sync {
    /// Members of a collection, in order
    async fn members(&self, collection_id: &str) -> Result<Vec<AudienceEntry>, AppError>;
}

/// Loads collection members from the store
///
/// Items pointing at rows that no longer exist become `Unresolvable`.
#[derive(Clone)]
pub struct StoreMembers {
    db: Arc<Database>,
    classifier: IdentityClassifier,
}

impl StoreMembers {
    pub fn new(db: Arc<Database>, classifier: IdentityClassifier) -> Self {
        Self { db, classifier }
    }
}

#[async_trait]
impl MemberSource for StoreMembers {
    async fn members(&self, collection_id: &str) -> Result<Vec<AudienceEntry>, AppError> {
        let items = self.db.get_collection_items(collection_id).await?;
        let mut entries = Vec::with_capacity(items.len());

        for item in items {
            let entry = match ItemKind::parse(&item.item_kind) {
                Some(ItemKind::LocalUser) => match self.classifier.local_by_id(&item.item_id).await? {
                    Some(local) => AudienceEntry::Identity(Identity::Local(local)),
                    None => AudienceEntry::Unresolvable(format!("local user {}", item.item_id)),
                },
                Some(ItemKind::RemoteUser) => {
                    match self.classifier.remote_by_id(&item.item_id).await? {
                        Some(remote) => AudienceEntry::Identity(Identity::Remote(remote)),
                        None => {
                            AudienceEntry::Unresolvable(format!("remote user {}", item.item_id))
                        }
                    }
                }
                Some(ItemKind::Collection) => match self.db.get_collection(&item.item_id).await? {
                    Some(collection) => AudienceEntry::Collection(CollectionRef {
                        id: collection.id,
                        title: collection.title,
                    }),
                    None => AudienceEntry::Unresolvable(format!("collection {}", item.item_id)),
                },
                Some(ItemKind::Activity) | None => AudienceEntry::Unresolvable(format!(
                    "{} {} is not an audience member",
                    item.item_kind, item.item_id
                )),
            };
            entries.push(entry);
        }

        Ok(entries)
    }
}

/// Outcome of resolving an audience
#[derive(Debug, Default)]
pub struct Resolution {
    /// Deduplicated by canonical handle
    pub identities: HashSet<Identity>,
    /// Per-entry problems; never abort resolution
    pub errors: Vec<AudienceError>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Audience resolver
#[derive(Clone)]
pub struct AudienceResolver {
    members: Arc<dyn MemberSource>,
}

impl AudienceResolver {
    pub fn new(members: Arc<dyn MemberSource>) -> Self {
        Self { members }
    }

    /// Members of one collection, as stored
    pub async fn members(&self, collection_id: &str) -> Result<Vec<AudienceEntry>, AppError> {
        self.members.members(collection_id).await
    }

    /// Resolve entries into concrete recipients.
    ///
    /// Collections whose ID is in `exclude` are skipped. Every collection is
    /// expanded at most once per call, so cycles terminate and mutually
    /// nested lists cost one member load each.
    pub async fn resolve(&self, entries: &[AudienceEntry], exclude: &HashSet<String>) -> Resolution {
        let mut resolution = Resolution::default();
        let mut expanded = exclude.clone();
        self.resolve_into(entries, &mut expanded, &mut resolution)
            .await;
        resolution
    }

    fn resolve_into<'a>(
        &'a self,
        entries: &'a [AudienceEntry],
        expanded: &'a mut HashSet<String>,
        out: &'a mut Resolution,
    ) -> BoxFuture<'a, ()> {
        async move {
            for entry in entries {
                match entry {
                    AudienceEntry::Identity(identity) => {
                        out.identities.insert(identity.clone());
                    }
                    AudienceEntry::Placeholder => {}
                    AudienceEntry::Unresolvable(description) => {
                        out.errors
                            .push(AudienceError::Unresolvable(description.clone()));
                    }
                    AudienceEntry::Collection(collection) => {
                        if !expanded.insert(collection.id.clone()) {
                            tracing::debug!(
                                collection_id = %collection.id,
                                "Collection already expanded, skipping"
                            );
                            continue;
                        }

                        match self.members.members(&collection.id).await {
                            Ok(members) => {
                                self.resolve_into(&members, &mut *expanded, &mut *out).await;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    collection_id = %collection.id,
                                    error = %e,
                                    "Failed to load collection members"
                                );
                                out.errors.push(AudienceError::Store(format!(
                                    "collection {}: {}",
                                    collection.id, e
                                )));
                            }
                        }
                    }
                }
            }
        }
        .boxed()
    }
}
