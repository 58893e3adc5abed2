//! Outgoing activities
//!
//! Builds and stores activities authored by local users, and serializes them
//! into the pump.io (ActivityStreams 1.0) JSON that is sent to peers.

use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::audience::{AudienceEntry, AudienceResolver, AudienceTier};
use super::identity::{Identity, LocalIdentity};
use crate::data::{ActivityRecord, CollectionType, Database, EntityId, Generator, ItemKind};
use crate::error::AppError;

/// Generator recorded when an activity does not name one
pub const DEFAULT_GENERATOR_NAME: &str = "fedispatch";
pub const DEFAULT_GENERATOR_TYPE: &str = "service";

/// Verbs an activity may carry
pub const VALID_VERBS: [&str; 16] = [
    "add",
    "author",
    "create",
    "delete",
    "dislike",
    "favorite",
    "follow",
    "like",
    "post",
    "share",
    "unfollow",
    "unfavorite",
    "unlike",
    "unshare",
    "update",
    "tag",
];

/// Activity verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Add,
    Author,
    Create,
    Delete,
    Dislike,
    Favorite,
    Follow,
    Like,
    Post,
    Share,
    Unfollow,
    Unfavorite,
    Unlike,
    Unshare,
    Update,
    Tag,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Author => "author",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Dislike => "dislike",
            Self::Favorite => "favorite",
            Self::Follow => "follow",
            Self::Like => "like",
            Self::Post => "post",
            Self::Share => "share",
            Self::Unfollow => "unfollow",
            Self::Unfavorite => "unfavorite",
            Self::Unlike => "unlike",
            Self::Unshare => "unshare",
            Self::Update => "update",
            Self::Tag => "tag",
        }
    }

    /// Past tense used in generated activity content
    fn past_tense(&self) -> &'static str {
        match self {
            Self::Add => "added",
            Self::Author => "authored",
            Self::Create => "created",
            Self::Delete => "deleted",
            Self::Dislike => "disliked",
            Self::Favorite => "favorited",
            Self::Follow => "followed",
            Self::Like => "liked",
            Self::Post => "posted",
            Self::Share => "shared",
            Self::Unfollow => "stopped following",
            Self::Unfavorite => "unfavorited",
            Self::Unlike => "unliked",
            Self::Unshare => "unshared",
            Self::Update => "updated",
            Self::Tag => "tagged",
        }
    }
}

impl FromStr for Verb {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "author" => Ok(Self::Author),
            "create" => Ok(Self::Create),
            "delete" => Ok(Self::Delete),
            "dislike" => Ok(Self::Dislike),
            "favorite" => Ok(Self::Favorite),
            "follow" => Ok(Self::Follow),
            "like" => Ok(Self::Like),
            "post" => Ok(Self::Post),
            "share" => Ok(Self::Share),
            "unfollow" => Ok(Self::Unfollow),
            "unfavorite" => Ok(Self::Unfavorite),
            "unlike" => Ok(Self::Unlike),
            "unshare" => Ok(Self::Unshare),
            "update" => Ok(Self::Update),
            "tag" => Ok(Self::Tag),
            other => Err(AppError::Validation(format!(
                "Invalid verb '{}', expected one of: {}",
                other,
                VALID_VERBS.join(", ")
            ))),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activity to be created
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub verb: Verb,
    /// Local user ID of the author
    pub actor_id: String,
    pub object: Option<Value>,
    pub target: Option<Value>,
    /// `(name, object_type)`; defaults to this service
    pub generator: Option<(String, String)>,
    pub audience: HashMap<AudienceTier, Vec<AudienceEntry>>,
}

impl NewActivity {
    pub fn new(verb: Verb, actor_id: impl Into<String>) -> Self {
        Self {
            verb,
            actor_id: actor_id.into(),
            object: None,
            target: None,
            generator: None,
            audience: HashMap::new(),
        }
    }

    pub fn with_object(mut self, object: Value) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_target(mut self, target: Value) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_generator(mut self, name: &str, object_type: &str) -> Self {
        self.generator = Some((name.to_string(), object_type.to_string()));
        self
    }

    /// Add entries to one audience tier
    pub fn address(mut self, tier: AudienceTier, entries: Vec<AudienceEntry>) -> Self {
        self.audience.entry(tier).or_default().extend(entries);
        self
    }
}

/// Collection holding a tier's entries, if the activity has one
pub fn tier_collection(record: &ActivityRecord, tier: AudienceTier) -> Option<&str> {
    match tier {
        AudienceTier::To => record.to_collection.as_deref(),
        AudienceTier::Cc => record.cc_collection.as_deref(),
        AudienceTier::Bto => record.bto_collection.as_deref(),
        AudienceTier::Bcc => record.bcc_collection.as_deref(),
    }
}

fn entry_item(entry: &AudienceEntry) -> Option<(ItemKind, &str)> {
    match entry {
        AudienceEntry::Identity(Identity::Local(local)) => Some((ItemKind::LocalUser, &local.id)),
        AudienceEntry::Identity(Identity::Remote(remote)) => {
            Some((ItemKind::RemoteUser, &remote.id))
        }
        AudienceEntry::Collection(collection) => Some((ItemKind::Collection, &collection.id)),
        AudienceEntry::Placeholder | AudienceEntry::Unresolvable(_) => None,
    }
}

/// Create and store an activity.
///
/// Each non-empty audience tier is stored as its own collection. The
/// activity is appended to the author's outbox.
///
/// # Errors
/// - NotFound if the actor is not a local user
/// - Database on store failure
pub async fn create_activity(db: &Database, new: NewActivity) -> Result<ActivityRecord, AppError> {
    let actor = db
        .get_local_user(&new.actor_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let (generator_name, generator_type) = new.generator.clone().unwrap_or_else(|| {
        (
            DEFAULT_GENERATOR_NAME.to_string(),
            DEFAULT_GENERATOR_TYPE.to_string(),
        )
    });
    let generator = db
        .get_or_create_generator(&generator_name, &generator_type)
        .await?;

    let id = EntityId::new().0;
    let mut tier_ids: HashMap<AudienceTier, String> = HashMap::new();

    for tier in AudienceTier::ALL {
        let Some(entries) = new.audience.get(&tier).filter(|e| !e.is_empty()) else {
            continue;
        };

        let collection = db
            .create_collection(
                CollectionType::AudienceTargetting,
                Some(format!("{} of activity {}", tier.as_str(), id).as_str()),
                Some(actor.id.as_str()),
            )
            .await?;

        for entry in entries {
            match entry_item(entry) {
                Some((kind, item_id)) => {
                    db.append_to_collection(&collection.id, kind, item_id).await?;
                }
                None => {
                    tracing::debug!(tier = tier.as_str(), "Not storing unaddressable entry");
                }
            }
        }

        tier_ids.insert(tier, collection.id);
    }

    let object_type = new
        .object
        .as_ref()
        .and_then(|o| o.get("objectType"))
        .and_then(Value::as_str)
        .unwrap_or("object");
    let content = format!("{} {} a {}", actor.username, new.verb.past_tense(), object_type);

    let record = ActivityRecord {
        id,
        verb: new.verb.as_str().to_string(),
        actor_id: actor.id.clone(),
        object: new.object.as_ref().map(Value::to_string),
        target: new.target.as_ref().map(Value::to_string),
        generator_id: Some(generator.id),
        content: Some(content),
        to_collection: tier_ids.remove(&AudienceTier::To),
        cc_collection: tier_ids.remove(&AudienceTier::Cc),
        bto_collection: tier_ids.remove(&AudienceTier::Bto),
        bcc_collection: tier_ids.remove(&AudienceTier::Bcc),
        distribution_id: None,
        published_at: Utc::now(),
    };

    db.insert_activity(&record).await?;
    db.append_to_collection(&actor.outbox_id, ItemKind::Activity, &record.id)
        .await?;

    tracing::info!(
        activity_id = %record.id,
        verb = %record.verb,
        actor = %actor.username,
        "Created activity"
    );

    Ok(record)
}

/// Load the stored entries of every tier of an activity.
pub async fn load_audience(
    resolver: &AudienceResolver,
    record: &ActivityRecord,
) -> Result<HashMap<AudienceTier, Vec<AudienceEntry>>, AppError> {
    let mut audience = HashMap::new();
    for tier in AudienceTier::ALL {
        if let Some(collection_id) = tier_collection(record, tier) {
            audience.insert(tier, resolver.members(collection_id).await?);
        }
    }
    Ok(audience)
}

/// JSON audience object for an entry, `None` for unaddressable entries
fn audience_object(entry: &AudienceEntry, base_url: &str) -> Option<Value> {
    match entry {
        AudienceEntry::Identity(Identity::Local(local)) => Some(json!({
            "objectType": "person",
            "id": format!("acct:{}", local.webfinger()),
        })),
        AudienceEntry::Identity(Identity::Remote(remote)) => {
            let mut person = Map::new();
            person.insert("objectType".to_string(), json!("person"));
            person.insert("id".to_string(), json!(format!("acct:{}", remote.webfinger)));
            if let Some(name) = &remote.name {
                person.insert("displayName".to_string(), json!(name));
            }
            if let Some(url) = &remote.url {
                person.insert("url".to_string(), json!(url));
            }
            Some(Value::Object(person))
        }
        AudienceEntry::Collection(collection) => {
            let mut object = Map::new();
            object.insert("objectType".to_string(), json!("collection"));
            object.insert(
                "id".to_string(),
                json!(format!("{}/api/collection/{}", base_url, collection.id)),
            );
            if let Some(title) = &collection.title {
                object.insert("displayName".to_string(), json!(title));
            }
            Some(Value::Object(object))
        }
        AudienceEntry::Placeholder | AudienceEntry::Unresolvable(_) => None,
    }
}

/// Serialize an activity for delivery to peers.
///
/// Only the `to` and `cc` tiers are written; blind tiers never appear.
pub fn serialize_public(
    record: &ActivityRecord,
    actor: &LocalIdentity,
    generator: Option<&Generator>,
    audience: &HashMap<AudienceTier, Vec<AudienceEntry>>,
    base_url: &str,
) -> Value {
    let base_url = base_url.trim_end_matches('/');
    let published = record.published_at.to_rfc3339();

    let mut activity = Map::new();
    activity.insert(
        "id".to_string(),
        json!(format!("{}/api/activity/{}", base_url, record.id)),
    );
    activity.insert("objectType".to_string(), json!("activity"));
    activity.insert("verb".to_string(), json!(record.verb));
    activity.insert(
        "actor".to_string(),
        json!({
            "objectType": "person",
            "id": format!("acct:{}", actor.webfinger()),
            "preferredUsername": actor.username,
        }),
    );
    activity.insert("published".to_string(), json!(published));
    activity.insert("updated".to_string(), json!(published));

    if let Some(content) = &record.content {
        activity.insert("content".to_string(), json!(content));
    }
    for (key, raw) in [("object", &record.object), ("target", &record.target)] {
        if let Some(value) = raw.as_deref().and_then(|r| serde_json::from_str::<Value>(r).ok()) {
            activity.insert(key.to_string(), value);
        }
    }
    if let Some(generator) = generator {
        activity.insert(
            "generator".to_string(),
            json!({
                "objectType": generator.object_type,
                "displayName": generator.name,
            }),
        );
    }

    for tier in AudienceTier::ALL.iter().filter(|t| !t.is_blind()) {
        let objects: Vec<Value> = audience
            .get(tier)
            .into_iter()
            .flatten()
            .filter_map(|entry| audience_object(entry, base_url))
            .collect();
        if !objects.is_empty() {
            activity.insert(tier.as_str().to_string(), Value::Array(objects));
        }
    }

    Value::Object(activity)
}
