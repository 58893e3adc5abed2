//! Federation module
//!
//! Handles:
//! - Activity creation and public serialization
//! - Audience classification and recursive resolution
//! - host-meta / lrdd discovery of remote endpoints
//! - Client registration with dialback authentication
//! - OAuth 1.0a signed inbox delivery

mod activity;
mod audience;
mod credential;
mod delivery;
mod discovery;
mod identity;
pub mod signature;

pub use activity::{
    DEFAULT_GENERATOR_NAME, DEFAULT_GENERATOR_TYPE, NewActivity, VALID_VERBS, Verb,
    create_activity, load_audience, serialize_public, tier_collection,
};
pub use audience::{
    AudienceEntry, AudienceResolver, AudienceTier, CollectionRef, MemberSource, Resolution,
    StoreMembers,
};
pub use credential::CredentialManager;
pub use delivery::{DeliveryDispatcher, FederationOutcome};
pub use discovery::{DiscoveryClient, Endpoints, Link, LinkIndex, LinksDocument, index_links};
pub use identity::{Handle, Identity, IdentityClassifier, LocalIdentity, RemoteIdentity};
pub use signature::{
    DialbackCredentials, dialback_header, dialback_token, http_date, oauth1_authorization,
    parse_dialback_header, parse_oauth_header, verify_dialback, verify_oauth1,
};
