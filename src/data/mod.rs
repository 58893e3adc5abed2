//! Data layer module
//!
//! Handles all data persistence:
//! - Local and remote users
//! - Ordered collections (inboxes, audience tiers, distribution records)
//! - Activities and generators
//! - Client credentials

mod database;
mod models;

pub use database::Database;
pub use models::*;
