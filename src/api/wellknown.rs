//! Well-known endpoints
//!
//! What peers need to discover and verify this node:
//! - /.well-known/host-meta (JSON)
//! - /.well-known/webfinger
//! - /api/dialback

use axum::{
    Form, Router,
    extract::{Query, State},
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{Handle, Link, LinksDocument};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/host-meta
/// - GET /.well-known/webfinger
/// - POST /api/dialback
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/host-meta", get(host_meta))
        .route("/.well-known/webfinger", get(webfinger))
        .route("/api/dialback", post(dialback))
}

fn link(rel: &str, link_type: Option<&str>, href: String) -> Link {
    Link {
        rel: rel.to_string(),
        link_type: link_type.map(ToString::to_string),
        href: Some(href),
        template: None,
    }
}

/// GET /.well-known/host-meta
///
/// JSON host-meta with the `lrdd` template peers use to look up our users.
async fn host_meta(State(state): State<AppState>) -> Json<LinksDocument> {
    let base_url = state.config.server.base_url();

    Json(LinksDocument {
        subject: None,
        links: vec![
            Link {
                rel: "lrdd".to_string(),
                link_type: Some("application/json".to_string()),
                href: None,
                template: Some(format!("{}/.well-known/webfinger?resource={{uri}}", base_url)),
            },
            link("dialback", None, format!("{}/api/dialback", base_url)),
        ],
    })
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain (the `acct:` scheme is optional)
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<LinksDocument>, AppError> {
    let handle =
        Handle::parse(&query.resource).map_err(|e| AppError::Validation(e.to_string()))?;

    if !state.config.server.is_local_host(&handle.host) {
        return Err(AppError::NotFound);
    }

    let user = state
        .db
        .get_local_user_by_username(&handle.localpart)
        .await?
        .ok_or(AppError::NotFound)?;

    let base_url = state.config.server.base_url();
    let user_url = format!("{}/api/user/{}", base_url, user.username);

    Ok(Json(LinksDocument {
        subject: Some(format!("acct:{}@{}", user.username, state.config.server.domain)),
        links: vec![
            link("self", Some("application/json"), format!("{}/profile", user_url)),
            link(
                "activity-inbox",
                Some("application/json"),
                format!("{}/inbox", user_url),
            ),
            link(
                "activity-outbox",
                Some("application/json"),
                format!("{}/feed", user_url),
            ),
            link("dialback", None, format!("{}/api/dialback", base_url)),
        ],
    }))
}

/// Dialback verification request
#[derive(Debug, Deserialize)]
struct DialbackForm {
    webfinger: String,
    token: String,
    date: String,
    /// Endpoint the token was presented to
    url: String,
}

/// POST /api/dialback
///
/// A peer asks whether we issued `token` for `webfinger` at `date` when
/// calling `url`. 200 if so, 401 otherwise.
async fn dialback(
    State(state): State<AppState>,
    Form(form): Form<DialbackForm>,
) -> Result<&'static str, AppError> {
    let handle = Handle::parse(&form.webfinger).map_err(|_| AppError::InvalidSignature)?;
    if !state.config.server.is_local_host(&handle.host) {
        tracing::debug!(webfinger = %form.webfinger, "Dialback for a foreign handle");
        return Err(AppError::InvalidSignature);
    }

    state
        .credentials
        .verify_dialback(&form.webfinger, &form.date, &form.url, &form.token)?;

    tracing::debug!(webfinger = %form.webfinger, url = %form.url, "Dialback verified");
    Ok("OK")
}
