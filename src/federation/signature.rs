//! Request signing for pump.io federation
//!
//! Implements:
//! - OAuth 1.0 HMAC-SHA1 client signatures (RFC 5849) with `oauth_body_hash`
//!   for the JSON bodies we POST to remote inboxes
//! - Dialback tokens used to prove our identity when registering as a client

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::AppError;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew for dialback dates (seconds)
const DIALBACK_MAX_SKEW_SECS: i64 = 300;

// =============================================================================
// OAuth 1.0
// =============================================================================

/// Percent-encode per RFC 5849 section 3.6 (unreserved characters kept).
fn oauth_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Build the RFC 5849 signature base string.
///
/// # Arguments
/// * `method` - HTTP method (uppercased here)
/// * `url` - Full request URL; query parameters are folded into the
///   parameter set
/// * `oauth_params` - `oauth_*` protocol parameters, excluding `oauth_signature`
pub fn signature_base_string(
    method: &str,
    url: &str,
    oauth_params: &[(String, String)],
) -> Result<String, AppError> {
    let parsed =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?
        .to_ascii_lowercase();

    // Url::port() is None for the scheme's default port
    let base_url = match parsed.port() {
        Some(port) => format!("{}://{}:{}{}", parsed.scheme(), host, port, parsed.path()),
        None => format!("{}://{}{}", parsed.scheme(), host, parsed.path()),
    };

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (oauth_encode(&k), oauth_encode(&v)))
        .collect();
    params.extend(
        oauth_params
            .iter()
            .map(|(k, v)| (oauth_encode(k), oauth_encode(v))),
    );
    params.sort();

    let normalized = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    Ok(format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        oauth_encode(&base_url),
        oauth_encode(&normalized)
    ))
}

/// base64(SHA1(body)), the `oauth_body_hash` parameter value
pub fn body_hash(body: &[u8]) -> String {
    BASE64.encode(Sha1::digest(body))
}

fn hmac_sha1_signature(client_secret: &str, base_string: &str) -> Result<String, AppError> {
    // Two-legged: no token secret after the '&'
    let key = format!("{}&", oauth_encode(client_secret));
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid HMAC key: {}", e)))?;
    mac.update(base_string.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Build an OAuth 1.0 `Authorization` header for a request.
///
/// # Example
/// ```ignore
/// let header = oauth1_authorization(&client_id, &client_secret, "POST", inbox, Some(&body))?;
/// request.header("Authorization", header)
/// ```
pub fn oauth1_authorization(
    client_id: &str,
    client_secret: &str,
    method: &str,
    url: &str,
    body: Option<&[u8]>,
) -> Result<String, AppError> {
    oauth1_authorization_with(
        client_id,
        client_secret,
        method,
        url,
        body,
        &generate_nonce(),
        Utc::now().timestamp(),
    )
}

/// Same as [`oauth1_authorization`] with a caller-supplied nonce and timestamp.
pub fn oauth1_authorization_with(
    client_id: &str,
    client_secret: &str,
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    nonce: &str,
    timestamp: i64,
) -> Result<String, AppError> {
    let mut params = vec![
        ("oauth_consumer_key".to_string(), client_id.to_string()),
        ("oauth_nonce".to_string(), nonce.to_string()),
        (
            "oauth_signature_method".to_string(),
            "HMAC-SHA1".to_string(),
        ),
        ("oauth_timestamp".to_string(), timestamp.to_string()),
        ("oauth_version".to_string(), "1.0".to_string()),
    ];
    if let Some(body) = body {
        params.push(("oauth_body_hash".to_string(), body_hash(body)));
    }

    let base_string = signature_base_string(method, url, &params)?;
    let signature = hmac_sha1_signature(client_secret, &base_string)?;
    params.push(("oauth_signature".to_string(), signature));

    let fields = params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, oauth_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!("OAuth {}", fields))
}

/// Parse an `Authorization: OAuth ...` header into its (decoded) parameters.
pub fn parse_oauth_header(header: &str) -> Result<BTreeMap<String, String>, AppError> {
    let fields = header
        .trim()
        .strip_prefix("OAuth ")
        .ok_or_else(|| AppError::Validation("Not an OAuth authorization header".to_string()))?;

    let mut params = BTreeMap::new();
    for part in fields.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        let decoded = urlencoding::decode(value)
            .map_err(|_| AppError::Validation(format!("Invalid encoding for {}", key)))?;
        params.insert(key.trim().to_string(), decoded.into_owned());
    }

    Ok(params)
}

/// Verify an OAuth 1.0 HMAC-SHA1 signed request.
///
/// # Returns
/// The `oauth_consumer_key` (client ID) that signed the request
///
/// # Errors
/// - Validation if the header is malformed
/// - InvalidSignature if the signature or body hash does not match
pub fn verify_oauth1(
    header: &str,
    client_secret: &str,
    method: &str,
    url: &str,
    body: Option<&[u8]>,
) -> Result<String, AppError> {
    let mut params = parse_oauth_header(header)?;
    params.remove("realm");

    let signature = params
        .remove("oauth_signature")
        .ok_or_else(|| AppError::Validation("Missing oauth_signature".to_string()))?;

    match params.get("oauth_signature_method").map(String::as_str) {
        Some("HMAC-SHA1") => {}
        other => {
            return Err(AppError::Validation(format!(
                "Unsupported signature method: {:?}",
                other
            )));
        }
    }

    let client_id = params
        .get("oauth_consumer_key")
        .cloned()
        .ok_or_else(|| AppError::Validation("Missing oauth_consumer_key".to_string()))?;

    if let Some(body) = body {
        if params.get("oauth_body_hash") != Some(&body_hash(body)) {
            return Err(AppError::InvalidSignature);
        }
    }

    let params: Vec<(String, String)> = params.into_iter().collect();
    let base_string = signature_base_string(method, url, &params)?;

    let key = format!("{}&", oauth_encode(client_secret));
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid HMAC key: {}", e)))?;
    mac.update(base_string.as_bytes());

    let signature_bytes = BASE64
        .decode(signature)
        .map_err(|_| AppError::InvalidSignature)?;
    mac.verify_slice(&signature_bytes)
        .map_err(|_| AppError::InvalidSignature)?;

    Ok(client_id)
}

// =============================================================================
// Dialback
// =============================================================================

/// Current time formatted for a `Date` header (RFC 2822, GMT)
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Mint a dialback token: base64(HMAC-SHA256(secret, "webfinger\ndate\nendpoint")).
pub fn dialback_token(
    secret: &str,
    webfinger: &str,
    date: &str,
    endpoint: &str,
) -> Result<String, AppError> {
    let mac = dialback_mac(secret, webfinger, date, endpoint)?;
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn dialback_mac(
    secret: &str,
    webfinger: &str,
    date: &str,
    endpoint: &str,
) -> Result<HmacSha256, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid HMAC key: {}", e)))?;
    mac.update(format!("{}\n{}\n{}", webfinger, date, endpoint).as_bytes());
    Ok(mac)
}

/// `Authorization` header value for a dialback-authenticated request
pub fn dialback_header(webfinger: &str, token: &str) -> String {
    format!("Dialback webfinger=\"{}\", token=\"{}\"", webfinger, token)
}

/// Parsed `Authorization: Dialback ...` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialbackCredentials {
    pub webfinger: String,
    pub token: String,
}

/// Parse a `Dialback webfinger="...", token="..."` header.
pub fn parse_dialback_header(header: &str) -> Result<DialbackCredentials, AppError> {
    let fields = header
        .trim()
        .strip_prefix("Dialback ")
        .ok_or_else(|| AppError::Validation("Not a Dialback authorization header".to_string()))?;

    let mut webfinger = None;
    let mut token = None;
    for part in fields.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "webfinger" => webfinger = Some(value),
                "token" => token = Some(value),
                _ => {}
            }
        }
    }

    Ok(DialbackCredentials {
        webfinger: webfinger
            .ok_or_else(|| AppError::Validation("Missing webfinger".to_string()))?,
        token: token.ok_or_else(|| AppError::Validation("Missing token".to_string()))?,
    })
}

/// Check a dialback token minted by [`dialback_token`].
///
/// Rejects dates more than five minutes away from now.
pub fn verify_dialback(
    secret: &str,
    webfinger: &str,
    date: &str,
    endpoint: &str,
    token: &str,
) -> Result<(), AppError> {
    let parsed = DateTime::parse_from_rfc2822(date)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;
    if (Utc::now().timestamp() - parsed.timestamp()).abs() > DIALBACK_MAX_SKEW_SECS {
        return Err(AppError::InvalidSignature);
    }

    let token_bytes = BASE64
        .decode(token)
        .map_err(|_| AppError::InvalidSignature)?;
    dialback_mac(secret, webfinger, date, endpoint)?
        .verify_slice(&token_bytes)
        .map_err(|_| AppError::InvalidSignature)
}
