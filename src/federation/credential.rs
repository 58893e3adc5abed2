//! Client credentials for remote servers
//!
//! Before we can sign requests to a pump.io server, each local sender needs
//! an OAuth client registered with that server. Registration is authenticated
//! by dialback and the resulting credential is stored per (sender, host).

use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use super::identity::LocalIdentity;
use super::signature;
use crate::config::{FederationConfig, normalize_host};
use crate::data::{ClientCredential, Database};
use crate::error::AppError;
use crate::metrics;

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    client_secret: String,
}

/// Credential manager
///
/// Sole writer of client credentials.
#[derive(Clone)]
pub struct CredentialManager {
    http_client: reqwest::Client,
    db: Arc<Database>,
    dialback_secret: String,
    application_name: String,
}

impl CredentialManager {
    pub fn new(http_client: reqwest::Client, db: Arc<Database>, config: &FederationConfig) -> Self {
        Self {
            http_client,
            db,
            dialback_secret: config.dialback_secret.clone(),
            application_name: config.application_name.clone(),
        }
    }

    /// Return the stored credential for (sender, host), registering first if
    /// there is none.
    ///
    /// Concurrent registrations for the same key converge on the first stored
    /// credential.
    ///
    /// # Errors
    /// `AppError::Registration` if the remote server does not answer 200 with
    /// `client_id` and `client_secret`. Not retried here.
    pub async fn get_or_register(
        &self,
        sender: &LocalIdentity,
        host: &str,
        registration_endpoint: &str,
    ) -> Result<ClientCredential, AppError> {
        let host = normalize_host(host);

        if let Some(credential) = self.db.get_client_credential(&sender.id, &host).await? {
            metrics::CACHE_HITS_TOTAL
                .with_label_values(&["client_credentials"])
                .inc();
            return Ok(credential);
        }
        metrics::CACHE_MISSES_TOTAL
            .with_label_values(&["client_credentials"])
            .inc();

        let registered = self.register(sender, registration_endpoint).await?;
        let candidate = ClientCredential {
            user_id: sender.id.clone(),
            host: host.clone(),
            client_id: registered.client_id,
            client_secret: registered.client_secret,
            created_at: chrono::Utc::now(),
        };

        let stored = self.db.insert_credential_if_absent(&candidate).await?;
        if stored.client_id != candidate.client_id {
            tracing::info!(
                sender = %sender.webfinger(),
                host = %host,
                "Concurrent registration already stored a credential, reusing it"
            );
        } else {
            tracing::info!(
                sender = %sender.webfinger(),
                host = %host,
                "Registered client with remote server"
            );
        }

        Ok(stored)
    }

    async fn register(
        &self,
        sender: &LocalIdentity,
        registration_endpoint: &str,
    ) -> Result<RegistrationResponse, AppError> {
        let webfinger = sender.webfinger();
        let date = signature::http_date();
        let token = signature::dialback_token(
            &self.dialback_secret,
            &webfinger,
            &date,
            registration_endpoint,
        )?;

        let body = serde_json::json!({
            "type": "client_associate",
            "application_type": "web",
            "application_name": self.application_name,
        });

        let started = Instant::now();
        let response = self
            .http_client
            .post(registration_endpoint)
            .header(
                reqwest::header::AUTHORIZATION,
                signature::dialback_header(&webfinger, &token),
            )
            .header(reqwest::header::DATE, date)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                metrics::observe_federation_request("registration", "error", started.elapsed());
                AppError::Registration(format!(
                    "POST {} failed: {}",
                    registration_endpoint, e
                ))
            })?;

        let status = response.status();
        metrics::observe_federation_request("registration", status.as_str(), started.elapsed());

        if status != reqwest::StatusCode::OK {
            return Err(AppError::Registration(format!(
                "{} returned HTTP {}",
                registration_endpoint, status
            )));
        }

        response.json::<RegistrationResponse>().await.map_err(|e| {
            AppError::Registration(format!(
                "{} returned an invalid registration response: {}",
                registration_endpoint, e
            ))
        })
    }

    /// OAuth 1.0 `Authorization` header for a request signed with `credential`
    pub fn authorize(
        &self,
        credential: &ClientCredential,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<String, AppError> {
        signature::oauth1_authorization(
            &credential.client_id,
            &credential.client_secret,
            method,
            url,
            body,
        )
    }

    /// Check a dialback token a peer received from us.
    pub fn verify_dialback(
        &self,
        webfinger: &str,
        date: &str,
        endpoint: &str,
        token: &str,
    ) -> Result<(), AppError> {
        signature::verify_dialback(&self.dialback_secret, webfinger, date, endpoint, token)
    }
}
