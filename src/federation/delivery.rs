//! Activity distribution
//!
//! `federate` serializes an activity once, resolves every audience tier into
//! concrete recipients, fills local inboxes directly and queues one delivery
//! job per remote recipient. `deliver_remote` runs one such job: discovery,
//! client credentials, then a signed POST to the recipient's inbox.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use super::activity::{load_audience, serialize_public};
use super::audience::{AudienceEntry, AudienceResolver};
use super::credential::CredentialManager;
use super::discovery::DiscoveryClient;
use super::identity::{Handle, Identity, IdentityClassifier, LocalIdentity};
use crate::data::{CollectionType, Database, ItemKind};
use crate::error::{AppError, AudienceError};
use crate::metrics;
use crate::queue::{Job, JobHandle, JobHandler, JobQueue, RemoteDelivery};

/// Result of one `federate` run
#[derive(Debug)]
pub enum FederationOutcome {
    /// Audience resolved to nobody; nothing was recorded or queued
    NoRecipients { audience_errors: Vec<AudienceError> },
    Dispatched {
        distribution_id: String,
        /// Local inboxes that received the activity for the first time
        local_deliveries: usize,
        remote_jobs: Vec<JobHandle>,
        audience_errors: Vec<AudienceError>,
    },
}

/// Delivery dispatcher
#[derive(Clone)]
pub struct DeliveryDispatcher {
    db: Arc<Database>,
    resolver: AudienceResolver,
    classifier: IdentityClassifier,
    discovery: DiscoveryClient,
    credentials: CredentialManager,
    http_client: reqwest::Client,
    queue: Arc<dyn JobQueue>,
    base_url: String,
}

impl DeliveryDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        resolver: AudienceResolver,
        classifier: IdentityClassifier,
        discovery: DiscoveryClient,
        credentials: CredentialManager,
        http_client: reqwest::Client,
        queue: Arc<dyn JobQueue>,
        base_url: String,
    ) -> Self {
        Self {
            db,
            resolver,
            classifier,
            discovery,
            credentials,
            http_client,
            queue,
            base_url,
        }
    }

    /// Distribute a stored activity to its audience.
    ///
    /// Local inboxes are filled before this returns; remote deliveries are
    /// queued and not awaited. Running it again for the same activity reuses
    /// the existing distribution record.
    ///
    /// # Errors
    /// - NotFound if the activity or its actor does not exist
    /// - Database/Queue errors; unreachable recipients never fail this
    pub async fn federate(&self, activity_id: &str) -> Result<FederationOutcome, AppError> {
        let record = self
            .db
            .get_activity(activity_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let actor = self
            .classifier
            .local_by_id(&record.actor_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let generator = match &record.generator_id {
            Some(id) => self.db.get_generator(id).await?,
            None => None,
        };

        let audience = load_audience(&self.resolver, &record).await?;
        let payload = serialize_public(
            &record,
            &actor,
            generator.as_ref(),
            &audience,
            &self.base_url,
        );

        let entries: Vec<AudienceEntry> = audience.into_values().flatten().collect();
        let resolution = self.resolver.resolve(&entries, &HashSet::new()).await;
        for error in &resolution.errors {
            tracing::warn!(activity_id = %record.id, error = %error, "Audience entry skipped");
        }

        if resolution.is_empty() {
            tracing::info!(activity_id = %record.id, "Activity has no recipients");
            return Ok(FederationOutcome::NoRecipients {
                audience_errors: resolution.errors,
            });
        }

        let distribution_id = match &record.distribution_id {
            Some(id) => id.clone(),
            None => {
                let collection = self
                    .db
                    .create_collection(
                        CollectionType::AudienceTargetting,
                        Some(format!("Recipients of Activity {}", record.id).as_str()),
                        Some(actor.id.as_str()),
                    )
                    .await?;
                self.db
                    .set_activity_distribution(&record.id, &collection.id)
                    .await?
            }
        };

        let mut local_deliveries = 0;
        let mut remote_jobs = Vec::new();

        for identity in &resolution.identities {
            match identity {
                Identity::Local(local) => {
                    if self.deliver_local(local, &record.id).await? {
                        local_deliveries += 1;
                    }
                }
                Identity::Remote(remote) => {
                    let job = Job::DeliverRemote(RemoteDelivery {
                        activity_id: record.id.clone(),
                        payload: payload.clone(),
                        sender_id: actor.id.clone(),
                        recipient: remote.webfinger.clone(),
                        distribution_id: distribution_id.clone(),
                    });
                    remote_jobs.push(self.queue.submit(job)?);
                }
            }
        }

        // The author always sees their own activity
        if self.deliver_local(&actor, &record.id).await? {
            local_deliveries += 1;
        }

        metrics::ACTIVITIES_FEDERATED_TOTAL
            .with_label_values(&[record.verb.as_str()])
            .inc();
        tracing::info!(
            activity_id = %record.id,
            distribution_id = %distribution_id,
            local_deliveries,
            remote_jobs = remote_jobs.len(),
            audience_errors = resolution.errors.len(),
            "Activity federated"
        );

        Ok(FederationOutcome::Dispatched {
            distribution_id,
            local_deliveries,
            remote_jobs,
            audience_errors: resolution.errors,
        })
    }

    async fn deliver_local(&self, recipient: &LocalIdentity, activity_id: &str) -> Result<bool, AppError> {
        let added = self
            .db
            .append_to_collection(&recipient.inbox_id, ItemKind::Activity, activity_id)
            .await?;
        if added {
            metrics::LOCAL_INBOX_DELIVERIES_TOTAL.inc();
            tracing::debug!(recipient = %recipient.username, activity_id, "Added to local inbox");
        }
        Ok(added)
    }

    /// Deliver one activity to one remote recipient.
    ///
    /// Returns immediately if the recipient is already in the distribution
    /// record, so a retried job never posts twice after success.
    ///
    /// # Errors
    /// - Discovery/Registration if endpoints or credentials cannot be obtained
    /// - Delivery if the inbox POST fails or does not answer 200
    pub async fn deliver_remote(&self, delivery: &RemoteDelivery) -> Result<(), AppError> {
        let mut recipient = self
            .classifier
            .remote_by_webfinger(&delivery.recipient)
            .await?
            .ok_or(AppError::NotFound)?;

        if self
            .db
            .collection_contains(&delivery.distribution_id, ItemKind::RemoteUser, &recipient.id)
            .await?
        {
            tracing::debug!(
                recipient = %recipient.webfinger,
                activity_id = %delivery.activity_id,
                "Already delivered"
            );
            return Ok(());
        }

        let sender = self
            .classifier
            .local_by_id(&delivery.sender_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let endpoints = self.discovery.discover(&mut recipient).await?;
        let registration_endpoint = endpoints.registration_endpoint().ok_or_else(|| {
            AppError::Discovery(format!(
                "{} advertises no registration_endpoint",
                recipient.webfinger
            ))
        })?;
        let inbox = endpoints.activity_inbox().ok_or_else(|| {
            AppError::Discovery(format!("{} has no activity-inbox", recipient.webfinger))
        })?;

        let host = Handle::parse(&recipient.webfinger)
            .map_err(|e| AppError::Discovery(e.to_string()))?
            .host;
        let credential = self
            .credentials
            .get_or_register(&sender, &host, registration_endpoint)
            .await?;

        let body = serde_json::to_vec(&delivery.payload)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;
        let authorization = self
            .credentials
            .authorize(&credential, "POST", inbox, Some(&body))?;

        let started = Instant::now();
        let response = self
            .http_client
            .post(inbox)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::AUTHORIZATION, authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                metrics::observe_federation_request("delivery", "error", started.elapsed());
                AppError::Delivery {
                    status: None,
                    message: format!("Failed to deliver to {}: {}", inbox, e),
                }
            })?;

        let status = response.status();
        metrics::observe_federation_request("delivery", status.as_str(), started.elapsed());

        if status != reqwest::StatusCode::OK {
            return Err(AppError::Delivery {
                status: Some(status.as_u16()),
                message: format!("Inbox {} rejected activity: HTTP {}", inbox, status),
            });
        }

        self.db
            .append_to_collection(&delivery.distribution_id, ItemKind::RemoteUser, &recipient.id)
            .await?;

        tracing::info!(
            recipient = %recipient.webfinger,
            activity_id = %delivery.activity_id,
            "Delivered activity to remote inbox"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for DeliveryDispatcher {
    async fn handle(&self, job: &Job) -> Result<(), AppError> {
        match job {
            Job::Federate { activity_id } => self.federate(activity_id).await.map(|_| ()),
            Job::DeliverRemote(delivery) => self.deliver_remote(delivery).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::data::LocalUser;
    use crate::federation::activity::{NewActivity, Verb, create_activity};
    use crate::federation::audience::{AudienceTier, CollectionRef, StoreMembers};
    use crate::queue::RecordingQueue;
    use tempfile::TempDir;

    struct Fixture {
        db: Arc<Database>,
        dispatcher: DeliveryDispatcher,
        queue: Arc<RecordingQueue>,
        classifier: IdentityClassifier,
        _temp_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("delivery_test.db"))
                .await
                .unwrap(),
        );
        let config = valid_config();
        let http_client = reqwest::Client::new();
        let classifier = IdentityClassifier::new(db.clone(), &config.server);
        let resolver = AudienceResolver::new(Arc::new(StoreMembers::new(
            db.clone(),
            classifier.clone(),
        )));
        let queue = Arc::new(RecordingQueue::default());

        let dispatcher = DeliveryDispatcher::new(
            db.clone(),
            resolver,
            classifier.clone(),
            DiscoveryClient::new(http_client.clone(), db.clone()),
            CredentialManager::new(http_client.clone(), db.clone(), &config.federation),
            http_client,
            queue.clone(),
            config.server.base_url(),
        );

        Fixture {
            db,
            dispatcher,
            queue,
            classifier,
            _temp_dir: temp_dir,
        }
    }

    fn local(user: &LocalUser) -> AudienceEntry {
        AudienceEntry::Identity(Identity::Local(LocalIdentity::from_user(user, "local.test")))
    }

    #[tokio::test]
    async fn cyclic_collection_delivers_locally_without_jobs() {
        let f = fixture().await;
        let actor = f.db.insert_local_user("actor", None).await.unwrap();
        let a = f.db.insert_local_user("usera", None).await.unwrap();
        let b = f.db.insert_local_user("userb", None).await.unwrap();

        // X = {userb, X}
        let x = f
            .db
            .create_collection(CollectionType::UserDefined, Some("X"), Some(actor.id.as_str()))
            .await
            .unwrap();
        f.db.append_to_collection(&x.id, ItemKind::LocalUser, &b.id)
            .await
            .unwrap();
        f.db.append_to_collection(&x.id, ItemKind::Collection, &x.id)
            .await
            .unwrap();

        let record = create_activity(
            &f.db,
            NewActivity::new(Verb::Post, &actor.id).address(
                AudienceTier::To,
                vec![
                    local(&a),
                    AudienceEntry::Collection(CollectionRef {
                        id: x.id.clone(),
                        title: None,
                    }),
                ],
            ),
        )
        .await
        .unwrap();

        let outcome = f.dispatcher.federate(&record.id).await.unwrap();
        match outcome {
            FederationOutcome::Dispatched {
                local_deliveries,
                remote_jobs,
                ..
            } => {
                // usera, userb, plus the actor's own inbox
                assert_eq!(local_deliveries, 3);
                assert!(remote_jobs.is_empty());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        for user in [&a, &b, &actor] {
            assert!(
                f.db.collection_contains(&user.inbox_id, ItemKind::Activity, &record.id)
                    .await
                    .unwrap()
            );
        }
        assert!(f.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn empty_audience_records_nothing() {
        let f = fixture().await;
        let actor = f.db.insert_local_user("actor", None).await.unwrap();

        let record = create_activity(&f.db, NewActivity::new(Verb::Post, &actor.id))
            .await
            .unwrap();

        let outcome = f.dispatcher.federate(&record.id).await.unwrap();
        assert!(matches!(outcome, FederationOutcome::NoRecipients { .. }));

        let stored = f.db.get_activity(&record.id).await.unwrap().unwrap();
        assert!(stored.distribution_id.is_none());
        assert!(f.queue.jobs().is_empty());
        assert!(
            !f.db
                .collection_contains(&actor.inbox_id, ItemKind::Activity, &record.id)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn remote_recipients_get_one_job_each_without_blind_addresses() {
        let f = fixture().await;
        let actor = f.db.insert_local_user("actor", None).await.unwrap();
        let remotes = f
            .classifier
            .audience_from_addresses("bob@remote.example, carol@remote.example")
            .await
            .unwrap();

        let record = create_activity(
            &f.db,
            NewActivity::new(Verb::Post, &actor.id)
                .address(
                    AudienceTier::To,
                    vec![AudienceEntry::Identity(remotes[0].clone())],
                )
                .address(
                    AudienceTier::Bcc,
                    vec![
                        AudienceEntry::Identity(remotes[1].clone()),
                        AudienceEntry::Identity(remotes[0].clone()),
                    ],
                ),
        )
        .await
        .unwrap();

        f.dispatcher.federate(&record.id).await.unwrap();

        let jobs = f.queue.jobs();
        assert_eq!(jobs.len(), 2);

        let recipients: HashSet<String> = jobs
            .iter()
            .map(|job| match job {
                Job::DeliverRemote(delivery) => {
                    let body = delivery.payload.to_string();
                    assert!(body.contains("bob@remote.example"));
                    assert!(!body.contains("carol@remote.example"));
                    delivery.recipient.clone()
                }
                other => panic!("unexpected job: {:?}", other),
            })
            .collect();
        assert_eq!(
            recipients,
            HashSet::from([
                "bob@remote.example".to_string(),
                "carol@remote.example".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn federate_twice_reuses_distribution_record() {
        let f = fixture().await;
        let actor = f.db.insert_local_user("actor", None).await.unwrap();
        let bob = f.db.insert_local_user("bob", None).await.unwrap();

        let record = create_activity(
            &f.db,
            NewActivity::new(Verb::Like, &actor.id).address(AudienceTier::Cc, vec![local(&bob)]),
        )
        .await
        .unwrap();

        let first = f.dispatcher.federate(&record.id).await.unwrap();
        let second = f.dispatcher.federate(&record.id).await.unwrap();

        match (first, second) {
            (
                FederationOutcome::Dispatched {
                    distribution_id: a,
                    local_deliveries: first_count,
                    ..
                },
                FederationOutcome::Dispatched {
                    distribution_id: b,
                    local_deliveries: second_count,
                    ..
                },
            ) => {
                assert_eq!(a, b);
                assert_eq!(first_count, 2);
                assert_eq!(second_count, 0);
            }
            other => panic!("unexpected outcomes: {:?}", other),
        }
    }

    #[tokio::test]
    async fn federate_unknown_activity_is_not_found() {
        let f = fixture().await;
        assert!(matches!(
            f.dispatcher.federate("missing").await,
            Err(AppError::NotFound)
        ));
    }
}
