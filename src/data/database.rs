//! SQLite database operations
//!
//! All database access goes through this module.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Local users
    // =========================================================================

    /// Create a local user together with its inbox and outbox collections.
    pub async fn insert_local_user(
        &self,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<LocalUser, AppError> {
        let now = Utc::now();
        let user = LocalUser {
            id: EntityId::new().0,
            username: username.to_string(),
            display_name: display_name.map(ToString::to_string),
            inbox_id: EntityId::new().0,
            outbox_id: EntityId::new().0,
            created_at: now,
        };

        let mut tx = self.pool.begin().await?;

        for (collection_id, collection_type, title) in [
            (&user.inbox_id, CollectionType::Inbox, "inbox"),
            (&user.outbox_id, CollectionType::Outbox, "outbox"),
        ] {
            sqlx::query(
                "INSERT INTO collections (id, collection_type, title, owner_id, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(collection_id)
            .bind(collection_type.as_str())
            .bind(format!("{}'s {}", username, title))
            .bind(&user.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO local_users (id, username, display_name, inbox_id, outbox_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(&user.inbox_id)
        .bind(&user.outbox_id)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(user)
    }

    /// Get local user by ID
    pub async fn get_local_user(&self, id: &str) -> Result<Option<LocalUser>, AppError> {
        let user = sqlx::query_as::<_, LocalUser>("SELECT * FROM local_users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Get local user by username (case-insensitive)
    pub async fn get_local_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<LocalUser>, AppError> {
        let user = sqlx::query_as::<_, LocalUser>("SELECT * FROM local_users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    // =========================================================================
    // Remote users
    // =========================================================================

    /// Get remote user by ID
    pub async fn get_remote_user(&self, id: &str) -> Result<Option<RemoteUser>, AppError> {
        let user = sqlx::query_as::<_, RemoteUser>("SELECT * FROM remote_users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Get remote user by handle (case-insensitive)
    pub async fn get_remote_user_by_webfinger(
        &self,
        webfinger: &str,
    ) -> Result<Option<RemoteUser>, AppError> {
        let user =
            sqlx::query_as::<_, RemoteUser>("SELECT * FROM remote_users WHERE webfinger = ?")
                .bind(webfinger)
                .fetch_optional(&self.pool)
                .await?;

        Ok(user)
    }

    /// Return the remote user for `webfinger`, creating a stub if none exists.
    ///
    /// Concurrent callers converge on a single row. Profile fields that are
    /// still NULL on an existing row are filled from `profile`; known values
    /// are never overwritten.
    pub async fn get_or_create_remote_user(
        &self,
        webfinger: &str,
        profile: &RemoteProfile,
    ) -> Result<RemoteUser, AppError> {
        sqlx::query(
            r#"
            INSERT INTO remote_users (id, webfinger, name, url, bio, endpoints, created_at)
            VALUES (?, ?, ?, ?, ?, NULL, ?)
            ON CONFLICT(webfinger) DO UPDATE SET
                name = COALESCE(remote_users.name, excluded.name),
                url = COALESCE(remote_users.url, excluded.url),
                bio = COALESCE(remote_users.bio, excluded.bio)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(webfinger)
        .bind(&profile.name)
        .bind(&profile.url)
        .bind(&profile.bio)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_remote_user_by_webfinger(webfinger)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Persist discovered endpoints (JSON) for a remote user.
    pub async fn update_remote_endpoints(&self, id: &str, endpoints: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE remote_users SET endpoints = ? WHERE id = ?")
            .bind(endpoints)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Collections
    // =========================================================================

    /// Create an empty collection
    pub async fn create_collection(
        &self,
        collection_type: CollectionType,
        title: Option<&str>,
        owner_id: Option<&str>,
    ) -> Result<Collection, AppError> {
        let collection = Collection {
            id: EntityId::new().0,
            collection_type: collection_type.as_str().to_string(),
            title: title.map(ToString::to_string),
            owner_id: owner_id.map(ToString::to_string),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO collections (id, collection_type, title, owner_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&collection.id)
        .bind(&collection.collection_type)
        .bind(&collection.title)
        .bind(&collection.owner_id)
        .bind(collection.created_at)
        .execute(&self.pool)
        .await?;

        Ok(collection)
    }

    /// Get collection by ID
    pub async fn get_collection(&self, id: &str) -> Result<Option<Collection>, AppError> {
        let collection = sqlx::query_as::<_, Collection>("SELECT * FROM collections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(collection)
    }

    /// Append an item to the end of a collection.
    ///
    /// An item already present is left where it is.
    ///
    /// # Returns
    /// `true` if the item was added, `false` if it was already a member.
    pub async fn append_to_collection(
        &self,
        collection_id: &str,
        kind: ItemKind,
        item_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO collection_items (collection_id, item_kind, item_id, position, added_at)
            SELECT ?, ?, ?, COALESCE(MAX(position), -1) + 1, ?
            FROM collection_items WHERE collection_id = ?
            "#,
        )
        .bind(collection_id)
        .bind(kind.as_str())
        .bind(item_id)
        .bind(Utc::now())
        .bind(collection_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Items of a collection in insertion order
    pub async fn get_collection_items(
        &self,
        collection_id: &str,
    ) -> Result<Vec<CollectionItem>, AppError> {
        let items = sqlx::query_as::<_, CollectionItem>(
            r#"
            SELECT collection_id, item_kind, item_id, position, added_at
            FROM collection_items
            WHERE collection_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// Check collection membership
    pub async fn collection_contains(
        &self,
        collection_id: &str,
        kind: ItemKind,
        item_id: &str,
    ) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM collection_items WHERE collection_id = ? AND item_kind = ? AND item_id = ?",
        )
        .bind(collection_id)
        .bind(kind.as_str())
        .bind(item_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    // =========================================================================
    // Generators
    // =========================================================================

    /// Get generator by ID
    pub async fn get_generator(&self, id: &str) -> Result<Option<Generator>, AppError> {
        let generator = sqlx::query_as::<_, Generator>("SELECT * FROM generators WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(generator)
    }

    /// Return the generator with this name and type, creating it if needed.
    pub async fn get_or_create_generator(
        &self,
        name: &str,
        object_type: &str,
    ) -> Result<Generator, AppError> {
        sqlx::query(
            r#"
            INSERT INTO generators (id, name, object_type, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name, object_type) DO NOTHING
            "#,
        )
        .bind(EntityId::new().0)
        .bind(name)
        .bind(object_type)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let generator = sqlx::query_as::<_, Generator>(
            "SELECT * FROM generators WHERE name = ? AND object_type = ?",
        )
        .bind(name)
        .bind(object_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(generator)
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Insert activity
    pub async fn insert_activity(&self, activity: &ActivityRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO activities (
                id, verb, actor_id, object, target, generator_id, content,
                to_collection, cc_collection, bto_collection, bcc_collection,
                distribution_id, published_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&activity.id)
        .bind(&activity.verb)
        .bind(&activity.actor_id)
        .bind(&activity.object)
        .bind(&activity.target)
        .bind(&activity.generator_id)
        .bind(&activity.content)
        .bind(&activity.to_collection)
        .bind(&activity.cc_collection)
        .bind(&activity.bto_collection)
        .bind(&activity.bcc_collection)
        .bind(&activity.distribution_id)
        .bind(activity.published_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get activity by ID
    pub async fn get_activity(&self, id: &str) -> Result<Option<ActivityRecord>, AppError> {
        let activity =
            sqlx::query_as::<_, ActivityRecord>("SELECT * FROM activities WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(activity)
    }

    /// Attach a distribution record to an activity unless one is already set.
    ///
    /// # Returns
    /// The distribution record ID now stored on the activity.
    pub async fn set_activity_distribution(
        &self,
        activity_id: &str,
        distribution_id: &str,
    ) -> Result<String, AppError> {
        sqlx::query(
            "UPDATE activities SET distribution_id = ? WHERE id = ? AND distribution_id IS NULL",
        )
        .bind(distribution_id)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT distribution_id FROM activities WHERE id = ?")
                .bind(activity_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        stored.ok_or(AppError::NotFound)
    }

    // =========================================================================
    // Client credentials
    // =========================================================================

    /// Get cached client credential for (user, host)
    pub async fn get_client_credential(
        &self,
        user_id: &str,
        host: &str,
    ) -> Result<Option<ClientCredential>, AppError> {
        let credential = sqlx::query_as::<_, ClientCredential>(
            "SELECT * FROM client_credentials WHERE user_id = ? AND host = ?",
        )
        .bind(user_id)
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;

        Ok(credential)
    }

    /// Insert a credential unless one exists for the same (user, host).
    ///
    /// Atomic at the SQL statement level, so concurrent registrations
    /// converge on whichever row was written first.
    ///
    /// # Returns
    /// The stored (winning) credential.
    pub async fn insert_credential_if_absent(
        &self,
        credential: &ClientCredential,
    ) -> Result<ClientCredential, AppError> {
        sqlx::query(
            r#"
            INSERT INTO client_credentials (user_id, host, client_id, client_secret, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, host) DO NOTHING
            "#,
        )
        .bind(&credential.user_id)
        .bind(&credential.host)
        .bind(&credential.client_id)
        .bind(&credential.client_secret)
        .bind(credential.created_at)
        .execute(&self.pool)
        .await?;

        self.get_client_credential(&credential.user_id, &credential.host)
            .await?
            .ok_or(AppError::NotFound)
    }
}
