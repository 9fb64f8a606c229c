//! PostgreSQL record store.
//!
//! Rows live in a configurable table. A row trigger publishes every mutation
//! with `pg_notify` on `<table>_changes`; [`PgRecordStore::listen`] relays
//! those notifications into the store's change feed, so changes made by
//! other processes (or by hand) reach the change-stream watcher too.
//!
//! Notification payloads are capped by PostgreSQL at 8000 bytes, so the
//! trigger sends only the operation, the key and whether the description
//! changed. The relay reads the new description back from the table.

use crate::config::StoreConfig;
use crate::record_store::{ChangeFeed, Record, RecordChange, RecordField, RecordStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that a table name is a plain SQL identifier
pub fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);

    // The trigger and channel names add a suffix to the table name.
    let fits = name.len() + "_notify_change".len() <= MAX_IDENTIFIER_LEN;

    if valid_start && fits && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}

/// Row operation reported by the change trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Payload emitted by the change trigger
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangeNotification {
    pub op: ChangeOp,
    pub key: String,
    #[serde(default)]
    pub description_changed: bool,
}

impl ChangeNotification {
    /// Build the change, given the current description when it changed
    pub fn into_change(self, description: Option<String>) -> RecordChange {
        match self.op {
            ChangeOp::Insert => RecordChange::Insert { key: self.key },
            ChangeOp::Update => RecordChange::Modify {
                key: self.key,
                new_description: description.filter(|_| self.description_changed),
            },
            ChangeOp::Delete => RecordChange::Remove { key: self.key },
        }
    }
}

/// Decode a trigger payload
pub fn decode_notification(payload: &str) -> Result<ChangeNotification, StoreError> {
    serde_json::from_str(payload).map_err(|e| StoreError::Decode(e.to_string()))
}

/// Trigger function publishing row changes on `<table>_changes`
fn notify_function_sql(table: &str) -> String {
    format!(
        "CREATE OR REPLACE FUNCTION {table}_notify_change() RETURNS trigger AS $$
        BEGIN
            PERFORM pg_notify(
                '{table}_changes',
                json_build_object(
                    'op', TG_OP,
                    'key', CASE WHEN TG_OP = 'DELETE' THEN OLD.key ELSE NEW.key END,
                    'description_changed', CASE
                        WHEN TG_OP = 'UPDATE' THEN OLD.description IS DISTINCT FROM NEW.description
                        ELSE FALSE
                    END
                )::text
            );
            RETURN NULL;
        END;
        $$ LANGUAGE plpgsql"
    )
}

/// Record store backed by a PostgreSQL table
pub struct PgRecordStore {
    pool: PgPool,
    table: String,
    changes: Arc<ChangeFeed>,
}

impl PgRecordStore {
    /// Connect with a new pool
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("no database URL configured".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(url)
            .await?;

        info!(table = %config.table_name, "Connected to PostgreSQL database");

        Self::from_pool(pool, &config.table_name)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;

        Ok(Self {
            pool,
            table: table.to_string(),
            changes: Arc::new(ChangeFeed::default()),
        })
    }

    /// Notification channel of the change trigger
    pub fn channel(&self) -> String {
        format!("{}_changes", self.table)
    }

    /// Create the table and the change trigger if missing
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!(table = %self.table, "Running database migrations");

        let table = &self.table;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    key TEXT PRIMARY KEY,
                    origin TEXT NOT NULL,
                    processed_at TIMESTAMPTZ NOT NULL,
                    description TEXT
                )"
            ),
            notify_function_sql(table),
            format!("DROP TRIGGER IF EXISTS {table}_changes ON {table}"),
            format!(
                "CREATE TRIGGER {table}_changes
                AFTER INSERT OR UPDATE OR DELETE ON {table}
                FOR EACH ROW EXECUTE FUNCTION {table}_notify_change()"
            ),
        ];

        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Relay trigger notifications into the change stream
    pub async fn listen(&self) -> Result<JoinHandle<()>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        let channel = self.channel();
        listener.listen(&channel).await?;

        info!(channel = %channel, "Listening for record changes");

        let feed = self.changes.clone();
        let pool = self.pool.clone();
        let description_sql = format!("SELECT description FROM {} WHERE key = $1", self.table);
        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => match decode_notification(notification.payload()) {
                        Ok(notification) => {
                            let description = if notification.description_changed {
                                fetch_description(&pool, &description_sql, &notification.key).await
                            } else {
                                None
                            };
                            let change = notification.into_change(description);
                            debug!(key = %change.key(), "Record change received");
                            feed.publish(change);
                        }
                        Err(e) => warn!(error = %e, "Ignoring change notification"),
                    },
                    Err(e) => {
                        error!(error = %e, "Change listener error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn fetch_description(pool: &PgPool, sql: &str, key: &str) -> Option<String> {
    match sqlx::query_scalar::<_, Option<String>>(sql)
        .bind(key)
        .fetch_optional(pool)
        .await
    {
        Ok(description) => description.flatten(),
        Err(e) => {
            error!(key, error = %e, "Failed to read changed description");
            None
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn upsert(&self, key: &str, origin: &str, processed_at: DateTime<Utc>) -> Result<Record, StoreError> {
        let sql = format!(
            "INSERT INTO {} (key, origin, processed_at) VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE SET origin = EXCLUDED.origin, processed_at = EXCLUDED.processed_at
             RETURNING key, origin, processed_at, description",
            self.table
        );

        let record = sqlx::query_as::<_, Record>(&sql)
            .bind(key)
            .bind(origin)
            .bind(processed_at)
            .fetch_one(&self.pool)
            .await?;

        debug!("Record upserted");
        Ok(record)
    }

    #[instrument(skip(self, value), fields(table = %self.table))]
    async fn set_field(&self, key: &str, field: RecordField, value: &str) -> Result<Record, StoreError> {
        let sql = format!(
            "UPDATE {} SET {} = $2 WHERE key = $1 RETURNING key, origin, processed_at, description",
            self.table,
            field.column()
        );

        sqlx::query_as::<_, Record>(&sql)
            .bind(key)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn delete(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE key = $1 RETURNING key, origin, processed_at, description",
            self.table
        );

        Ok(sqlx::query_as::<_, Record>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let sql = format!(
            "SELECT key, origin, processed_at, description FROM {} WHERE key = $1",
            self.table
        );

        Ok(sqlx::query_as::<_, Record>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RecordChange> {
        self.changes.subscribe()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
