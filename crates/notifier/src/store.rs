//! Backing store for the persistent transport and the REST endpoints.
//!
//! Every write is idempotent: inserting an existing id, marking a read row as
//! read or deleting a missing row all succeed without effect.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;

use beacon_common::error::PersistenceError;
use beacon_common::types::{Notification, NotificationRecord};

/// Postgres channel the insert trigger publishes on.
pub const INSERT_CHANNEL: &str = "notification_inserted";

#[async_trait]
pub trait NotificationStore: Send + Sync + 'static {
    /// Returns false when the id already existed.
    async fn insert(&self, user_id: &str, notification: &Notification)
    -> Result<bool, PersistenceError>;

    /// Returns false when no unread row with this id exists.
    async fn mark_read(&self, user_id: &str, id: &str) -> Result<bool, PersistenceError>;

    /// Returns the number of rows that changed.
    async fn mark_all_read(&self, user_id: &str) -> Result<u64, PersistenceError>;

    async fn delete(&self, user_id: &str, id: &str) -> Result<bool, PersistenceError>;

    async fn delete_all(&self, user_id: &str) -> Result<u64, PersistenceError>;

    /// Newest first.
    async fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>, PersistenceError>;

    /// Live feed of rows inserted for `user_id` from now on. The stream ends
    /// when the underlying subscription is lost.
    async fn watch_inserts(
        &self,
        user_id: &str,
    ) -> Result<BoxStream<'static, Notification>, PersistenceError>;
}

// ============================================================
// PostgreSQL
// ============================================================

pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Key published by the insert trigger.
#[derive(Debug, Deserialize)]
struct InsertedKey {
    id: String,
    user_id: String,
}

/// Decode a trigger payload, keeping only ids of rows owned by `user_id`.
fn decode_insert(user_id: &str, payload: &str) -> Option<String> {
    match serde_json::from_str::<InsertedKey>(payload) {
        Ok(key) if key.user_id == user_id => Some(key.id),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable change-feed payload");
            None
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT id, user_id, title, message, type, timestamp, read, link, \
     category, priority, sender, recipient, expires_at FROM notifications";

async fn fetch_one(
    pool: &PgPool,
    user_id: &str,
    id: &str,
) -> Result<Option<Notification>, PersistenceError> {
    let row = sqlx::query_as::<_, NotificationRecord>(&format!(
        "{} WHERE id = $1 AND user_id = $2",
        SELECT_COLUMNS
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(NotificationRecord::into_notification))
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(
        &self,
        user_id: &str,
        notification: &Notification,
    ) -> Result<bool, PersistenceError> {
        let record = NotificationRecord::from_notification(user_id, notification);
        let result = sqlx::query(
            r#"
            INSERT INTO notifications
                (id, user_id, title, message, type, timestamp, read, link,
                 category, priority, sender, recipient, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.title)
        .bind(&record.message)
        .bind(record.kind)
        .bind(record.timestamp)
        .bind(record.read)
        .bind(&record.link)
        .bind(&record.category)
        .bind(record.priority)
        .bind(&record.sender)
        .bind(&record.recipient)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_read(&self, user_id: &str, id: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            "UPDATE notifications SET read = true WHERE id = $1 AND user_id = $2 AND read = false",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<u64, PersistenceError> {
        let result =
            sqlx::query("UPDATE notifications SET read = true WHERE user_id = $1 AND read = false")
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_all(&self, user_id: &str) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM notifications WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>, PersistenceError> {
        let rows = sqlx::query_as::<_, NotificationRecord>(&format!(
            "{} WHERE user_id = $1 ORDER BY timestamp DESC LIMIT $2",
            SELECT_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(NotificationRecord::into_notification).collect())
    }

    async fn watch_inserts(
        &self,
        user_id: &str,
    ) -> Result<BoxStream<'static, Notification>, PersistenceError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(INSERT_CHANNEL).await?;
        tracing::debug!(user_id, channel = INSERT_CHANNEL, "Listening for inserts");

        let user_id = user_id.to_string();
        let pool = self.pool.clone();
        let stream = listener
            .into_stream()
            .take_while(|item| {
                if let Err(e) = item {
                    tracing::warn!(error = %e, "Change feed interrupted");
                }
                futures::future::ready(item.is_ok())
            })
            .filter_map(move |item| {
                let id = item
                    .ok()
                    .and_then(|message| decode_insert(&user_id, message.payload()));
                let pool = pool.clone();
                let user_id = user_id.clone();
                async move {
                    let id = id?;
                    match fetch_one(&pool, &user_id, &id).await {
                        Ok(found) => found,
                        Err(e) => {
                            tracing::warn!(id = %id, error = %e, "Failed to load inserted row");
                            None
                        }
                    }
                }
            })
            .boxed();

        Ok(stream)
    }
}

// ============================================================
// In-memory
// ============================================================

/// Process-local store with the same contract, including the insert feed.
/// Used when no database is configured and in tests, where it can be made
/// to fail on demand.
pub struct MemoryNotificationStore {
    rows: Mutex<Vec<NotificationRecord>>,
    feed: Mutex<broadcast::Sender<NotificationRecord>>,
    available: AtomicBool,
    watch_attempts: AtomicUsize,
}

impl Default for MemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            rows: Mutex::new(Vec::new()),
            feed: Mutex::new(feed),
            available: AtomicBool::new(true),
            watch_attempts: AtomicUsize::new(0),
        }
    }

    /// While unavailable every operation fails with `PersistenceError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// End every open insert feed, as a dropped database connection would.
    pub fn close_feeds(&self) {
        let (feed, _) = broadcast::channel(256);
        *self.feed.lock() = feed;
    }

    /// Insert a row as another writer would (bypassing any transport).
    pub fn insert_external(&self, user_id: &str, notification: &Notification) -> bool {
        self.insert_record(NotificationRecord::from_notification(user_id, notification))
    }

    pub fn rows(&self, user_id: &str) -> Vec<NotificationRecord> {
        self.rows
            .lock()
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn feed_subscribers(&self) -> usize {
        self.feed.lock().receiver_count()
    }

    /// Calls to `watch_inserts`, successful or not.
    pub fn watch_attempts(&self) -> usize {
        self.watch_attempts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PersistenceError::Unavailable("memory store offline".to_string()))
        }
    }

    fn insert_record(&self, record: NotificationRecord) -> bool {
        {
            let mut rows = self.rows.lock();
            if rows.iter().any(|row| row.id == record.id) {
                return false;
            }
            rows.push(record.clone());
        }
        let _ = self.feed.lock().send(record);
        true
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(
        &self,
        user_id: &str,
        notification: &Notification,
    ) -> Result<bool, PersistenceError> {
        self.check()?;
        Ok(self.insert_record(NotificationRecord::from_notification(user_id, notification)))
    }

    async fn mark_read(&self, user_id: &str, id: &str) -> Result<bool, PersistenceError> {
        self.check()?;
        let mut rows = self.rows.lock();
        let row = rows
            .iter_mut()
            .find(|row| row.user_id == user_id && row.id == id && !row.read);
        Ok(match row {
            Some(row) => {
                row.read = true;
                true
            }
            None => false,
        })
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<u64, PersistenceError> {
        self.check()?;
        let mut changed = 0;
        for row in self.rows.lock().iter_mut() {
            if row.user_id == user_id && !row.read {
                row.read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<bool, PersistenceError> {
        self.check()?;
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|row| !(row.user_id == user_id && row.id == id));
        Ok(rows.len() != before)
    }

    async fn delete_all(&self, user_id: &str) -> Result<u64, PersistenceError> {
        self.check()?;
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|row| row.user_id != user_id);
        Ok((before - rows.len()) as u64)
    }

    async fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>, PersistenceError> {
        self.check()?;
        let mut rows = self.rows(user_id);
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(limit.max(0) as usize);
        Ok(rows.into_iter().map(NotificationRecord::into_notification).collect())
    }

    async fn watch_inserts(
        &self,
        user_id: &str,
    ) -> Result<BoxStream<'static, Notification>, PersistenceError> {
        self.watch_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let receiver = self.feed.lock().subscribe();
        let user_id = user_id.to_string();

        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let user_id = user_id.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(record) if record.user_id == user_id => {
                            return Some((record.into_notification(), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Insert feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(stream)
    }
}
