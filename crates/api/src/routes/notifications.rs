//! Notification routes, scoped to the authenticated user.
//!
//! Writes publish to the recipient's live channel before persisting, so a
//! failing store never delays delivery.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use beacon_common::error::AppError;
use beacon_common::types::{Notification, NotificationType, Priority, user_channel};
use beacon_notifier::demo::demo_notification;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNotificationParams {
    pub recipient: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: NotificationType,
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub link: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreateNotificationParams {
    fn validate(&self) -> Result<(), AppError> {
        if self.recipient.trim().is_empty() {
            return Err(AppError::Validation("recipient must not be empty".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(AppError::Validation("title must not be empty".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(AppError::Validation("message must not be empty".to_string()));
        }
        Ok(())
    }

    fn into_notification(self, sender: &str) -> Notification {
        let mut n = Notification::new(self.title, self.message)
            .with_kind(self.kind)
            .with_priority(self.priority)
            .with_recipient(self.recipient);
        if let Some(category) = self.category {
            n = n.with_category(category);
        }
        n.link = self.link;
        n.expires_at = self.expires_at;
        n.sender = Some(sender.to_string());
        n
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications", post(create_notification))
        .route("/api/notifications", delete(delete_all_notifications))
        .route("/api/notifications/test", post(send_test_notification))
        .route("/api/notifications/read-all", post(mark_all_read))
        .route("/api/notifications/{id}/read", post(mark_read))
        .route("/api/notifications/{id}", delete(delete_notification))
}

/// Publish live, then persist under `user_id`. Persistence failures are logged.
async fn deliver(state: &AppState, user_id: &str, notification: &Notification) -> usize {
    let receivers = state
        .channels
        .publish(&user_channel(user_id), notification.clone());

    if let Err(e) = state.store.insert(user_id, notification).await {
        tracing::warn!(
            user_id,
            id = %notification.id,
            error = %e,
            "Failed to persist notification; live delivery unaffected"
        );
    }
    receivers
}

/// GET /api/notifications?limit=N: most recent first.
async fn list_notifications(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let notifications = state.store.recent(&auth.user_id, limit).await?;
    Ok(Json(notifications))
}

/// POST /api/notifications: send to `recipient`.
async fn create_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<CreateNotificationParams>,
) -> Result<(StatusCode, Json<Notification>), AppError> {
    params.validate()?;
    let recipient = params.recipient.clone();
    let notification = params.into_notification(&auth.user_id);

    let receivers = deliver(&state, &recipient, &notification).await;
    tracing::info!(
        sender = %auth.user_id,
        recipient = %recipient,
        id = %notification.id,
        receivers,
        "Notification sent"
    );
    Ok((StatusCode::CREATED, Json(notification)))
}

/// POST /api/notifications/test: send a demo notification to yourself.
async fn send_test_notification(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<(StatusCode, Json<Notification>), AppError> {
    let notification = demo_notification(Some(&auth.user_id));
    deliver(&state, &auth.user_id, &notification).await;
    Ok((StatusCode::CREATED, Json(notification)))
}

/// POST /api/notifications/{id}/read
async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let updated = state.store.mark_read(&auth.user_id, &id).await?;
    Ok(Json(json!({ "updated": updated })))
}

/// POST /api/notifications/read-all
async fn mark_all_read(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let updated = state.store.mark_all_read(&auth.user_id).await?;
    Ok(Json(json!({ "updated": updated })))
}

/// DELETE /api/notifications/{id}: absent ids are not an error.
async fn delete_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state.store.delete(&auth.user_id, &id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

/// DELETE /api/notifications
async fn delete_all_notifications(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state.store.delete_all(&auth.user_id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(recipient: &str, title: &str) -> CreateNotificationParams {
        serde_json::from_value(json!({
            "recipient": recipient,
            "title": title,
            "message": "Body",
        }))
        .unwrap()
    }

    #[test]
    fn test_create_params_defaults() {
        let p = params("user-2", "Hello");
        assert_eq!(p.kind, NotificationType::Info);
        assert_eq!(p.priority, Priority::Medium);
        assert!(p.validate().is_ok());

        let n = p.into_notification("user-1");
        assert_eq!(n.sender.as_deref(), Some("user-1"));
        assert_eq!(n.recipient.as_deref(), Some("user-2"));
        assert_eq!(n.category, "system");
        assert!(!n.read);
    }

    #[test]
    fn test_blank_fields_rejected() {
        assert!(params("", "Hello").validate().is_err());
        assert!(params("user-2", "   ").validate().is_err());
    }
}
