use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display flavour of a notification. Drives icon/styling only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::Info => write!(f, "info"),
            NotificationType::Success => write!(f, "success"),
            NotificationType::Warning => write!(f, "warning"),
            NotificationType::Error => write!(f, "error"),
        }
    }
}

/// Notification priority levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// A delivered notification.
///
/// Missing `id`, `timestamp` or `category` on the wire are filled in on receipt,
/// so a sender may publish the bare `title` + `message` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default = "generate_id")]
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: NotificationType,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub read: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_category() -> String {
    "system".to_string()
}

impl Notification {
    /// Build an unread notification stamped with a fresh id and the current time.
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            title: title.into(),
            message: message.into(),
            kind: NotificationType::default(),
            category: default_category(),
            priority: Priority::default(),
            read: false,
            timestamp: Utc::now(),
            link: None,
            sender: None,
            recipient: None,
            expires_at: None,
        }
    }

    pub fn with_kind(mut self, kind: NotificationType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Whether `expires_at` has passed. Informational only; nothing evicts
    /// expired notifications automatically.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The persisted row, one per notification, owned by `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub message: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub link: Option<String>,
    pub category: String,
    pub priority: Priority,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    pub fn from_notification(user_id: &str, notification: &Notification) -> Self {
        Self {
            id: notification.id.clone(),
            user_id: user_id.to_string(),
            title: notification.title.clone(),
            message: notification.message.clone(),
            kind: notification.kind,
            timestamp: notification.timestamp,
            read: notification.read,
            link: notification.link.clone(),
            category: notification.category.clone(),
            priority: notification.priority,
            sender: notification.sender.clone(),
            recipient: notification.recipient.clone(),
            expires_at: notification.expires_at,
        }
    }

    pub fn into_notification(self) -> Notification {
        Notification {
            id: self.id,
            title: self.title,
            message: self.message,
            kind: self.kind,
            category: self.category,
            priority: self.priority,
            read: self.read,
            timestamp: self.timestamp,
            link: self.link,
            sender: self.sender,
            recipient: self.recipient,
            expires_at: self.expires_at,
        }
    }
}

/// Wire envelope exchanged over the live transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Client → server: start receiving a channel.
    Subscribe { channel: String },

    /// Server → client: one delivered notification.
    Notification {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        notification: Notification,
    },

    /// Server → client: acknowledgement of a `subscribe`.
    SubscriptionSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

impl Envelope {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Logical per-user channel name, `user:{id}`.
pub fn user_channel(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Inverse of [`user_channel`].
pub fn channel_user(channel: &str) -> Option<&str> {
    channel.strip_prefix("user:").filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_notification_gets_defaults() {
        let json = r#"{"title":"Hello","message":"World"}"#;
        let n: Notification = serde_json::from_str(json).unwrap();
        assert!(!n.id.is_empty());
        assert_eq!(n.kind, NotificationType::Info);
        assert_eq!(n.priority, Priority::Medium);
        assert_eq!(n.category, "system");
        assert!(!n.read);
    }

    #[test]
    fn test_type_field_is_renamed() {
        let n = Notification::new("t", "m").with_kind(NotificationType::Warning);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "warning");
        assert!(json.get("link").is_none());
    }

    #[test]
    fn test_envelope_subscribe_shape() {
        let env = Envelope::Subscribe {
            channel: user_channel("user-1"),
        };
        let json = env.to_json().unwrap();
        assert_eq!(json, r#"{"type":"subscribe","channel":"user:user-1"}"#);
    }

    #[test]
    fn test_envelope_notification_parsing() {
        let raw = r#"{"type":"notification","notification":{"id":"n1","title":"A","message":"B","type":"error","priority":"high","timestamp":"2024-05-01T10:00:00Z"}}"#;
        match Envelope::from_json(raw).unwrap() {
            Envelope::Notification {
                channel,
                notification,
            } => {
                assert!(channel.is_none());
                assert_eq!(notification.id, "n1");
                assert_eq!(notification.kind, NotificationType::Error);
                assert_eq!(notification.priority, Priority::High);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_envelope_type_rejected() {
        assert!(Envelope::from_json(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_channel_user_roundtrip() {
        assert_eq!(channel_user(&user_channel("abc")), Some("abc"));
        assert_eq!(channel_user("user:"), None);
        assert_eq!(channel_user("team:abc"), None);
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        let mut n = Notification::new("t", "m");
        assert!(!n.is_expired(now));
        n.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(n.is_expired(now));
    }
}
