//! Text rendering of the inbox, as a boundary-wrapped component.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use beacon_boundary::{Component, Render};
use beacon_common::error::RenderError;
use beacon_common::types::{Notification, NotificationType, Priority};

use crate::center::NotificationCenter;

/// Rendered inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxView {
    pub connected: bool,
    pub unread_count: usize,
    pub lines: Vec<String>,
}

impl fmt::Display for InboxView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.connected { "online" } else { "offline" };
        writeln!(f, "── Inbox [{}] {} unread ──", status, self.unread_count)?;
        if self.lines.is_empty() {
            writeln!(f, "  (no notifications)")?;
        }
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

pub struct InboxPanel {
    center: Arc<NotificationCenter>,
    limit: usize,
}

impl InboxPanel {
    pub fn new(center: Arc<NotificationCenter>) -> Self {
        Self { center, limit: 10 }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

fn marker(kind: NotificationType) -> &'static str {
    match kind {
        NotificationType::Info => "i",
        NotificationType::Success => "+",
        NotificationType::Warning => "!",
        NotificationType::Error => "x",
    }
}

fn format_line(n: &Notification) -> String {
    let unread = if n.read { " " } else { "*" };
    let priority = match n.priority {
        Priority::High => " [high]",
        Priority::Medium | Priority::Low => "",
    };
    let stale = if n.is_expired(Utc::now()) { " (expired)" } else { "" };
    format!(
        "{} [{}] {} {:<12} {}: {}{}{}  ({})",
        unread,
        marker(n.kind),
        n.timestamp.format("%H:%M:%S"),
        n.category,
        n.title,
        n.message,
        priority,
        stale,
        n.id
    )
}

impl Component for InboxPanel {
    type View = InboxView;

    fn render(&mut self) -> Result<Render<InboxView>, RenderError> {
        let snapshot = self.center.snapshot();
        if !snapshot.loaded {
            return Ok(Render::Loading);
        }

        let lines = snapshot
            .notifications
            .iter()
            .take(self.limit)
            .map(format_line)
            .collect();

        Ok(Render::Ready(InboxView {
            connected: snapshot.connected,
            unread_count: snapshot.unread_count,
            lines,
        }))
    }
}
