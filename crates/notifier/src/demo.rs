//! Synthetic notifications for demos, "send test notification" actions and tests.

use rand::seq::SliceRandom;

use beacon_common::types::{Notification, NotificationType, Priority};

struct Template {
    title: &'static str,
    message: &'static str,
    kind: NotificationType,
    category: &'static str,
    priority: Priority,
}

const TEMPLATES: &[Template] = &[
    Template {
        title: "New work order assigned",
        message: "Work order WO-1042 has been assigned to you.",
        kind: NotificationType::Info,
        category: "work-order",
        priority: Priority::High,
    },
    Template {
        title: "Work order completed",
        message: "WO-0987 was marked complete by the field crew.",
        kind: NotificationType::Success,
        category: "work-order",
        priority: Priority::Medium,
    },
    Template {
        title: "Low stock",
        message: "Hydraulic filters are below the reorder threshold.",
        kind: NotificationType::Warning,
        category: "inventory",
        priority: Priority::Medium,
    },
    Template {
        title: "Invoice paid",
        message: "Invoice INV-2211 has been paid in full.",
        kind: NotificationType::Success,
        category: "invoice",
        priority: Priority::Low,
    },
    Template {
        title: "Invoice overdue",
        message: "Invoice INV-2198 is 14 days past due.",
        kind: NotificationType::Error,
        category: "invoice",
        priority: Priority::High,
    },
    Template {
        title: "New customer",
        message: "A new customer account was created.",
        kind: NotificationType::Info,
        category: "customer",
        priority: Priority::Low,
    },
    Template {
        title: "Team update",
        message: "The weekly schedule has been published.",
        kind: NotificationType::Info,
        category: "team",
        priority: Priority::Low,
    },
    Template {
        title: "New message",
        message: "You have an unread message in #dispatch.",
        kind: NotificationType::Info,
        category: "chat",
        priority: Priority::Medium,
    },
    Template {
        title: "Scheduled maintenance",
        message: "The system will be briefly unavailable tonight at 02:00.",
        kind: NotificationType::Warning,
        category: "system",
        priority: Priority::Medium,
    },
];

/// Sender id stamped on synthesized notifications.
pub const DEMO_SENDER: &str = "beacon-demo";

/// Build a random demo notification addressed to `recipient`.
pub fn demo_notification(recipient: Option<&str>) -> Notification {
    let template = {
        let mut rng = rand::thread_rng();
        TEMPLATES.choose(&mut rng).unwrap_or(&TEMPLATES[0])
    };

    let mut notification = Notification::new(template.title, template.message)
        .with_kind(template.kind)
        .with_category(template.category)
        .with_priority(template.priority);
    notification.sender = Some(DEMO_SENDER.to_string());
    notification.recipient = recipient.map(str::to_string);
    notification
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_is_addressed_and_unread() {
        let n = demo_notification(Some("user-1"));
        assert_eq!(n.recipient.as_deref(), Some("user-1"));
        assert_eq!(n.sender.as_deref(), Some(DEMO_SENDER));
        assert!(!n.read);
    }

    #[test]
    fn test_demo_ids_are_unique() {
        let a = demo_notification(None);
        let b = demo_notification(None);
        assert_ne!(a.id, b.id);
    }
}
