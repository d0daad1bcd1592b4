//! Client-visible notification list.
//!
//! Stored in arrival order; displayed newest first by `timestamp`. The unread
//! count is always computed from the items, never cached.

use beacon_common::types::Notification;

#[derive(Debug, Clone, Default)]
pub struct NotificationList {
    items: Vec<Notification>,
}

impl NotificationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append in arrival order. An id already in the list is ignored.
    pub fn add(&mut self, notification: Notification) -> bool {
        if self.contains(&notification.id) {
            return false;
        }
        self.items.push(notification);
        true
    }

    /// Merge backfilled rows. Rows already present keep their local fields,
    /// except that a read marker from either side wins.
    pub fn merge_history(&mut self, history: Vec<Notification>) -> usize {
        let mut added = 0;
        for incoming in history {
            match self.items.iter_mut().find(|n| n.id == incoming.id) {
                Some(existing) => existing.read |= incoming.read,
                None => {
                    self.items.push(incoming);
                    added += 1;
                }
            }
        }
        added
    }

    /// Newest first. Equal timestamps keep arrival order.
    pub fn sorted(&self) -> Vec<Notification> {
        let mut items = self.items.clone();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        items
    }

    /// In arrival order.
    pub fn arrivals(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|n| n.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    /// Returns true if the item changed. Read never reverts to unread.
    pub fn mark_as_read(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|n| n.id == id && !n.read) {
            Some(n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }

    /// Returns how many items changed.
    pub fn mark_all_as_read(&mut self) -> usize {
        let mut changed = 0;
        for n in self.items.iter_mut().filter(|n| !n.read) {
            n.read = true;
            changed += 1;
        }
        changed
    }

    /// Remove by id. Absent ids are a no-op.
    pub fn clear(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|n| n.id != id);
        self.items.len() != before
    }

    pub fn clear_all(&mut self) -> usize {
        let removed = self.items.len();
        self.items.clear();
        removed
    }
}
