//! Notification delivery: persist, then fan out to connected subscribers.

use crate::services::SqliteStore;
use crate::types::{Notification, NotificationKind, NotificationPriority};
use crate::websocket::RoomManager;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Notifier {
    store: Arc<SqliteStore>,
    rooms: Arc<RoomManager>,
}

impl Notifier {
    pub fn new(store: Arc<SqliteStore>, rooms: Arc<RoomManager>) -> Arc<Self> {
        Arc::new(Self { store, rooms })
    }

    /// Create, persist and push a notification for one user.
    pub fn notify(
        &self,
        user_id: &str,
        kind: NotificationKind,
        title: &str,
        body: &str,
        priority: NotificationPriority,
    ) -> Notification {
        let notification = Notification::new(
            user_id.to_string(),
            kind,
            title.to_string(),
            body.to_string(),
            priority,
        );
        if let Err(e) = self.store.create_notification(&notification) {
            warn!(user_id, error = %e, "failed to persist notification");
        }
        self.rooms.publish_notification(user_id, &notification);
        debug!(user_id, kind = kind.as_str(), "notification delivered");
        notification
    }

    /// Push an announcement to every system-channel subscriber.
    pub fn system_broadcast(&self, title: &str, body: &str) {
        self.rooms.publish_system(&format!("{title}: {body}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_persists() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let rooms = RoomManager::new();
        let notifier = Notifier::new(store.clone(), rooms);

        notifier.notify(
            "u1",
            NotificationKind::TradeExecuted,
            "trade executed",
            "bought 0.01 BTCUSDT",
            NotificationPriority::Medium,
        );

        let stored = store.list_notifications("u1", 10);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, NotificationKind::TradeExecuted);
        assert!(stored[0].read_at.is_none());
    }
}
