//! Kill-switch: emergency halt of new order submissions.
//!
//! A global flag plus per-user flags. Transitions are audit-logged and
//! notified; the trade router performs the actual position sweep when a
//! switch fires.

use crate::services::{Notifier, SqliteStore};
use crate::types::{NotificationKind, NotificationPriority};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchReason {
    Manual,
    DailyDrawdownExceeded,
    DataDelayExceeded,
    CircuitBreakerTriggered,
    SystemError,
}

impl KillSwitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillSwitchReason::Manual => "manual",
            KillSwitchReason::DailyDrawdownExceeded => "daily_drawdown_exceeded",
            KillSwitchReason::DataDelayExceeded => "data_delay_exceeded",
            KillSwitchReason::CircuitBreakerTriggered => "circuit_breaker_triggered",
            KillSwitchReason::SystemError => "system_error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchRecord {
    pub reason: KillSwitchReason,
    pub triggered_by: String,
    pub triggered_at: i64,
    /// UTC trading day (`YYYY-MM-DD`) the freeze was triggered on.
    /// Daily-drawdown freezes expire when this day ends.
    pub trading_day: String,
}

fn current_trading_day() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

pub struct KillSwitch {
    global: AtomicBool,
    per_user: DashMap<String, KillSwitchRecord>,
    store: Arc<SqliteStore>,
    notifier: Arc<Notifier>,
}

impl KillSwitch {
    pub fn new(store: Arc<SqliteStore>, notifier: Arc<Notifier>) -> Arc<Self> {
        Arc::new(Self {
            global: AtomicBool::new(false),
            per_user: DashMap::new(),
            store,
            notifier,
        })
    }

    /// True when the user is frozen, either individually or globally.
    pub fn is_active(&self, user_id: &str) -> bool {
        if self.global.load(Ordering::Acquire) {
            return true;
        }
        self.roll_trading_day(&current_trading_day());
        self.per_user.contains_key(user_id)
    }

    pub fn is_global_active(&self) -> bool {
        self.global.load(Ordering::Acquire)
    }

    pub fn user_record(&self, user_id: &str) -> Option<KillSwitchRecord> {
        self.roll_trading_day(&current_trading_day());
        self.per_user.get(user_id).map(|r| r.clone())
    }

    /// Lift daily-drawdown freezes from earlier trading days; they last only
    /// until the day rolls over. Manual and other freezes stay until an
    /// explicit release. Returns how many were lifted.
    pub fn roll_trading_day(&self, today: &str) -> usize {
        let expired: Vec<String> = self
            .per_user
            .iter()
            .filter(|r| {
                r.reason == KillSwitchReason::DailyDrawdownExceeded && r.trading_day != today
            })
            .map(|r| r.key().clone())
            .collect();

        let mut released = 0;
        for user_id in expired {
            if self.release_user(&user_id, "trading_day_rollover") {
                released += 1;
            }
        }
        released
    }

    pub fn activate_global(&self, triggered_by: &str) {
        self.global.store(true, Ordering::Release);
        warn!(triggered_by, "global kill-switch activated");
        let _ = self.store.append_audit(
            "kill_switch",
            None,
            &format!("global activated by {triggered_by}"),
        );
        self.notifier
            .system_broadcast("kill-switch", "global trading freeze activated");
    }

    pub fn release_global(&self, released_by: &str) {
        self.global.store(false, Ordering::Release);
        info!(released_by, "global kill-switch released");
        let _ = self.store.append_audit(
            "kill_switch",
            None,
            &format!("global released by {released_by}"),
        );
        self.notifier
            .system_broadcast("kill-switch", "global trading freeze released");
    }

    /// Freeze one user. Returns false when already frozen (no re-trigger).
    pub fn activate_user(
        &self,
        user_id: &str,
        reason: KillSwitchReason,
        triggered_by: &str,
    ) -> bool {
        if self.per_user.contains_key(user_id) {
            return false;
        }
        let record = KillSwitchRecord {
            reason,
            triggered_by: triggered_by.to_string(),
            triggered_at: chrono::Utc::now().timestamp_millis(),
            trading_day: current_trading_day(),
        };
        self.per_user.insert(user_id.to_string(), record);
        warn!(user_id, reason = reason.as_str(), "kill-switch activated");
        let _ = self.store.append_audit(
            "kill_switch",
            Some(user_id),
            &format!("activated: {} by {triggered_by}", reason.as_str()),
        );
        self.notifier.notify(
            user_id,
            NotificationKind::System,
            "kill-switch activated",
            &format!(
                "all positions are being closed and new orders are frozen ({})",
                reason.as_str()
            ),
            NotificationPriority::Critical,
        );
        true
    }

    pub fn release_user(&self, user_id: &str, released_by: &str) -> bool {
        if self.per_user.remove(user_id).is_none() {
            return false;
        }
        info!(user_id, released_by, "kill-switch released");
        let _ = self.store.append_audit(
            "kill_switch",
            Some(user_id),
            &format!("released by {released_by}"),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::RoomManager;

    fn switch() -> Arc<KillSwitch> {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let notifier = Notifier::new(store.clone(), RoomManager::new());
        KillSwitch::new(store, notifier)
    }

    #[test]
    fn test_global_freeze_applies_to_everyone() {
        let ks = switch();
        assert!(!ks.is_active("u1"));
        ks.activate_global("admin");
        assert!(ks.is_active("u1"));
        assert!(ks.is_active("u2"));
        ks.release_global("admin");
        assert!(!ks.is_active("u1"));
    }

    #[test]
    fn test_user_freeze_is_scoped() {
        let ks = switch();
        assert!(ks.activate_user("u1", KillSwitchReason::DailyDrawdownExceeded, "risk_engine"));
        assert!(ks.is_active("u1"));
        assert!(!ks.is_active("u2"));

        // No re-trigger while active.
        assert!(!ks.activate_user("u1", KillSwitchReason::Manual, "user"));

        assert!(ks.release_user("u1", "admin"));
        assert!(!ks.is_active("u1"));
        assert!(!ks.release_user("u1", "admin"));
    }

    #[test]
    fn test_drawdown_freeze_lifts_on_next_trading_day() {
        let ks = switch();
        ks.activate_user("u1", KillSwitchReason::DailyDrawdownExceeded, "risk_engine");
        assert!(ks.is_active("u1"));

        // Same day: nothing expires.
        assert_eq!(ks.roll_trading_day(&current_trading_day()), 0);
        assert!(ks.is_active("u1"));

        // The day rolls over: the freeze lifts without an admin call.
        assert_eq!(ks.roll_trading_day("2099-01-01"), 1);
        assert!(!ks.is_active("u1"));
    }

    #[test]
    fn test_manual_freeze_survives_trading_day_rollover() {
        let ks = switch();
        ks.activate_user("u1", KillSwitchReason::Manual, "admin");
        assert_eq!(ks.roll_trading_day("2099-01-01"), 0);
        assert!(ks.is_active("u1"));
    }

    #[test]
    fn test_transitions_are_audited() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let notifier = Notifier::new(store.clone(), RoomManager::new());
        let ks = KillSwitch::new(store.clone(), notifier);

        ks.activate_global("admin");
        ks.release_global("admin");
        ks.activate_user("u1", KillSwitchReason::Manual, "u1");
        assert!(store.audit_count() >= 3);
    }
}
