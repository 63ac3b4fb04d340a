//! Notification types.

use serde::{Deserialize, Serialize};

/// Longest notification body we store or push; longer texts truncate.
pub const MAX_BODY_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TradeExecuted,
    AlertTriggered,
    System,
    Recommendation,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TradeExecuted => "trade_executed",
            NotificationKind::AlertTriggered => "alert_triggered",
            NotificationKind::System => "system",
            NotificationKind::Recommendation => "recommendation",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "trade_executed" => NotificationKind::TradeExecuted,
            "alert_triggered" => NotificationKind::AlertTriggered,
            "recommendation" => NotificationKind::Recommendation,
            _ => NotificationKind::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Medium => "medium",
            NotificationPriority::High => "high",
            NotificationPriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "medium" => NotificationPriority::Medium,
            "high" => NotificationPriority::High,
            "critical" => NotificationPriority::Critical,
            _ => NotificationPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub read_at: Option<i64>,
    pub created_at: i64,
}

impl Notification {
    pub fn new(
        user_id: String,
        kind: NotificationKind,
        title: String,
        body: String,
        priority: NotificationPriority,
    ) -> Self {
        let mut body = body;
        if body.len() > MAX_BODY_LEN {
            body.truncate(MAX_BODY_LEN);
        }
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            kind,
            title,
            body,
            priority,
            read_at: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_is_bounded() {
        let n = Notification::new(
            "u1".to_string(),
            NotificationKind::System,
            "t".to_string(),
            "x".repeat(2000),
            NotificationPriority::Low,
        );
        assert_eq!(n.body.len(), MAX_BODY_LEN);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(NotificationPriority::Critical > NotificationPriority::High);
        assert!(NotificationPriority::Medium > NotificationPriority::Low);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            NotificationKind::TradeExecuted,
            NotificationKind::AlertTriggered,
            NotificationKind::System,
            NotificationKind::Recommendation,
        ] {
            assert_eq!(NotificationKind::parse(kind.as_str()), kind);
        }
    }
}
