//! WebSocket frame types.

use super::{Notification, Quote, Trade};
use serde::{Deserialize, Serialize};

/// Streaming channel families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// `prices:<symbol>` — last-value-wins on overflow.
    Prices,
    /// `trades:<user>` — lossless; a full buffer disconnects the subscriber.
    Trades,
    /// `notifications:<user>` — lossless; a full buffer disconnects.
    Notifications,
    /// `system` — broadcast announcements.
    System,
}

/// Incoming WebSocket message from a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame: authenticate with a bearer token.
    Auth { token: String },
    Subscribe {
        channel: ChannelKind,
        #[serde(default)]
        symbol: Option<String>,
    },
    Unsubscribe {
        channel: ChannelKind,
        #[serde(default)]
        symbol: Option<String>,
    },
    Ping,
}

/// Outgoing WebSocket message to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated {
        user_id: String,
    },
    Subscribed {
        channel: ChannelKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
    },
    Unsubscribed {
        channel: ChannelKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
    },
    PriceTick {
        data: Quote,
    },
    TradeEvent {
        data: Trade,
    },
    Notification {
        data: Notification,
    },
    System {
        message: String,
    },
    Pong,
    Error {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channel":"prices","symbol":"BTCUSDT"}"#)
                .unwrap();
        match msg {
            ClientMessage::Subscribe { channel, symbol } => {
                assert_eq!(channel, ChannelKind::Prices);
                assert_eq!(symbol.as_deref(), Some("BTCUSDT"));
            }
            _ => panic!("expected subscribe"),
        }
    }

    #[test]
    fn test_auth_frame_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"auth","token":"abc.def.ghi"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Auth { .. }));
    }

    #[test]
    fn test_server_message_tagged() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }
}
