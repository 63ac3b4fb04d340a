//! WebSocket subscription rooms and per-client outbound buffers.
//!
//! Price channels are last-value-wins: when a client's buffer is full the
//! oldest queued tick gives way to the newest. Trade and notification
//! channels never drop — a client that cannot keep up is disconnected and
//! resynchronizes over REST after reconnecting.

use crate::types::{ChannelKind, Notification, Quote, ServerMessage, Trade};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound frames buffered per client.
pub const OUTBOX_CAPACITY: usize = 256;

enum Frame {
    Price { symbol: String, json: String },
    Reliable { json: String },
}

/// Bounded outbound queue with per-channel overflow policy.
pub struct Outbox {
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a price tick. A pending tick for the same symbol is replaced in
    /// place; on overflow the oldest queued tick is dropped in favor of the
    /// newest.
    pub fn push_price(&self, symbol: &str, json: String) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.queue.lock().unwrap();

        for frame in queue.iter_mut() {
            if let Frame::Price { symbol: s, json: j } = frame {
                if s == symbol {
                    *j = json;
                    self.notify.notify_one();
                    return;
                }
            }
        }

        if queue.len() >= self.capacity {
            match queue
                .iter()
                .position(|f| matches!(f, Frame::Price { .. }))
            {
                Some(pos) => {
                    queue.remove(pos);
                }
                // Buffer full of reliable frames; shed the tick itself.
                None => return,
            }
        }

        queue.push_back(Frame::Price {
            symbol: symbol.to_string(),
            json,
        });
        self.notify.notify_one();
    }

    /// Queue a lossless frame. Returns false when the buffer is full, which
    /// closes the outbox — the subscriber is too slow and must reconnect.
    pub fn push_reliable(&self, json: String) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            drop(queue);
            self.close();
            return false;
        }
        queue.push_back(Frame::Reliable { json });
        self.notify.notify_one();
        true
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Await the next frame; `None` once the outbox is closed.
    pub async fn next(&self) -> Option<String> {
        loop {
            // Register interest before re-checking so a notify between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(frame) = self.queue.lock().unwrap().pop_front() {
                return Some(match frame {
                    Frame::Price { json, .. } => json,
                    Frame::Reliable { json } => json,
                });
            }

            notified.await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// A connected, authenticated client.
pub struct ClientConn {
    pub id: Uuid,
    pub user_id: String,
    pub outbox: Outbox,
}

/// Manages channel subscriptions and fan-out to connected clients.
pub struct RoomManager {
    clients: DashMap<Uuid, Arc<ClientConn>>,
    /// symbol -> subscribed clients
    price_rooms: DashMap<String, HashSet<Uuid>>,
    /// user_id -> clients subscribed to that user's trade events
    trade_rooms: DashMap<String, HashSet<Uuid>>,
    /// user_id -> clients subscribed to that user's notifications
    notification_rooms: DashMap<String, HashSet<Uuid>>,
    system_room: DashMap<Uuid, ()>,
}

impl RoomManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            price_rooms: DashMap::new(),
            trade_rooms: DashMap::new(),
            notification_rooms: DashMap::new(),
            system_room: DashMap::new(),
        })
    }

    pub fn register(&self, user_id: String) -> Arc<ClientConn> {
        let conn = Arc::new(ClientConn {
            id: Uuid::new_v4(),
            user_id,
            outbox: Outbox::new(OUTBOX_CAPACITY),
        });
        self.clients.insert(conn.id, conn.clone());
        debug!(client = %conn.id, "websocket client registered");
        conn
    }

    pub fn unregister(&self, client_id: Uuid) {
        if let Some((_, conn)) = self.clients.remove(&client_id) {
            conn.outbox.close();
        }
        for mut room in self.price_rooms.iter_mut() {
            room.remove(&client_id);
        }
        for mut room in self.trade_rooms.iter_mut() {
            room.remove(&client_id);
        }
        for mut room in self.notification_rooms.iter_mut() {
            room.remove(&client_id);
        }
        self.system_room.remove(&client_id);
        debug!(client = %client_id, "websocket client unregistered");
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Subscribe a client to a channel. Trade and notification channels bind
    /// to the authenticated user; the symbol is only meaningful for prices.
    pub fn subscribe(
        &self,
        client_id: Uuid,
        channel: ChannelKind,
        symbol: Option<&str>,
    ) -> bool {
        let Some(conn) = self.clients.get(&client_id).map(|c| c.clone()) else {
            return false;
        };
        match channel {
            ChannelKind::Prices => match symbol {
                Some(symbol) => {
                    self.price_rooms
                        .entry(symbol.to_uppercase())
                        .or_default()
                        .insert(client_id);
                    true
                }
                None => false,
            },
            ChannelKind::Trades => {
                self.trade_rooms
                    .entry(conn.user_id.clone())
                    .or_default()
                    .insert(client_id);
                true
            }
            ChannelKind::Notifications => {
                self.notification_rooms
                    .entry(conn.user_id.clone())
                    .or_default()
                    .insert(client_id);
                true
            }
            ChannelKind::System => {
                self.system_room.insert(client_id, ());
                true
            }
        }
    }

    pub fn unsubscribe(
        &self,
        client_id: Uuid,
        channel: ChannelKind,
        symbol: Option<&str>,
    ) -> bool {
        let Some(conn) = self.clients.get(&client_id).map(|c| c.clone()) else {
            return false;
        };
        match channel {
            ChannelKind::Prices => match symbol {
                Some(symbol) => {
                    if let Some(mut room) = self.price_rooms.get_mut(&symbol.to_uppercase()) {
                        room.remove(&client_id);
                    }
                    true
                }
                None => false,
            },
            ChannelKind::Trades => {
                if let Some(mut room) = self.trade_rooms.get_mut(&conn.user_id) {
                    room.remove(&client_id);
                }
                true
            }
            ChannelKind::Notifications => {
                if let Some(mut room) = self.notification_rooms.get_mut(&conn.user_id) {
                    room.remove(&client_id);
                }
                true
            }
            ChannelKind::System => {
                self.system_room.remove(&client_id);
                true
            }
        }
    }

    /// Symbols with at least one price subscriber; drives the hot-symbol
    /// refresh loop.
    pub fn active_price_symbols(&self) -> Vec<String> {
        self.price_rooms
            .iter()
            .filter(|room| !room.is_empty())
            .map(|room| room.key().clone())
            .collect()
    }

    pub fn publish_price(&self, quote: &Quote) {
        let Some(room) = self.price_rooms.get(&quote.symbol) else {
            return;
        };
        let message = ServerMessage::PriceTick {
            data: quote.clone(),
        };
        let Ok(json) = serde_json::to_string(&message) else {
            return;
        };
        for client_id in room.iter() {
            if let Some(conn) = self.clients.get(client_id) {
                conn.outbox.push_price(&quote.symbol, json.clone());
            }
        }
    }

    pub fn publish_trade(&self, user_id: &str, trade: &Trade) {
        let message = ServerMessage::TradeEvent {
            data: trade.clone(),
        };
        let Ok(json) = serde_json::to_string(&message) else {
            return;
        };
        self.publish_reliable_to_room(&self.trade_rooms, user_id, &json);
    }

    pub fn publish_notification(&self, user_id: &str, notification: &Notification) {
        let message = ServerMessage::Notification {
            data: notification.clone(),
        };
        let Ok(json) = serde_json::to_string(&message) else {
            return;
        };
        self.publish_reliable_to_room(&self.notification_rooms, user_id, &json);
    }

    pub fn publish_system(&self, text: &str) {
        let message = ServerMessage::System {
            message: text.to_string(),
        };
        let Ok(json) = serde_json::to_string(&message) else {
            return;
        };
        let client_ids: Vec<Uuid> = self.system_room.iter().map(|e| *e.key()).collect();
        for client_id in client_ids {
            if let Some(conn) = self.clients.get(&client_id) {
                if !conn.outbox.push_reliable(json.clone()) {
                    warn!(client = %client_id, "slow subscriber disconnected");
                }
            }
        }
    }

    fn publish_reliable_to_room(
        &self,
        rooms: &DashMap<String, HashSet<Uuid>>,
        key: &str,
        json: &str,
    ) {
        let Some(room) = rooms.get(key) else {
            return;
        };
        let client_ids: Vec<Uuid> = room.iter().copied().collect();
        drop(room);
        for client_id in client_ids {
            if let Some(conn) = self.clients.get(&client_id) {
                if !conn.outbox.push_reliable(json.to_string()) {
                    warn!(client = %client_id, "slow subscriber disconnected");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetClass, QuoteSource};
    use rust_decimal_macros::dec;

    fn quote(symbol: &str, fetched_at: i64) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            price: dec!(100),
            change_24h_pct: 0.0,
            volume_24h: 0.0,
            high_24h: 0.0,
            low_24h: 0.0,
            asset_class: AssetClass::Crypto,
            source_tag: QuoteSource::Synthetic,
            fetched_at,
        }
    }

    #[tokio::test]
    async fn test_price_subscription_delivery() {
        let rooms = RoomManager::new();
        let conn = rooms.register("u1".to_string());
        assert!(rooms.subscribe(conn.id, ChannelKind::Prices, Some("BTCUSDT")));

        rooms.publish_price(&quote("BTCUSDT", 1));
        let frame = conn.outbox.next().await.unwrap();
        assert!(frame.contains("price_tick"));
        assert!(frame.contains("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_price_last_value_wins() {
        let rooms = RoomManager::new();
        let conn = rooms.register("u1".to_string());
        rooms.subscribe(conn.id, ChannelKind::Prices, Some("BTCUSDT"));

        // Two ticks for one symbol coalesce into the newest.
        rooms.publish_price(&quote("BTCUSDT", 1));
        rooms.publish_price(&quote("BTCUSDT", 2));
        assert_eq!(conn.outbox.len(), 1);

        let frame = conn.outbox.next().await.unwrap();
        assert!(frame.contains("\"fetched_at\":2"));
    }

    #[tokio::test]
    async fn test_reliable_overflow_disconnects() {
        let outbox = Outbox::new(4);
        for _ in 0..4 {
            assert!(outbox.push_reliable("{}".to_string()));
        }
        assert!(!outbox.push_reliable("{}".to_string()));
        assert!(outbox.is_closed());
        assert!(outbox.next().await.is_none());
    }

    #[tokio::test]
    async fn test_price_overflow_sheds_oldest() {
        let outbox = Outbox::new(2);
        outbox.push_price("A", "a1".to_string());
        outbox.push_price("B", "b1".to_string());
        outbox.push_price("C", "c1".to_string());
        assert_eq!(outbox.len(), 2);
        assert!(!outbox.is_closed());

        // Oldest (A) was shed; B then C remain.
        assert_eq!(outbox.next().await.unwrap(), "b1");
        assert_eq!(outbox.next().await.unwrap(), "c1");
    }

    #[tokio::test]
    async fn test_trade_events_bound_to_user() {
        let rooms = RoomManager::new();
        let alice = rooms.register("alice".to_string());
        let bob = rooms.register("bob".to_string());
        rooms.subscribe(alice.id, ChannelKind::Trades, None);
        rooms.subscribe(bob.id, ChannelKind::Trades, None);

        let trade = Trade {
            id: "t1".to_string(),
            user_id: "alice".to_string(),
            platform_id: None,
            symbol: "BTCUSDT".to_string(),
            side: crate::types::OrderSide::Buy,
            order_type: crate::types::OrderType::Market,
            quantity: dec!(0.01),
            entry_price: dec!(60000),
            exit_price: None,
            stop_loss: None,
            take_profit: None,
            status: crate::types::TradeStatus::Open,
            pnl: dec!(0),
            execution_kind: crate::types::ExecutionKind::Paper,
            market_price_at_execution: dec!(60000),
            created_at: 0,
            closed_at: None,
        };
        rooms.publish_trade("alice", &trade);

        assert_eq!(alice.outbox.len(), 1);
        assert_eq!(bob.outbox.len(), 0);
    }

    #[tokio::test]
    async fn test_unregister_cleans_rooms() {
        let rooms = RoomManager::new();
        let conn = rooms.register("u1".to_string());
        rooms.subscribe(conn.id, ChannelKind::Prices, Some("BTCUSDT"));
        rooms.subscribe(conn.id, ChannelKind::System, None);

        rooms.unregister(conn.id);
        assert_eq!(rooms.client_count(), 0);
        assert!(rooms.active_price_symbols().is_empty());
        assert!(conn.outbox.is_closed());
    }
}
