//! Tiller - multi-user trade orchestration backend.
//!
//! Market data aggregation with multi-source fallback, an order submission
//! pipeline gated by a risk engine and circuit breakers, per-user portfolio
//! accounting, and streaming fan-out to connected clients.

pub mod adapters;
pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;
pub mod websocket;

use config::Config;
use services::{
    AiClient, AlertEngine, ApprovalQueue, AuthService, BreakerRegistry, KillSwitch,
    MarketDataAggregator, Notifier, PortfolioLedger, SqliteStore, TradeRouter, Vault,
};
use std::sync::Arc;
use websocket::RoomManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub vault: Arc<Vault>,
    pub auth: Arc<AuthService>,
    pub market: Arc<MarketDataAggregator>,
    pub breakers: Arc<BreakerRegistry>,
    pub portfolios: Arc<PortfolioLedger>,
    pub router: Arc<TradeRouter>,
    pub approvals: Arc<ApprovalQueue>,
    pub kill_switch: Arc<KillSwitch>,
    pub alerts: Arc<AlertEngine>,
    pub ai: Arc<AiClient>,
    pub notifier: Arc<Notifier>,
    pub rooms: Arc<RoomManager>,
}
