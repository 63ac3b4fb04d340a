pub mod ai;
pub mod alerts;
pub mod approvals;
pub mod auth;
pub mod breaker;
pub mod kill_switch;
pub mod market_data;
pub mod notifier;
pub mod portfolio;
pub mod risk;
pub mod router;
pub mod sqlite_store;
pub mod vault;

pub use ai::{AiClient, Analysis};
pub use alerts::{AlertEngine, AlertError};
pub use approvals::{ApprovalError, ApprovalQueue};
pub use auth::{AuthService, AuthServiceError};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use kill_switch::{KillSwitch, KillSwitchReason};
pub use market_data::{MarketDataAggregator, MarketError};
pub use notifier::Notifier;
pub use portfolio::{LedgerError, PortfolioLedger};
pub use risk::{RiskAssessment, RiskEngine, RiskLimits, RiskReason, RiskVerdict};
pub use router::TradeRouter;
pub use sqlite_store::SqliteStore;
pub use vault::{Vault, VaultError};
