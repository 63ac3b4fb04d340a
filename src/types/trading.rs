//! Trading types: orders, executed trades, operating modes, approvals.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
            OrderType::StopLoss => write!(f, "stop_loss"),
            OrderType::TakeProfit => write!(f, "take_profit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
    Cancelled,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeStatus::Open => write!(f, "open"),
            TradeStatus::Closed => write!(f, "closed"),
            TradeStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Whether a trade actually hit a live exchange or was simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Paper,
    Live,
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionKind::Paper => write!(f, "paper"),
            ExecutionKind::Live => write!(f, "live"),
        }
    }
}

/// Per-user operating mode governing whether automated orders reach an
/// adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    LearningOnly,
    Assisted,
    Autopilot,
}

impl Default for TradingMode {
    fn default() -> Self {
        TradingMode::LearningOnly
    }
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::LearningOnly => "learning_only",
            TradingMode::Assisted => "assisted",
            TradingMode::Autopilot => "autopilot",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "assisted" => TradingMode::Assisted,
            "autopilot" => TradingMode::Autopilot,
            _ => TradingMode::LearningOnly,
        }
    }
}

/// Who originated an order. Assisted mode only intercepts automated ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderOrigin {
    Manual,
    Automated,
}

/// A proposed order, ephemeral until accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub platform_id: Option<String>,
}

impl TradeOrder {
    /// Basic shape validation before anything touches state.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol must not be empty".to_string());
        }
        if self.quantity <= Decimal::ZERO {
            return Err("quantity must be positive".to_string());
        }
        match self.order_type {
            OrderType::Limit if self.limit_price.is_none() => {
                Err("limit order requires limit_price".to_string())
            }
            OrderType::StopLoss | OrderType::TakeProfit if self.stop_price.is_none() => {
                Err("stop order requires stop_price".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// An executed trade record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub user_id: String,
    pub platform_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: TradeStatus,
    pub pnl: Decimal,
    pub execution_kind: ExecutionKind,
    pub market_price_at_execution: Decimal,
    pub created_at: i64,
    pub closed_at: Option<i64>,
}

impl Trade {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }
}

/// Outcome of a submission through the trade router.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TradeOutcome {
    /// The order was executed and recorded.
    Executed { trade: Trade },
    /// Learning-only mode: recorded and scored, never submitted.
    Recorded { reason: String },
    /// Assisted mode: awaiting explicit user approval.
    PendingApproval { approval_id: String, expires_at: i64 },
    /// Accepted by the venue but resting (unfilled limit/stop order).
    Resting {
        exchange_order_id: String,
        symbol: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// An automated order parked for explicit user approval.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub id: String,
    pub user_id: String,
    pub order: TradeOrder,
    pub status: ApprovalStatus,
    pub created_at: i64,
    pub expires_at: i64,
}

/// API request body for `POST /trades`.
#[derive(Debug, Deserialize)]
pub struct PlaceTradeRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub platform_id: Option<String>,
    /// Replaying the same key returns the original trade without a second
    /// submission.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl From<PlaceTradeRequest> for TradeOrder {
    fn from(req: PlaceTradeRequest) -> Self {
        TradeOrder {
            symbol: req.symbol.to_uppercase(),
            side: req.side,
            order_type: req.order_type,
            quantity: req.quantity,
            limit_price: req.limit_price,
            stop_price: None,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            platform_id: req.platform_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market_order(qty: Decimal) -> TradeOrder {
        TradeOrder {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: qty,
            limit_price: None,
            stop_price: None,
            stop_loss: None,
            take_profit: None,
            platform_id: None,
        }
    }

    #[test]
    fn test_order_validation() {
        assert!(market_order(dec!(0.01)).validate().is_ok());
        assert!(market_order(dec!(0)).validate().is_err());
        assert!(market_order(dec!(-1)).validate().is_err());

        let mut limit = market_order(dec!(1));
        limit.order_type = OrderType::Limit;
        assert!(limit.validate().is_err());
        limit.limit_price = Some(dec!(50000));
        assert!(limit.validate().is_ok());
    }

    #[test]
    fn test_mode_parse_defaults_to_learning() {
        assert_eq!(TradingMode::parse("autopilot"), TradingMode::Autopilot);
        assert_eq!(TradingMode::parse("nonsense"), TradingMode::LearningOnly);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_execution_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ExecutionKind::Paper).unwrap(),
            "\"paper\""
        );
    }
}
