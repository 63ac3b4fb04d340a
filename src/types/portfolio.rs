//! Portfolio and position state.

use super::OrderSide;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Smallest balance discrepancy we tolerate between `total_balance` and
/// `available_balance + invested_balance`.
pub const BALANCE_EPSILON: Decimal = dec!(0.000000000000000001);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn from_order_side(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub average_price: Decimal,
    pub side: PositionSide,
}

impl Position {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.average_price
    }

    /// Unrealized P&L at the given mark price.
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (mark - self.average_price) * self.quantity,
            PositionSide::Short => (self.average_price - mark) * self.quantity,
        }
    }
}

/// Per-user portfolio, the authoritative balance state.
///
/// Mutations flow exclusively through the portfolio ledger; everything else
/// reads snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub user_id: String,
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    pub invested_balance: Decimal,
    pub daily_pnl: Decimal,
    pub total_pnl: Decimal,
    /// Trading day (`YYYY-MM-DD`, UTC) the daily P&L applies to.
    pub trading_day: String,
    pub positions: HashMap<String, Position>,
    pub updated_at: i64,
}

impl Portfolio {
    pub fn new(user_id: String, seed_balance: Decimal) -> Self {
        Self {
            user_id,
            total_balance: seed_balance,
            available_balance: seed_balance,
            invested_balance: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
            total_pnl: Decimal::ZERO,
            trading_day: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            positions: HashMap::new(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// `total_balance = available_balance + invested_balance` within one
    /// representable least-significant unit.
    pub fn is_balanced(&self) -> bool {
        let diff = self.total_balance - (self.available_balance + self.invested_balance);
        diff.abs() <= BALANCE_EPSILON
    }

    /// Daily drawdown as a positive fraction of total balance, zero when the
    /// day is flat or up.
    pub fn daily_drawdown(&self) -> Decimal {
        if self.daily_pnl >= Decimal::ZERO || self.total_balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        -self.daily_pnl / self.total_balance
    }
}

/// Snapshot returned by `GET /portfolio`.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioView {
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    pub invested_balance: Decimal,
    pub daily_pnl: Decimal,
    pub total_pnl: Decimal,
    pub positions: Vec<Position>,
}

impl From<&Portfolio> for PortfolioView {
    fn from(p: &Portfolio) -> Self {
        let mut positions: Vec<Position> = p.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Self {
            total_balance: p.total_balance,
            available_balance: p.available_balance,
            invested_balance: p.invested_balance,
            daily_pnl: p.daily_pnl,
            total_pnl: p.total_pnl,
            positions,
        }
    }
}
