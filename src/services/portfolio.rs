//! Portfolio accounting.
//!
//! Authoritative per-user balance state behind a single writer (one RwLock
//! per user; readers take snapshots concurrently). Trades are the unit of
//! record — positions are a projection over open trades — and every mutation
//! journals to the audit log with a monotonic sequence number.

use crate::error::AppError;
use crate::services::SqliteStore;
use crate::types::{Portfolio, Position, PositionSide, Trade};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        needed: Decimal,
        available: Decimal,
    },

    #[error("portfolio not found for {0}")]
    NotFound(String),
}

impl From<LedgerError> for AppError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientFunds { needed, available } => AppError::RiskDenied {
                reason: "insufficient_funds".to_string(),
                detail: Some(format!("need {needed}, have {available}")),
            },
            LedgerError::NotFound(user) => AppError::NotFound(format!("portfolio for {user}")),
        }
    }
}

pub struct PortfolioLedger {
    store: Arc<SqliteStore>,
    books: DashMap<String, Arc<RwLock<Portfolio>>>,
    seed_balance: Decimal,
}

impl PortfolioLedger {
    pub fn new(store: Arc<SqliteStore>, seed_balance: Decimal) -> Arc<Self> {
        Arc::new(Self {
            store,
            books: DashMap::new(),
            seed_balance,
        })
    }

    /// Create the user's portfolio with the seed balance if absent.
    pub fn ensure(&self, user_id: &str) -> Arc<RwLock<Portfolio>> {
        self.books
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let portfolio = self
                    .store
                    .load_portfolio(user_id)
                    .unwrap_or_else(|| {
                        let fresh = Portfolio::new(user_id.to_string(), self.seed_balance);
                        let _ = self.store.save_portfolio(&fresh);
                        let _ = self.store.append_audit(
                            "portfolio",
                            Some(user_id),
                            &format!("created with seed balance {}", self.seed_balance),
                        );
                        info!(user_id, "portfolio created");
                        fresh
                    });
                Arc::new(RwLock::new(portfolio))
            })
            .clone()
    }

    /// Consistent point-in-time snapshot; readers never block each other.
    pub async fn snapshot(&self, user_id: &str) -> Portfolio {
        let book = self.ensure(user_id);
        let guard = book.read().await;
        guard.clone()
    }

    /// Apply a newly opened trade: move its notional from available to
    /// invested and fold it into the position projection.
    pub async fn apply_open(&self, trade: &Trade) -> Result<Portfolio, LedgerError> {
        let book = self.ensure(&trade.user_id);
        let mut portfolio = book.write().await;
        roll_trading_day(&mut portfolio);

        let notional = trade.notional();
        if notional > portfolio.available_balance {
            return Err(LedgerError::InsufficientFunds {
                needed: notional,
                available: portfolio.available_balance,
            });
        }

        portfolio.available_balance -= notional;
        portfolio.invested_balance += notional;
        apply_position_delta(
            &mut portfolio.positions,
            &trade.symbol,
            PositionSide::from_order_side(trade.side),
            trade.quantity,
            trade.entry_price,
        );
        portfolio.updated_at = chrono::Utc::now().timestamp_millis();

        debug_assert!(portfolio.is_balanced());
        self.persist_and_journal(
            &portfolio,
            &format!(
                "open trade {} {} {} @ {} notional {}",
                trade.id, trade.side, trade.symbol, trade.entry_price, notional
            ),
        );
        Ok(portfolio.clone())
    }

    /// Apply a close: release the entry notional back to available together
    /// with the realized P&L.
    pub async fn apply_close(&self, trade: &Trade, pnl: Decimal) -> Result<Portfolio, LedgerError> {
        let book = self.ensure(&trade.user_id);
        let mut portfolio = book.write().await;
        roll_trading_day(&mut portfolio);

        let entry_notional = trade.notional();
        portfolio.invested_balance -= entry_notional;
        if portfolio.invested_balance < Decimal::ZERO {
            portfolio.invested_balance = Decimal::ZERO;
        }
        portfolio.available_balance += entry_notional + pnl;
        portfolio.total_balance += pnl;
        portfolio.daily_pnl += pnl;
        portfolio.total_pnl += pnl;
        apply_position_delta(
            &mut portfolio.positions,
            &trade.symbol,
            PositionSide::from_order_side(trade.side.opposite()),
            trade.quantity,
            trade.exit_price.unwrap_or(trade.entry_price),
        );
        portfolio.updated_at = chrono::Utc::now().timestamp_millis();

        debug_assert!(portfolio.is_balanced());
        self.persist_and_journal(
            &portfolio,
            &format!("close trade {} pnl {}", trade.id, pnl),
        );
        Ok(portfolio.clone())
    }

    /// Unrealized P&L across positions given mark prices per symbol.
    pub fn unrealized_pnl(portfolio: &Portfolio, marks: &HashMap<String, Decimal>) -> Decimal {
        portfolio
            .positions
            .values()
            .filter_map(|p| marks.get(&p.symbol).map(|mark| p.unrealized_pnl(*mark)))
            .sum()
    }

    fn persist_and_journal(&self, portfolio: &Portfolio, detail: &str) {
        if let Err(e) = self.store.save_portfolio(portfolio) {
            tracing::error!(user_id = %portfolio.user_id, error = %e, "failed to persist portfolio");
        }
        match self
            .store
            .append_audit("portfolio", Some(&portfolio.user_id), detail)
        {
            Ok(seq) => debug!(seq, user_id = %portfolio.user_id, "portfolio mutation journaled"),
            Err(e) => tracing::error!(error = %e, "failed to journal portfolio mutation"),
        }
    }
}

/// Reset daily P&L when the UTC trading day changes.
fn roll_trading_day(portfolio: &mut Portfolio) {
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    if portfolio.trading_day != today {
        debug!(user_id = %portfolio.user_id, %today, "rolling trading day");
        portfolio.trading_day = today;
        portfolio.daily_pnl = Decimal::ZERO;
    }
}

/// Fold an exposure delta into the per-symbol position projection, netting
/// opposite sides.
fn apply_position_delta(
    positions: &mut HashMap<String, Position>,
    symbol: &str,
    side: PositionSide,
    quantity: Decimal,
    price: Decimal,
) {
    match positions.get_mut(symbol) {
        None => {
            positions.insert(
                symbol.to_string(),
                Position {
                    symbol: symbol.to_string(),
                    quantity,
                    average_price: price,
                    side,
                },
            );
        }
        Some(position) if position.side == side => {
            let total_qty = position.quantity + quantity;
            position.average_price =
                (position.average_price * position.quantity + price * quantity) / total_qty;
            position.quantity = total_qty;
        }
        Some(position) => {
            if position.quantity > quantity {
                position.quantity -= quantity;
            } else if position.quantity == quantity {
                positions.remove(symbol);
            } else {
                position.quantity = quantity - position.quantity;
                position.average_price = price;
                position.side = side;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionKind, OrderSide, OrderType, TradeStatus};
    use rust_decimal_macros::dec;

    fn ledger() -> Arc<PortfolioLedger> {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        PortfolioLedger::new(store, dec!(10000))
    }

    fn open_trade(id: &str, qty: Decimal, price: Decimal) -> Trade {
        Trade {
            id: id.to_string(),
            user_id: "u1".to_string(),
            platform_id: None,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: qty,
            entry_price: price,
            exit_price: None,
            stop_loss: None,
            take_profit: None,
            status: TradeStatus::Open,
            pnl: Decimal::ZERO,
            execution_kind: ExecutionKind::Paper,
            market_price_at_execution: price,
            created_at: chrono::Utc::now().timestamp_millis(),
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn test_open_moves_notional_to_invested() {
        let ledger = ledger();
        let portfolio = ledger
            .apply_open(&open_trade("t1", dec!(0.01), dec!(60000)))
            .await
            .unwrap();

        assert_eq!(portfolio.available_balance, dec!(9400));
        assert_eq!(portfolio.invested_balance, dec!(600));
        assert_eq!(portfolio.total_balance, dec!(10000));
        assert!(portfolio.is_balanced());

        let position = portfolio.positions.get("BTCUSDT").unwrap();
        assert_eq!(position.quantity, dec!(0.01));
        assert_eq!(position.side, PositionSide::Long);
    }

    #[tokio::test]
    async fn test_open_rejects_insufficient_funds() {
        let ledger = ledger();
        let err = ledger
            .apply_open(&open_trade("t1", dec!(1), dec!(60000)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        // Nothing changed.
        let portfolio = ledger.snapshot("u1").await;
        assert_eq!(portfolio.available_balance, dec!(10000));
        assert!(portfolio.positions.is_empty());
    }

    #[tokio::test]
    async fn test_close_realizes_pnl() {
        let ledger = ledger();
        let mut trade = open_trade("t1", dec!(0.01), dec!(60000));
        ledger.apply_open(&trade).await.unwrap();

        trade.exit_price = Some(dec!(62000));
        let portfolio = ledger.apply_close(&trade, dec!(20)).await.unwrap();

        assert_eq!(portfolio.invested_balance, Decimal::ZERO);
        assert_eq!(portfolio.available_balance, dec!(10020));
        assert_eq!(portfolio.total_balance, dec!(10020));
        assert_eq!(portfolio.daily_pnl, dec!(20));
        assert_eq!(portfolio.total_pnl, dec!(20));
        assert!(portfolio.positions.is_empty());
        assert!(portfolio.is_balanced());
    }

    #[tokio::test]
    async fn test_average_in_same_side() {
        let ledger = ledger();
        ledger
            .apply_open(&open_trade("t1", dec!(0.01), dec!(60000)))
            .await
            .unwrap();
        let portfolio = ledger
            .apply_open(&open_trade("t2", dec!(0.01), dec!(62000)))
            .await
            .unwrap();

        let position = portfolio.positions.get("BTCUSDT").unwrap();
        assert_eq!(position.quantity, dec!(0.02));
        assert_eq!(position.average_price, dec!(61000));
    }

    #[tokio::test]
    async fn test_mutations_are_journaled() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let ledger = PortfolioLedger::new(store.clone(), dec!(10000));
        ledger
            .apply_open(&open_trade("t1", dec!(0.01), dec!(60000)))
            .await
            .unwrap();
        // Creation plus the open mutation.
        assert!(store.audit_count() >= 2);
    }

    #[tokio::test]
    async fn test_unrealized_pnl_projection() {
        let ledger = ledger();
        ledger
            .apply_open(&open_trade("t1", dec!(0.1), dec!(60000)))
            .await
            .unwrap();
        let portfolio = ledger.snapshot("u1").await;

        let mut marks = HashMap::new();
        marks.insert("BTCUSDT".to_string(), dec!(62000));
        assert_eq!(
            PortfolioLedger::unrealized_pnl(&portfolio, &marks),
            dec!(200)
        );
    }
}
