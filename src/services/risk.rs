//! Risk engine.
//!
//! Pure evaluation of a proposed order against per-user limits: no awaits,
//! no state mutation. The trade router applies the verdict and emits audit
//! records.

use crate::types::{Portfolio, Quote, TradeOrder};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

/// Decimal places quantities are quantized to when the engine reduces or
/// advises a size.
const QTY_SCALE: u32 = 8;

#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Maximum single-trade exposure as a fraction of total balance.
    pub per_trade_max: Decimal,
    /// Maximum aggregate open exposure as a multiple of equity.
    pub leverage_max: Decimal,
    /// Daily drawdown at which new trades stop.
    pub daily_dd_soft: Decimal,
    /// Daily drawdown at which the kill-switch fires.
    pub daily_dd_hard: Decimal,
    /// Default fraction of equity risked per trade for sizing assistance.
    pub risk_fraction: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            per_trade_max: dec!(0.005),
            leverage_max: dec!(3),
            daily_dd_soft: dec!(0.03),
            daily_dd_hard: dec!(0.05),
            risk_fraction: dec!(0.01),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    PerTradeExposureExceeded,
    LeverageExceeded,
    DailyDrawdownSoft,
    DailyDrawdownHard,
    EmptyPortfolio,
}

impl RiskReason {
    /// User-facing reason string; both drawdown stops surface the same code.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskReason::PerTradeExposureExceeded => "per_trade_exposure_exceeded",
            RiskReason::LeverageExceeded => "leverage_exceeded",
            RiskReason::DailyDrawdownSoft | RiskReason::DailyDrawdownHard => {
                "daily_drawdown_exceeded"
            }
            RiskReason::EmptyPortfolio => "empty_portfolio",
        }
    }

    pub fn is_hard_stop(&self) -> bool {
        matches!(self, RiskReason::DailyDrawdownHard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum RiskVerdict {
    Allow,
    Reduce { quantity: Decimal },
    Deny { reason: RiskReason },
}

/// Verdict plus the advisory maximum size for the same inputs.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub verdict: RiskVerdict,
    /// Maximum quantity the sizing rules would allow, when computable.
    pub advised_quantity: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    limits: RiskLimits,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Evaluate a proposed order against the owner's portfolio snapshot and
    /// the current quote. `unrealized_pnl` is marked to market by the caller
    /// so the evaluation itself never suspends.
    pub fn evaluate(
        &self,
        order: &TradeOrder,
        portfolio: &Portfolio,
        quote: &Quote,
        unrealized_pnl: Decimal,
    ) -> RiskAssessment {
        let advised_quantity = self.advise_quantity(order, portfolio, quote);

        if portfolio.total_balance <= Decimal::ZERO {
            return RiskAssessment {
                verdict: RiskVerdict::Deny {
                    reason: RiskReason::EmptyPortfolio,
                },
                advised_quantity,
            };
        }

        let reference_price = order.limit_price.unwrap_or(quote.price);
        let notional = order.quantity * reference_price;

        // 1. Per-trade exposure cap.
        let exposure = notional / portfolio.total_balance;
        if exposure > self.limits.per_trade_max {
            return RiskAssessment {
                verdict: RiskVerdict::Deny {
                    reason: RiskReason::PerTradeExposureExceeded,
                },
                advised_quantity,
            };
        }

        // 2. Aggregate open exposure against the leverage cap. When only part
        // of the requested quantity fits, the verdict shrinks it instead of
        // rejecting outright.
        let equity = portfolio.total_balance + unrealized_pnl;
        let exposure_cap = equity * self.limits.leverage_max;
        let headroom = exposure_cap - portfolio.invested_balance;
        if headroom <= Decimal::ZERO {
            return RiskAssessment {
                verdict: RiskVerdict::Deny {
                    reason: RiskReason::LeverageExceeded,
                },
                advised_quantity,
            };
        }
        if notional > headroom {
            let reduced = (headroom / reference_price).round_dp(QTY_SCALE);
            if reduced <= Decimal::ZERO {
                return RiskAssessment {
                    verdict: RiskVerdict::Deny {
                        reason: RiskReason::LeverageExceeded,
                    },
                    advised_quantity,
                };
            }
            return RiskAssessment {
                verdict: RiskVerdict::Reduce { quantity: reduced },
                advised_quantity,
            };
        }

        // 3. Daily drawdown, realized plus unrealized since the start of the
        // trading day.
        let day_pnl = portfolio.daily_pnl + unrealized_pnl;
        if day_pnl < Decimal::ZERO {
            let drawdown = -day_pnl / portfolio.total_balance;
            if drawdown >= self.limits.daily_dd_hard {
                return RiskAssessment {
                    verdict: RiskVerdict::Deny {
                        reason: RiskReason::DailyDrawdownHard,
                    },
                    advised_quantity,
                };
            }
            if drawdown >= self.limits.daily_dd_soft {
                return RiskAssessment {
                    verdict: RiskVerdict::Deny {
                        reason: RiskReason::DailyDrawdownSoft,
                    },
                    advised_quantity,
                };
            }
        }

        RiskAssessment {
            verdict: RiskVerdict::Allow,
            advised_quantity,
        }
    }

    /// Position sizing assistance:
    /// `min(equity · risk_fraction / stop_distance, per_trade_max · equity / reference_price)`.
    fn advise_quantity(
        &self,
        order: &TradeOrder,
        portfolio: &Portfolio,
        quote: &Quote,
    ) -> Option<Decimal> {
        let equity = portfolio.total_balance;
        if equity <= Decimal::ZERO {
            return None;
        }
        let reference_price = order.limit_price.unwrap_or(quote.price);
        if reference_price <= Decimal::ZERO {
            return None;
        }

        let exposure_cap_qty = self.limits.per_trade_max * equity / reference_price;

        let advised = match order.stop_loss {
            Some(stop) => {
                let stop_distance = (reference_price - stop).abs();
                if stop_distance <= Decimal::ZERO {
                    exposure_cap_qty
                } else {
                    let risk_qty = equity * self.limits.risk_fraction / stop_distance;
                    risk_qty.min(exposure_cap_qty)
                }
            }
            None => exposure_cap_qty,
        };

        Some(advised.round_dp(QTY_SCALE))
    }
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::new(RiskLimits::default())
    }
}
