//! Smart alert engine and opportunity scanning.
//!
//! Armed alerts key by fingerprint per owner; every aggregator tick
//! evaluates matching alerts, and the armed-to-triggered transition emits
//! exactly one notification per arming. Opportunity scans run at a bounded
//! cadence, carry an expiry, and dedupe by fingerprint per owner.

use crate::error::AppError;
use crate::services::sqlite_store::is_unique_violation;
use crate::services::{Notifier, SqliteStore};
use crate::types::{
    alert_fingerprint, AlertCondition, AlertState, CreateAlertRequest, NotificationKind,
    NotificationPriority, Opportunity, Quote, SmartAlert,
};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Closes kept per symbol for RSI and volume baselines.
const HISTORY_LEN: usize = 50;
const RSI_PERIOD: usize = 14;
/// Volume must exceed this multiple of its rolling average to count as a
/// spike.
const VOLUME_SPIKE_FACTOR: f64 = 2.0;
/// 24h move that qualifies as an opportunity, percent.
const OPPORTUNITY_MOVE_PCT: f64 = 5.0;
/// Opportunities stay fresh for this long.
const OPPORTUNITY_TTL_MS: i64 = 15 * 60 * 1000;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("duplicate armed alert")]
    Duplicate,

    #[error("alert {0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<AlertError> for AppError {
    fn from(e: AlertError) -> Self {
        match e {
            AlertError::Duplicate => {
                AppError::Conflict("an identical armed alert already exists".to_string())
            }
            AlertError::NotFound(id) => AppError::NotFound(format!("alert {id}")),
            AlertError::Database(msg) => AppError::Internal(msg),
        }
    }
}

#[derive(Debug, Clone)]
struct TickSample {
    price: f64,
    volume: f64,
}

pub struct AlertEngine {
    store: Arc<SqliteStore>,
    notifier: Arc<Notifier>,
    /// alert id -> alert, armed entries only plus recent others.
    alerts: DashMap<String, SmartAlert>,
    /// Recent samples per symbol for RSI / volume baselines.
    history: DashMap<String, VecDeque<TickSample>>,
    /// (user, fingerprint) -> expiry for opportunity dedupe.
    seen_opportunities: DashMap<(String, String), i64>,
}

impl AlertEngine {
    pub fn new(store: Arc<SqliteStore>, notifier: Arc<Notifier>) -> Arc<Self> {
        let engine = Arc::new(Self {
            store: store.clone(),
            notifier,
            alerts: DashMap::new(),
            history: DashMap::new(),
            seen_opportunities: DashMap::new(),
        });
        for alert in store.load_armed_alerts() {
            engine.alerts.insert(alert.id.clone(), alert);
        }
        info!(armed = engine.alerts.len(), "alert engine loaded");
        engine
    }

    pub fn create(
        &self,
        user_id: &str,
        request: CreateAlertRequest,
    ) -> Result<SmartAlert, AlertError> {
        let alert = SmartAlert::new(
            user_id.to_string(),
            request.symbol,
            request.condition,
            request.threshold,
        );
        self.store.create_alert(&alert).map_err(|e| {
            if is_unique_violation(&e) {
                AlertError::Duplicate
            } else {
                AlertError::Database(e.to_string())
            }
        })?;
        self.alerts.insert(alert.id.clone(), alert.clone());
        info!(alert_id = %alert.id, user_id, symbol = %alert.symbol, "alert armed");
        Ok(alert)
    }

    pub fn list(&self, user_id: &str) -> Vec<SmartAlert> {
        self.store.list_alerts(user_id)
    }

    pub fn dismiss(&self, alert_id: &str, user_id: &str) -> Result<(), AlertError> {
        let deleted = self
            .store
            .delete_alert(alert_id, user_id)
            .map_err(|e| AlertError::Database(e.to_string()))?;
        if deleted == 0 {
            return Err(AlertError::NotFound(alert_id.to_string()));
        }
        self.alerts.remove(alert_id);
        Ok(())
    }

    /// Evaluate armed alerts against a published quote.
    pub fn on_tick(&self, quote: &Quote) {
        self.push_history(quote);

        let candidates: Vec<SmartAlert> = self
            .alerts
            .iter()
            .filter(|a| a.state == AlertState::Armed && a.symbol == quote.symbol)
            .map(|a| a.clone())
            .collect();

        for alert in candidates {
            if self.condition_met(&alert, quote) {
                self.trigger(alert);
            }
        }
    }

    fn trigger(&self, mut alert: SmartAlert) {
        // Swap to triggered before notifying so a racing tick cannot fire
        // the same arming twice.
        {
            let Some(mut entry) = self.alerts.get_mut(&alert.id) else {
                return;
            };
            if entry.state != AlertState::Armed {
                return;
            }
            entry.state = AlertState::Triggered;
            entry.triggered_at = Some(chrono::Utc::now().timestamp_millis());
            alert = entry.clone();
        }

        let _ = self
            .store
            .update_alert_state(&alert.id, AlertState::Triggered, alert.triggered_at);
        info!(alert_id = %alert.id, symbol = %alert.symbol, "alert triggered");
        self.notifier.notify(
            &alert.user_id,
            NotificationKind::AlertTriggered,
            "alert triggered",
            &format!(
                "{} {} {}",
                alert.symbol,
                alert.condition.as_str(),
                alert.threshold
            ),
            NotificationPriority::High,
        );
    }

    fn condition_met(&self, alert: &SmartAlert, quote: &Quote) -> bool {
        match alert.condition {
            AlertCondition::PriceAbove => quote.price > alert.threshold,
            AlertCondition::PriceBelow => quote.price < alert.threshold,
            AlertCondition::RsiAbove => self
                .rsi(&alert.symbol)
                .map(|rsi| rsi > alert.threshold.to_f64().unwrap_or(f64::MAX))
                .unwrap_or(false),
            AlertCondition::RsiBelow => self
                .rsi(&alert.symbol)
                .map(|rsi| rsi < alert.threshold.to_f64().unwrap_or(0.0))
                .unwrap_or(false),
            AlertCondition::VolumeSpike => self.volume_spiked(&alert.symbol, quote.volume_24h),
        }
    }

    fn push_history(&self, quote: &Quote) {
        let mut history = self.history.entry(quote.symbol.clone()).or_default();
        history.push_back(TickSample {
            price: quote.price.to_f64().unwrap_or(0.0),
            volume: quote.volume_24h,
        });
        while history.len() > HISTORY_LEN {
            history.pop_front();
        }
    }

    /// Wilder RSI over the recent close history.
    fn rsi(&self, symbol: &str) -> Option<f64> {
        let history = self.history.get(symbol)?;
        if history.len() < RSI_PERIOD + 1 {
            return None;
        }
        let closes: Vec<f64> = history
            .iter()
            .rev()
            .take(RSI_PERIOD + 1)
            .rev()
            .map(|s| s.price)
            .collect();

        let mut gains = 0.0;
        let mut losses = 0.0;
        for window in closes.windows(2) {
            let delta = window[1] - window[0];
            if delta >= 0.0 {
                gains += delta;
            } else {
                losses -= delta;
            }
        }
        if losses == 0.0 {
            return Some(100.0);
        }
        let rs = (gains / RSI_PERIOD as f64) / (losses / RSI_PERIOD as f64);
        Some(100.0 - 100.0 / (1.0 + rs))
    }

    fn volume_spiked(&self, symbol: &str, current: f64) -> bool {
        let Some(history) = self.history.get(symbol) else {
            return false;
        };
        // Exclude the sample just pushed for this tick.
        let baseline: Vec<f64> = history
            .iter()
            .take(history.len().saturating_sub(1))
            .map(|s| s.volume)
            .filter(|v| *v > 0.0)
            .collect();
        if baseline.len() < 5 {
            return false;
        }
        let avg = baseline.iter().sum::<f64>() / baseline.len() as f64;
        current > avg * VOLUME_SPIKE_FACTOR
    }

    /// Scan cached quotes for outsized moves and notify every user once per
    /// fingerprint until the opportunity expires.
    pub fn scan_opportunities(&self, quotes: &[Quote]) -> Vec<Opportunity> {
        let now = chrono::Utc::now().timestamp_millis();
        self.seen_opportunities.retain(|_, expiry| *expiry > now);

        let mut found = Vec::new();
        for quote in quotes {
            if quote.change_24h_pct.abs() < OPPORTUNITY_MOVE_PCT {
                continue;
            }
            let direction = if quote.change_24h_pct > 0.0 {
                "momentum"
            } else {
                "pullback"
            };
            let score = (quote.change_24h_pct.abs() * 10.0).min(100.0) as u8;
            let fingerprint = alert_fingerprint(
                direction,
                &quote.symbol,
                AlertCondition::PriceAbove,
                Decimal::from(score as i64),
            );
            let opportunity = Opportunity {
                id: uuid::Uuid::new_v4().to_string(),
                symbol: quote.symbol.clone(),
                summary: format!(
                    "{} moved {:.1}% in 24h ({direction})",
                    quote.symbol, quote.change_24h_pct
                ),
                score,
                fingerprint,
                created_at: now,
                expires_at: now + OPPORTUNITY_TTL_MS,
            };

            for user_id in self.store.list_user_ids() {
                let key = (user_id.clone(), opportunity.fingerprint.clone());
                if self.seen_opportunities.contains_key(&key) {
                    continue;
                }
                self.seen_opportunities.insert(key, opportunity.expires_at);
                self.notifier.notify(
                    &user_id,
                    NotificationKind::Recommendation,
                    "market opportunity",
                    &opportunity.summary,
                    NotificationPriority::Low,
                );
            }
            debug!(symbol = %opportunity.symbol, score, "opportunity published");
            found.push(opportunity);
        }
        found
    }
}
