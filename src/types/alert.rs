//! Smart alerts and opportunity scan types.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    PriceAbove,
    PriceBelow,
    RsiAbove,
    RsiBelow,
    VolumeSpike,
}

impl AlertCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCondition::PriceAbove => "price_above",
            AlertCondition::PriceBelow => "price_below",
            AlertCondition::RsiAbove => "rsi_above",
            AlertCondition::RsiBelow => "rsi_below",
            AlertCondition::VolumeSpike => "volume_spike",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "price_above" => Some(AlertCondition::PriceAbove),
            "price_below" => Some(AlertCondition::PriceBelow),
            "rsi_above" => Some(AlertCondition::RsiAbove),
            "rsi_below" => Some(AlertCondition::RsiBelow),
            "volume_spike" => Some(AlertCondition::VolumeSpike),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Armed,
    Triggered,
    Dismissed,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Armed => "armed",
            AlertState::Triggered => "triggered",
            AlertState::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "armed" => AlertState::Armed,
            "triggered" => AlertState::Triggered,
            _ => AlertState::Dismissed,
        }
    }
}

/// Deterministic fingerprint over owner, symbol, condition and a bucketised
/// threshold. Two armed alerts with the same fingerprint cannot coexist for
/// one owner.
pub fn alert_fingerprint(
    user_id: &str,
    symbol: &str,
    condition: AlertCondition,
    threshold: Decimal,
) -> String {
    // Bucket thresholds to cents so near-identical alerts collapse.
    let bucket = (threshold * dec!(100)).round();
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(symbol.to_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(condition.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct SmartAlert {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub condition: AlertCondition,
    pub threshold: Decimal,
    pub fingerprint: String,
    pub state: AlertState,
    pub created_at: i64,
    pub triggered_at: Option<i64>,
}

impl SmartAlert {
    pub fn new(user_id: String, symbol: String, condition: AlertCondition, threshold: Decimal) -> Self {
        let symbol = symbol.to_uppercase();
        let fingerprint = alert_fingerprint(&user_id, &symbol, condition, threshold);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            symbol,
            condition,
            threshold,
            fingerprint,
            state: AlertState::Armed,
            created_at: chrono::Utc::now().timestamp_millis(),
            triggered_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAlertRequest {
    pub symbol: String,
    pub condition: AlertCondition,
    pub threshold: Decimal,
}

/// A scanned market opportunity, deduplicated by fingerprint per owner and
/// carrying an expiry.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub id: String,
    pub symbol: String,
    pub summary: String,
    /// Heuristic strength in [0, 100].
    pub score: u8,
    pub fingerprint: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let a = alert_fingerprint("u1", "BTCUSDT", AlertCondition::PriceAbove, dec!(65000));
        let b = alert_fingerprint("u1", "btcusdt", AlertCondition::PriceAbove, dec!(65000));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_buckets_thresholds() {
        // Sub-cent differences collapse into one bucket.
        let a = alert_fingerprint("u1", "BTCUSDT", AlertCondition::PriceAbove, dec!(65000.001));
        let b = alert_fingerprint("u1", "BTCUSDT", AlertCondition::PriceAbove, dec!(65000.002));
        assert_eq!(a, b);

        let c = alert_fingerprint("u1", "BTCUSDT", AlertCondition::PriceAbove, dec!(65001));
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_separates_owners_and_conditions() {
        let a = alert_fingerprint("u1", "BTCUSDT", AlertCondition::PriceAbove, dec!(65000));
        let b = alert_fingerprint("u2", "BTCUSDT", AlertCondition::PriceAbove, dec!(65000));
        let c = alert_fingerprint("u1", "BTCUSDT", AlertCondition::PriceBelow, dec!(65000));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_new_alert_is_armed() {
        let alert = SmartAlert::new(
            "u1".to_string(),
            "ethusdt".to_string(),
            AlertCondition::RsiBelow,
            dec!(30),
        );
        assert_eq!(alert.state, AlertState::Armed);
        assert_eq!(alert.symbol, "ETHUSDT");
        assert!(alert.triggered_at.is_none());
    }
}
