//! Market data types: quotes, asset classes, source provenance.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Asset class a symbol belongs to, used to pick the source ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Crypto,
    Stock,
    Forex,
    Commodity,
    Index,
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetClass::Crypto => write!(f, "crypto"),
            AssetClass::Stock => write!(f, "stock"),
            AssetClass::Forex => write!(f, "forex"),
            AssetClass::Commodity => write!(f, "commodity"),
            AssetClass::Index => write!(f, "index"),
        }
    }
}

/// Where a quote came from. `Synthetic` marks fallback data so callers can
/// downgrade user-visible confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteSource {
    CryptoFeed,
    EquityFeed,
    FxFeed,
    Synthetic,
}

impl QuoteSource {
    pub fn tag(&self) -> &'static str {
        match self {
            QuoteSource::CryptoFeed => "crypto_feed",
            QuoteSource::EquityFeed => "equity_feed",
            QuoteSource::FxFeed => "fx_feed",
            QuoteSource::Synthetic => "synthetic",
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, QuoteSource::Synthetic)
    }
}

/// Latest priced view of a symbol with freshness metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Decimal,
    pub change_24h_pct: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub asset_class: AssetClass,
    pub source_tag: QuoteSource,
    /// Wall-clock fetch time in milliseconds since epoch. The aggregator
    /// additionally tracks a monotonic instant internally for freshness.
    pub fetched_at: i64,
}

impl Quote {
    pub fn age_millis(&self, now_millis: i64) -> i64 {
        (now_millis - self.fetched_at).max(0)
    }
}

/// Batch quote response entry: either a quote or the reason it is missing.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QuoteEntry {
    Quote(Quote),
    Missing { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_source_tags() {
        assert_eq!(QuoteSource::CryptoFeed.tag(), "crypto_feed");
        assert_eq!(QuoteSource::Synthetic.tag(), "synthetic");
        assert!(QuoteSource::Synthetic.is_synthetic());
        assert!(!QuoteSource::FxFeed.is_synthetic());
    }

    #[test]
    fn test_quote_age() {
        let quote = Quote {
            symbol: "BTCUSDT".to_string(),
            price: dec!(60000),
            change_24h_pct: 1.2,
            volume_24h: 1_000_000.0,
            high_24h: 61000.0,
            low_24h: 59000.0,
            asset_class: AssetClass::Crypto,
            source_tag: QuoteSource::CryptoFeed,
            fetched_at: 1_000,
        };
        assert_eq!(quote.age_millis(4_000), 3_000);
        // Clock skew never yields a negative age.
        assert_eq!(quote.age_millis(500), 0);
    }

    #[test]
    fn test_quote_entry_serialization() {
        let missing = QuoteEntry::Missing {
            error: "all sources failed".to_string(),
        };
        let json = serde_json::to_string(&missing).unwrap();
        assert!(json.contains("all sources failed"));
    }
}
