//! Deterministic synthetic price table.
//!
//! Last-resort source used when every live feed for an asset class has
//! failed. Prices are stable per symbol so repeated calls agree, and the
//! `source_tag` marks the data as synthetic so callers can downgrade
//! confidence.

use crate::types::{AssetClass, Quote, QuoteSource};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Reference prices for common symbols.
const KNOWN_PRICES: &[(&str, Decimal)] = &[
    ("BTCUSDT", dec!(60000)),
    ("ETHUSDT", dec!(3000)),
    ("BNBUSDT", dec!(550)),
    ("SOLUSDT", dec!(150)),
    ("XRPUSDT", dec!(0.52)),
    ("DOGEUSDT", dec!(0.12)),
    ("ADAUSDT", dec!(0.45)),
    ("AAPL", dec!(210)),
    ("MSFT", dec!(420)),
    ("TSLA", dec!(250)),
    ("NVDA", dec!(120)),
    ("EURUSD", dec!(1.09)),
    ("GBPUSD", dec!(1.27)),
    ("USDJPY", dec!(155)),
    ("XAUUSD", dec!(2300)),
    ("SPX", dec!(5300)),
];

/// Produce a synthetic quote for any symbol. Unknown symbols derive a stable
/// pseudo-price from the symbol text so the table never runs dry.
pub fn quote(symbol: &str, asset_class: AssetClass) -> Quote {
    let symbol = symbol.to_uppercase();
    let price = KNOWN_PRICES
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, p)| *p)
        .unwrap_or_else(|| derived_price(&symbol, asset_class));

    let price_f = price.to_string().parse::<f64>().unwrap_or(1.0);
    Quote {
        symbol,
        price,
        change_24h_pct: 0.0,
        volume_24h: 0.0,
        high_24h: price_f,
        low_24h: price_f,
        asset_class,
        source_tag: QuoteSource::Synthetic,
        fetched_at: chrono::Utc::now().timestamp_millis(),
    }
}

/// Stable pseudo-price in a plausible range for the asset class.
fn derived_price(symbol: &str, asset_class: AssetClass) -> Decimal {
    let seed: u64 = symbol
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    match asset_class {
        AssetClass::Crypto => Decimal::from(1 + seed % 1000) / dec!(10),
        AssetClass::Stock => Decimal::from(10 + seed % 490),
        AssetClass::Forex => dec!(0.5) + Decimal::from(seed % 150) / dec!(100),
        AssetClass::Commodity => Decimal::from(50 + seed % 2500),
        AssetClass::Index => Decimal::from(1000 + seed % 5000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_symbol_price() {
        let q = quote("BTCUSDT", AssetClass::Crypto);
        assert_eq!(q.price, dec!(60000));
        assert_eq!(q.source_tag, QuoteSource::Synthetic);
    }

    #[test]
    fn test_case_insensitive() {
        let q = quote("btcusdt", AssetClass::Crypto);
        assert_eq!(q.symbol, "BTCUSDT");
        assert_eq!(q.price, dec!(60000));
    }

    #[test]
    fn test_unknown_symbol_is_deterministic_and_positive() {
        let a = quote("ZZZUSDT", AssetClass::Crypto);
        let b = quote("ZZZUSDT", AssetClass::Crypto);
        assert_eq!(a.price, b.price);
        assert!(a.price > Decimal::ZERO);
    }
}
