//! Public crypto aggregator feed.
//!
//! Speaks the Binance-compatible `/ticker/24hr` wire format, which several
//! public aggregators mirror.

use crate::types::{AssetClass, Quote, QuoteSource};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    last_price: String,
    price_change_percent: String,
    quote_volume: String,
    high_price: String,
    low_price: String,
}

#[derive(Clone)]
pub struct CryptoFeed {
    client: Client,
    base_url: String,
}

impl CryptoFeed {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn fetch(&self, symbol: &str) -> anyhow::Result<Quote> {
        let url = format!("{}/ticker/24hr", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("crypto feed returned {}", response.status());
        }

        let ticker: TickerResponse = response.json().await?;
        let price: Decimal = ticker.last_price.parse()?;
        debug!(%symbol, %price, "crypto feed quote");

        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            change_24h_pct: ticker.price_change_percent.parse().unwrap_or(0.0),
            volume_24h: ticker.quote_volume.parse().unwrap_or(0.0),
            high_24h: ticker.high_price.parse().unwrap_or(0.0),
            low_24h: ticker.low_price.parse().unwrap_or(0.0),
            asset_class: AssetClass::Crypto,
            source_tag: QuoteSource::CryptoFeed,
            fetched_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}
