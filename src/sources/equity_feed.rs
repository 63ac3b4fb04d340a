//! Equity market-data endpoint.
//!
//! Finnhub-compatible `/quote` wire format; also serves commodity and index
//! tickers on the same shape.

use crate::types::{AssetClass, Quote, QuoteSource};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    /// Current price.
    c: f64,
    /// Percent change.
    dp: Option<f64>,
    /// Day high.
    h: f64,
    /// Day low.
    l: f64,
}

#[derive(Clone)]
pub struct EquityFeed {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl EquityFeed {
    pub fn new(client: Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    pub async fn fetch(&self, symbol: &str, asset_class: AssetClass) -> anyhow::Result<Quote> {
        let url = format!("{}/quote", self.base_url);
        let mut request = self.client.get(&url).query(&[("symbol", symbol)]);
        if let Some(ref key) = self.api_key {
            request = request.query(&[("token", key.as_str())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("equity feed returned {}", response.status());
        }

        let body: QuoteResponse = response.json().await?;
        let price =
            Decimal::from_f64(body.c).ok_or_else(|| anyhow::anyhow!("unrepresentable price"))?;
        debug!(%symbol, %price, "equity feed quote");

        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            change_24h_pct: body.dp.unwrap_or(0.0),
            volume_24h: 0.0,
            high_24h: body.h,
            low_24h: body.l,
            asset_class,
            source_tag: QuoteSource::EquityFeed,
            fetched_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}
