//! FX rate endpoint.
//!
//! Open-exchange-rate style wire format: `/latest/<BASE>` returns a map of
//! quote-currency rates. A six-letter pair like `EURUSD` resolves to the
//! `USD` rate of the `EUR` table.

use crate::types::{AssetClass, Quote, QuoteSource};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RatesResponse {
    rates: HashMap<String, f64>,
}

#[derive(Clone)]
pub struct FxFeed {
    client: Client,
    base_url: String,
}

impl FxFeed {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn fetch(&self, symbol: &str) -> anyhow::Result<Quote> {
        if symbol.len() != 6 {
            anyhow::bail!("not a six-letter forex pair: {symbol}");
        }
        let (base, counter) = symbol.split_at(3);

        let url = format!("{}/latest/{}", self.base_url, base);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("fx feed returned {}", response.status());
        }

        let body: RatesResponse = response.json().await?;
        let rate = body
            .rates
            .get(counter)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no rate for {counter}"))?;
        let price =
            Decimal::from_f64(rate).ok_or_else(|| anyhow::anyhow!("unrepresentable rate"))?;
        debug!(%symbol, %price, "fx feed quote");

        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            change_24h_pct: 0.0,
            volume_24h: 0.0,
            high_24h: rate,
            low_24h: rate,
            asset_class: AssetClass::Forex,
            source_tag: QuoteSource::FxFeed,
            fetched_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}
