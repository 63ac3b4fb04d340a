//! AI analysis assistant.
//!
//! The provider is an opaque text-completion service behind a timeout and
//! the `ai:provider` breaker. It is explicitly recoverable: any failure (or
//! a missing API key) yields a deterministic textual fallback marked
//! `degraded`, never an error to the caller.

use crate::services::BreakerRegistry;
use crate::types::Quote;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const AI_BREAKER: &str = "ai:provider";
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub symbol: String,
    pub text: String,
    /// True when the provider was unavailable and the deterministic
    /// fallback was served instead.
    pub degraded: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
}

pub struct AiClient {
    client: Client,
    api_key: Option<String>,
    url: String,
    breakers: Arc<BreakerRegistry>,
}

impl AiClient {
    pub fn new(api_key: Option<String>, url: String, breakers: Arc<BreakerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            client: Client::builder()
                .timeout(COMPLETION_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            url,
            breakers,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Produce a market analysis for the symbol. Falls back deterministically
    /// when the provider is disabled, its breaker is open, or the call fails.
    pub async fn analyze(&self, symbol: &str, quote: &Quote) -> Analysis {
        let Some(ref key) = self.api_key else {
            return fallback(symbol, quote);
        };
        if self.breakers.try_acquire(AI_BREAKER).is_err() {
            debug!(%symbol, "ai breaker open, serving fallback");
            return fallback(symbol, quote);
        }

        match self.complete(key, symbol, quote).await {
            Ok(text) => {
                self.breakers.record_success(AI_BREAKER);
                Analysis {
                    symbol: symbol.to_string(),
                    text,
                    degraded: false,
                }
            }
            Err(e) => {
                warn!(%symbol, error = %e, "ai provider failed, serving fallback");
                self.breakers.record_failure(AI_BREAKER);
                fallback(symbol, quote)
            }
        }
    }

    async fn complete(&self, key: &str, symbol: &str, quote: &Quote) -> anyhow::Result<String> {
        let prompt = format!(
            "Summarize the trading picture for {symbol}: price {}, 24h change {:.2}%, \
             24h range {} to {}.",
            quote.price, quote.change_24h_pct, quote.low_24h, quote.high_24h
        );
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(key)
            .json(&json!({
                "prompt": prompt,
                "max_tokens": 256,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("provider returned {}", response.status());
        }
        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("empty completion"))
    }
}

/// Deterministic analysis derived only from the quote itself.
fn fallback(symbol: &str, quote: &Quote) -> Analysis {
    let direction = if quote.change_24h_pct > 1.0 {
        "trending up"
    } else if quote.change_24h_pct < -1.0 {
        "trending down"
    } else {
        "moving sideways"
    };
    Analysis {
        symbol: symbol.to_string(),
        text: format!(
            "{symbol} is {direction} at {} ({:+.2}% over 24h). \
             Automated analysis is temporarily unavailable; this summary is \
             derived from market data only.",
            quote.price, quote.change_24h_pct
        ),
        degraded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetClass, QuoteSource};
    use rust_decimal_macros::dec;

    fn quote() -> Quote {
        Quote {
            symbol: "BTCUSDT".to_string(),
            price: dec!(60000),
            change_24h_pct: 2.5,
            volume_24h: 0.0,
            high_24h: 61000.0,
            low_24h: 59000.0,
            asset_class: AssetClass::Crypto,
            source_tag: QuoteSource::Synthetic,
            fetched_at: 0,
        }
    }

    #[tokio::test]
    async fn test_missing_key_degrades_gracefully() {
        let ai = AiClient::new(None, "http://localhost:1".to_string(), BreakerRegistry::new());
        assert!(!ai.is_enabled());

        let analysis = ai.analyze("BTCUSDT", &quote()).await;
        assert!(analysis.degraded);
        assert!(analysis.text.contains("BTCUSDT"));
        assert!(analysis.text.contains("trending up"));
    }

    #[tokio::test]
    async fn test_open_breaker_skips_provider() {
        let breakers = BreakerRegistry::new();
        breakers.trip(AI_BREAKER);
        let ai = AiClient::new(
            Some("key".to_string()),
            "http://localhost:1".to_string(),
            breakers,
        );
        let analysis = ai.analyze("BTCUSDT", &quote()).await;
        assert!(analysis.degraded);
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let a = fallback("BTCUSDT", &quote());
        let b = fallback("BTCUSDT", &quote());
        assert_eq!(a.text, b.text);
        assert!(a.degraded);
    }
}
