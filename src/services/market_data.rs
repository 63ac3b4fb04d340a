//! Market data aggregator.
//!
//! Symbols classify into asset classes; each class consults a ranked list of
//! sources until one returns a usable quote, falling through to the
//! deterministic synthetic table only when every live source fails. A
//! per-symbol cache serves requests younger than the freshness window, and
//! concurrent refreshes for one symbol coalesce behind a per-symbol lock so
//! at most one upstream call happens per window.

use crate::config::Config;
use crate::error::AppError;
use crate::services::BreakerRegistry;
use crate::sources::{synthetic, CryptoFeed, EquityFeed, FxFeed};
use crate::types::{AssetClass, Quote, QuoteEntry, QuoteSource};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CURRENCIES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "CHF", "AUD", "CAD", "NZD", "CNY", "SEK", "NOK",
];

const COMMODITIES: &[&str] = &["XAUUSD", "XAGUSD", "XPTUSD", "WTIUSD"];

const INDICES: &[&str] = &["SPX", "NDX", "DJI", "FTSE", "DAX", "N225"];

const CRYPTO_QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "BUSD"];

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl From<MarketError> for AppError {
    fn from(e: MarketError) -> Self {
        match e {
            MarketError::UnknownSymbol(s) => AppError::NotFound(format!("unknown symbol {s}")),
        }
    }
}

struct CachedQuote {
    quote: Quote,
    fetched: Instant,
}

pub struct MarketDataAggregator {
    crypto: Option<CryptoFeed>,
    equity: Option<EquityFeed>,
    fx: Option<FxFeed>,
    cache: DashMap<String, CachedQuote>,
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    breakers: Arc<BreakerRegistry>,
    freshness: Duration,
    source_timeout: Duration,
    tick_tx: broadcast::Sender<Quote>,
}

impl MarketDataAggregator {
    pub fn new(config: &Config, breakers: Arc<BreakerRegistry>) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tiller/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let (tick_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            crypto: Some(CryptoFeed::new(
                client.clone(),
                config.crypto_feed_url.clone(),
            )),
            equity: Some(EquityFeed::new(
                client.clone(),
                config.equity_feed_url.clone(),
                None,
            )),
            fx: Some(FxFeed::new(client, config.fx_feed_url.clone())),
            cache: DashMap::new(),
            refresh_locks: DashMap::new(),
            breakers,
            freshness: Duration::from_secs(config.freshness_secs),
            source_timeout: Duration::from_secs(config.source_timeout_secs),
            tick_tx,
        })
    }

    /// Aggregator with no live sources; everything resolves from the
    /// synthetic table. Used in tests and paper-only deployments.
    pub fn synthetic_only(breakers: Arc<BreakerRegistry>, freshness: Duration) -> Arc<Self> {
        let (tick_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            crypto: None,
            equity: None,
            fx: None,
            cache: DashMap::new(),
            refresh_locks: DashMap::new(),
            breakers,
            freshness,
            source_timeout: Duration::from_secs(5),
            tick_tx,
        })
    }

    /// Classify a symbol by suffix rules and explicit allowlists.
    pub fn classify(symbol: &str) -> Option<AssetClass> {
        let s = symbol.to_uppercase();
        if s.is_empty() || s.len() > 12 || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        if COMMODITIES.contains(&s.as_str()) {
            return Some(AssetClass::Commodity);
        }
        if INDICES.contains(&s.as_str()) {
            return Some(AssetClass::Index);
        }
        if CRYPTO_QUOTE_SUFFIXES.iter().any(|suf| s.ends_with(suf)) && s.len() > 4 {
            return Some(AssetClass::Crypto);
        }
        if s.len() == 6 {
            let (base, counter) = s.split_at(3);
            if CURRENCIES.contains(&base) && CURRENCIES.contains(&counter) {
                return Some(AssetClass::Forex);
            }
        }
        if s.len() <= 5 && s.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Some(AssetClass::Stock);
        }
        None
    }

    /// Subscribe to published price ticks.
    pub fn subscribe(&self) -> broadcast::Receiver<Quote> {
        self.tick_tx.subscribe()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Symbols currently held in the cache.
    pub fn cached_symbols(&self) -> Vec<String> {
        self.cache.iter().map(|e| e.key().clone()).collect()
    }

    /// Latest cached quote regardless of freshness.
    pub fn cached_quote(&self, symbol: &str) -> Option<Quote> {
        self.cache
            .get(&symbol.to_uppercase())
            .map(|c| c.quote.clone())
    }

    /// Serve a quote from cache when younger than the freshness window,
    /// refreshing otherwise.
    pub async fn quote(&self, symbol: &str) -> Result<Quote, MarketError> {
        self.quote_with_max_age(symbol, self.freshness).await
    }

    /// Serve a quote no older than `max_age`, refreshing when necessary.
    pub async fn quote_with_max_age(
        &self,
        symbol: &str,
        max_age: Duration,
    ) -> Result<Quote, MarketError> {
        let symbol = symbol.to_uppercase();
        let asset_class =
            Self::classify(&symbol).ok_or_else(|| MarketError::UnknownSymbol(symbol.clone()))?;

        if let Some(cached) = self.cache.get(&symbol) {
            if cached.fetched.elapsed() < max_age {
                return Ok(cached.quote.clone());
            }
        }

        // Coalesce concurrent refreshes: one caller fetches, the rest wait on
        // the per-symbol lock and then read the cache it filled.
        let lock = self
            .refresh_locks
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(cached) = self.cache.get(&symbol) {
            if cached.fetched.elapsed() < max_age {
                return Ok(cached.quote.clone());
            }
        }

        let quote = self.fetch_from_sources(&symbol, asset_class).await;
        self.store_quote(quote.clone());
        Ok(quote)
    }

    /// Batch lookup; missing symbols report their reason instead of failing
    /// the whole request.
    pub async fn quotes(&self, symbols: &[String]) -> HashMap<String, QuoteEntry> {
        let mut out = HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            let entry = match self.quote(symbol).await {
                Ok(q) => QuoteEntry::Quote(q),
                Err(e) => QuoteEntry::Missing {
                    error: e.to_string(),
                },
            };
            out.insert(symbol.to_uppercase(), entry);
        }
        out
    }

    /// Insert an externally produced quote. Older ticks than the cached one
    /// are dropped so subscribers always observe monotonic `fetched_at`.
    pub fn insert_quote(&self, quote: Quote) {
        self.store_quote(quote);
    }

    /// Trip the breaker of the given source, e.g. when stale data is caught
    /// during order submission.
    pub fn trip_source(&self, source: QuoteSource) {
        self.breakers.trip(&format!("source:{}", source.tag()));
    }

    fn store_quote(&self, quote: Quote) {
        let symbol = quote.symbol.clone();
        let mut replaced = true;
        self.cache
            .entry(symbol)
            .and_modify(|cached| {
                if quote.fetched_at >= cached.quote.fetched_at {
                    cached.quote = quote.clone();
                    cached.fetched = Instant::now();
                } else {
                    replaced = false;
                }
            })
            .or_insert_with(|| CachedQuote {
                quote: quote.clone(),
                fetched: Instant::now(),
            });

        if replaced {
            let _ = self.tick_tx.send(quote);
        }
    }

    /// Consult ranked sources for the class; fall through to synthetic data
    /// only when all live sources fail.
    async fn fetch_from_sources(&self, symbol: &str, asset_class: AssetClass) -> Quote {
        let ranked: Vec<QuoteSource> = match asset_class {
            AssetClass::Crypto => vec![QuoteSource::CryptoFeed],
            AssetClass::Stock | AssetClass::Commodity | AssetClass::Index => {
                vec![QuoteSource::EquityFeed]
            }
            AssetClass::Forex => vec![QuoteSource::FxFeed],
        };

        for source in ranked {
            let breaker_key = format!("source:{}", source.tag());
            // A source whose breaker is open is skipped without burning a
            // timeout on it.
            if self.breakers.try_acquire(&breaker_key).is_err() {
                debug!(%symbol, source = source.tag(), "source breaker open, skipping");
                continue;
            }

            match self.try_source(source, symbol, asset_class).await {
                Ok(quote) if quote.price > Decimal::ZERO => {
                    self.breakers.record_success(&breaker_key);
                    return quote;
                }
                Ok(_) => {
                    warn!(%symbol, source = source.tag(), "non-positive price from source");
                    self.breakers.record_failure(&breaker_key);
                }
                Err(e) => {
                    warn!(%symbol, source = source.tag(), error = %e, "source failed");
                    self.breakers.record_failure(&breaker_key);
                }
            }
        }

        debug!(%symbol, "all live sources failed, serving synthetic quote");
        synthetic::quote(symbol, asset_class)
    }

    async fn try_source(
        &self,
        source: QuoteSource,
        symbol: &str,
        asset_class: AssetClass,
    ) -> anyhow::Result<Quote> {
        let fetch = async {
            match source {
                QuoteSource::CryptoFeed => match self.crypto {
                    Some(ref feed) => feed.fetch(symbol).await,
                    None => anyhow::bail!("crypto feed not configured"),
                },
                QuoteSource::EquityFeed => match self.equity {
                    Some(ref feed) => feed.fetch(symbol, asset_class).await,
                    None => anyhow::bail!("equity feed not configured"),
                },
                QuoteSource::FxFeed => match self.fx {
                    Some(ref feed) => feed.fetch(symbol).await,
                    None => anyhow::bail!("fx feed not configured"),
                },
                QuoteSource::Synthetic => Ok(synthetic::quote(symbol, asset_class)),
            }
        };

        match tokio::time::timeout(self.source_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("source timed out after {:?}", self.source_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn synthetic_aggregator() -> Arc<MarketDataAggregator> {
        MarketDataAggregator::synthetic_only(BreakerRegistry::new(), Duration::from_secs(30))
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            MarketDataAggregator::classify("BTCUSDT"),
            Some(AssetClass::Crypto)
        );
        assert_eq!(
            MarketDataAggregator::classify("ethusdc"),
            Some(AssetClass::Crypto)
        );
        assert_eq!(
            MarketDataAggregator::classify("EURUSD"),
            Some(AssetClass::Forex)
        );
        assert_eq!(
            MarketDataAggregator::classify("AAPL"),
            Some(AssetClass::Stock)
        );
        assert_eq!(
            MarketDataAggregator::classify("XAUUSD"),
            Some(AssetClass::Commodity)
        );
        assert_eq!(
            MarketDataAggregator::classify("SPX"),
            Some(AssetClass::Index)
        );
        assert_eq!(MarketDataAggregator::classify(""), None);
        assert_eq!(MarketDataAggregator::classify("not a symbol"), None);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_missing() {
        let aggregator = synthetic_aggregator();
        assert!(aggregator.quote("not-a-symbol").await.is_err());

        let entries = aggregator
            .quotes(&["BTCUSDT".to_string(), "###".to_string()])
            .await;
        assert!(matches!(entries.get("BTCUSDT"), Some(QuoteEntry::Quote(_))));
        assert!(matches!(
            entries.get("###"),
            Some(QuoteEntry::Missing { .. })
        ));
    }

    #[tokio::test]
    async fn test_synthetic_fallback_is_tagged() {
        let aggregator = synthetic_aggregator();
        let quote = aggregator.quote("BTCUSDT").await.unwrap();
        assert_eq!(quote.source_tag, QuoteSource::Synthetic);
        assert_eq!(quote.price, dec!(60000));
    }

    #[tokio::test]
    async fn test_cache_serves_within_freshness_window() {
        let aggregator = synthetic_aggregator();
        let first = aggregator.quote("BTCUSDT").await.unwrap();
        let second = aggregator.quote("BTCUSDT").await.unwrap();
        assert_eq!(first.fetched_at, second.fetched_at);
        assert_eq!(aggregator.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let aggregator = synthetic_aggregator();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let agg = aggregator.clone();
            handles.push(tokio::spawn(
                async move { agg.quote("ETHUSDT").await.unwrap() },
            ));
        }
        let mut fetched_ats = Vec::new();
        for handle in handles {
            fetched_ats.push(handle.await.unwrap().fetched_at);
        }
        // All callers observe the same refresh.
        let first = fetched_ats[0];
        assert!(fetched_ats.iter().all(|t| *t == first));
    }

    #[tokio::test]
    async fn test_stale_ticks_are_dropped() {
        let aggregator = synthetic_aggregator();
        let fresh = aggregator.quote("BTCUSDT").await.unwrap();

        let mut stale = fresh.clone();
        stale.fetched_at = fresh.fetched_at - 10_000;
        stale.price = dec!(1);
        aggregator.insert_quote(stale);

        let cached = aggregator.cached_quote("BTCUSDT").unwrap();
        assert_eq!(cached.fetched_at, fresh.fetched_at);
        assert_eq!(cached.price, fresh.price);
    }

    #[tokio::test]
    async fn test_ticks_publish_to_subscribers() {
        let aggregator = synthetic_aggregator();
        let mut rx = aggregator.subscribe();
        let quote = aggregator.quote("SOLUSDT").await.unwrap();
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.symbol, "SOLUSDT");
        assert_eq!(tick.fetched_at, quote.fetched_at);
    }
}
