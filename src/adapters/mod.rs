//! Exchange adapters.
//!
//! A closed set of variants over a uniform capability set, so call sites get
//! compile-time exhaustive handling instead of dynamic dispatch. Every
//! upstream failure mode translates into the `AdapterError` taxonomy, calls
//! serialize per connection, and transient errors retry with exponential
//! backoff plus jitter. Credentials never appear in logs.

pub mod binance;
pub mod bybit;
pub mod okx;
pub mod paper;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use okx::OkxAdapter;
pub use paper::{PaperAdapter, PaperFill};

use crate::error::AppError;
use crate::services::MarketDataAggregator;
use crate::types::{
    ExecutionKind, Platform, PlatformCredentials, PlatformKind, Quote, TradeOrder,
};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Uniform failure taxonomy across exchanges.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("market closed: {0}")]
    MarketClosed(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("exchange error: {0}")]
    Unknown(String),
}

impl AdapterError {
    /// Transient errors are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Network(_) | AdapterError::RateLimit(_) | AdapterError::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AdapterError::Timeout(e.to_string())
        } else if e.is_connect() {
            AdapterError::Network(e.to_string())
        } else if e.is_decode() {
            AdapterError::Unknown(format!("malformed response: {e}"))
        } else {
            AdapterError::Network(e.to_string())
        }
    }
}

impl From<AdapterError> for AppError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Timeout(msg) => AppError::UpstreamTimeout(msg),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAckStatus {
    Filled,
    Accepted,
    Rejected,
}

/// Canonical order acknowledgement, independent of wire format.
#[derive(Debug, Clone, Serialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub fill_price: Option<Decimal>,
    pub status: OrderAckStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
}

/// Result of a lightweight authenticated ping.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub ok: bool,
    pub latency_ms: u64,
    pub balance_snapshot: Option<HashMap<String, AssetBalance>>,
}

/// Closed set of exchange adapters with a common capability set.
pub enum ExchangeAdapter {
    Binance(BinanceAdapter),
    Bybit(BybitAdapter),
    Okx(OkxAdapter),
    Paper(PaperAdapter),
}

impl ExchangeAdapter {
    /// Build an adapter for a platform. Decrypted credentials live only
    /// inside the returned instance.
    pub fn from_platform(
        platform: &Platform,
        credentials: PlatformCredentials,
        market: Arc<MarketDataAggregator>,
    ) -> Self {
        match platform.kind {
            PlatformKind::Binance => ExchangeAdapter::Binance(BinanceAdapter::new(
                credentials,
                platform.is_sandbox,
            )),
            PlatformKind::Bybit => {
                ExchangeAdapter::Bybit(BybitAdapter::new(credentials, platform.is_sandbox))
            }
            PlatformKind::Okx => {
                ExchangeAdapter::Okx(OkxAdapter::new(credentials, platform.is_sandbox))
            }
            PlatformKind::Paper => ExchangeAdapter::Paper(PaperAdapter::new(market)),
        }
    }

    pub fn execution_kind(&self) -> ExecutionKind {
        match self {
            ExchangeAdapter::Paper(_) => ExecutionKind::Paper,
            _ => ExecutionKind::Live,
        }
    }

    pub async fn test(&self) -> Result<TestReport, AdapterError> {
        match self {
            ExchangeAdapter::Binance(a) => a.test().await,
            ExchangeAdapter::Bybit(a) => a.test().await,
            ExchangeAdapter::Okx(a) => a.test().await,
            ExchangeAdapter::Paper(a) => a.test().await,
        }
    }

    pub async fn balances(&self) -> Result<HashMap<String, AssetBalance>, AdapterError> {
        match self {
            ExchangeAdapter::Binance(a) => a.balances().await,
            ExchangeAdapter::Bybit(a) => a.balances().await,
            ExchangeAdapter::Okx(a) => a.balances().await,
            ExchangeAdapter::Paper(a) => a.balances().await,
        }
    }

    pub async fn ticker(&self, symbol: &str) -> Result<Quote, AdapterError> {
        match self {
            ExchangeAdapter::Binance(a) => a.ticker(symbol).await,
            ExchangeAdapter::Bybit(a) => a.ticker(symbol).await,
            ExchangeAdapter::Okx(a) => a.ticker(symbol).await,
            ExchangeAdapter::Paper(a) => a.ticker(symbol).await,
        }
    }

    /// Submit an order. `mark` is the aggregator quote the router validated;
    /// the paper adapter fills against it.
    pub async fn place_order(
        &self,
        owner_id: &str,
        order: &TradeOrder,
        mark: &Quote,
    ) -> Result<OrderAck, AdapterError> {
        match self {
            ExchangeAdapter::Binance(a) => a.place_order(order).await,
            ExchangeAdapter::Bybit(a) => a.place_order(order).await,
            ExchangeAdapter::Okx(a) => a.place_order(order).await,
            ExchangeAdapter::Paper(a) => a.place_order(owner_id, order, mark).await,
        }
    }

    pub async fn cancel(&self, symbol: &str, exchange_order_id: &str) -> Result<(), AdapterError> {
        match self {
            ExchangeAdapter::Binance(a) => a.cancel(symbol, exchange_order_id).await,
            ExchangeAdapter::Bybit(a) => a.cancel(symbol, exchange_order_id).await,
            ExchangeAdapter::Okx(a) => a.cancel(symbol, exchange_order_id).await,
            ExchangeAdapter::Paper(a) => a.cancel(exchange_order_id).await,
        }
    }

    pub async fn order_status(
        &self,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<OrderAckStatus, AdapterError> {
        match self {
            ExchangeAdapter::Binance(a) => a.order_status(symbol, exchange_order_id).await,
            ExchangeAdapter::Bybit(a) => a.order_status(symbol, exchange_order_id).await,
            ExchangeAdapter::Okx(a) => a.order_status(symbol, exchange_order_id).await,
            ExchangeAdapter::Paper(a) => a.order_status(exchange_order_id).await,
        }
    }
}

/// Retry a call on transient failures with exponential backoff and jitter.
pub(crate) async fn retry_transient<T, F, Fut>(
    max_attempts: u32,
    mut op: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let base_ms = 200u64.saturating_mul(1 << attempt);
                let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
                tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_transient_classification() {
        assert!(AdapterError::Network("reset".into()).is_transient());
        assert!(AdapterError::RateLimit("429".into()).is_transient());
        assert!(AdapterError::Timeout("5s".into()).is_transient());
        assert!(!AdapterError::Auth("bad key".into()).is_transient());
        assert!(!AdapterError::InsufficientFunds("0".into()).is_transient());
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::Auth("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AdapterError::Network("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_error_maps_to_http_taxonomy() {
        let timeout: AppError = AdapterError::Timeout("slow".into()).into();
        assert_eq!(timeout.code(), "UPSTREAM_TIMEOUT");
        let network: AppError = AdapterError::Network("down".into()).into();
        assert_eq!(network.code(), "UPSTREAM_ERROR");
    }
}
