//! Binance spot adapter.
//!
//! Signed requests carry an HMAC-SHA256 hex signature over the query string
//! plus a timestamp; the API key travels in `X-MBX-APIKEY`.

use super::{retry_transient, AdapterError, AssetBalance, OrderAck, OrderAckStatus, TestReport};
use crate::types::{
    AssetClass, OrderSide, OrderType, PlatformCredentials, Quote, QuoteSource, TradeOrder,
};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const MAINNET_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    last_price: String,
    price_change_percent: String,
    quote_volume: String,
    high_price: String,
    low_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    #[serde(default)]
    fills: Vec<OrderFill>,
}

#[derive(Debug, Deserialize)]
struct OrderFill {
    price: String,
    qty: String,
}

pub struct BinanceAdapter {
    client: Client,
    base_url: &'static str,
    api_key: String,
    api_secret: String,
    // Upstream requires serialized signed calls per connection; interleaved
    // timestamps trip its replay protection.
    call_lock: Mutex<()>,
}

impl BinanceAdapter {
    pub fn new(credentials: PlatformCredentials, sandbox: bool) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: if sandbox { TESTNET_URL } else { MAINNET_URL },
            api_key: credentials.api_key,
            api_secret: credentials.secret_key,
            call_lock: Mutex::new(()),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let mut query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let timestamp = chrono::Utc::now().timestamp_millis();
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={timestamp}"));
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn classify_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AdapterError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        let api_error: Option<ApiError> = serde_json::from_str(&body).ok();
        let msg = api_error
            .as_ref()
            .map(|e| e.msg.clone())
            .unwrap_or_else(|| format!("http {status}"));

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterError::Auth(msg),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => AdapterError::RateLimit(msg),
            s if s.is_server_error() => AdapterError::Network(msg),
            _ => match api_error.map(|e| e.code) {
                Some(-2010) | Some(-2019) => AdapterError::InsufficientFunds(msg),
                Some(-1013) => AdapterError::MarketClosed(msg),
                Some(-2014) | Some(-2015) => AdapterError::Auth(msg),
                _ => AdapterError::Unknown(msg),
            },
        })
    }

    async fn signed_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let _guard = self.call_lock.lock().await;
        let query = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::classify_response(response).await
    }

    async fn signed_send<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let _guard = self.call_lock.lock().await;
        let query = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::classify_response(response).await
    }

    pub async fn test(&self) -> Result<TestReport, AdapterError> {
        let started = Instant::now();
        let balances = self.balances().await?;
        Ok(TestReport {
            ok: true,
            latency_ms: started.elapsed().as_millis() as u64,
            balance_snapshot: Some(balances),
        })
    }

    pub async fn balances(&self) -> Result<HashMap<String, AssetBalance>, AdapterError> {
        let account: AccountResponse = retry_transient(MAX_ATTEMPTS, || {
            self.signed_get("/api/v3/account", &[])
        })
        .await?;

        let mut out = HashMap::new();
        for balance in account.balances {
            let free: Decimal = balance.free.parse().unwrap_or_default();
            let locked: Decimal = balance.locked.parse().unwrap_or_default();
            if free > Decimal::ZERO || locked > Decimal::ZERO {
                out.insert(balance.asset, AssetBalance { free, locked });
            }
        }
        Ok(out)
    }

    pub async fn ticker(&self, symbol: &str) -> Result<Quote, AdapterError> {
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, symbol);
        let response = self.client.get(&url).send().await?;
        let ticker: TickerResponse = Self::classify_response(response).await?;
        Ok(Quote {
            symbol: symbol.to_string(),
            price: ticker.last_price.parse().unwrap_or_default(),
            change_24h_pct: ticker.price_change_percent.parse().unwrap_or(0.0),
            volume_24h: ticker.quote_volume.parse().unwrap_or(0.0),
            high_24h: ticker.high_price.parse().unwrap_or(0.0),
            low_24h: ticker.low_price.parse().unwrap_or(0.0),
            asset_class: AssetClass::Crypto,
            source_tag: QuoteSource::CryptoFeed,
            fetched_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub async fn place_order(&self, order: &TradeOrder) -> Result<OrderAck, AdapterError> {
        let side = match order.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", order.symbol.clone()),
            ("side", side.to_string()),
            ("quantity", order.quantity.to_string()),
        ];
        match order.order_type {
            OrderType::Market => params.push(("type", "MARKET".to_string())),
            OrderType::Limit => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                if let Some(price) = order.limit_price {
                    params.push(("price", price.to_string()));
                }
            }
            OrderType::StopLoss => {
                params.push(("type", "STOP_LOSS".to_string()));
                if let Some(stop) = order.stop_price {
                    params.push(("stopPrice", stop.to_string()));
                }
            }
            OrderType::TakeProfit => {
                params.push(("type", "TAKE_PROFIT".to_string()));
                if let Some(stop) = order.stop_price {
                    params.push(("stopPrice", stop.to_string()));
                }
            }
        }

        let response: OrderResponse = self
            .signed_send(reqwest::Method::POST, "/api/v3/order", &params)
            .await?;

        debug!(order_id = response.order_id, status = %response.status, "binance order placed");
        Ok(OrderAck {
            exchange_order_id: response.order_id.to_string(),
            fill_price: weighted_fill_price(&response.fills),
            status: match response.status.as_str() {
                "FILLED" => OrderAckStatus::Filled,
                "REJECTED" | "EXPIRED" => OrderAckStatus::Rejected,
                _ => OrderAckStatus::Accepted,
            },
        })
    }

    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), AdapterError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let _: serde_json::Value = self
            .signed_send(reqwest::Method::DELETE, "/api/v3/order", &params)
            .await?;
        Ok(())
    }

    pub async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderAckStatus, AdapterError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let response: OrderResponse = self.signed_get("/api/v3/order", &params).await?;
        Ok(match response.status.as_str() {
            "FILLED" => OrderAckStatus::Filled,
            "CANCELED" | "REJECTED" | "EXPIRED" => OrderAckStatus::Rejected,
            _ => OrderAckStatus::Accepted,
        })
    }
}

fn weighted_fill_price(fills: &[OrderFill]) -> Option<Decimal> {
    let mut total_qty = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    for fill in fills {
        let price: Decimal = fill.price.parse().ok()?;
        let qty: Decimal = fill.qty.parse().ok()?;
        total_qty += qty;
        total_cost += price * qty;
    }
    if total_qty > Decimal::ZERO {
        Some(total_cost / total_qty)
    } else {
        None
    }
}
