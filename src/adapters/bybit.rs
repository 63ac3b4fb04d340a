//! Bybit v5 spot adapter.
//!
//! Signatures are HMAC-SHA256 hex over `timestamp + api_key + recv_window +
//! payload`, carried in `X-BAPI-*` headers. The v5 API wraps every response
//! in `{retCode, retMsg, result}`.

use super::{retry_transient, AdapterError, AssetBalance, OrderAck, OrderAckStatus, TestReport};
use crate::types::{
    AssetClass, OrderSide, OrderType, PlatformCredentials, Quote, QuoteSource, TradeOrder,
};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletResult {
    list: Vec<WalletAccount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletAccount {
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletCoin {
    coin: String,
    wallet_balance: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResult {
    list: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
    last_price: String,
    price_24h_pcnt: String,
    turnover_24h: String,
    high_price_24h: String,
    low_price_24h: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResult {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderQueryResult {
    list: Vec<OrderQueryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderQueryEntry {
    order_status: String,
    avg_price: Option<String>,
}

pub struct BybitAdapter {
    client: Client,
    base_url: &'static str,
    api_key: String,
    api_secret: String,
    call_lock: Mutex<()>,
}

impl BybitAdapter {
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

    fn sign(&self, timestamp: i64, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn classify(code: i64, msg: String) -> AdapterError {
        match code {
            10003 | 10004 | 33004 => AdapterError::Auth(msg),
            10006 | 10018 => AdapterError::RateLimit(msg),
            170131 | 170033 => AdapterError::InsufficientFunds(msg),
            170001 => AdapterError::MarketClosed(msg),
            _ => AdapterError::Unknown(msg),
        }
    }

    fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, AdapterError> {
        if envelope.ret_code != 0 {
            return Err(Self::classify(envelope.ret_code, envelope.ret_msg));
        }
        envelope
            .result
            .ok_or_else(|| AdapterError::Unknown("empty result".to_string()))
    }

    async fn signed_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, AdapterError> {
        let _guard = self.call_lock.lock().await;
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, query);
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await?;
        let envelope: Envelope<T> = response.json().await?;
        Self::unwrap_envelope(envelope)
    }

    async fn signed_post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, AdapterError> {
        let _guard = self.call_lock.lock().await;
        let body_text = body.to_string();
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, &body_text);
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(body_text)
            .send()
            .await?;
        let envelope: Envelope<T> = response.json().await?;
        Self::unwrap_envelope(envelope)
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
        let result: WalletResult = retry_transient(MAX_ATTEMPTS, || {
            self.signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
        })
        .await?;

        let mut out = HashMap::new();
        for account in result.list {
            for coin in account.coin {
                let free: Decimal = coin.wallet_balance.parse().unwrap_or_default();
                let locked: Decimal = coin.locked.parse().unwrap_or_default();
                if free > Decimal::ZERO || locked > Decimal::ZERO {
                    out.insert(coin.coin, AssetBalance { free, locked });
                }
            }
        }
        Ok(out)
    }

    pub async fn ticker(&self, symbol: &str) -> Result<Quote, AdapterError> {
        let url = format!(
            "{}/v5/market/tickers?category=spot&symbol={}",
            self.base_url, symbol
        );
        let response = self.client.get(&url).send().await?;
        let envelope: Envelope<TickerResult> = response.json().await?;
        let result = Self::unwrap_envelope(envelope)?;
        let entry = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Unknown(format!("no ticker for {symbol}")))?;

        Ok(Quote {
            symbol: symbol.to_string(),
            price: entry.last_price.parse().unwrap_or_default(),
            change_24h_pct: entry.price_24h_pcnt.parse::<f64>().unwrap_or(0.0) * 100.0,
            volume_24h: entry.turnover_24h.parse().unwrap_or(0.0),
            high_24h: entry.high_price_24h.parse().unwrap_or(0.0),
            low_24h: entry.low_price_24h.parse().unwrap_or(0.0),
            asset_class: AssetClass::Crypto,
            source_tag: QuoteSource::CryptoFeed,
            fetched_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub async fn place_order(&self, order: &TradeOrder) -> Result<OrderAck, AdapterError> {
        let side = match order.side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        let order_type = match order.order_type {
            OrderType::Market => "Market",
            _ => "Limit",
        };
        let mut body = json!({
            "category": "spot",
            "symbol": order.symbol,
            "side": side,
            "orderType": order_type,
            "qty": order.quantity.to_string(),
        });
        if let Some(price) = order.limit_price {
            body["price"] = json!(price.to_string());
        }
        if let Some(stop) = order.stop_price {
            body["triggerPrice"] = json!(stop.to_string());
        }

        let result: OrderResult = self.signed_post("/v5/order/create", body).await?;
        debug!(order_id = %result.order_id, "bybit order placed");

        // v5 acks asynchronously; fills surface through the status query.
        Ok(OrderAck {
            exchange_order_id: result.order_id,
            fill_price: None,
            status: OrderAckStatus::Accepted,
        })
    }

    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), AdapterError> {
        let body = json!({
            "category": "spot",
            "symbol": symbol,
            "orderId": order_id,
        });
        let _: serde_json::Value = self.signed_post("/v5/order/cancel", body).await?;
        Ok(())
    }

    pub async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderAckStatus, AdapterError> {
        let query = format!("category=spot&symbol={symbol}&orderId={order_id}");
        let result: OrderQueryResult = self.signed_get("/v5/order/realtime", &query).await?;
        let entry = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Unknown(format!("order {order_id} not found")))?;
        Ok(match entry.order_status.as_str() {
            "Filled" => OrderAckStatus::Filled,
            "Cancelled" | "Rejected" | "Deactivated" => OrderAckStatus::Rejected,
            _ => OrderAckStatus::Accepted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BybitAdapter {
        BybitAdapter::new(
            PlatformCredentials {
                api_key: "key".to_string(),
                secret_key: "secret".to_string(),
                passphrase: None,
            },
            true,
        )
    }

    #[test]
    fn test_signature_includes_key_and_window() {
        let a = adapter();
        let sig = a.sign(1000, "accountType=UNIFIED");
        assert_eq!(sig.len(), 64);
        // Different payloads must sign differently.
        assert_ne!(sig, a.sign(1000, "accountType=SPOT"));
        assert_ne!(sig, a.sign(1001, "accountType=UNIFIED"));
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            BybitAdapter::classify(10003, "bad key".into()),
            AdapterError::Auth(_)
        ));
        assert!(matches!(
            BybitAdapter::classify(10006, "slow down".into()),
            AdapterError::RateLimit(_)
        ));
        assert!(matches!(
            BybitAdapter::classify(170131, "broke".into()),
            AdapterError::InsufficientFunds(_)
        ));
    }
}
