//! OKX v5 adapter.
//!
//! Signatures are base64 HMAC-SHA256 over `timestamp + method + path + body`
//! with an ISO-8601 timestamp; the passphrase travels in its own header and
//! sandbox mode uses the `x-simulated-trading` flag.

use super::{retry_transient, AdapterError, AssetBalance, OrderAck, OrderAckStatus, TestReport};
use crate::types::{
    AssetClass, OrderSide, OrderType, PlatformCredentials, Quote, QuoteSource, TradeOrder,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
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

const BASE_URL: &str = "https://www.okx.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDetail {
    ccy: String,
    avail_bal: String,
    frozen_bal: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    last: String,
    vol_ccy_24h: String,
    high_24h: String,
    low_24h: String,
    open_24h: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    ord_id: String,
    #[serde(default)]
    s_code: String,
    #[serde(default)]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStateData {
    state: String,
    avg_px: Option<String>,
}

/// Convert `BTCUSDT` into OKX's hyphenated `BTC-USDT` instrument id.
fn to_inst_id(symbol: &str) -> String {
    for quote in ["USDT", "USDC", "BTC", "ETH"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}-{quote}");
            }
        }
    }
    symbol.to_string()
}

pub struct OkxAdapter {
    client: Client,
    api_key: String,
    api_secret: String,
    passphrase: String,
    sandbox: bool,
    call_lock: Mutex<()>,
}

impl OkxAdapter {
    pub fn new(credentials: PlatformCredentials, sandbox: bool) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key: credentials.api_key,
            api_secret: credentials.secret_key,
            passphrase: credentials.passphrase.unwrap_or_default(),
            sandbox,
            call_lock: Mutex::new(()),
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn classify(code: &str, msg: String) -> AdapterError {
        match code {
            "50111" | "50113" | "50114" => AdapterError::Auth(msg),
            "50011" | "50013" => AdapterError::RateLimit(msg),
            "51008" | "59200" => AdapterError::InsufficientFunds(msg),
            "51000" => AdapterError::MarketClosed(msg),
            _ => AdapterError::Unknown(msg),
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<T>, AdapterError> {
        let _guard = self.call_lock.lock().await;
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_text);

        let mut request = self
            .client
            .request(method, format!("{BASE_URL}{path}"))
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if self.sandbox {
            request = request.header("x-simulated-trading", "1");
        }
        if !body_text.is_empty() {
            request = request.body(body_text);
        }

        let response = request.send().await?;
        let envelope: Envelope<T> = response.json().await?;
        if envelope.code != "0" {
            return Err(Self::classify(&envelope.code, envelope.msg));
        }
        Ok(envelope.data)
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
        let data: Vec<BalanceData> = retry_transient(MAX_ATTEMPTS, || {
            self.request(reqwest::Method::GET, "/api/v5/account/balance", None)
        })
        .await?;

        let mut out = HashMap::new();
        for account in data {
            for detail in account.details {
                let free: Decimal = detail.avail_bal.parse().unwrap_or_default();
                let locked: Decimal = detail.frozen_bal.parse().unwrap_or_default();
                if free > Decimal::ZERO || locked > Decimal::ZERO {
                    out.insert(detail.ccy, AssetBalance { free, locked });
                }
            }
        }
        Ok(out)
    }

    pub async fn ticker(&self, symbol: &str) -> Result<Quote, AdapterError> {
        let inst_id = to_inst_id(symbol);
        let url = format!("{BASE_URL}/api/v5/market/ticker?instId={inst_id}");
        let response = self.client.get(&url).send().await?;
        let envelope: Envelope<TickerData> = response.json().await?;
        if envelope.code != "0" {
            return Err(Self::classify(&envelope.code, envelope.msg));
        }
        let ticker = envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Unknown(format!("no ticker for {symbol}")))?;

        let last: f64 = ticker.last.parse().unwrap_or(0.0);
        let open: f64 = ticker.open_24h.parse().unwrap_or(0.0);
        let change = if open > 0.0 {
            (last - open) / open * 100.0
        } else {
            0.0
        };

        Ok(Quote {
            symbol: symbol.to_string(),
            price: ticker.last.parse().unwrap_or_default(),
            change_24h_pct: change,
            volume_24h: ticker.vol_ccy_24h.parse().unwrap_or(0.0),
            high_24h: ticker.high_24h.parse().unwrap_or(0.0),
            low_24h: ticker.low_24h.parse().unwrap_or(0.0),
            asset_class: AssetClass::Crypto,
            source_tag: QuoteSource::CryptoFeed,
            fetched_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub async fn place_order(&self, order: &TradeOrder) -> Result<OrderAck, AdapterError> {
        let side = match order.side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let ord_type = match order.order_type {
            OrderType::Market => "market",
            _ => "limit",
        };
        let mut body = json!({
            "instId": to_inst_id(&order.symbol),
            "tdMode": "cash",
            "side": side,
            "ordType": ord_type,
            "sz": order.quantity.to_string(),
        });
        if let Some(price) = order.limit_price {
            body["px"] = json!(price.to_string());
        }

        let data: Vec<OrderData> = self
            .request(reqwest::Method::POST, "/api/v5/trade/order", Some(body))
            .await?;
        let ack = data
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Unknown("empty order response".to_string()))?;

        if !ack.s_code.is_empty() && ack.s_code != "0" {
            return Err(Self::classify(&ack.s_code, ack.s_msg));
        }

        debug!(order_id = %ack.ord_id, "okx order placed");
        Ok(OrderAck {
            exchange_order_id: ack.ord_id,
            fill_price: None,
            status: OrderAckStatus::Accepted,
        })
    }

    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), AdapterError> {
        let body = json!({
            "instId": to_inst_id(symbol),
            "ordId": order_id,
        });
        let _: Vec<serde_json::Value> = self
            .request(
                reqwest::Method::POST,
                "/api/v5/trade/cancel-order",
                Some(body),
            )
            .await?;
        Ok(())
    }

    pub async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderAckStatus, AdapterError> {
        let path = format!(
            "/api/v5/trade/order?instId={}&ordId={}",
            to_inst_id(symbol),
            order_id
        );
        let data: Vec<OrderStateData> =
            self.request(reqwest::Method::GET, &path, None).await?;
        let entry = data
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Unknown(format!("order {order_id} not found")))?;
        let _ = entry.avg_px;
        Ok(match entry.state.as_str() {
            "filled" => OrderAckStatus::Filled,
            "canceled" | "mmp_canceled" => OrderAckStatus::Rejected,
            _ => OrderAckStatus::Accepted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inst_id_conversion() {
        assert_eq!(to_inst_id("BTCUSDT"), "BTC-USDT");
        assert_eq!(to_inst_id("ETHUSDC"), "ETH-USDC");
        assert_eq!(to_inst_id("WEIRD"), "WEIRD");
    }

    #[test]
    fn test_signature_is_base64() {
        let adapter = OkxAdapter::new(
            PlatformCredentials {
                api_key: "key".to_string(),
                secret_key: "secret".to_string(),
                passphrase: Some("phrase".to_string()),
            },
            true,
        );
        let sig = adapter.sign("2024-01-01T00:00:00.000Z", "GET", "/api/v5/account/balance", "");
        assert!(BASE64.decode(&sig).is_ok());
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            OkxAdapter::classify("50111", "invalid key".into()),
            AdapterError::Auth(_)
        ));
        assert!(matches!(
            OkxAdapter::classify("51008", "insufficient".into()),
            AdapterError::InsufficientFunds(_)
        ));
    }
}
