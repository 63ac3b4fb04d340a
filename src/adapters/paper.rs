//! Paper trading adapter.
//!
//! In-memory execution against aggregator quotes: market orders fill at the
//! marked price with zero slippage, limit and stop orders queue and fill
//! against subsequent quote updates. Fills for queued orders surface on a
//! broadcast channel the trade router listens to.

use super::{AdapterError, AssetBalance, OrderAck, OrderAckStatus, TestReport};
use crate::services::MarketDataAggregator;
use crate::types::{OrderSide, OrderType, Quote, TradeOrder};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Virtual settlement balance reported by `balances()`.
const VIRTUAL_QUOTE_BALANCE: Decimal = dec!(1000000);

/// A queued order that filled against a later quote update.
#[derive(Debug, Clone)]
pub struct PaperFill {
    pub owner_id: String,
    pub order: TradeOrder,
    pub price: Decimal,
    pub mark: Quote,
}

#[derive(Debug, Clone)]
struct QueuedOrder {
    id: String,
    owner_id: String,
    order: TradeOrder,
}

/// Clones share the queue and fill channel, so one logical simulator can
/// back many adapter handles.
#[derive(Clone)]
pub struct PaperAdapter {
    market: Arc<MarketDataAggregator>,
    queued: Arc<DashMap<String, QueuedOrder>>,
    fill_tx: broadcast::Sender<PaperFill>,
}

impl PaperAdapter {
    pub fn new(market: Arc<MarketDataAggregator>) -> Self {
        let (fill_tx, _) = broadcast::channel(256);
        Self {
            market,
            queued: Arc::new(DashMap::new()),
            fill_tx,
        }
    }

    /// Subscribe to fills of queued orders.
    pub fn subscribe_fills(&self) -> broadcast::Receiver<PaperFill> {
        self.fill_tx.subscribe()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
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
        let mut out = HashMap::new();
        out.insert(
            "USDT".to_string(),
            AssetBalance {
                free: VIRTUAL_QUOTE_BALANCE,
                locked: Decimal::ZERO,
            },
        );
        Ok(out)
    }

    pub async fn ticker(&self, symbol: &str) -> Result<Quote, AdapterError> {
        self.market
            .quote(symbol)
            .await
            .map_err(|e| AdapterError::Unknown(e.to_string()))
    }

    pub async fn place_order(
        &self,
        owner_id: &str,
        order: &TradeOrder,
        mark: &Quote,
    ) -> Result<OrderAck, AdapterError> {
        let id = format!("paper-{}", uuid::Uuid::new_v4());

        match order.order_type {
            // Market orders fill at the marked price with zero slippage.
            OrderType::Market => Ok(OrderAck {
                exchange_order_id: id,
                fill_price: Some(mark.price),
                status: OrderAckStatus::Filled,
            }),
            OrderType::Limit => {
                let limit = order
                    .limit_price
                    .ok_or_else(|| AdapterError::Unknown("limit order without price".into()))?;
                let marketable = match order.side {
                    OrderSide::Buy => mark.price <= limit,
                    OrderSide::Sell => mark.price >= limit,
                };
                if marketable {
                    return Ok(OrderAck {
                        exchange_order_id: id,
                        fill_price: Some(mark.price),
                        status: OrderAckStatus::Filled,
                    });
                }
                self.enqueue(id.clone(), owner_id, order);
                Ok(OrderAck {
                    exchange_order_id: id,
                    fill_price: None,
                    status: OrderAckStatus::Accepted,
                })
            }
            OrderType::StopLoss | OrderType::TakeProfit => {
                if order.stop_price.is_none() {
                    return Err(AdapterError::Unknown("stop order without price".into()));
                }
                self.enqueue(id.clone(), owner_id, order);
                Ok(OrderAck {
                    exchange_order_id: id,
                    fill_price: None,
                    status: OrderAckStatus::Accepted,
                })
            }
        }
    }

    pub async fn cancel(&self, order_id: &str) -> Result<(), AdapterError> {
        match self.queued.remove(order_id) {
            Some(_) => {
                debug!(order_id, "paper order cancelled");
                Ok(())
            }
            None => Err(AdapterError::Unknown(format!(
                "order {order_id} not found or already filled"
            ))),
        }
    }

    pub async fn order_status(&self, order_id: &str) -> Result<OrderAckStatus, AdapterError> {
        if self.queued.contains_key(order_id) {
            Ok(OrderAckStatus::Accepted)
        } else {
            Ok(OrderAckStatus::Filled)
        }
    }

    fn enqueue(&self, id: String, owner_id: &str, order: &TradeOrder) {
        debug!(%id, symbol = %order.symbol, "paper order queued");
        self.queued.insert(
            id.clone(),
            QueuedOrder {
                id,
                owner_id: owner_id.to_string(),
                order: order.clone(),
            },
        );
    }

    /// Evaluate queued orders against a quote update; crossed orders fill
    /// and publish on the fill channel.
    pub fn on_tick(&self, quote: &Quote) {
        let crossed: Vec<QueuedOrder> = self
            .queued
            .iter()
            .filter(|entry| {
                let queued = entry.value();
                queued.order.symbol == quote.symbol && Self::crosses(&queued.order, quote.price)
            })
            .map(|entry| entry.value().clone())
            .collect();

        for queued in crossed {
            if self.queued.remove(&queued.id).is_none() {
                continue;
            }
            let price = Self::fill_price(&queued.order, quote.price);
            info!(
                order_id = %queued.id,
                symbol = %queued.order.symbol,
                %price,
                "queued paper order filled"
            );
            let _ = self.fill_tx.send(PaperFill {
                owner_id: queued.owner_id,
                order: queued.order,
                price,
                mark: quote.clone(),
            });
        }
    }

    /// Drive `on_tick` from the aggregator's publish stream.
    pub fn run(&self) -> tokio::task::JoinHandle<()> {
        let adapter = self.clone();
        let mut ticks = adapter.market.subscribe();
        tokio::spawn(async move {
            while let Ok(quote) = ticks.recv().await {
                adapter.on_tick(&quote);
            }
        })
    }

    fn crosses(order: &TradeOrder, price: Decimal) -> bool {
        match order.order_type {
            OrderType::Limit => {
                let Some(limit) = order.limit_price else {
                    return false;
                };
                match order.side {
                    OrderSide::Buy => price <= limit,
                    OrderSide::Sell => price >= limit,
                }
            }
            OrderType::StopLoss => {
                let Some(stop) = order.stop_price else {
                    return false;
                };
                match order.side {
                    OrderSide::Sell => price <= stop,
                    OrderSide::Buy => price >= stop,
                }
            }
            OrderType::TakeProfit => {
                let Some(stop) = order.stop_price else {
                    return false;
                };
                match order.side {
                    OrderSide::Sell => price >= stop,
                    OrderSide::Buy => price <= stop,
                }
            }
            OrderType::Market => true,
        }
    }

    fn fill_price(order: &TradeOrder, mark: Decimal) -> Decimal {
        match order.order_type {
            // Resting limit orders fill at their limit price.
            OrderType::Limit => order.limit_price.unwrap_or(mark),
            _ => mark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::BreakerRegistry;
    use crate::types::{AssetClass, QuoteSource};
    use std::time::Duration;

    fn adapter() -> PaperAdapter {
        let market =
            MarketDataAggregator::synthetic_only(BreakerRegistry::new(), Duration::from_secs(30));
        PaperAdapter::new(market)
    }

    fn order(order_type: OrderType, side: OrderSide) -> TradeOrder {
        TradeOrder {
            symbol: "BTCUSDT".to_string(),
            side,
            order_type,
            quantity: dec!(0.01),
            limit_price: None,
            stop_price: None,
            stop_loss: None,
            take_profit: None,
            platform_id: None,
        }
    }

    fn mark(price: Decimal) -> Quote {
        Quote {
            symbol: "BTCUSDT".to_string(),
            price,
            change_24h_pct: 0.0,
            volume_24h: 0.0,
            high_24h: 0.0,
            low_24h: 0.0,
            asset_class: AssetClass::Crypto,
            source_tag: QuoteSource::Synthetic,
            fetched_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_at_mark_zero_slippage() {
        let paper = adapter();
        let ack = paper
            .place_order("u1", &order(OrderType::Market, OrderSide::Buy), &mark(dec!(60000)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderAckStatus::Filled);
        assert_eq!(ack.fill_price, Some(dec!(60000)));
    }

    #[tokio::test]
    async fn test_nonmarketable_limit_queues_then_fills_on_tick() {
        let paper = adapter();
        let mut fills = paper.subscribe_fills();

        let mut buy = order(OrderType::Limit, OrderSide::Buy);
        buy.limit_price = Some(dec!(59000));
        let ack = paper
            .place_order("u1", &buy, &mark(dec!(60000)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderAckStatus::Accepted);
        assert_eq!(paper.queued_count(), 1);

        // Price is still above the limit: nothing fills.
        paper.on_tick(&mark(dec!(59500)));
        assert_eq!(paper.queued_count(), 1);

        // Crossed: fills at the limit price.
        paper.on_tick(&mark(dec!(58900)));
        assert_eq!(paper.queued_count(), 0);
        let fill = fills.recv().await.unwrap();
        assert_eq!(fill.price, dec!(59000));
        assert_eq!(fill.owner_id, "u1");
    }

    #[tokio::test]
    async fn test_marketable_limit_fills_immediately() {
        let paper = adapter();
        let mut buy = order(OrderType::Limit, OrderSide::Buy);
        buy.limit_price = Some(dec!(61000));
        let ack = paper
            .place_order("u1", &buy, &mark(dec!(60000)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderAckStatus::Filled);
        assert_eq!(ack.fill_price, Some(dec!(60000)));
    }

    #[tokio::test]
    async fn test_stop_loss_triggers_below_stop() {
        let paper = adapter();
        let mut fills = paper.subscribe_fills();

        let mut stop = order(OrderType::StopLoss, OrderSide::Sell);
        stop.stop_price = Some(dec!(58000));
        paper
            .place_order("u1", &stop, &mark(dec!(60000)))
            .await
            .unwrap();

        paper.on_tick(&mark(dec!(59000)));
        assert_eq!(paper.queued_count(), 1);

        paper.on_tick(&mark(dec!(57900)));
        let fill = fills.recv().await.unwrap();
        assert_eq!(fill.price, dec!(57900));
    }

    #[tokio::test]
    async fn test_cancel_queued_order() {
        let paper = adapter();
        let mut buy = order(OrderType::Limit, OrderSide::Buy);
        buy.limit_price = Some(dec!(1));
        let ack = paper
            .place_order("u1", &buy, &mark(dec!(60000)))
            .await
            .unwrap();

        assert!(paper.cancel(&ack.exchange_order_id).await.is_ok());
        assert_eq!(paper.queued_count(), 0);
        assert!(paper.cancel(&ack.exchange_order_id).await.is_err());
    }
}
