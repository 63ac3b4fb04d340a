//! Trade router: the gated submission pipeline.
//!
//! Per user submission flow:
//! lock → risk verdict → breaker gates → fresh quote → adapter →
//! portfolio mutation → trade record → notification + stream event.
//! Operating mode decides whether an order reaches an adapter at all, and
//! the kill-switch sweeps open positions oldest first.

use crate::adapters::{ExchangeAdapter, OrderAckStatus, PaperAdapter};
use crate::error::{AppError, Result};
use crate::services::{
    ApprovalQueue, BreakerRegistry, KillSwitch, KillSwitchReason, MarketDataAggregator, Notifier,
    PortfolioLedger, RiskEngine, RiskVerdict, SqliteStore, Vault,
};
use crate::types::{
    ExecutionKind, NotificationKind, NotificationPriority, OrderOrigin, OrderSide, Platform,
    PlatformCredentials, PlatformStatus, PlatformTestResult, Quote, Trade, TradeOrder,
    TradeOutcome, TradeStatus, TradingMode, User,
};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const EXCHANGE_API_BREAKER: &str = "exchange_api";
const TRADE_EXECUTION_BREAKER: &str = "trade_execution";

pub struct TradeRouter {
    store: Arc<SqliteStore>,
    market: Arc<MarketDataAggregator>,
    portfolios: Arc<PortfolioLedger>,
    breakers: Arc<BreakerRegistry>,
    risk: RiskEngine,
    approvals: Arc<ApprovalQueue>,
    kill_switch: Arc<KillSwitch>,
    notifier: Arc<Notifier>,
    rooms: Arc<crate::websocket::RoomManager>,
    vault: Arc<Vault>,
    paper: PaperAdapter,
    /// Cached adapters per platform; credentials decrypt once per
    /// connection, not per order.
    adapters: DashMap<String, Arc<ExchangeAdapter>>,
    /// No two orders for the same user proceed concurrently.
    submission_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Maximum quote age accepted while submitting.
    quote_max_age: Duration,
    /// Self-reference for detached tasks (fills, sweeps).
    me: Weak<TradeRouter>,
}

#[allow(clippy::too_many_arguments)]
impl TradeRouter {
    pub fn new(
        store: Arc<SqliteStore>,
        market: Arc<MarketDataAggregator>,
        portfolios: Arc<PortfolioLedger>,
        breakers: Arc<BreakerRegistry>,
        risk: RiskEngine,
        approvals: Arc<ApprovalQueue>,
        kill_switch: Arc<KillSwitch>,
        notifier: Arc<Notifier>,
        rooms: Arc<crate::websocket::RoomManager>,
        vault: Arc<Vault>,
        quote_max_age: Duration,
    ) -> Arc<Self> {
        let paper = PaperAdapter::new(market.clone());
        Arc::new_cyclic(|me| Self {
            store,
            market,
            portfolios,
            breakers,
            risk,
            approvals,
            kill_switch,
            notifier,
            rooms,
            vault,
            paper,
            adapters: DashMap::new(),
            submission_locks: DashMap::new(),
            quote_max_age,
            me: me.clone(),
        })
    }

    /// Start the background loops: queued paper fills become trade records,
    /// and the approval queue sweeps expired entries.
    pub fn spawn_background_tasks(&self) {
        self.paper.run();

        let Some(router) = self.me.upgrade() else {
            return;
        };
        let mut fills = router.paper.subscribe_fills();
        tokio::spawn(async move {
            while let Ok(fill) = fills.recv().await {
                let result = router
                    .record_execution(
                        &fill.owner_id,
                        &fill.order,
                        None,
                        ExecutionKind::Paper,
                        fill.price,
                        &fill.mark,
                        None,
                    )
                    .await;
                if let Err(e) = result {
                    warn!(owner = %fill.owner_id, error = %e, "queued paper fill not recorded");
                }
            }
        });

        let approvals = self.approvals.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                let expired = approvals.sweep_expired();
                if expired > 0 {
                    info!(expired, "expired pending approvals cancelled");
                }
            }
        });
    }

    // ========== Submission ==========

    /// Route a proposed order according to the user's operating mode.
    pub async fn submit(
        &self,
        user: &User,
        order: TradeOrder,
        origin: OrderOrigin,
        idempotency_key: Option<String>,
    ) -> Result<TradeOutcome> {
        order.validate().map_err(AppError::Validation)?;

        // Idempotent replay returns the original trade, no second
        // submission.
        if let Some(ref key) = idempotency_key {
            if let Some(trade_id) = self.store.get_idempotent_trade(&user.id, key) {
                let trade = self
                    .store
                    .get_trade(&trade_id)
                    .ok_or_else(|| AppError::Internal("idempotency points nowhere".into()))?;
                return Ok(TradeOutcome::Executed { trade });
            }
        }

        self.check_kill_switch(&user.id)?;

        match user.trading_mode {
            TradingMode::LearningOnly => {
                // Record and score the proposal without ever submitting it.
                let verdict = match self.market.quote(&order.symbol).await {
                    Ok(quote) => {
                        let portfolio = self.portfolios.snapshot(&user.id).await;
                        let assessment = self.risk.evaluate(&order, &portfolio, &quote, Decimal::ZERO);
                        format!("{:?}", assessment.verdict)
                    }
                    Err(_) => "unscored".to_string(),
                };
                let _ = self.store.append_audit(
                    "learning_order",
                    Some(&user.id),
                    &format!(
                        "{} {} {} recorded, not submitted (risk: {verdict})",
                        order.side, order.quantity, order.symbol
                    ),
                );
                info!(user_id = %user.id, symbol = %order.symbol, "learning mode: order recorded only");
                return Ok(TradeOutcome::Recorded {
                    reason: "learning_mode_no_execution".to_string(),
                });
            }
            TradingMode::Assisted if origin == OrderOrigin::Automated => {
                let approval = self.approvals.enqueue(&user.id, order);
                self.notifier.notify(
                    &user.id,
                    NotificationKind::Recommendation,
                    "trade approval required",
                    &format!(
                        "{} {} {} awaits your approval",
                        approval.order.side, approval.order.quantity, approval.order.symbol
                    ),
                    NotificationPriority::Medium,
                );
                return Ok(TradeOutcome::PendingApproval {
                    approval_id: approval.id,
                    expires_at: approval.expires_at,
                });
            }
            _ => {}
        }

        self.execute_detached(user.id.clone(), order, idempotency_key)
            .await
    }

    /// Approve a parked Assisted-mode order and submit it.
    pub async fn approve(&self, user: &User, approval_id: &str) -> Result<TradeOutcome> {
        let order = self.approvals.approve(approval_id, &user.id)?;
        self.check_kill_switch(&user.id)?;
        self.execute_detached(user.id.clone(), order, None).await
    }

    /// Run the gated pipeline on a detached task so a client disconnect
    /// cannot abandon an in-flight adapter call; the trade, if any, is
    /// still recorded.
    async fn execute_detached(
        &self,
        user_id: String,
        order: TradeOrder,
        idempotency_key: Option<String>,
    ) -> Result<TradeOutcome> {
        let Some(router) = self.me.upgrade() else {
            return self.execute_order(&user_id, order, idempotency_key).await;
        };
        let handle =
            tokio::spawn(async move { router.execute_order(&user_id, order, idempotency_key).await });
        handle
            .await
            .map_err(|e| AppError::Internal(format!("submission task failed: {e}")))?
    }

    fn check_kill_switch(&self, user_id: &str) -> Result<()> {
        if self.kill_switch.is_global_active() {
            return Err(AppError::RiskDenied {
                reason: "kill_switch_active".to_string(),
                detail: Some("global trading freeze".to_string()),
            });
        }
        if let Some(record) = self.kill_switch.user_record(user_id) {
            let detail = match record.reason {
                KillSwitchReason::DailyDrawdownExceeded => {
                    "kill-switch active until the next trading day"
                }
                _ => "kill-switch active until released",
            };
            return Err(AppError::RiskDenied {
                reason: record.reason.as_str().to_string(),
                detail: Some(detail.to_string()),
            });
        }
        Ok(())
    }

    /// The gated submission pipeline proper. Assumes mode gating already
    /// happened.
    async fn execute_order(
        &self,
        user_id: &str,
        mut order: TradeOrder,
        idempotency_key: Option<String>,
    ) -> Result<TradeOutcome> {
        // a. Per-user submission lock.
        let lock = self.submission_lock(user_id);
        let _guard = lock.lock().await;

        self.check_kill_switch(user_id)?;

        // d (pulled forward for risk inputs): current quote, hard freshness
        // bound. Stale data while ordering trips the source breaker.
        let quote = self
            .market
            .quote_with_max_age(&order.symbol, self.quote_max_age)
            .await?;
        let now = chrono::Utc::now().timestamp_millis();
        if quote.age_millis(now) > self.quote_max_age.as_millis() as i64 {
            self.market.trip_source(quote.source_tag);
            return Err(AppError::Upstream(format!(
                "market data for {} is stale",
                order.symbol
            )));
        }

        // b. Risk verdict on a portfolio snapshot marked to market.
        let portfolio = self.portfolios.snapshot(user_id).await;
        let marks = self.cached_marks(&portfolio);
        let unrealized = PortfolioLedger::unrealized_pnl(&portfolio, &marks);
        let assessment = self.risk.evaluate(&order, &portfolio, &quote, unrealized);
        match assessment.verdict {
            RiskVerdict::Deny { reason } => {
                let _ = self.store.append_audit(
                    "risk_denied",
                    Some(user_id),
                    &format!("{} {}: {}", order.side, order.symbol, reason.as_str()),
                );
                if reason.is_hard_stop() {
                    self.fire_kill_switch(user_id, KillSwitchReason::DailyDrawdownExceeded);
                }
                return Err(AppError::RiskDenied {
                    reason: reason.as_str().to_string(),
                    detail: assessment
                        .advised_quantity
                        .map(|q| format!("advised maximum quantity: {q}")),
                });
            }
            RiskVerdict::Reduce { quantity } => {
                info!(user_id, %quantity, "risk engine reduced order quantity");
                order.quantity = quantity;
            }
            RiskVerdict::Allow => {}
        }

        // Platform choice: default-marked connected live platform, else the
        // most recently tested one; otherwise paper.
        let platform = self.select_platform(user_id, order.platform_id.as_deref())?;
        let execution_kind = match platform {
            Some(ref p) if p.kind.is_live() => ExecutionKind::Live,
            _ => ExecutionKind::Paper,
        };

        // The adapter is constructed (credentials decrypted) before the
        // breaker gates so that every reserved probe is guaranteed to reach
        // an adapter call that resolves it.
        let adapter = match platform {
            Some(ref p) => self.adapter_for(p)?,
            None => Arc::new(ExchangeAdapter::Paper(self.paper.clone())),
        };

        // c. Breaker gates for the chosen route, acquired as one unit: if a
        // later breaker rejects, probes already reserved on earlier ones are
        // handed back so a half-open breaker cannot get stuck at its probe
        // limit without an adapter call ever resolving it.
        let mut acquired: Vec<&str> = Vec::new();
        for breaker in [EXCHANGE_API_BREAKER, TRADE_EXECUTION_BREAKER] {
            match self.breakers.try_acquire(breaker) {
                Ok(()) => acquired.push(breaker),
                Err(rejected) => {
                    for held in acquired {
                        self.breakers.release_probe(held);
                    }
                    return Err(AppError::BreakerOpen {
                        resource: rejected.resource,
                        retry_after_secs: rejected.retry_after_secs,
                    });
                }
            }
        }

        // e. Adapter call; failures feed both breakers.
        let ack = match adapter.place_order(user_id, &order, &quote).await {
            Ok(ack) => {
                self.breakers.record_success(EXCHANGE_API_BREAKER);
                self.breakers.record_success(TRADE_EXECUTION_BREAKER);
                ack
            }
            Err(e) => {
                self.breakers.record_failure(EXCHANGE_API_BREAKER);
                self.breakers.record_failure(TRADE_EXECUTION_BREAKER);
                warn!(user_id, symbol = %order.symbol, error = %e, "adapter rejected order");
                return Err(e.into());
            }
        };

        match ack.status {
            OrderAckStatus::Rejected => Err(AppError::Upstream(format!(
                "exchange rejected order {}",
                ack.exchange_order_id
            ))),
            OrderAckStatus::Accepted if ack.fill_price.is_none() => {
                // Resting order: queued paper orders fill via the tick loop;
                // live market orders fill at the marked price.
                if execution_kind == ExecutionKind::Live
                    && order.order_type == crate::types::OrderType::Market
                {
                    let trade = self
                        .record_execution(
                            user_id,
                            &order,
                            platform.as_ref(),
                            execution_kind,
                            quote.price,
                            &quote,
                            idempotency_key,
                        )
                        .await?;
                    return Ok(TradeOutcome::Executed { trade });
                }
                let _ = self.store.append_audit(
                    "order_resting",
                    Some(user_id),
                    &format!("{} resting as {}", order.symbol, ack.exchange_order_id),
                );
                Ok(TradeOutcome::Resting {
                    exchange_order_id: ack.exchange_order_id,
                    symbol: order.symbol.clone(),
                })
            }
            _ => {
                let fill_price = ack.fill_price.unwrap_or(quote.price);
                let trade = self
                    .record_execution(
                        user_id,
                        &order,
                        platform.as_ref(),
                        execution_kind,
                        fill_price,
                        &quote,
                        idempotency_key,
                    )
                    .await?;
                Ok(TradeOutcome::Executed { trade })
            }
        }
    }

    /// f + g: mutate the portfolio, write the trade record, notify and
    /// stream.
    async fn record_execution(
        &self,
        user_id: &str,
        order: &TradeOrder,
        platform: Option<&Platform>,
        execution_kind: ExecutionKind,
        fill_price: Decimal,
        mark: &Quote,
        idempotency_key: Option<String>,
    ) -> Result<Trade> {
        let trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            platform_id: platform.map(|p| p.id.clone()),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            entry_price: fill_price,
            exit_price: None,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            status: TradeStatus::Open,
            pnl: Decimal::ZERO,
            execution_kind,
            market_price_at_execution: mark.price,
            created_at: chrono::Utc::now().timestamp_millis(),
            closed_at: None,
        };

        self.portfolios.apply_open(&trade).await?;
        self.store.create_trade(&trade)?;
        if let Some(key) = idempotency_key {
            self.store.put_idempotency_key(user_id, &key, &trade.id)?;
        }

        self.rooms.publish_trade(user_id, &trade);
        self.notifier.notify(
            user_id,
            NotificationKind::TradeExecuted,
            "trade executed",
            &format!(
                "{} {} {} @ {} ({})",
                trade.side, trade.quantity, trade.symbol, trade.entry_price, trade.execution_kind
            ),
            NotificationPriority::Medium,
        );
        info!(
            user_id,
            trade_id = %trade.id,
            symbol = %trade.symbol,
            kind = %trade.execution_kind,
            "trade recorded"
        );
        Ok(trade)
    }

    // ========== Close path ==========

    pub async fn close_trade(&self, user: &User, trade_id: &str) -> Result<Trade> {
        let lock = self.submission_lock(&user.id);
        let _guard = lock.lock().await;
        self.close_trade_locked(&user.id, trade_id).await
    }

    /// Close a single trade; the caller holds the user's submission lock.
    async fn close_trade_locked(&self, user_id: &str, trade_id: &str) -> Result<Trade> {
        let mut trade = self
            .store
            .get_trade(trade_id)
            .ok_or_else(|| AppError::NotFound(format!("trade {trade_id}")))?;
        if trade.user_id != user_id {
            return Err(AppError::Forbidden("not your trade".to_string()));
        }
        if !trade.is_open() {
            return Err(AppError::Conflict(format!(
                "trade {trade_id} is {}",
                trade.status
            )));
        }

        let quote = self
            .market
            .quote_with_max_age(&trade.symbol, self.quote_max_age)
            .await?;

        let close_order = TradeOrder {
            symbol: trade.symbol.clone(),
            side: trade.side.opposite(),
            order_type: crate::types::OrderType::Market,
            quantity: trade.quantity,
            limit_price: None,
            stop_price: None,
            stop_loss: None,
            take_profit: None,
            platform_id: trade.platform_id.clone(),
        };

        let adapter = match trade.platform_id {
            Some(ref platform_id) => {
                let platform = self
                    .store
                    .get_platform(platform_id)
                    .ok_or_else(|| AppError::NotFound(format!("platform {platform_id}")))?;
                self.adapter_for(&platform)?
            }
            None => Arc::new(ExchangeAdapter::Paper(self.paper.clone())),
        };

        let exit_price = match adapter.place_order(user_id, &close_order, &quote).await {
            Ok(ack) => {
                self.breakers.record_success(EXCHANGE_API_BREAKER);
                self.breakers.record_success(TRADE_EXECUTION_BREAKER);
                ack.fill_price.unwrap_or(quote.price)
            }
            Err(e) => {
                self.breakers.record_failure(EXCHANGE_API_BREAKER);
                self.breakers.record_failure(TRADE_EXECUTION_BREAKER);
                return Err(e.into());
            }
        };

        let direction = match trade.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        };
        let pnl = (exit_price - trade.entry_price) * trade.quantity * direction;

        trade.exit_price = Some(exit_price);
        trade.status = TradeStatus::Closed;
        trade.pnl = pnl;
        trade.closed_at = Some(chrono::Utc::now().timestamp_millis());
        self.store.update_trade(&trade)?;
        self.portfolios.apply_close(&trade, pnl).await?;

        self.rooms.publish_trade(user_id, &trade);
        self.notifier.notify(
            user_id,
            NotificationKind::TradeExecuted,
            "position closed",
            &format!("{} closed @ {} (pnl {})", trade.symbol, exit_price, pnl),
            NotificationPriority::Medium,
        );
        info!(user_id, trade_id = %trade.id, %pnl, "trade closed");
        Ok(trade)
    }

    /// Kill-switch sweep: close every open trade oldest first. Failures are
    /// recorded but never abort the sweep.
    pub async fn close_all(&self, user_id: &str, reason: &str) -> usize {
        let lock = self.submission_lock(user_id);
        let _guard = lock.lock().await;

        let open = self.store.open_trades(user_id);
        let total = open.len();
        let mut closed = 0usize;
        for trade in open {
            match self.close_trade_locked(user_id, &trade.id).await {
                Ok(_) => closed += 1,
                Err(e) => {
                    error!(user_id, trade_id = %trade.id, error = %e, "mass-close failed for trade");
                    let _ = self.store.append_audit(
                        "kill_switch_close_failed",
                        Some(user_id),
                        &format!("trade {}: {e}", trade.id),
                    );
                }
            }
        }
        let _ = self.store.append_audit(
            "kill_switch_sweep",
            Some(user_id),
            &format!("{closed}/{total} positions closed ({reason})"),
        );
        closed
    }

    fn fire_kill_switch(&self, user_id: &str, reason: KillSwitchReason) {
        if !self.kill_switch.activate_user(user_id, reason, "risk_engine") {
            return;
        }
        let Some(router) = self.me.upgrade() else {
            return;
        };
        let user_id = user_id.to_string();
        // The sweep runs after the current submission releases the lock.
        tokio::spawn(async move {
            router.close_all(&user_id, reason.as_str()).await;
        });
    }

    // ========== Platform plumbing ==========

    /// Pick the platform the order will route through. An explicit platform
    /// must belong to the user; otherwise the default-marked connected live
    /// platform wins, then the most recently tested one, then paper.
    fn select_platform(
        &self,
        user_id: &str,
        requested: Option<&str>,
    ) -> Result<Option<Platform>> {
        if let Some(platform_id) = requested {
            let platform = self
                .store
                .get_platform(platform_id)
                .ok_or_else(|| AppError::NotFound(format!("platform {platform_id}")))?;
            if platform.user_id != user_id {
                return Err(AppError::Forbidden("not your platform".to_string()));
            }
            if !platform.kind.is_live() {
                return Ok(None);
            }
            if platform.status != PlatformStatus::Connected {
                return Err(AppError::Conflict(format!(
                    "platform {platform_id} is {}",
                    platform.status.as_str()
                )));
            }
            return Ok(Some(platform));
        }

        let mut live: Vec<Platform> = self
            .store
            .list_platforms(user_id)
            .into_iter()
            .filter(|p| p.kind.is_live() && p.status == PlatformStatus::Connected)
            .collect();
        if live.is_empty() {
            return Ok(None);
        }
        if let Some(pos) = live.iter().position(|p| p.is_default) {
            return Ok(Some(live.swap_remove(pos)));
        }
        live.sort_by_key(|p| p.last_tested_at.unwrap_or(0));
        Ok(live.pop())
    }

    /// Adapter for a platform, decrypting credentials on first use only.
    /// Plaintext never leaves the adapter instance.
    fn adapter_for(&self, platform: &Platform) -> Result<Arc<ExchangeAdapter>> {
        if let Some(adapter) = self.adapters.get(&platform.id) {
            return Ok(adapter.clone());
        }

        let credentials = PlatformCredentials {
            api_key: self
                .vault
                .decrypt(&platform.api_key_enc)
                .map_err(|_| AppError::Vault)?,
            secret_key: self
                .vault
                .decrypt(&platform.secret_key_enc)
                .map_err(|_| AppError::Vault)?,
            passphrase: match platform.passphrase_enc {
                Some(ref enc) => Some(self.vault.decrypt(enc).map_err(|_| AppError::Vault)?),
                None => None,
            },
        };
        let adapter = Arc::new(ExchangeAdapter::from_platform(
            platform,
            credentials,
            self.market.clone(),
        ));
        self.adapters.insert(platform.id.clone(), adapter.clone());
        Ok(adapter)
    }

    /// Authenticated connectivity test; updates status and last_tested_at.
    pub async fn test_platform(&self, user_id: &str, platform_id: &str) -> Result<PlatformTestResult> {
        let platform = self
            .store
            .get_platform(platform_id)
            .ok_or_else(|| AppError::NotFound(format!("platform {platform_id}")))?;
        if platform.user_id != user_id {
            return Err(AppError::Forbidden("not your platform".to_string()));
        }

        let adapter = self.adapter_for(&platform)?;
        let now = chrono::Utc::now().timestamp_millis();
        match adapter.test().await {
            Ok(report) => {
                self.breakers.record_success(EXCHANGE_API_BREAKER);
                self.store.update_platform_status(
                    platform_id,
                    PlatformStatus::Connected,
                    Some(now),
                )?;
                Ok(PlatformTestResult {
                    ok: true,
                    latency_ms: report.latency_ms,
                    error: None,
                })
            }
            Err(e) => {
                self.breakers.record_failure(EXCHANGE_API_BREAKER);
                self.store
                    .update_platform_status(platform_id, PlatformStatus::Error, Some(now))?;
                Ok(PlatformTestResult {
                    ok: false,
                    latency_ms: 0,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    // ========== Helpers ==========

    pub fn paper_adapter(&self) -> &PaperAdapter {
        &self.paper
    }

    fn submission_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.submission_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Cached mark prices for every open position symbol.
    fn cached_marks(&self, portfolio: &crate::types::Portfolio) -> HashMap<String, Decimal> {
        portfolio
            .positions
            .keys()
            .filter_map(|symbol| {
                self.market
                    .cached_quote(symbol)
                    .map(|q| (symbol.clone(), q.price))
            })
            .collect()
    }
}
