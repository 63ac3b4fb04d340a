//! End-to-end tests for the trade orchestration pipeline: mode gating,
//! risk verdicts, breaker gates, paper fallback, kill-switch sweeps and
//! idempotent submission.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use tiller::services::{
    ApprovalQueue, AuthService, BreakerConfig, BreakerRegistry, BreakerState, KillSwitch,
    KillSwitchReason, MarketDataAggregator, Notifier, PortfolioLedger, RiskEngine, SqliteStore,
    TradeRouter, Vault,
};
use tiller::types::{
    ExecutionKind, OrderOrigin, OrderSide, OrderType, Portfolio, Role, TradeOrder, TradeOutcome,
    TradeStatus, TradingMode, User,
};
use tiller::websocket::RoomManager;

struct Fixture {
    store: Arc<SqliteStore>,
    router: Arc<TradeRouter>,
    approvals: Arc<ApprovalQueue>,
    kill_switch: Arc<KillSwitch>,
    portfolios: Arc<PortfolioLedger>,
    breakers: Arc<BreakerRegistry>,
    #[allow(dead_code)]
    auth: Arc<AuthService>,
}

fn fixture() -> Fixture {
    fixture_with(Duration::from_secs(300), BreakerConfig::default())
}

fn fixture_with_approval_ttl(ttl: Duration) -> Fixture {
    fixture_with(ttl, BreakerConfig::default())
}

fn fixture_with_breakers(config: BreakerConfig) -> Fixture {
    fixture_with(Duration::from_secs(300), config)
}

fn fixture_with(ttl: Duration, breaker_config: BreakerConfig) -> Fixture {
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    let rooms = RoomManager::new();
    let notifier = Notifier::new(store.clone(), rooms.clone());
    let breakers = BreakerRegistry::with_config(breaker_config);
    let market = MarketDataAggregator::synthetic_only(breakers.clone(), Duration::from_secs(30));
    let portfolios = PortfolioLedger::new(store.clone(), dec!(10000));
    let approvals = ApprovalQueue::new(ttl);
    let kill_switch = KillSwitch::new(store.clone(), notifier.clone());
    let vault = Arc::new(Vault::from_key_b64(&BASE64.encode([7u8; 32])).unwrap());
    let auth = AuthService::new(store.clone(), "0123456789abcdef0123456789abcdef".to_string());

    let router = TradeRouter::new(
        store.clone(),
        market,
        portfolios.clone(),
        breakers.clone(),
        RiskEngine::default(),
        approvals.clone(),
        kill_switch.clone(),
        notifier,
        rooms,
        vault,
        Duration::from_secs(5),
    );

    Fixture {
        store,
        router,
        approvals,
        kill_switch,
        portfolios,
        breakers,
        auth,
    }
}

fn user(fixture: &Fixture, id: &str, mode: TradingMode) -> User {
    let user = User {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        username: id.to_string(),
        password_hash: "hash".to_string(),
        role: Role::User,
        totp_secret: None,
        totp_enabled: false,
        trading_mode: mode,
        created_at: chrono::Utc::now().timestamp_millis(),
    };
    fixture.store.create_user(&user).unwrap();
    user
}

fn market_buy(qty: Decimal) -> TradeOrder {
    TradeOrder {
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Market,
        quantity: qty,
        limit_price: None,
        stop_price: None,
        stop_loss: None,
        take_profit: None,
        platform_id: None,
    }
}

// =============================================================================
// Paper fallback and execution
// =============================================================================

#[tokio::test]
async fn test_paper_fallback_when_no_live_platform() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    let outcome = fx
        .router
        .submit(&u1, market_buy(dec!(0.01)), OrderOrigin::Manual, None)
        .await
        .unwrap();

    let TradeOutcome::Executed { trade } = outcome else {
        panic!("expected executed trade");
    };
    assert_eq!(trade.execution_kind, ExecutionKind::Paper);
    // Synthetic table marks BTCUSDT at 60000.
    assert_eq!(trade.market_price_at_execution, dec!(60000));
    assert_eq!(trade.entry_price, dec!(60000));
    assert_eq!(trade.status, TradeStatus::Open);

    // available decreased by 0.01 × quote.
    let portfolio = fx.portfolios.snapshot("u1").await;
    assert_eq!(portfolio.available_balance, dec!(9400));
    assert_eq!(portfolio.invested_balance, dec!(600));
    assert!(portfolio.is_balanced());

    // Trade persisted under the user's index.
    let trades = fx.store.list_trades("u1", 10);
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].id, trade.id);
}

#[tokio::test]
async fn test_close_returns_capital() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    let outcome = fx
        .router
        .submit(&u1, market_buy(dec!(0.01)), OrderOrigin::Manual, None)
        .await
        .unwrap();
    let TradeOutcome::Executed { trade } = outcome else {
        panic!("expected executed trade");
    };

    let closed = fx.router.close_trade(&u1, &trade.id).await.unwrap();
    assert_eq!(closed.status, TradeStatus::Closed);
    // Synthetic prices are stable, so the round trip is flat.
    assert_eq!(closed.pnl, Decimal::ZERO);
    assert!(closed.exit_price.is_some());

    let portfolio = fx.portfolios.snapshot("u1").await;
    assert_eq!(portfolio.available_balance, dec!(10000));
    assert_eq!(portfolio.invested_balance, Decimal::ZERO);
    assert!(portfolio.is_balanced());

    // Closing twice conflicts.
    let err = fx.router.close_trade(&u1, &trade.id).await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

// =============================================================================
// Risk gating
// =============================================================================

#[tokio::test]
async fn test_risk_denial_above_per_trade_cap() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    // 10 BTC at 60000 is a 600000 notional against a 10000 book.
    let err = fx
        .router
        .submit(&u1, market_buy(dec!(10)), OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RISK_DENIED");
    assert!(err.to_string().contains("per_trade_exposure_exceeded"));

    // No trade written, portfolio unchanged.
    assert!(fx.store.list_trades("u1", 10).is_empty());
    let portfolio = fx.portfolios.snapshot("u1").await;
    assert_eq!(portfolio.available_balance, dec!(10000));
}

#[tokio::test]
async fn test_daily_drawdown_hard_stop_fires_kill_switch() {
    let fx = fixture();
    let u3 = user(&fx, "u3", TradingMode::Autopilot);

    // Seed the stored portfolio at -5.01% on the day before the ledger
    // first loads it.
    let mut portfolio = Portfolio::new("u3".to_string(), dec!(10000));
    portfolio.daily_pnl = dec!(-501);
    portfolio.total_pnl = dec!(-501);
    portfolio.total_balance = dec!(10000);
    fx.store.save_portfolio(&portfolio).unwrap();

    let err = fx
        .router
        .submit(&u3, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("daily_drawdown_exceeded"));
    assert!(fx.kill_switch.is_active("u3"));

    // Follow-up orders stay frozen with the same reason.
    let err = fx
        .router
        .submit(&u3, market_buy(dec!(0.0001)), OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RISK_DENIED");
    assert!(err.to_string().contains("daily_drawdown_exceeded"));

    // The freeze lasts only until the next trading day: once the day rolls
    // over it lifts on its own, no admin release required.
    assert_eq!(fx.kill_switch.roll_trading_day("2099-01-01"), 1);
    assert!(!fx.kill_switch.is_active("u3"));
}

#[tokio::test]
async fn test_kill_switch_sweep_closes_oldest_first() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    for _ in 0..2 {
        fx.router
            .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
            .await
            .unwrap();
    }
    assert_eq!(fx.store.open_trades("u1").len(), 2);

    let closed = fx.router.close_all("u1", "manual").await;
    assert_eq!(closed, 2);
    assert!(fx.store.open_trades("u1").is_empty());

    let portfolio = fx.portfolios.snapshot("u1").await;
    assert_eq!(portfolio.available_balance, dec!(10000));
}

#[tokio::test]
async fn test_global_kill_switch_blocks_submissions() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    fx.kill_switch.activate_global("admin");
    let err = fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RISK_DENIED");
    assert!(err.to_string().contains("kill_switch_active"));

    fx.kill_switch.release_global("admin");
    assert!(fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .is_ok());
}

// =============================================================================
// Circuit breakers
// =============================================================================

#[tokio::test]
async fn test_open_breaker_rejects_submission_without_adapter_call() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    // Five failures inside the window trip the exchange breaker.
    for _ in 0..5 {
        fx.breakers.record_failure("exchange_api");
    }

    let err = fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BREAKER_OPEN");
    assert!(fx.store.list_trades("u1", 10).is_empty());
}

#[tokio::test]
async fn test_half_open_probe_released_when_second_gate_rejects() {
    let fx = fixture_with_breakers(BreakerConfig {
        failure_threshold: 5,
        failure_window: Duration::from_secs(60),
        cooldown: Duration::from_millis(50),
        probe_limit: 1,
    });
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    // exchange_api opens first and becomes probe-eligible; trade_execution
    // opens later and is still inside its cooldown.
    fx.breakers.trip("exchange_api");
    tokio::time::sleep(Duration::from_millis(60)).await;
    fx.breakers.trip("trade_execution");

    // First attempt reserves a probe on exchange_api, then trade_execution
    // rejects the submission.
    let err = fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BREAKER_OPEN");
    assert!(err.to_string().contains("trade_execution"));

    // The reserved probe was handed back: a retry is rejected by
    // trade_execution again, not by a stuck half-open exchange_api.
    let err = fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("trade_execution"));

    // Once trade_execution's cooldown lapses both probes are admitted, the
    // paper adapter succeeds, and both breakers heal closed.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let outcome = fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .unwrap();
    assert!(matches!(outcome, TradeOutcome::Executed { .. }));
    assert_eq!(fx.breakers.state("exchange_api"), BreakerState::Closed);
    assert_eq!(fx.breakers.state("trade_execution"), BreakerState::Closed);
}

// =============================================================================
// Operating modes
// =============================================================================

#[tokio::test]
async fn test_learning_only_records_without_submitting() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::LearningOnly);

    let outcome = fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .unwrap();
    assert!(matches!(outcome, TradeOutcome::Recorded { .. }));
    assert!(fx.store.list_trades("u1", 10).is_empty());

    let portfolio = fx.portfolios.snapshot("u1").await;
    assert_eq!(portfolio.available_balance, dec!(10000));
}

#[tokio::test]
async fn test_assisted_mode_parks_automated_orders() {
    let fx = fixture();
    let u2 = user(&fx, "u2", TradingMode::Assisted);

    let outcome = fx
        .router
        .submit(&u2, market_buy(dec!(0.0005)), OrderOrigin::Automated, None)
        .await
        .unwrap();
    let TradeOutcome::PendingApproval { approval_id, .. } = outcome else {
        panic!("expected pending approval");
    };
    assert!(fx.store.list_trades("u2", 10).is_empty());

    // Approval executes the parked order.
    let outcome = fx.router.approve(&u2, &approval_id).await.unwrap();
    assert!(matches!(outcome, TradeOutcome::Executed { .. }));
    assert_eq!(fx.store.list_trades("u2", 10).len(), 1);
}

#[tokio::test]
async fn test_assisted_manual_orders_pass_through() {
    let fx = fixture();
    let u2 = user(&fx, "u2", TradingMode::Assisted);

    let outcome = fx
        .router
        .submit(&u2, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .unwrap();
    assert!(matches!(outcome, TradeOutcome::Executed { .. }));
}

#[tokio::test]
async fn test_assisted_ttl_expiry_cancels_before_adapter() {
    let fx = fixture_with_approval_ttl(Duration::from_millis(0));
    let u2 = user(&fx, "u2", TradingMode::Assisted);

    let outcome = fx
        .router
        .submit(&u2, market_buy(dec!(0.0005)), OrderOrigin::Automated, None)
        .await
        .unwrap();
    let TradeOutcome::PendingApproval { approval_id, .. } = outcome else {
        panic!("expected pending approval");
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(fx.approvals.sweep_expired(), 1);

    // The expired approval can never reach an adapter.
    assert!(fx.router.approve(&u2, &approval_id).await.is_err());
    assert!(fx.store.list_trades("u2", 10).is_empty());
}

// =============================================================================
// Idempotency and validation
// =============================================================================

#[tokio::test]
async fn test_idempotent_replay_returns_original_trade() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);
    let key = Some("client-key-1".to_string());

    let first = fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, key.clone())
        .await
        .unwrap();
    let TradeOutcome::Executed { trade: original } = first else {
        panic!("expected executed trade");
    };

    let replay = fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, key)
        .await
        .unwrap();
    let TradeOutcome::Executed { trade: replayed } = replay else {
        panic!("expected executed trade");
    };

    assert_eq!(original.id, replayed.id);
    assert_eq!(fx.store.list_trades("u1", 10).len(), 1);
}

#[tokio::test]
async fn test_invalid_orders_rejected_up_front() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    let err = fx
        .router
        .submit(&u1, market_buy(dec!(0)), OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    let mut limit = market_buy(dec!(0.001));
    limit.order_type = OrderType::Limit;
    let err = fx
        .router
        .submit(&u1, limit, OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_submissions_serialize_per_user() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let router = fx.router.clone();
        let user = u1.clone();
        handles.push(tokio::spawn(async move {
            router
                .submit(&user, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // All ten mutations applied in order without losing balance.
    let portfolio = fx.portfolios.snapshot("u1").await;
    assert_eq!(portfolio.invested_balance, dec!(300));
    assert_eq!(portfolio.available_balance, dec!(9700));
    assert!(portfolio.is_balanced());
    assert_eq!(fx.store.list_trades("u1", 20).len(), 10);
}

#[tokio::test]
async fn test_kill_switch_reason_for_manual_freeze() {
    let fx = fixture();
    let u1 = user(&fx, "u1", TradingMode::Autopilot);

    fx.kill_switch
        .activate_user("u1", KillSwitchReason::Manual, "admin");
    let err = fx
        .router
        .submit(&u1, market_buy(dec!(0.0005)), OrderOrigin::Manual, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("manual"));
}
