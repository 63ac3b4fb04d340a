use axum::{routing::get, Router};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiller::config::Config;
use tiller::services::{
    AiClient, AlertEngine, ApprovalQueue, AuthService, BreakerConfig, BreakerRegistry, KillSwitch,
    MarketDataAggregator, Notifier, PortfolioLedger, RiskEngine, RiskLimits, SqliteStore,
    TradeRouter, Vault,
};
use tiller::websocket::{self, RoomManager};
use tiller::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration and secrets fail fast: exit 1 on anything unrecoverable,
    // exit 2 when the database schema is ahead of this binary.
    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let vault = match Vault::from_key_b64(&config.vault_key) {
        Ok(vault) => Arc::new(vault),
        Err(e) => {
            error!("vault key rejected: {e}");
            return ExitCode::from(1);
        }
    };

    let store = match SqliteStore::new(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open database at {}: {e}", config.db_path);
            return ExitCode::from(1);
        }
    };
    if store.migrations_pending() {
        error!("database schema is newer than this binary, refusing to start");
        return ExitCode::from(2);
    }

    let rooms = RoomManager::new();
    let notifier = Notifier::new(store.clone(), rooms.clone());
    let breakers =
        BreakerRegistry::with_observers(BreakerConfig::default(), store.clone(), notifier.clone());
    let market = MarketDataAggregator::new(&config, breakers.clone());
    let portfolios = PortfolioLedger::new(store.clone(), config.seed_balance);
    let auth = AuthService::new(store.clone(), config.jwt_secret.clone());
    let approvals = ApprovalQueue::new(Duration::from_secs(config.approval_ttl_secs));
    let kill_switch = KillSwitch::new(store.clone(), notifier.clone());
    let alerts = AlertEngine::new(store.clone(), notifier.clone());
    let ai = AiClient::new(
        config.ai_provider_key.clone(),
        config.ai_provider_url.clone(),
        breakers.clone(),
    );
    if !ai.is_enabled() {
        info!("AI provider key absent, analysis endpoints run in degraded mode");
    }

    let router = TradeRouter::new(
        store.clone(),
        market.clone(),
        portfolios.clone(),
        breakers.clone(),
        RiskEngine::new(RiskLimits::default()),
        approvals.clone(),
        kill_switch.clone(),
        notifier.clone(),
        rooms.clone(),
        vault.clone(),
        Duration::from_secs(config.order_quote_max_age_secs),
    );
    router.spawn_background_tasks();

    // Fan published ticks out to price subscribers and the alert engine.
    {
        let rooms = rooms.clone();
        let alerts = alerts.clone();
        let mut ticks = market.subscribe();
        tokio::spawn(async move {
            while let Ok(quote) = ticks.recv().await {
                rooms.publish_price(&quote);
                alerts.on_tick(&quote);
            }
        });
    }

    // Keep hot symbols fresh: everything someone subscribed to plus
    // everything already cached.
    {
        let market = market.clone();
        let rooms = rooms.clone();
        let interval = Duration::from_secs(config.freshness_secs.max(2) / 2);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let mut symbols = rooms.active_price_symbols();
                symbols.extend(market.cached_symbols());
                symbols.sort();
                symbols.dedup();
                for symbol in symbols {
                    let _ = market.quote(&symbol).await;
                }
            }
        });
    }

    // Opportunity scans at a bounded cadence.
    {
        let market = market.clone();
        let alerts = alerts.clone();
        let interval = Duration::from_secs(config.opportunity_scan_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let quotes: Vec<_> = market
                    .cached_symbols()
                    .iter()
                    .filter_map(|s| market.cached_quote(s))
                    .collect();
                if !quotes.is_empty() {
                    alerts.scan_opportunities(&quotes);
                }
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        store,
        vault,
        auth,
        market,
        breakers,
        portfolios,
        router,
        approvals,
        kill_switch,
        alerts,
        ai,
        notifier,
        rooms,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(tiller::api::router())
        .route("/ws", get(websocket::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {e}", config.listen_addr);
            return ExitCode::from(1);
        }
    };
    info!("tiller listening on {}", config.listen_addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("server error: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
