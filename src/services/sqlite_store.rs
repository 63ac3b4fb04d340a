//! SQLite persistence layer.
//!
//! Every entity stores as a row keyed by its id. Platform rows hold vault
//! ciphertext only, trades carry a user index, and the audit log is
//! append-only with a monotonic sequence. Money columns store as TEXT and
//! parse back into `Decimal`.

use crate::types::{
    AlertCondition, AlertState, ExecutionKind, Notification, NotificationKind,
    NotificationPriority, OrderSide, OrderType, Platform, PlatformKind, PlatformStatus, Portfolio,
    Position, PositionSide, Role, SmartAlert, Trade, TradeStatus, TradingMode, User,
};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, info};

/// Schema version written by this binary. A database stamped with a newer
/// version refuses to start (exit code 2) rather than run with an unknown
/// layout.
pub const SCHEMA_VERSION: i64 = 1;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn parse_dec(s: String) -> Decimal {
    s.parse().unwrap_or_default()
}

fn parse_dec_opt(s: Option<String>) -> Option<Decimal> {
    s.and_then(|v| v.parse().ok())
}

/// True when the error is a UNIQUE constraint violation, used to map
/// duplicate registrations and armed-alert fingerprints to 409s.
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn new_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("in-memory SQLite store initialized");
        Ok(store)
    }

    /// True when the database was written by a newer binary.
    pub fn migrations_pending(&self) -> bool {
        let conn = self.conn.lock().unwrap();
        let stored: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap_or(SCHEMA_VERSION);
        stored > SCHEMA_VERSION
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
            [],
        )?;
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| {
            row.get(0)
        })?;
        if rows == 0 {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user',
                totp_secret TEXT,
                totp_enabled INTEGER NOT NULL DEFAULT 0,
                trading_mode TEXT NOT NULL DEFAULT 'learning_only',
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS portfolios (
                user_id TEXT PRIMARY KEY,
                total_balance TEXT NOT NULL,
                available_balance TEXT NOT NULL,
                invested_balance TEXT NOT NULL,
                daily_pnl TEXT NOT NULL,
                total_pnl TEXT NOT NULL,
                trading_day TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                average_price TEXT NOT NULL,
                side TEXT NOT NULL,
                PRIMARY KEY (user_id, symbol)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS platforms (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                is_sandbox INTEGER NOT NULL DEFAULT 0,
                is_default INTEGER NOT NULL DEFAULT 0,
                api_key_enc TEXT NOT NULL,
                secret_key_enc TEXT NOT NULL,
                passphrase_enc TEXT,
                status TEXT NOT NULL DEFAULT 'disconnected',
                last_tested_at INTEGER,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_platforms_user ON platforms(user_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                platform_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT,
                stop_loss TEXT,
                take_profit TEXT,
                status TEXT NOT NULL,
                pnl TEXT NOT NULL,
                execution_kind TEXT NOT NULL,
                market_price_at_execution TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                closed_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_user ON trades(user_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_user_status ON trades(user_id, status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                condition TEXT NOT NULL,
                threshold TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                triggered_at INTEGER
            )",
            [],
        )?;
        // Two armed alerts with the same fingerprint cannot coexist for one
        // owner.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_armed_fingerprint
             ON alerts(user_id, fingerprint) WHERE state = 'armed'",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                priority TEXT NOT NULL,
                read_at INTEGER,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                user_id TEXT,
                detail TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT NOT NULL,
                user_id TEXT NOT NULL,
                trade_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (key, user_id)
            )",
            [],
        )?;

        Ok(())
    }

    // ========== Users ==========

    pub fn create_user(&self, user: &User) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id, email, username, password_hash, role, totp_secret,
                                totp_enabled, trading_mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user.id,
                user.email,
                user.username,
                user.password_hash,
                user.role.as_str(),
                user.totp_secret,
                user.totp_enabled as i64,
                user.trading_mode.as_str(),
                user.created_at,
            ],
        )?;
        Ok(())
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        let role: String = row.get(4)?;
        let mode: String = row.get(7)?;
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            username: row.get(2)?,
            password_hash: row.get(3)?,
            role: Role::parse(&role),
            totp_secret: row.get(5)?,
            totp_enabled: row.get::<_, i64>(6)? != 0,
            trading_mode: TradingMode::parse(&mode),
            created_at: row.get(8)?,
        })
    }

    pub fn get_user(&self, id: &str) -> Option<User> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT id, email, username, password_hash, role, totp_secret,
                    totp_enabled, trading_mode, created_at
             FROM users WHERE id = ?1",
            params![id],
            Self::row_to_user,
        );
        match result {
            Ok(user) => Some(user),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                error!("error fetching user: {e}");
                None
            }
        }
    }

    pub fn get_user_by_email(&self, email: &str) -> Option<User> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT id, email, username, password_hash, role, totp_secret,
                    totp_enabled, trading_mode, created_at
             FROM users WHERE email = ?1",
            params![email],
            Self::row_to_user,
        );
        match result {
            Ok(user) => Some(user),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                error!("error fetching user by email: {e}");
                None
            }
        }
    }

    pub fn list_user_ids(&self) -> Vec<String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare("SELECT id FROM users") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map([], |row| row.get(0))
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    pub fn set_trading_mode(&self, user_id: &str, mode: TradingMode) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET trading_mode = ?1 WHERE id = ?2",
            params![mode.as_str(), user_id],
        )?;
        Ok(())
    }

    pub fn set_totp(
        &self,
        user_id: &str,
        secret: Option<&str>,
        enabled: bool,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET totp_secret = ?1, totp_enabled = ?2 WHERE id = ?3",
            params![secret, enabled as i64, user_id],
        )?;
        Ok(())
    }

    // ========== Portfolios & positions ==========

    pub fn save_portfolio(&self, portfolio: &Portfolio) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO portfolios (user_id, total_balance, available_balance,
                                     invested_balance, daily_pnl, total_pnl,
                                     trading_day, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id) DO UPDATE SET
                total_balance = excluded.total_balance,
                available_balance = excluded.available_balance,
                invested_balance = excluded.invested_balance,
                daily_pnl = excluded.daily_pnl,
                total_pnl = excluded.total_pnl,
                trading_day = excluded.trading_day,
                updated_at = excluded.updated_at",
            params![
                portfolio.user_id,
                portfolio.total_balance.to_string(),
                portfolio.available_balance.to_string(),
                portfolio.invested_balance.to_string(),
                portfolio.daily_pnl.to_string(),
                portfolio.total_pnl.to_string(),
                portfolio.trading_day,
                portfolio.updated_at,
            ],
        )?;

        conn.execute(
            "DELETE FROM positions WHERE user_id = ?1",
            params![portfolio.user_id],
        )?;
        for position in portfolio.positions.values() {
            conn.execute(
                "INSERT INTO positions (user_id, symbol, quantity, average_price, side)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    portfolio.user_id,
                    position.symbol,
                    position.quantity.to_string(),
                    position.average_price.to_string(),
                    position.side.to_string(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn load_portfolio(&self, user_id: &str) -> Option<Portfolio> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT user_id, total_balance, available_balance, invested_balance,
                    daily_pnl, total_pnl, trading_day, updated_at
             FROM portfolios WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(Portfolio {
                    user_id: row.get(0)?,
                    total_balance: parse_dec(row.get(1)?),
                    available_balance: parse_dec(row.get(2)?),
                    invested_balance: parse_dec(row.get(3)?),
                    daily_pnl: parse_dec(row.get(4)?),
                    total_pnl: parse_dec(row.get(5)?),
                    trading_day: row.get(6)?,
                    positions: HashMap::new(),
                    updated_at: row.get(7)?,
                })
            },
        );

        let mut portfolio = match result {
            Ok(p) => p,
            Err(rusqlite::Error::QueryReturnedNoRows) => return None,
            Err(e) => {
                error!("error fetching portfolio: {e}");
                return None;
            }
        };

        let mut stmt = conn
            .prepare(
                "SELECT symbol, quantity, average_price, side
                 FROM positions WHERE user_id = ?1",
            )
            .ok()?;
        let positions = stmt
            .query_map(params![user_id], |row| {
                let side: String = row.get(3)?;
                Ok(Position {
                    symbol: row.get(0)?,
                    quantity: parse_dec(row.get(1)?),
                    average_price: parse_dec(row.get(2)?),
                    side: if side == "short" {
                        PositionSide::Short
                    } else {
                        PositionSide::Long
                    },
                })
            })
            .ok()?;
        for position in positions.flatten() {
            portfolio.positions.insert(position.symbol.clone(), position);
        }
        Some(portfolio)
    }

    // ========== Platforms ==========

    pub fn create_platform(&self, platform: &Platform) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        if platform.is_default {
            conn.execute(
                "UPDATE platforms SET is_default = 0 WHERE user_id = ?1",
                params![platform.user_id],
            )?;
        }
        conn.execute(
            "INSERT INTO platforms (id, user_id, name, kind, is_sandbox, is_default,
                                    api_key_enc, secret_key_enc, passphrase_enc,
                                    status, last_tested_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                platform.id,
                platform.user_id,
                platform.name,
                platform.kind.as_str(),
                platform.is_sandbox as i64,
                platform.is_default as i64,
                platform.api_key_enc,
                platform.secret_key_enc,
                platform.passphrase_enc,
                platform.status.as_str(),
                platform.last_tested_at,
                platform.created_at,
            ],
        )?;
        Ok(())
    }

    fn row_to_platform(row: &rusqlite::Row<'_>) -> rusqlite::Result<Platform> {
        let kind: String = row.get(3)?;
        let status: String = row.get(9)?;
        Ok(Platform {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            kind: PlatformKind::parse(&kind).unwrap_or(PlatformKind::Paper),
            is_sandbox: row.get::<_, i64>(4)? != 0,
            is_default: row.get::<_, i64>(5)? != 0,
            api_key_enc: row.get(6)?,
            secret_key_enc: row.get(7)?,
            passphrase_enc: row.get(8)?,
            status: PlatformStatus::parse(&status),
            last_tested_at: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    const PLATFORM_COLS: &'static str = "id, user_id, name, kind, is_sandbox, is_default,
         api_key_enc, secret_key_enc, passphrase_enc, status, last_tested_at, created_at";

    pub fn get_platform(&self, id: &str) -> Option<Platform> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM platforms WHERE id = ?1",
            Self::PLATFORM_COLS
        );
        match conn.query_row(&sql, params![id], Self::row_to_platform) {
            Ok(p) => Some(p),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                error!("error fetching platform: {e}");
                None
            }
        }
    }

    pub fn list_platforms(&self, user_id: &str) -> Vec<Platform> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM platforms WHERE user_id = ?1 ORDER BY created_at",
            Self::PLATFORM_COLS
        );
        let mut stmt = match conn.prepare(&sql) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![user_id], Self::row_to_platform)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    pub fn update_platform_status(
        &self,
        id: &str,
        status: PlatformStatus,
        last_tested_at: Option<i64>,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE platforms SET status = ?1,
                    last_tested_at = COALESCE(?2, last_tested_at)
             WHERE id = ?3",
            params![status.as_str(), last_tested_at, id],
        )?;
        Ok(())
    }

    pub fn delete_platform(&self, id: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM platforms WHERE id = ?1", params![id])
    }

    // ========== Trades ==========

    pub fn create_trade(&self, trade: &Trade) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trades (id, user_id, platform_id, symbol, side, order_type,
                                 quantity, entry_price, exit_price, stop_loss, take_profit,
                                 status, pnl, execution_kind, market_price_at_execution,
                                 created_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                trade.id,
                trade.user_id,
                trade.platform_id,
                trade.symbol,
                trade.side.to_string(),
                trade.order_type.to_string(),
                trade.quantity.to_string(),
                trade.entry_price.to_string(),
                trade.exit_price.map(|d| d.to_string()),
                trade.stop_loss.map(|d| d.to_string()),
                trade.take_profit.map(|d| d.to_string()),
                trade.status.to_string(),
                trade.pnl.to_string(),
                trade.execution_kind.to_string(),
                trade.market_price_at_execution.to_string(),
                trade.created_at,
                trade.closed_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_trade(&self, trade: &Trade) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE trades SET exit_price = ?1, status = ?2, pnl = ?3, closed_at = ?4
             WHERE id = ?5",
            params![
                trade.exit_price.map(|d| d.to_string()),
                trade.status.to_string(),
                trade.pnl.to_string(),
                trade.closed_at,
                trade.id,
            ],
        )?;
        Ok(())
    }

    fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
        let side: String = row.get(4)?;
        let order_type: String = row.get(5)?;
        let status: String = row.get(11)?;
        let execution_kind: String = row.get(13)?;
        Ok(Trade {
            id: row.get(0)?,
            user_id: row.get(1)?,
            platform_id: row.get(2)?,
            symbol: row.get(3)?,
            side: if side == "sell" {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            order_type: match order_type.as_str() {
                "limit" => OrderType::Limit,
                "stop_loss" => OrderType::StopLoss,
                "take_profit" => OrderType::TakeProfit,
                _ => OrderType::Market,
            },
            quantity: parse_dec(row.get(6)?),
            entry_price: parse_dec(row.get(7)?),
            exit_price: parse_dec_opt(row.get(8)?),
            stop_loss: parse_dec_opt(row.get(9)?),
            take_profit: parse_dec_opt(row.get(10)?),
            status: match status.as_str() {
                "closed" => TradeStatus::Closed,
                "cancelled" => TradeStatus::Cancelled,
                _ => TradeStatus::Open,
            },
            pnl: parse_dec(row.get(12)?),
            execution_kind: if execution_kind == "live" {
                ExecutionKind::Live
            } else {
                ExecutionKind::Paper
            },
            market_price_at_execution: parse_dec(row.get(14)?),
            created_at: row.get(15)?,
            closed_at: row.get(16)?,
        })
    }

    const TRADE_COLS: &'static str = "id, user_id, platform_id, symbol, side, order_type,
         quantity, entry_price, exit_price, stop_loss, take_profit, status, pnl,
         execution_kind, market_price_at_execution, created_at, closed_at";

    pub fn get_trade(&self, id: &str) -> Option<Trade> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM trades WHERE id = ?1", Self::TRADE_COLS);
        match conn.query_row(&sql, params![id], Self::row_to_trade) {
            Ok(t) => Some(t),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                error!("error fetching trade: {e}");
                None
            }
        }
    }

    pub fn list_trades(&self, user_id: &str, limit: usize) -> Vec<Trade> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM trades WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            Self::TRADE_COLS
        );
        let mut stmt = match conn.prepare(&sql) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![user_id, limit as i64], Self::row_to_trade)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    /// Open trades for a user, oldest first — the kill-switch sweep order.
    pub fn open_trades(&self, user_id: &str) -> Vec<Trade> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM trades WHERE user_id = ?1 AND status = 'open' ORDER BY created_at ASC",
            Self::TRADE_COLS
        );
        let mut stmt = match conn.prepare(&sql) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![user_id], Self::row_to_trade)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    pub fn trade_count(&self) -> i64 {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .unwrap_or(0)
    }

    // ========== Alerts ==========

    pub fn create_alert(&self, alert: &SmartAlert) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (id, user_id, symbol, condition, threshold, fingerprint,
                                 state, created_at, triggered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                alert.id,
                alert.user_id,
                alert.symbol,
                alert.condition.as_str(),
                alert.threshold.to_string(),
                alert.fingerprint,
                alert.state.as_str(),
                alert.created_at,
                alert.triggered_at,
            ],
        )?;
        Ok(())
    }

    fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<SmartAlert> {
        let condition: String = row.get(3)?;
        let state: String = row.get(6)?;
        Ok(SmartAlert {
            id: row.get(0)?,
            user_id: row.get(1)?,
            symbol: row.get(2)?,
            condition: AlertCondition::parse(&condition).unwrap_or(AlertCondition::PriceAbove),
            threshold: parse_dec(row.get(4)?),
            fingerprint: row.get(5)?,
            state: AlertState::parse(&state),
            created_at: row.get(7)?,
            triggered_at: row.get(8)?,
        })
    }

    pub fn list_alerts(&self, user_id: &str) -> Vec<SmartAlert> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(
            "SELECT id, user_id, symbol, condition, threshold, fingerprint, state,
                    created_at, triggered_at
             FROM alerts WHERE user_id = ?1 ORDER BY created_at DESC",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![user_id], Self::row_to_alert)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    pub fn load_armed_alerts(&self) -> Vec<SmartAlert> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(
            "SELECT id, user_id, symbol, condition, threshold, fingerprint, state,
                    created_at, triggered_at
             FROM alerts WHERE state = 'armed'",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map([], Self::row_to_alert)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    pub fn update_alert_state(
        &self,
        id: &str,
        state: AlertState,
        triggered_at: Option<i64>,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alerts SET state = ?1, triggered_at = COALESCE(?2, triggered_at)
             WHERE id = ?3",
            params![state.as_str(), triggered_at, id],
        )?;
        Ok(())
    }

    pub fn delete_alert(&self, id: &str, user_id: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM alerts WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )
    }

    // ========== Notifications ==========

    pub fn create_notification(&self, n: &Notification) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notifications (id, user_id, kind, title, body, priority,
                                        read_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                n.id,
                n.user_id,
                n.kind.as_str(),
                n.title,
                n.body,
                n.priority.as_str(),
                n.read_at,
                n.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_notifications(&self, user_id: &str, limit: usize) -> Vec<Notification> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(
            "SELECT id, user_id, kind, title, body, priority, read_at, created_at
             FROM notifications WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![user_id, limit as i64], |row| {
            let kind: String = row.get(2)?;
            let priority: String = row.get(5)?;
            Ok(Notification {
                id: row.get(0)?,
                user_id: row.get(1)?,
                kind: NotificationKind::parse(&kind),
                title: row.get(3)?,
                body: row.get(4)?,
                priority: NotificationPriority::parse(&priority),
                read_at: row.get(6)?,
                created_at: row.get(7)?,
            })
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }

    pub fn mark_notification_read(&self, id: &str, user_id: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE notifications SET read_at = ?1 WHERE id = ?2 AND user_id = ?3",
            params![now, id, user_id],
        )
    }

    // ========== Audit log ==========

    /// Append an audit record; the returned sequence number is monotonic.
    pub fn append_audit(
        &self,
        kind: &str,
        user_id: Option<&str>,
        detail: &str,
    ) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO audit_log (kind, user_id, detail, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![kind, user_id, detail, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn audit_count(&self) -> i64 {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .unwrap_or(0)
    }

    // ========== Idempotency ==========

    pub fn get_idempotent_trade(&self, user_id: &str, key: &str) -> Option<String> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT trade_id FROM idempotency_keys WHERE key = ?1 AND user_id = ?2",
            params![key, user_id],
            |row| row.get(0),
        ) {
            Ok(id) => Some(id),
            Err(_) => None,
        }
    }

    pub fn put_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
        trade_id: &str,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR IGNORE INTO idempotency_keys (key, user_id, trade_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, user_id, trade_id, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store() -> SqliteStore {
        SqliteStore::new_in_memory().unwrap()
    }

    fn sample_user(id: &str, email: &str) -> User {
        User {
            id: id.to_string(),
            email: email.to_string(),
            username: format!("user-{id}"),
            password_hash: "hash".to_string(),
            role: Role::User,
            totp_secret: None,
            totp_enabled: false,
            trading_mode: TradingMode::Autopilot,
            created_at: 1,
        }
    }

    #[test]
    fn test_user_roundtrip_and_duplicates() {
        let store = store();
        store.create_user(&sample_user("u1", "a@b.c")).unwrap();

        let user = store.get_user("u1").unwrap();
        assert_eq!(user.email, "a@b.c");
        assert_eq!(user.trading_mode, TradingMode::Autopilot);

        let dup = store.create_user(&sample_user("u2", "a@b.c"));
        assert!(is_unique_violation(&dup.unwrap_err()));
    }

    #[test]
    fn test_portfolio_roundtrip_with_positions() {
        let store = store();
        let mut portfolio = Portfolio::new("u1".to_string(), dec!(10000));
        portfolio.positions.insert(
            "BTCUSDT".to_string(),
            Position {
                symbol: "BTCUSDT".to_string(),
                quantity: dec!(0.5),
                average_price: dec!(60000.123456789012345678),
                side: PositionSide::Long,
            },
        );
        store.save_portfolio(&portfolio).unwrap();

        let loaded = store.load_portfolio("u1").unwrap();
        assert_eq!(loaded.total_balance, dec!(10000));
        let position = loaded.positions.get("BTCUSDT").unwrap();
        // Decimal survives the TEXT roundtrip without precision loss.
        assert_eq!(position.average_price, dec!(60000.123456789012345678));
    }

    #[test]
    fn test_open_trades_ordered_oldest_first() {
        let store = store();
        for (id, created_at) in [("t2", 200), ("t1", 100), ("t3", 300)] {
            let trade = Trade {
                id: id.to_string(),
                user_id: "u1".to_string(),
                platform_id: None,
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                quantity: dec!(0.01),
                entry_price: dec!(60000),
                exit_price: None,
                stop_loss: None,
                take_profit: None,
                status: TradeStatus::Open,
                pnl: Decimal::ZERO,
                execution_kind: ExecutionKind::Paper,
                market_price_at_execution: dec!(60000),
                created_at,
                closed_at: None,
            };
            store.create_trade(&trade).unwrap();
        }

        let open = store.open_trades("u1");
        let ids: Vec<&str> = open.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_armed_fingerprint_uniqueness() {
        let store = store();
        let alert = SmartAlert::new(
            "u1".to_string(),
            "BTCUSDT".to_string(),
            AlertCondition::PriceAbove,
            dec!(65000),
        );
        store.create_alert(&alert).unwrap();

        let duplicate = SmartAlert::new(
            "u1".to_string(),
            "BTCUSDT".to_string(),
            AlertCondition::PriceAbove,
            dec!(65000),
        );
        let err = store.create_alert(&duplicate).unwrap_err();
        assert!(is_unique_violation(&err));

        // Once the first alert leaves armed state the fingerprint frees up.
        store
            .update_alert_state(&alert.id, AlertState::Triggered, Some(1))
            .unwrap();
        store.create_alert(&duplicate).unwrap();
    }

    #[test]
    fn test_audit_sequence_monotonic() {
        let store = store();
        let a = store.append_audit("test", Some("u1"), "first").unwrap();
        let b = store.append_audit("test", None, "second").unwrap();
        let c = store.append_audit("test", None, "third").unwrap();
        assert!(a < b && b < c);
        assert_eq!(store.audit_count(), 3);
    }

    #[test]
    fn test_idempotency_key_lookup() {
        let store = store();
        assert!(store.get_idempotent_trade("u1", "k1").is_none());
        store.put_idempotency_key("u1", "k1", "t1").unwrap();
        assert_eq!(store.get_idempotent_trade("u1", "k1").unwrap(), "t1");
        // Same key for another user is independent.
        assert!(store.get_idempotent_trade("u2", "k1").is_none());
    }

    #[test]
    fn test_migrations_pending_detection() {
        let store = store();
        assert!(!store.migrations_pending());
        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE schema_version SET version = version + 1", [])
                .unwrap();
        }
        assert!(store.migrations_pending());
    }
}
