use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use thiserror::Error;

/// Environment variables the server recognizes. Anything else starting with
/// `TILLER_` is rejected at startup so typos fail fast instead of silently
/// falling back to defaults.
const KNOWN_VARS: &[&str] = &[
    "TILLER_LISTEN_ADDR",
    "TILLER_DB_PATH",
    "TILLER_SEED_BALANCE",
    "TILLER_FRESHNESS_SECS",
    "TILLER_SOURCE_TIMEOUT_SECS",
    "TILLER_ORDER_QUOTE_MAX_AGE_SECS",
    "TILLER_APPROVAL_TTL_SECS",
    "TILLER_OPPORTUNITY_SCAN_SECS",
    "TILLER_CRYPTO_FEED_URL",
    "TILLER_EQUITY_FEED_URL",
    "TILLER_FX_FEED_URL",
    "TILLER_AI_PROVIDER_URL",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("unrecognized environment variable {0}")]
    Unknown(String),
}

/// Application configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_addr: String,
    /// Path to the SQLite database file.
    pub db_path: String,
    /// Base64 AES-256 key for the credential vault (required).
    pub vault_key: String,
    /// HS256 signing secret for bearer tokens (required, >= 32 bytes).
    pub jwt_secret: String,
    /// AI provider API key. Absent disables AI endpoints gracefully.
    pub ai_provider_key: Option<String>,
    /// AI provider completion endpoint.
    pub ai_provider_url: String,
    /// Crypto aggregator feed base URL.
    pub crypto_feed_url: String,
    /// Equity market-data endpoint base URL.
    pub equity_feed_url: String,
    /// FX rate endpoint base URL.
    pub fx_feed_url: String,
    /// Quote cache freshness window in seconds.
    pub freshness_secs: u64,
    /// Per-source fetch timeout in seconds.
    pub source_timeout_secs: u64,
    /// Maximum quote age accepted while submitting an order, seconds.
    pub order_quote_max_age_secs: u64,
    /// TTL for Assisted-mode approval requests, seconds.
    pub approval_ttl_secs: u64,
    /// Opportunity scan cadence, seconds.
    pub opportunity_scan_secs: u64,
    /// Starting balance for newly registered users.
    pub seed_balance: Decimal,
}

impl Config {
    /// Load and validate configuration from the environment.
    ///
    /// Missing required secrets and malformed values are hard errors; the
    /// binary maps them to exit code 1.
    pub fn from_env() -> Result<Self, ConfigError> {
        for (name, _) in env::vars() {
            if name.starts_with("TILLER_") && !KNOWN_VARS.contains(&name.as_str()) {
                return Err(ConfigError::Unknown(name));
            }
        }

        let vault_key = env::var("VAULT_KEY").map_err(|_| ConfigError::Missing("VAULT_KEY"))?;

        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: format!("must be at least 32 bytes, got {}", jwt_secret.len()),
            });
        }

        let seed_balance = match env::var("TILLER_SEED_BALANCE") {
            Ok(v) => v.parse::<Decimal>().map_err(|e| ConfigError::Invalid {
                name: "TILLER_SEED_BALANCE",
                reason: e.to_string(),
            })?,
            Err(_) => dec!(10000),
        };
        if seed_balance <= Decimal::ZERO {
            return Err(ConfigError::Invalid {
                name: "TILLER_SEED_BALANCE",
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            listen_addr: env::var("TILLER_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3001".to_string()),
            db_path: env::var("TILLER_DB_PATH").unwrap_or_else(|_| "tiller.db".to_string()),
            vault_key,
            jwt_secret,
            ai_provider_key: env::var("AI_PROVIDER_KEY").ok(),
            ai_provider_url: env::var("TILLER_AI_PROVIDER_URL")
                .unwrap_or_else(|_| "https://api.deepseek.com/v1/completions".to_string()),
            crypto_feed_url: env::var("TILLER_CRYPTO_FEED_URL")
                .unwrap_or_else(|_| "https://api.binance.com/api/v3".to_string()),
            equity_feed_url: env::var("TILLER_EQUITY_FEED_URL")
                .unwrap_or_else(|_| "https://finnhub.io/api/v1".to_string()),
            fx_feed_url: env::var("TILLER_FX_FEED_URL")
                .unwrap_or_else(|_| "https://open.er-api.com/v6".to_string()),
            freshness_secs: parse_secs("TILLER_FRESHNESS_SECS", 30)?,
            source_timeout_secs: parse_secs("TILLER_SOURCE_TIMEOUT_SECS", 5)?,
            order_quote_max_age_secs: parse_secs("TILLER_ORDER_QUOTE_MAX_AGE_SECS", 5)?,
            approval_ttl_secs: parse_secs("TILLER_APPROVAL_TTL_SECS", 300)?,
            opportunity_scan_secs: parse_secs("TILLER_OPPORTUNITY_SCAN_SECS", 60)?,
            seed_balance,
        })
    }
}

fn parse_secs(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(v) => {
            let secs = v.parse::<u64>().map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be non-zero".to_string(),
                });
            }
            Ok(secs)
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test to avoid
    // interleaving with parallel test threads.
    #[test]
    fn test_from_env_validation() {
        env::remove_var("VAULT_KEY");
        env::remove_var("JWT_SECRET");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("VAULT_KEY"))
        ));

        env::set_var("VAULT_KEY", "Zm9vYmFyZm9vYmFyZm9vYmFyZm9vYmFyZm9vYmFyZm8=");
        env::set_var("JWT_SECRET", "short");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                ..
            })
        ));

        env::set_var("JWT_SECRET", "0123456789abcdef0123456789abcdef");
        env::set_var("TILLER_TYPO_VAR", "1");
        assert!(matches!(Config::from_env(), Err(ConfigError::Unknown(_))));
        env::remove_var("TILLER_TYPO_VAR");

        let config = Config::from_env().expect("valid config");
        assert_eq!(config.freshness_secs, 30);
        assert_eq!(config.source_timeout_secs, 5);
        assert_eq!(config.seed_balance, dec!(10000));
        assert!(config.ai_provider_key.is_none());

        env::remove_var("VAULT_KEY");
        env::remove_var("JWT_SECRET");
    }
}
