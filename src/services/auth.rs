//! Authentication service.
//!
//! Argon2id password hashes, HS256 bearer tokens, and RFC-6238 TOTP (the
//! HMAC-SHA-256 variant) for two-factor login. Duplicate email or username
//! registrations surface as conflicts.

use crate::error::AppError;
use crate::services::sqlite_store::is_unique_violation;
use crate::services::SqliteStore;
use crate::types::{Claims, Role, TradingMode, User};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Access tokens live for 24 hours.
const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
/// TOTP step per RFC 6238.
const TOTP_STEP_SECS: i64 = 30;
const TOTP_DIGITS: u32 = 6;

#[derive(Debug, Error)]
pub enum AuthServiceError {
    #[error("email or username already registered")]
    Duplicate,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("two-factor code required")]
    TotpRequired,

    #[error("invalid two-factor code")]
    TotpInvalid,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("database error: {0}")]
    Database(String),
}

impl From<AuthServiceError> for AppError {
    fn from(e: AuthServiceError) -> Self {
        match e {
            AuthServiceError::Duplicate => AppError::Conflict(e.to_string()),
            AuthServiceError::InvalidCredentials => AppError::Auth(e.to_string()),
            AuthServiceError::TotpRequired => AppError::Forbidden(e.to_string()),
            AuthServiceError::TotpInvalid => AppError::Auth(e.to_string()),
            AuthServiceError::InvalidToken => AppError::Auth(e.to_string()),
            AuthServiceError::Database(msg) => AppError::Internal(msg),
        }
    }
}

pub struct AuthService {
    store: Arc<SqliteStore>,
    jwt_secret: String,
}

impl AuthService {
    pub fn new(store: Arc<SqliteStore>, jwt_secret: String) -> Arc<Self> {
        Arc::new(Self { store, jwt_secret })
    }

    /// Register a new user; returns the user and a fresh access token.
    pub fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<(User, String), AuthServiceError> {
        let email = email.trim().to_lowercase();
        let username = username.trim().to_string();

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            username,
            password_hash: hash_password(password)?,
            role: Role::User,
            totp_secret: None,
            totp_enabled: false,
            trading_mode: TradingMode::default(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        self.store.create_user(&user).map_err(|e| {
            if is_unique_violation(&e) {
                AuthServiceError::Duplicate
            } else {
                AuthServiceError::Database(e.to_string())
            }
        })?;

        info!(user_id = %user.id, "user registered");
        let token = self.issue_token(&user);
        Ok((user, token))
    }

    /// Verify credentials (and TOTP when enabled) and issue a token.
    pub fn login(
        &self,
        email: &str,
        password: &str,
        totp: Option<&str>,
    ) -> Result<(User, String), AuthServiceError> {
        let email = email.trim().to_lowercase();
        let user = self
            .store
            .get_user_by_email(&email)
            .ok_or(AuthServiceError::InvalidCredentials)?;

        if !verify_password(password, &user.password_hash) {
            warn!(user_id = %user.id, "failed login attempt");
            return Err(AuthServiceError::InvalidCredentials);
        }

        if user.totp_enabled {
            let code = totp.ok_or(AuthServiceError::TotpRequired)?;
            let secret = user
                .totp_secret
                .as_deref()
                .ok_or(AuthServiceError::TotpRequired)?;
            if !verify_totp(secret, code, chrono::Utc::now().timestamp()) {
                return Err(AuthServiceError::TotpInvalid);
            }
        }

        info!(user_id = %user.id, "user logged in");
        let token = self.issue_token(&user);
        Ok((user, token))
    }

    /// Generate and store a TOTP secret; returned hex goes to the user's
    /// authenticator. 2FA activates after the first verified code.
    pub fn totp_enroll(&self, user_id: &str) -> Result<String, AuthServiceError> {
        let mut secret = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut secret);
        let secret_hex = hex::encode(secret);
        self.store
            .set_totp(user_id, Some(&secret_hex), false)
            .map_err(|e| AuthServiceError::Database(e.to_string()))?;
        Ok(secret_hex)
    }

    /// Confirm enrollment with a valid code, turning 2FA on.
    pub fn totp_confirm(&self, user_id: &str, code: &str) -> Result<(), AuthServiceError> {
        let user = self
            .store
            .get_user(user_id)
            .ok_or(AuthServiceError::InvalidCredentials)?;
        let secret = user
            .totp_secret
            .as_deref()
            .ok_or(AuthServiceError::TotpInvalid)?;
        if !verify_totp(secret, code, chrono::Utc::now().timestamp()) {
            return Err(AuthServiceError::TotpInvalid);
        }
        self.store
            .set_totp(user_id, Some(secret), true)
            .map_err(|e| AuthServiceError::Database(e.to_string()))?;
        info!(user_id, "two-factor enabled");
        Ok(())
    }

    pub fn totp_disable(&self, user_id: &str) -> Result<(), AuthServiceError> {
        self.store
            .set_totp(user_id, None, false)
            .map_err(|e| AuthServiceError::Database(e.to_string()))
    }

    fn issue_token(&self, user: &User) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user.id.clone(),
            role: user.role,
            exp: now + TOKEN_TTL_SECS,
            iat: now,
        };
        encode_hs256(&self.jwt_secret, &claims)
    }

    /// Validate a bearer token and load the current user.
    pub fn authenticate(&self, token: &str) -> Result<User, AuthServiceError> {
        let claims = decode_hs256(&self.jwt_secret, token)?;
        if claims.exp < chrono::Utc::now().timestamp() {
            return Err(AuthServiceError::InvalidToken);
        }
        self.store
            .get_user(&claims.sub)
            .ok_or(AuthServiceError::InvalidToken)
    }
}

fn hash_password(password: &str) -> Result<String, AuthServiceError> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| AuthServiceError::Database(e.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthServiceError::Database(e.to_string()))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn encode_hs256(secret: &str, claims: &Claims) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
    let signing_input = format!("{header}.{payload}");

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{signing_input}.{signature}")
}

fn decode_hs256(secret: &str, token: &str) -> Result<Claims, AuthServiceError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthServiceError::InvalidToken);
    }

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(signing_input.as_bytes());
    let expected = mac.finalize().into_bytes();

    let provided = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|_| AuthServiceError::InvalidToken)?;
    if provided.as_slice() != expected.as_slice() {
        return Err(AuthServiceError::InvalidToken);
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| AuthServiceError::InvalidToken)?;
    serde_json::from_slice(&payload).map_err(|_| AuthServiceError::InvalidToken)
}

/// RFC 6238 TOTP over HMAC-SHA-256 with a 30 s step and 6 digits.
fn totp_code(secret_hex: &str, timestamp: i64) -> Option<String> {
    let secret = hex::decode(secret_hex).ok()?;
    let counter = (timestamp / TOTP_STEP_SECS) as u64;

    let mut mac = HmacSha256::new_from_slice(&secret).ok()?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    let code = binary % 10u32.pow(TOTP_DIGITS);
    Some(format!("{code:06}"))
}

/// Accept the current step plus one step of clock drift either way.
fn verify_totp(secret_hex: &str, code: &str, timestamp: i64) -> bool {
    for drift in [-1i64, 0, 1] {
        let at = timestamp + drift * TOTP_STEP_SECS;
        if totp_code(secret_hex, at).as_deref() == Some(code) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<AuthService> {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        AuthService::new(store, "0123456789abcdef0123456789abcdef".to_string())
    }

    #[test]
    fn test_register_then_login() {
        let auth = service();
        let (user, token) = auth.register("a@b.c", "alice", "hunter22").unwrap();
        assert!(!token.is_empty());

        let (logged_in, _) = auth.login("A@B.C", "hunter22", None).unwrap();
        assert_eq!(logged_in.id, user.id);

        assert!(matches!(
            auth.login("a@b.c", "wrong", None),
            Err(AuthServiceError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let auth = service();
        auth.register("a@b.c", "alice", "hunter22").unwrap();
        assert!(matches!(
            auth.register("a@b.c", "alice2", "hunter22"),
            Err(AuthServiceError::Duplicate)
        ));
    }

    #[test]
    fn test_token_roundtrip_and_tamper() {
        let auth = service();
        let (user, token) = auth.register("a@b.c", "alice", "hunter22").unwrap();

        let authenticated = auth.authenticate(&token).unwrap();
        assert_eq!(authenticated.id, user.id);

        let mut tampered = token.clone();
        tampered.push('x');
        assert!(auth.authenticate(&tampered).is_err());
        assert!(auth.authenticate("not.a.token").is_err());
    }

    #[test]
    fn test_totp_flow() {
        let auth = service();
        let (user, _) = auth.register("a@b.c", "alice", "hunter22").unwrap();

        let secret = auth.totp_enroll(&user.id).unwrap();
        let now = chrono::Utc::now().timestamp();
        let code = totp_code(&secret, now).unwrap();
        auth.totp_confirm(&user.id, &code).unwrap();

        // Missing code now yields a 403-mapped error.
        assert!(matches!(
            auth.login("a@b.c", "hunter22", None),
            Err(AuthServiceError::TotpRequired)
        ));
        // Valid code passes.
        let code = totp_code(&secret, chrono::Utc::now().timestamp()).unwrap();
        assert!(auth.login("a@b.c", "hunter22", Some(&code)).is_ok());
        // Garbage code fails.
        assert!(matches!(
            auth.login("a@b.c", "hunter22", Some("000000")),
            Err(AuthServiceError::TotpInvalid) | Err(AuthServiceError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_totp_codes_are_six_digits_and_step_stable() {
        let secret = hex::encode([1u8; 20]);
        let a = totp_code(&secret, 999_990).unwrap();
        let b = totp_code(&secret, 1_000_019).unwrap();
        let c = totp_code(&secret, 1_000_020).unwrap();
        assert_eq!(a.len(), 6);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
