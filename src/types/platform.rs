//! Exchange connection ("platform") types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    Binance,
    Bybit,
    Okx,
    Paper,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Binance => "binance",
            PlatformKind::Bybit => "bybit",
            PlatformKind::Okx => "okx",
            PlatformKind::Paper => "paper",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "binance" => Some(PlatformKind::Binance),
            "bybit" => Some(PlatformKind::Bybit),
            "okx" => Some(PlatformKind::Okx),
            "paper" => Some(PlatformKind::Paper),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, PlatformKind::Paper)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl PlatformStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformStatus::Disconnected => "disconnected",
            PlatformStatus::Connecting => "connecting",
            PlatformStatus::Connected => "connected",
            PlatformStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "connecting" => PlatformStatus::Connecting,
            "connected" => PlatformStatus::Connected,
            "error" => PlatformStatus::Error,
            _ => PlatformStatus::Disconnected,
        }
    }
}

/// A stored exchange connection. Credential fields hold vault ciphertext
/// only; plaintext exists solely inside an adapter instance.
#[derive(Debug, Clone)]
pub struct Platform {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub kind: PlatformKind,
    pub is_sandbox: bool,
    pub is_default: bool,
    pub api_key_enc: String,
    pub secret_key_enc: String,
    pub passphrase_enc: Option<String>,
    pub status: PlatformStatus,
    pub last_tested_at: Option<i64>,
    pub created_at: i64,
}

/// Decrypted credentials, alive only while an adapter is being constructed.
/// Deliberately not serializable, and `Debug` redacts the contents.
pub struct PlatformCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for PlatformCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformCredentials")
            .field("api_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// Public view of a platform; ciphertext never leaves the server.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformView {
    pub id: String,
    pub name: String,
    pub kind: PlatformKind,
    pub is_sandbox: bool,
    pub is_default: bool,
    pub status: PlatformStatus,
    pub last_tested_at: Option<i64>,
    pub created_at: i64,
}

impl From<&Platform> for PlatformView {
    fn from(p: &Platform) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            kind: p.kind,
            is_sandbox: p.is_sandbox,
            is_default: p.is_default,
            status: p.status,
            last_tested_at: p.last_tested_at,
            created_at: p.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePlatformRequest {
    pub name: String,
    pub kind: PlatformKind,
    pub api_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub is_sandbox: bool,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Serialize)]
pub struct PlatformTestResult {
    pub ok: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!(PlatformKind::parse("okx"), Some(PlatformKind::Okx));
        assert_eq!(PlatformKind::parse("nyse"), None);
        assert!(PlatformKind::Binance.is_live());
        assert!(!PlatformKind::Paper.is_live());
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = PlatformCredentials {
            api_key: "AKIA-very-secret".to_string(),
            secret_key: "swordfish".to_string(),
            passphrase: None,
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("swordfish"));
        assert!(!rendered.contains("AKIA"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_view_has_no_ciphertext() {
        let platform = Platform {
            id: "p1".to_string(),
            user_id: "u1".to_string(),
            name: "main".to_string(),
            kind: PlatformKind::Binance,
            is_sandbox: true,
            is_default: true,
            api_key_enc: "CIPHERTEXTKEY".to_string(),
            secret_key_enc: "CIPHERTEXTSECRET".to_string(),
            passphrase_enc: None,
            status: PlatformStatus::Connected,
            last_tested_at: None,
            created_at: 0,
        };
        let json = serde_json::to_string(&PlatformView::from(&platform)).unwrap();
        assert!(!json.contains("CIPHERTEXT"));
    }
}
