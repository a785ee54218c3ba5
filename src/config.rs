use std::path::PathBuf;
use std::time::Duration;

pub const MIN_CONFIDENCE_SCORE: f64 = 0.90;

#[derive(Debug, Clone)]
pub struct DextConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct XeroConfig {
    pub api_url: String,
    pub token_url: String,
    pub authorize_url: String,
    pub redirect_uri: String,
    pub scope: String,
    pub tenant_id: Option<String>,
    pub account_code: String,
    pub line_description: String,
    pub reference_prefix: String,
    pub payment_terms_days: i64,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub min_confidence: f64,
    pub vat_country_prefixes: Vec<String>,
    pub openai_url: String,
    pub openai_model: String,
    pub timeout: Duration,
}

/// Secrets supplied through the environment; they only fill empty credential fields.
#[derive(Debug, Clone, Default)]
pub struct SeedSecrets {
    pub dext_api_key: Option<String>,
    pub xero_client_id: Option<String>,
    pub xero_client_secret: Option<String>,
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub encryption_key: Option<String>,
    pub log_level: String,
    pub dext: DextConfig,
    pub xero: XeroConfig,
    pub validator: ValidatorConfig,
    pub seed: SeedSecrets,
}

impl AppConfig {
    /// Reads `.env` (if present) and the process environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let timeout = Duration::from_secs(
            get("HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(30),
        );
        let min_confidence = get("MIN_CONFIDENCE_SCORE")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| (0.0..=1.0).contains(v))
            .unwrap_or(MIN_CONFIDENCE_SCORE);
        let vat_country_prefixes = or("VAT_COUNTRY_PREFIXES", "GB")
            .split(',')
            .map(|p| p.trim().to_ascii_uppercase())
            .filter(|p| p.len() == 2)
            .collect();

        AppConfig {
            database_path: PathBuf::from(or("DATABASE_PATH", "dexero.sqlite")),
            encryption_key: get("ENCRYPTION_KEY"),
            log_level: or("LOG_LEVEL", "info"),
            dext: DextConfig {
                base_url: or("DEXT_API_URL", "https://api.dext.com/v1"),
                timeout,
            },
            xero: XeroConfig {
                api_url: or("XERO_API_URL", "https://api.xero.com/api.xro/2.0"),
                token_url: or("XERO_TOKEN_URL", "https://identity.xero.com/connect/token"),
                authorize_url: or("XERO_AUTHORIZE_URL", "https://login.xero.com/identity/connect/authorize"),
                redirect_uri: or("XERO_REDIRECT_URI", "http://localhost:5173/xero/callback"),
                scope: or("XERO_SCOPE", "offline_access accounting.transactions accounting.contacts"),
                tenant_id: get("XERO_TENANT_ID"),
                account_code: or("XERO_ACCOUNT_CODE", "200"),
                line_description: "Invoice from Dext".to_string(),
                reference_prefix: "DEXT".to_string(),
                payment_terms_days: 30,
                timeout,
            },
            validator: ValidatorConfig {
                min_confidence,
                vat_country_prefixes,
                openai_url: or("OPENAI_API_URL", "https://api.openai.com/v1/chat/completions"),
                openai_model: or("OPENAI_MODEL", "gpt-4o-mini"),
                timeout,
            },
            seed: SeedSecrets {
                dext_api_key: get("DEXT_API_KEY"),
                xero_client_id: get("XERO_CLIENT_ID"),
                xero_client_secret: get("XERO_CLIENT_SECRET"),
                openai_api_key: get("OPENAI_API_KEY"),
            },
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
