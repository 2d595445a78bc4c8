use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Config(format!("{} not set", name)))
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub upload_root: PathBuf,
    pub country_prefix: String,
    pub mpesa: MpesaConfig,
    pub whatsapp: Option<WhatsAppConfig>,
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub passkey: String,
    pub callback_url: String,
    pub environment: String,
}

impl MpesaConfig {
    pub fn base_url(&self) -> &'static str {
        if self.environment == "production" {
            "https://api.safaricom.co.ke"
        } else {
            "https://sandbox.safaricom.co.ke"
        }
    }
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub api_key: String,
    pub endpoint: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mpesa = MpesaConfig {
            consumer_key: required("MPESA_CONSUMER_KEY")?,
            consumer_secret: required("MPESA_CONSUMER_SECRET")?,
            short_code: required("MPESA_SHORT_CODE")?,
            passkey: required("MPESA_PASSKEY")?,
            callback_url: required("MPESA_CALLBACK_URL")?,
            environment: env::var("MPESA_ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string()),
        };

        // The WhatsApp sender is optional; without a key the delivered
        // notification is skipped.
        let whatsapp = env::var("WHATSAPP_API_KEY").ok().map(|api_key| WhatsAppConfig {
            api_key,
            endpoint: env::var("WHATSAPP_ENDPOINT")
                .unwrap_or_else(|_| "https://api.flaresend.com/send-message".to_string()),
        });

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| ConfigError::Config("Invalid PORT".to_string()))?,
            database_url: required("DATABASE_URL")?,
            upload_root: PathBuf::from(
                env::var("UPLOAD_ROOT").unwrap_or_else(|_| "uploads".to_string()),
            ),
            country_prefix: env::var("COUNTRY_PREFIX").unwrap_or_else(|_| "254".to_string()),
            mpesa,
            whatsapp,
        })
    }
}
