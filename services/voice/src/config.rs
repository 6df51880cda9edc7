use crate::session::{BackpressurePolicy, InterruptPolicy, SessionConfig};
use livechat_core::pcm::{RELAY_INPUT_SAMPLE_RATE, RELAY_OUTPUT_SAMPLE_RATE};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_url: String,
    pub store_slug: String,
    pub shopper_email: Option<String>,
    pub connect_timeout: Duration,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub block_size: usize,
    pub backpressure: BackpressurePolicy,
    pub interrupt: InterruptPolicy,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub log_level: Level,
}

/// Values given on the command line. Each one takes precedence over its
/// environment variable.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub server_url: Option<String>,
    pub store_slug: Option<String>,
    pub shopper_email: Option<String>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

/// Reads `name` and parses it, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(&Overrides::default())
    }

    /// Loads configuration from the environment, then applies `overrides`.
    pub fn load(overrides: &Overrides) -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let server_url = overrides
            .server_url
            .clone()
            .or_else(|| optional_var("LIVECHAT_SERVER_URL"))
            .unwrap_or_else(|| "ws://localhost:8000".to_string());
        if !["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| server_url.starts_with(scheme))
        {
            return Err(ConfigError::InvalidValue(
                "LIVECHAT_SERVER_URL".to_string(),
                format!("'{}' must start with ws://, wss://, http:// or https://", server_url),
            ));
        }

        let store_slug = overrides
            .store_slug
            .clone()
            .or_else(|| optional_var("LIVECHAT_STORE_SLUG"))
            .ok_or_else(|| ConfigError::MissingVar("LIVECHAT_STORE_SLUG".to_string()))?;
        let shopper_email = overrides
            .shopper_email
            .clone()
            .or_else(|| optional_var("LIVECHAT_SHOPPER_EMAIL"));

        let connect_timeout =
            Duration::from_secs(parse_var("LIVECHAT_CONNECT_TIMEOUT_SECS", 10u64)?);
        let input_sample_rate = parse_var("LIVECHAT_INPUT_SAMPLE_RATE", RELAY_INPUT_SAMPLE_RATE)?;
        let output_sample_rate =
            parse_var("LIVECHAT_OUTPUT_SAMPLE_RATE", RELAY_OUTPUT_SAMPLE_RATE)?;
        let block_size = parse_var("LIVECHAT_BLOCK_SIZE", 4096usize)?;
        for (name, value) in [
            ("LIVECHAT_INPUT_SAMPLE_RATE", input_sample_rate as usize),
            ("LIVECHAT_OUTPUT_SAMPLE_RATE", output_sample_rate as usize),
            ("LIVECHAT_BLOCK_SIZE", block_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
        }

        let backpressure = parse_var("LIVECHAT_BACKPRESSURE", BackpressurePolicy::default())?;
        let interrupt = parse_var("LIVECHAT_INTERRUPT", InterruptPolicy::default())?;

        let input_device = overrides
            .input_device
            .clone()
            .or_else(|| optional_var("LIVECHAT_INPUT_DEVICE"));
        let output_device = overrides
            .output_device
            .clone()
            .or_else(|| optional_var("LIVECHAT_OUTPUT_DEVICE"));

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            server_url,
            store_slug,
            shopper_email,
            connect_timeout,
            input_sample_rate,
            output_sample_rate,
            block_size,
            backpressure,
            interrupt,
            input_device,
            output_device,
            log_level,
        })
    }

    /// Builds the relay endpoint for this storefront and shopper.
    ///
    /// HTTP base URLs are mapped onto their WebSocket counterparts.
    pub fn endpoint(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        let mut url = format!(
            "{}/api/public/{}/live-chat",
            base,
            urlencoding::encode(&self.store_slug)
        );
        if let Some(email) = &self.shopper_email {
            url.push_str("?shopper_email=");
            url.push_str(&urlencoding::encode(email));
        }
        url
    }

    /// Projects the parts of the configuration a session needs.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint(),
            connect_timeout: self.connect_timeout,
            input_sample_rate: self.input_sample_rate,
            output_sample_rate: self.output_sample_rate,
            block_size: self.block_size,
            backpressure: self.backpressure,
            interrupt: self.interrupt,
            ..SessionConfig::default()
        }
    }
}
