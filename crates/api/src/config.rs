//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Database
    pub database_url: String,

    // Webhook ingestion
    /// Reject webhook bodies above this size
    pub webhook_max_body_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,

            webhook_max_body_bytes: env::var("WEBHOOK_MAX_BODY_BYTES")
                .unwrap_or_else(|_| "65536".to_string())
                .parse()
                .unwrap_or(65536),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_missing_database_url_fails() {
        std::env::remove_var("DATABASE_URL");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    #[serial]
    fn test_defaults_apply() {
        std::env::set_var("DATABASE_URL", "postgres://test");
        std::env::remove_var("BIND_ADDRESS");
        std::env::remove_var("WEBHOOK_MAX_BODY_BYTES");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.webhook_max_body_bytes, 65536);

        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn test_garbage_numeric_falls_back() {
        std::env::set_var("DATABASE_URL", "postgres://test");
        std::env::set_var("WEBHOOK_MAX_BODY_BYTES", "not-a-number");

        let config = Config::from_env().unwrap();
        assert_eq!(config.webhook_max_body_bytes, 65536);

        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("WEBHOOK_MAX_BODY_BYTES");
    }
}
