//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
    /// Other hostnames this instance answers to.
    ///
    /// WebFinger and local-target matching accept these in addition to `domain`.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Return true when `host` names this instance (primary domain or alias).
    pub fn is_local_host(&self, host: &str) -> bool {
        let host = normalized_server_host(host);
        normalized_server_host(&self.domain) == host
            || self
                .aliases
                .iter()
                .any(|alias| normalized_server_host(alias) == host)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation (outbound HTTP and key material) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Timeout applied to every remote fetch and delivery
    pub request_timeout_seconds: u64,
    /// Maximum concurrent deliveries during fan-out
    pub delivery_concurrency: usize,
    /// RSA modulus size for newly generated actor keys
    pub key_bits: usize,
    /// Permit remote fetches to loopback/private addresses (development only)
    #[serde(default)]
    pub allow_private_addresses: bool,
    /// User-Agent sent with outbound requests
    pub user_agent: String,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 10,
            delivery_concurrency: 10,
            key_bits: 2048,
            allow_private_addresses: false,
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("Pubgate/{}", env!("CARGO_PKG_VERSION"))
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (PUBGATE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("server.aliases", Vec::<String>::new())?
            .set_default("database.path", "data/pubgate.db")?
            .set_default("federation.request_timeout_seconds", 10)?
            .set_default("federation.delivery_concurrency", 10)?
            .set_default("federation.key_bits", 2048)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("federation.user_agent", default_user_agent())?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (PUBGATE__*)
            .add_source(
                Environment::with_prefix("PUBGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.aliases")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_KEY_BITS: usize = 1024;

        if self.federation.key_bits < MIN_KEY_BITS {
            return Err(crate::error::AppError::Config(format!(
                "federation.key_bits must be at least {}",
                MIN_KEY_BITS
            )));
        }

        if self.federation.delivery_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.federation.request_timeout_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                let host = normalized_server_host(&self.server.domain);
                tracing::warn!(
                    host = %host,
                    protocol = %self.server.protocol,
                    "Serving federation over plain http for local development"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.federation.allow_private_addresses {
            tracing::warn!("federation.allow_private_addresses is enabled; SSRF guard is off");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
                aliases: vec![],
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/pubgate-test.db"),
            },
            federation: FederationConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();
        config.server.protocol = "http".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }

    #[test]
    fn validate_rejects_tiny_keys_and_zero_concurrency() {
        let mut config = valid_config();
        config.federation.key_bits = 512;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.federation.delivery_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn is_local_host_matches_domain_and_aliases_case_insensitively() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();
        config.server.aliases = vec!["www.social.example.com".to_string()];

        assert!(config.server.is_local_host("SOCIAL.example.com"));
        assert!(config.server.is_local_host("www.social.example.com"));
        assert!(!config.server.is_local_host("evil.example.com"));
    }

    #[test]
    fn base_url_combines_protocol_and_domain() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();
        config.server.protocol = "https".to_string();
        assert_eq!(config.server.base_url(), "https://social.example.com");
    }
}
