//! Configuration management via environment variables
//!
//! Loads configuration from environment variables with .env file support.
//! Parsing is fatal at startup and never at request time.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;

use crate::error::{BouncerError, Result};
use crate::lapi::{LapiAuth, TlsAuth};
use crate::remediation::Remediation;
use crate::resolver::BouncingLevel;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub cache: CacheSettings,
    pub lapi: LapiSettings,
    pub bouncing: BouncingSettings,
    pub geo: GeoSettings,
}

/// Server binding configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub upstream_url: String,
    pub timeout: Duration,
    pub preserve_host: bool,
}

/// Cache backend selection
#[derive(Debug, Clone, PartialEq)]
pub enum CacheSystem {
    Filesystem,
    #[cfg(feature = "redis-storage")]
    Redis,
    #[cfg(feature = "memcached-storage")]
    Memcached,
}

/// Cache store settings
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub system: CacheSystem,
    pub fs_cache_path: PathBuf,
    pub redis_dsn: Option<String>,
    pub memcached_dsn: Option<String>,
    pub clean_ip_cache_duration: u64,
    pub bad_ip_cache_duration: u64,
    pub captcha_cache_duration: u64,
    pub geolocation_cache_duration: u64,
}

/// Decision feed connection settings
#[derive(Debug, Clone)]
pub struct LapiSettings {
    pub api_url: String,
    pub auth: LapiAuth,
    pub timeout: Duration,
    pub user_agent: String,
    pub use_curl: bool,
}

/// Bouncing behavior settings
#[derive(Debug, Clone)]
pub struct BouncingSettings {
    pub stream_mode: bool,
    pub stream_refresh_frequency: Duration,
    pub fallback_remediation: Remediation,
    pub bouncing_level: BouncingLevel,
    pub max_remediation_level: Remediation,
    pub trust_ip_forward_array: Vec<IpNet>,
    pub excluded_uris: Vec<String>,
    pub forced_test_ip: Option<String>,
    pub forced_test_forwarded_ip: Option<String>,
    /// Cleared when `FORCED_TEST_FORWARDED_IP=disabled`.
    pub honour_forwarded: bool,
    pub display_errors: bool,
}

/// Geolocation settings
#[derive(Debug, Clone)]
pub struct GeoSettings {
    pub enabled: bool,
    pub provider_type: String,
    pub database_type: Option<String>,
    pub database_path: Option<PathBuf>,
    pub save_result: bool,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Reads .env file if present, then parses environment variables.
    /// Returns error if required variables are missing or invalid.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerConfig::from_env()?,
            proxy: ProxyConfig::from_env()?,
            cache: CacheSettings::from_env()?,
            lapi: LapiSettings::from_env()?,
            bouncing: BouncingSettings::from_env()?,
            geo: GeoSettings::from_env()?,
        })
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<bool>()
        .map_err(|e| BouncerError::Config(format!("Invalid {name}: {e}")))
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u64>()
        .map_err(|e| BouncerError::Config(format!("Invalid {name}: {e}")))
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|e| BouncerError::Config(format!("Invalid SERVER_PORT: {e}")))?;

        Ok(Self { host, port })
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let upstream_url = env::var("PROXY_UPSTREAM_URL")
            .map_err(|_| BouncerError::Config("PROXY_UPSTREAM_URL is required".to_string()))?;

        let timeout_secs = env_u64("PROXY_TIMEOUT_SECS", 30)?;
        let preserve_host = env_bool("PROXY_PRESERVE_HOST", false)?;

        Ok(Self {
            upstream_url,
            timeout: Duration::from_secs(timeout_secs),
            preserve_host,
        })
    }
}

impl CacheSettings {
    pub fn from_env() -> Result<Self> {
        let system_str = env::var("CACHE_SYSTEM").unwrap_or_else(|_| "filesystem".to_string());

        let system = match system_str.to_lowercase().as_str() {
            "filesystem" => CacheSystem::Filesystem,
            #[cfg(feature = "redis-storage")]
            "redis" => CacheSystem::Redis,
            #[cfg(feature = "memcached-storage")]
            "memcached" => CacheSystem::Memcached,
            _ => {
                return Err(BouncerError::Config(format!(
                    "Invalid CACHE_SYSTEM: {system_str}. Expected 'filesystem', 'redis' or 'memcached'"
                )));
            }
        };

        let fs_cache_path = PathBuf::from(
            env::var("FS_CACHE_PATH").unwrap_or_else(|_| ".threatgate-cache".to_string()),
        );

        let redis_dsn = env::var("REDIS_DSN").ok();
        #[cfg(feature = "redis-storage")]
        if system == CacheSystem::Redis && redis_dsn.is_none() {
            return Err(BouncerError::Config(
                "REDIS_DSN is required when using the redis cache".to_string(),
            ));
        }

        let memcached_dsn = env::var("MEMCACHED_DSN").ok();
        #[cfg(feature = "memcached-storage")]
        if system == CacheSystem::Memcached && memcached_dsn.is_none() {
            return Err(BouncerError::Config(
                "MEMCACHED_DSN is required when using the memcached cache".to_string(),
            ));
        }

        Ok(Self {
            system,
            fs_cache_path,
            redis_dsn,
            memcached_dsn,
            clean_ip_cache_duration: env_u64("CLEAN_IP_CACHE_DURATION", 60)?,
            bad_ip_cache_duration: env_u64("BAD_IP_CACHE_DURATION", 120)?,
            captcha_cache_duration: env_u64("CAPTCHA_CACHE_DURATION", 86400)?,
            geolocation_cache_duration: env_u64("GEOLOCATION_CACHE_DURATION", 86400)?,
        })
    }
}

impl LapiSettings {
    pub fn from_env() -> Result<Self> {
        let api_url = env::var("API_URL")
            .map_err(|_| BouncerError::Config("API_URL is required".to_string()))?;

        let api_key = env::var("API_KEY").ok().filter(|s| !s.is_empty());
        let tls_cert_path = env::var("TLS_CERT_PATH").ok().filter(|s| !s.is_empty());

        let auth = match (api_key, tls_cert_path) {
            (Some(_), Some(_)) => {
                return Err(BouncerError::Config(
                    "API_KEY and TLS_CERT_PATH are mutually exclusive".to_string(),
                ));
            }
            (Some(key), None) => LapiAuth::ApiKey(key),
            (None, Some(cert_path)) => {
                let key_path = env::var("TLS_KEY_PATH").map_err(|_| {
                    BouncerError::Config("TLS_KEY_PATH is required with TLS_CERT_PATH".to_string())
                })?;
                LapiAuth::MutualTls(TlsAuth {
                    cert_path: PathBuf::from(cert_path),
                    key_path: PathBuf::from(key_path),
                    ca_cert_path: env::var("TLS_CA_CERT_PATH").ok().map(PathBuf::from),
                    verify_peer: env_bool("TLS_VERIFY_PEER", true)?,
                })
            }
            (None, None) => {
                return Err(BouncerError::Config(
                    "either API_KEY or TLS_CERT_PATH is required".to_string(),
                ));
            }
        };

        let timeout_secs = env_u64("API_TIMEOUT_SECS", 1)?;
        let user_agent = env::var("API_USER_AGENT")
            .unwrap_or_else(|_| format!("threatgate/{}", env!("CARGO_PKG_VERSION")));
        let use_curl = env_bool("USE_CURL", false)?;

        Ok(Self {
            api_url,
            auth,
            timeout: Duration::from_secs(timeout_secs),
            user_agent,
            use_curl,
        })
    }
}

impl BouncingSettings {
    pub fn from_env() -> Result<Self> {
        let stream_mode = env_bool("STREAM_MODE", false)?;
        let stream_refresh_frequency =
            Duration::from_secs(env_u64("STREAM_REFRESH_FREQUENCY_SECS", 60)?);

        let fallback_str =
            env::var("FALLBACK_REMEDIATION").unwrap_or_else(|_| "captcha".to_string());
        let fallback_remediation = Remediation::from_exact(&fallback_str).map_err(|_| {
            BouncerError::Config(format!("Invalid FALLBACK_REMEDIATION: {fallback_str}"))
        })?;

        let level_str = env::var("BOUNCING_LEVEL").unwrap_or_else(|_| "normal".to_string());
        let bouncing_level = BouncingLevel::parse(&level_str)
            .map_err(|_| BouncerError::Config(format!("Invalid BOUNCING_LEVEL: {level_str}")))?;

        let max_str = env::var("MAX_REMEDIATION_LEVEL").unwrap_or_else(|_| "ban".to_string());
        let max_remediation_level = Remediation::from_exact(&max_str).map_err(|_| {
            BouncerError::Config(format!("Invalid MAX_REMEDIATION_LEVEL: {max_str}"))
        })?;

        let mut trust_ip_forward_array = Vec::new();
        for raw in env_list("TRUST_IP_FORWARD_ARRAY") {
            let net = if raw.contains('/') {
                raw.parse::<IpNet>().map_err(|_| {
                    BouncerError::Config(format!("Invalid TRUST_IP_FORWARD_ARRAY entry: {raw}"))
                })
            } else {
                raw.parse::<std::net::IpAddr>().map(IpNet::from).map_err(|_| {
                    BouncerError::Config(format!("Invalid TRUST_IP_FORWARD_ARRAY entry: {raw}"))
                })
            };
            trust_ip_forward_array.push(net?);
        }

        let excluded_uris = env_list("EXCLUDED_URIS");

        let forced_test_ip = env::var("FORCED_TEST_IP").ok().filter(|s| !s.is_empty());
        let forced_raw = env::var("FORCED_TEST_FORWARDED_IP")
            .ok()
            .filter(|s| !s.is_empty());
        let honour_forwarded = forced_raw.as_deref() != Some("disabled");
        let forced_test_forwarded_ip = forced_raw.filter(|s| s != "disabled");

        let display_errors = env_bool("DISPLAY_ERRORS", false)?;

        Ok(Self {
            stream_mode,
            stream_refresh_frequency,
            fallback_remediation,
            bouncing_level,
            max_remediation_level,
            trust_ip_forward_array,
            excluded_uris,
            forced_test_ip,
            forced_test_forwarded_ip,
            honour_forwarded,
            display_errors,
        })
    }
}

impl GeoSettings {
    pub fn from_env() -> Result<Self> {
        let enabled = env_bool("GEOLOCATION_ENABLED", false)?;
        let provider_type = env::var("GEOLOCATION_TYPE").unwrap_or_else(|_| "maxmind".to_string());
        let database_type = env::var("GEOLOCATION_MAXMIND_DATABASE_TYPE").ok();
        let database_path = env::var("GEOLOCATION_MAXMIND_DATABASE_PATH")
            .ok()
            .map(PathBuf::from);

        if enabled && provider_type == "maxmind" && database_path.is_none() {
            return Err(BouncerError::Config(
                "GEOLOCATION_MAXMIND_DATABASE_PATH is required when geolocation is enabled"
                    .to_string(),
            ));
        }

        let save_result = env_bool("GEOLOCATION_SAVE_RESULT", true)?;

        Ok(Self {
            enabled,
            provider_type,
            database_type,
            database_path,
            save_result,
        })
    }
}
