use crate::error::{GatehouseError, Result};
use std::env;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway HTTP server configuration
    pub gateway: GatewayServerConfig,
    /// Upstream egress proxy configuration
    pub upstream: UpstreamProxyConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Resource pool configuration
    pub pool: PoolConfig,
    /// Session registry configuration
    pub session: SessionConfig,
    /// Geographic spoofing profile
    pub spoof: SpoofConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    /// Port to listen on (default: 8000)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Externally visible base path for proxied resources (default: /proxy)
    pub public_base: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
    /// Overall fetch timeout in seconds
    pub request_timeout: u64,
    /// WebSocket heartbeat interval in seconds
    pub heartbeat_interval: u64,
    /// Seconds without a client ping before a connection is force-closed
    pub heartbeat_timeout: u64,
}

/// Scheme used to reach the upstream commercial proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Socks5,
}

impl UpstreamScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Socks5 => "socks5",
        }
    }
}

/// Rotation mode for upstream egress identities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationMode {
    /// Each session keeps one egress identity for its lifetime
    #[default]
    Sticky,
    /// Every request may exit through a different identity
    Rotating,
}

impl RotationMode {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "rotating" | "rotate" => Self::Rotating,
            _ => Self::Sticky,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamProxyConfig {
    /// Upstream proxy server as host:port
    pub server: String,
    /// Scheme used to reach the upstream proxy
    pub scheme: UpstreamScheme,
    /// Base credential (username) for the upstream proxy
    pub username: String,
    /// Password for the upstream proxy
    pub password: String,
    /// Requested egress country tag (empty = unset)
    pub country: String,
    /// Requested egress region/state tag (empty = unset)
    pub region: String,
    /// Requested egress city tag (empty = unset)
    pub city: String,
    /// Fixed pool of sticky egress tokens, assigned round-robin
    pub sticky_tokens: Vec<String>,
    /// Sticky vs rotating egress
    pub rotation: RotationMode,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests per minute per client identity
    pub requests_per_minute: u32,
    /// Burst size over the 5-second window
    pub burst_size: u32,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of pooled resources
    pub max_size: usize,
    /// Seconds a free resource may sit idle before reclamation
    pub idle_timeout: u64,
    /// Seconds a caller may wait for a resource to free up
    pub acquire_timeout: u64,
    /// Poll interval in milliseconds while waiting for a free resource
    pub poll_interval_ms: u64,
    /// How often the idle reaper runs, in seconds
    pub reap_interval: u64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Seconds of inactivity before a session is evicted
    pub idle_timeout: u64,
    /// How often the idle sweep runs, in seconds
    pub sweep_interval: u64,
    /// Hard cap on concurrently tracked sessions
    pub max_sessions: usize,
    /// Maximum navigation history entries kept per session
    pub history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct SpoofConfig {
    /// Timezone presented to fetched pages
    pub timezone: String,
    /// Preferred language presented to fetched pages
    pub language: String,
    /// Locale tag
    pub locale: String,
    /// ISO country code
    pub country_code: String,
    /// Latitude reported by the geolocation override
    pub latitude: f64,
    /// Longitude reported by the geolocation override
    pub longitude: f64,
    /// Accuracy in meters reported by the geolocation override
    pub accuracy: u32,
    /// Literal text substitutions applied to visible content (from, to)
    pub substitutions: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            gateway: GatewayServerConfig {
                port: get_env_or("GATEWAY_PORT", "8000").parse().map_err(|_| {
                    GatehouseError::InvalidConfig("GATEWAY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("GATEWAY_HOST", "0.0.0.0"),
                public_base: normalize_base_path(&get_env_or("GATEWAY_PUBLIC_BASE", "/proxy")),
                cors_origins: get_env_or("CORS_ORIGINS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                request_timeout: get_env_or("GATEWAY_REQUEST_TIMEOUT", "30")
                    .parse()
                    .unwrap_or(30),
                heartbeat_interval: get_env_or("GATEWAY_HEARTBEAT_INTERVAL", "30")
                    .parse()
                    .unwrap_or(30),
                heartbeat_timeout: get_env_or("GATEWAY_HEARTBEAT_TIMEOUT", "120")
                    .parse()
                    .unwrap_or(120),
            },
            upstream: parse_upstream_proxy()?,
            rate_limit: RateLimitConfig {
                enabled: get_env_or("RATE_LIMIT_ENABLED", "true").parse().unwrap_or(true),
                requests_per_minute: get_env_or("RATE_LIMIT_PER_MINUTE", "100")
                    .parse()
                    .unwrap_or(100),
                burst_size: get_env_or("RATE_LIMIT_BURST", "20").parse().unwrap_or(20),
            },
            pool: PoolConfig {
                max_size: get_env_or("GATEWAY_POOL_SIZE", "10").parse().unwrap_or(10),
                idle_timeout: get_env_or("GATEWAY_POOL_IDLE_TIMEOUT", "300")
                    .parse()
                    .unwrap_or(300),
                acquire_timeout: get_env_or("GATEWAY_POOL_ACQUIRE_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                poll_interval_ms: get_env_or("GATEWAY_POOL_POLL_INTERVAL_MS", "250")
                    .parse()
                    .unwrap_or(250),
                reap_interval: get_env_or("GATEWAY_POOL_REAP_INTERVAL", "60")
                    .parse()
                    .unwrap_or(60),
            },
            session: SessionConfig {
                idle_timeout: get_env_or("SESSION_IDLE_TIMEOUT", "3600")
                    .parse()
                    .unwrap_or(3600),
                sweep_interval: get_env_or("SESSION_SWEEP_INTERVAL", "300")
                    .parse()
                    .unwrap_or(300),
                max_sessions: get_env_or("SESSION_MAX_COUNT", "10000")
                    .parse()
                    .unwrap_or(10000),
                history_limit: get_env_or("SESSION_HISTORY_LIMIT", "100")
                    .parse()
                    .unwrap_or(100),
            },
            spoof: SpoofConfig {
                timezone: get_env_or("SPOOF_TIMEZONE", "America/New_York"),
                language: get_env_or("SPOOF_LANGUAGE", "en-US"),
                locale: get_env_or("SPOOF_LOCALE", "en_US"),
                country_code: get_env_or("SPOOF_COUNTRY_CODE", "US"),
                latitude: get_env_or("SPOOF_LATITUDE", "40.7128").parse().unwrap_or(40.7128),
                longitude: get_env_or("SPOOF_LONGITUDE", "-74.0060")
                    .parse()
                    .unwrap_or(-74.0060),
                accuracy: get_env_or("SPOOF_ACCURACY", "100").parse().unwrap_or(100),
                substitutions: parse_substitutions(&get_env_or("GATEWAY_TEXT_SUBSTITUTIONS", "")),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Get the gateway bind address
    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}

fn parse_upstream_proxy() -> Result<UpstreamProxyConfig> {
    let server = get_env_or("UPSTREAM_PROXY_SERVER", "");
    if !server.is_empty() {
        // Validate host:port shape early so a typo fails at startup, not on
        // the first fetch.
        let probe = format!("http://{}", server);
        let url = Url::parse(&probe).map_err(|e| {
            GatehouseError::InvalidConfig(format!(
                "UPSTREAM_PROXY_SERVER must be host:port: {}",
                e
            ))
        })?;
        if url.host_str().is_none() {
            return Err(GatehouseError::InvalidConfig(
                "UPSTREAM_PROXY_SERVER must include a host".into(),
            ));
        }
    }

    let scheme = match get_env_or("UPSTREAM_PROXY_SCHEME", "http").to_lowercase().as_str() {
        "http" | "https" => UpstreamScheme::Http,
        "socks5" | "socks5h" => UpstreamScheme::Socks5,
        other => {
            return Err(GatehouseError::InvalidConfig(format!(
                "UPSTREAM_PROXY_SCHEME has unsupported value: {}",
                other
            )))
        }
    };

    let sticky_tokens: Vec<String> = get_env_or("UPSTREAM_STICKY_TOKENS", "")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(UpstreamProxyConfig {
        server,
        scheme,
        username: get_env_or("UPSTREAM_PROXY_USERNAME", ""),
        password: get_env_or("UPSTREAM_PROXY_PASSWORD", ""),
        country: get_env_or("UPSTREAM_COUNTRY", ""),
        region: get_env_or("UPSTREAM_REGION", ""),
        city: get_env_or("UPSTREAM_CITY", ""),
        sticky_tokens,
        rotation: RotationMode::from_str(&get_env_or("UPSTREAM_ROTATION", "sticky")),
    })
}

/// Parse `from=>to;from=>to` substitution pairs
fn parse_substitutions(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| {
            let (from, to) = pair.split_once("=>")?;
            let from = from.trim();
            if from.is_empty() {
                return None;
            }
            Some((from.to_string(), to.trim().to_string()))
        })
        .collect()
}

/// Ensure the public base path has a leading slash and no trailing slash
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/proxy".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "GATEWAY_PORT",
        "GATEWAY_HOST",
        "GATEWAY_PUBLIC_BASE",
        "CORS_ORIGINS",
        "GATEWAY_REQUEST_TIMEOUT",
        "GATEWAY_HEARTBEAT_INTERVAL",
        "GATEWAY_HEARTBEAT_TIMEOUT",
        "UPSTREAM_PROXY_SERVER",
        "UPSTREAM_PROXY_SCHEME",
        "UPSTREAM_PROXY_USERNAME",
        "UPSTREAM_PROXY_PASSWORD",
        "UPSTREAM_COUNTRY",
        "UPSTREAM_REGION",
        "UPSTREAM_CITY",
        "UPSTREAM_STICKY_TOKENS",
        "UPSTREAM_ROTATION",
        "RATE_LIMIT_ENABLED",
        "RATE_LIMIT_PER_MINUTE",
        "RATE_LIMIT_BURST",
        "GATEWAY_POOL_SIZE",
        "GATEWAY_POOL_IDLE_TIMEOUT",
        "GATEWAY_POOL_ACQUIRE_TIMEOUT",
        "GATEWAY_POOL_POLL_INTERVAL_MS",
        "GATEWAY_POOL_REAP_INTERVAL",
        "SESSION_IDLE_TIMEOUT",
        "SESSION_SWEEP_INTERVAL",
        "SESSION_MAX_COUNT",
        "SESSION_HISTORY_LIMIT",
        "SPOOF_TIMEZONE",
        "SPOOF_LANGUAGE",
        "SPOOF_LOCALE",
        "SPOOF_COUNTRY_CODE",
        "SPOOF_LATITUDE",
        "SPOOF_LONGITUDE",
        "SPOOF_ACCURACY",
        "GATEWAY_TEXT_SUBSTITUTIONS",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.gateway.port, 8000);
        assert_eq!(config.gateway.host, "0.0.0.0");
        assert_eq!(config.gateway.public_base, "/proxy");
        assert!(config.gateway.cors_origins.is_empty());

        assert_eq!(config.upstream.scheme, UpstreamScheme::Http);
        assert!(config.upstream.sticky_tokens.is_empty());
        assert_eq!(config.upstream.rotation, RotationMode::Sticky);

        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.requests_per_minute, 100);
        assert_eq!(config.rate_limit.burst_size, 20);

        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.session.idle_timeout, 3600);
        assert_eq!(config.session.history_limit, 100);

        assert_eq!(config.spoof.timezone, "America/New_York");
        assert!(config.spoof.substitutions.is_empty());
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GATEWAY_PORT", "9000");
        env::set_var("GATEWAY_PUBLIC_BASE", "gw/");
        env::set_var("UPSTREAM_PROXY_SERVER", "pg.egress.example:20002");
        env::set_var("UPSTREAM_PROXY_SCHEME", "socks5");
        env::set_var("UPSTREAM_PROXY_USERNAME", "cust123");
        env::set_var("UPSTREAM_STICKY_TOKENS", "aaa, bbb,ccc,");
        env::set_var("UPSTREAM_ROTATION", "rotating");
        env::set_var("RATE_LIMIT_PER_MINUTE", "250");
        env::set_var(
            "GATEWAY_TEXT_SUBSTITUTIONS",
            "Frankfurt=>New York;Deutsche Telekom=>Cloudflare, Inc.",
        );

        let config = Config::from_env().unwrap();

        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.public_base, "/gw");
        assert_eq!(config.upstream.server, "pg.egress.example:20002");
        assert_eq!(config.upstream.scheme, UpstreamScheme::Socks5);
        assert_eq!(config.upstream.username, "cust123");
        assert_eq!(
            config.upstream.sticky_tokens,
            vec!["aaa".to_string(), "bbb".to_string(), "ccc".to_string()]
        );
        assert_eq!(config.upstream.rotation, RotationMode::Rotating);
        assert_eq!(config.rate_limit.requests_per_minute, 250);
        assert_eq!(
            config.spoof.substitutions,
            vec![
                ("Frankfurt".to_string(), "New York".to_string()),
                (
                    "Deutsche Telekom".to_string(),
                    "Cloudflare, Inc.".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GATEWAY_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatehouseError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_upstream_scheme() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("UPSTREAM_PROXY_SCHEME", "gopher");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatehouseError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_upstream_server() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("UPSTREAM_PROXY_SERVER", "not a host");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatehouseError::InvalidConfig(_)));
    }

    #[test]
    fn test_gateway_addr_format() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();
        assert_eq!(config.gateway_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn test_parse_substitutions_malformed_pairs_skipped() {
        let parsed = parse_substitutions("a=>b;no-arrow;=>empty-from;c=>d");
        assert_eq!(
            parsed,
            vec![
                ("a".to_string(), "b".to_string()),
                ("c".to_string(), "d".to_string()),
            ]
        );
    }

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path("/proxy"), "/proxy");
        assert_eq!(normalize_base_path("/proxy/"), "/proxy");
        assert_eq!(normalize_base_path("gw"), "/gw");
        assert_eq!(normalize_base_path(""), "/proxy");
    }
}
