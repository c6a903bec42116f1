use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub relay: RelayConfig,
    pub realtime: RealtimeConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            relay: RelayConfig::from_env()?,
            realtime: RealtimeConfig {
                heartbeat_interval: seconds("WS_HEARTBEAT_SECS", 30)?,
            },
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// How print jobs reach the facilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    /// Submissions are acknowledged in-process.
    Local,
    Http {
        base_url: String,
        api_key: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub transport: TransportMode,
    pub request_timeout: Duration,
    pub queue_tick: Duration,
    pub health_interval: Duration,
    pub heartbeat_window: Duration,
}

impl RelayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let transport = match env::var("RELAY_TRANSPORT")
            .unwrap_or_else(|_| "local".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "local" | "" => TransportMode::Local,
            "http" => {
                let base_url = env::var("RELAY_API_URL")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .ok_or(ConfigError::Missing { name: "RELAY_API_URL" })?;
                TransportMode::Http {
                    base_url,
                    api_key: env::var("RELAY_API_KEY").ok().filter(|key| !key.is_empty()),
                }
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    name: "RELAY_TRANSPORT",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            transport,
            request_timeout: seconds("RELAY_TIMEOUT_SECS", 10)?,
            queue_tick: seconds("QUEUE_TICK_SECS", 30)?,
            health_interval: seconds("RELAY_HEALTH_SECS", 60)?,
            heartbeat_window: seconds("RELAY_HEARTBEAT_WINDOW_SECS", 300)?,
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::Local,
            request_timeout: Duration::from_secs(10),
            queue_tick: Duration::from_secs(30),
            health_interval: Duration::from_secs(60),
            heartbeat_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub heartbeat_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

fn seconds(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .ok_or(ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    Missing { name: &'static str },
    InvalidValue { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::Missing { name } => write!(f, "{name} must be set"),
            ConfigError::InvalidValue { name, value } => {
                write!(f, "{name} has an invalid value '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}
