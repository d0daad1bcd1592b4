use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Reconnection schedule: `base_ms * 2^attempt`, capped at `max_delay_ms`,
/// giving up after `max_attempts` consecutive failed cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// Knobs for the simulated transport's demo traffic and forced disconnects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulationConfig {
    /// When false, neither the demo generator nor the chaos ticker run.
    pub enabled: bool,
    pub demo_min_interval: Duration,
    pub demo_max_interval: Duration,
    pub chaos_tick: Duration,
    /// Chance of forcing a disconnect on each chaos tick (0.0..=1.0).
    pub chaos_drop_probability: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            demo_min_interval: Duration::from_secs(30),
            demo_max_interval: Duration::from_secs(120),
            chaos_tick: Duration::from_secs(180),
            chaos_drop_probability: 0.3,
        }
    }
}

impl SimulationConfig {
    /// No background traffic. Used by tests and by callers that only want
    /// explicit `trigger_demo_notification` calls.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Restart policy of a resilience boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RestartPolicy {
    pub base_delay_ms: u64,
    pub max_auto_retries: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_auto_retries: 3,
        }
    }
}

/// Which transport the client binds through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Simulated,
    Persistent,
}

impl FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulated" => Ok(TransportMode::Simulated),
            "persistent" => Ok(TransportMode::Persistent),
            other => Err(anyhow::anyhow!(
                "BEACON_TRANSPORT must be 'simulated' or 'persistent', got '{}'",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string (persistent transport and REST store)
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Listen address of the API server
    pub api_bind_addr: String,

    /// JWT secret for API authentication
    pub jwt_secret: Option<String>,

    /// JWT token expiry in hours
    pub jwt_expiry_hours: u64,

    /// Live endpoint used by the simulated transport
    pub ws_endpoint: String,

    pub transport_mode: TransportMode,

    /// Channel the terminal client binds to
    pub user_id: Option<String>,

    pub reconnect: ReconnectPolicy,

    pub simulation: SimulationConfig,

    pub restart: RestartPolicy,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = SimulationConfig::default();
        let reconnect = ReconnectPolicy::default();
        let restart = RestartPolicy::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            jwt_expiry_hours: env_or("JWT_EXPIRY_HOURS", 24)?,
            ws_endpoint: std::env::var("BEACON_WS_ENDPOINT")
                .unwrap_or_else(|_| "ws://localhost:3000/ws".to_string()),
            transport_mode: env_or("BEACON_TRANSPORT", TransportMode::Simulated)?,
            user_id: std::env::var("BEACON_USER_ID").ok(),
            reconnect: ReconnectPolicy {
                base_ms: env_or("RECONNECT_BASE_MS", reconnect.base_ms)?,
                max_delay_ms: env_or("RECONNECT_MAX_DELAY_MS", reconnect.max_delay_ms)?,
                max_attempts: env_or("RECONNECT_MAX_ATTEMPTS", reconnect.max_attempts)?,
            },
            simulation: SimulationConfig {
                enabled: env_or("DEMO_ENABLED", defaults.enabled)?,
                demo_min_interval: Duration::from_secs(env_or(
                    "DEMO_MIN_INTERVAL_SECS",
                    defaults.demo_min_interval.as_secs(),
                )?),
                demo_max_interval: Duration::from_secs(env_or(
                    "DEMO_MAX_INTERVAL_SECS",
                    defaults.demo_max_interval.as_secs(),
                )?),
                chaos_tick: Duration::from_secs(env_or(
                    "CHAOS_TICK_SECS",
                    defaults.chaos_tick.as_secs(),
                )?),
                chaos_drop_probability: probability_or(
                    "CHAOS_DROP_PROBABILITY",
                    defaults.chaos_drop_probability,
                )?,
            },
            restart: RestartPolicy {
                base_delay_ms: env_or("BOUNDARY_RETRY_BASE_MS", restart.base_delay_ms)?,
                max_auto_retries: env_or("BOUNDARY_MAX_AUTO_RETRIES", restart.max_auto_retries)?,
            },
        })
    }
}

/// Read `key` and parse it, falling back to `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

/// Like [`env_or`], but the value must be a finite number in `0.0..=1.0`.
fn probability_or(key: &str, default: f64) -> anyhow::Result<f64> {
    match std::env::var(key) {
        Ok(raw) => parse_probability(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_probability(key: &str, raw: &str) -> anyhow::Result<f64> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", key, raw))?;
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        anyhow::bail!("{} must be between 0.0 and 1.0, got '{}'", key, raw);
    }
    Ok(value)
}
