//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::backends::Backend;
use crate::error::ConfigError;

/// Credential router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Ceiling on failover attempts per dispatch (further capped by the
    /// number of credentials the user holds for the backend).
    pub max_attempts: usize,
    /// Extra attempts against the same credential after a transient failure.
    pub transient_retries: u32,
    /// First backoff delay.
    pub initial_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
    /// UTC hour at which each backend's daily quota resets.
    pub reset_hours: HashMap<Backend, u32>,
    /// Maximum stored credentials per user, across backends.
    pub max_credentials_per_user: usize,
    /// Model requested when the caller does not name one.
    pub default_model: String,
    /// Order in which `dispatch_any` tries backends.
    pub provider_priority: Vec<Backend>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            transient_retries: 2,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
            reset_hours: HashMap::from([
                (Backend::Gemini, 8),
                (Backend::OpenRouter, 0),
                (Backend::Groq, 0),
            ]),
            max_credentials_per_user: 10,
            default_model: "gemini-2.5-flash".to_string(),
            provider_priority: vec![Backend::Groq, Backend::OpenRouter, Backend::Gemini],
        }
    }
}

impl RouterConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// Reset hours are read from `SWITCHBOARD_RESET_HOUR_<BACKEND>`; the
    /// priority list from a comma-separated `SWITCHBOARD_PROVIDER_PRIORITY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut reset_hours = defaults.reset_hours.clone();
        for backend in Backend::ALL {
            let key = format!("SWITCHBOARD_RESET_HOUR_{}", backend.as_str().to_ascii_uppercase());
            if let Some(hour) = parse_env::<u32>(&key)? {
                if hour > 23 {
                    return Err(ConfigError::InvalidValue {
                        key,
                        message: format!("hour must be 0-23, got {hour}"),
                    });
                }
                reset_hours.insert(backend, hour);
            }
        }

        let provider_priority = match std::env::var("SWITCHBOARD_PROVIDER_PRIORITY") {
            Ok(raw) => parse_priority(&raw)?,
            Err(_) => defaults.provider_priority.clone(),
        };

        Ok(Self {
            max_attempts: parse_env("SWITCHBOARD_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            transient_retries: parse_env("SWITCHBOARD_TRANSIENT_RETRIES")?
                .unwrap_or(defaults.transient_retries),
            initial_delay: parse_env("SWITCHBOARD_BACKOFF_INITIAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            backoff_factor: parse_env("SWITCHBOARD_BACKOFF_FACTOR")?
                .unwrap_or(defaults.backoff_factor),
            max_delay: parse_env("SWITCHBOARD_BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            jitter: parse_env("SWITCHBOARD_BACKOFF_JITTER")?.unwrap_or(defaults.jitter),
            reset_hours,
            max_credentials_per_user: parse_env("SWITCHBOARD_MAX_CREDENTIALS")?
                .unwrap_or(defaults.max_credentials_per_user),
            default_model: std::env::var("SWITCHBOARD_DEFAULT_MODEL")
                .unwrap_or(defaults.default_model),
            provider_priority,
        })
    }

    /// Reset hour for `backend`, midnight UTC if unconfigured.
    pub fn reset_hour(&self, backend: Backend) -> u32 {
        self.reset_hours.get(&backend).copied().unwrap_or(0)
    }
}

/// Task scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wall-clock limit for a single node, including its tool round-trip.
    pub node_timeout: Duration,
    /// Largest plan accepted from the planner.
    pub max_nodes: usize,
    /// Model for nodes preferring speed.
    pub fast_model: String,
    /// Model for nodes preferring quality.
    pub smart_model: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(90),
            max_nodes: 6,
            fast_model: "gemini-2.0-flash".to_string(),
            smart_model: "gemini-2.5-flash".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            node_timeout: parse_env("SWITCHBOARD_NODE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.node_timeout),
            max_nodes: parse_env("SWITCHBOARD_MAX_NODES")?.unwrap_or(defaults.max_nodes),
            fast_model: std::env::var("SWITCHBOARD_FAST_MODEL").unwrap_or(defaults.fast_model),
            smart_model: std::env::var("SWITCHBOARD_SMART_MODEL").unwrap_or(defaults.smart_model),
        })
    }
}

/// Progress reporter configuration.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Minimum spacing between two renders.
    pub throttle: Duration,
    /// First line of every render.
    pub header: String,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(800),
            header: "…assembling your team".to_string(),
        }
    }
}

impl ProgressConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            throttle: parse_env("SWITCHBOARD_PROGRESS_THROTTLE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.throttle),
            header: defaults.header,
        })
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// Hex-encoded 32-byte master key for credential encryption.
    pub encryption_key: SecretString,
    /// How often the quota sweeper runs between scheduled reset hours.
    pub sweep_interval: Duration,
    /// Optional log file; stderr only when unset.
    pub log_path: Option<PathBuf>,
    /// Instructions for the fallback node when no usable plan is given.
    pub system_prompt: String,
    pub router: RouterConfig,
    pub scheduler: SchedulerConfig,
    pub progress: ProgressConfig,
}

impl AppConfig {
    /// Load from environment variables. `SWITCHBOARD_ENCRYPTION_KEY` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let encryption_key = std::env::var("SWITCHBOARD_ENCRYPTION_KEY")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingEnvVar("SWITCHBOARD_ENCRYPTION_KEY".to_string()))?;

        Ok(Self {
            db_path: std::env::var("SWITCHBOARD_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/switchboard.db")),
            encryption_key,
            sweep_interval: parse_env("SWITCHBOARD_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(300)),
            log_path: std::env::var("SWITCHBOARD_LOG_PATH").ok().map(PathBuf::from),
            system_prompt: std::env::var("SWITCHBOARD_SYSTEM_PROMPT")
                .unwrap_or_else(|_| "You are a helpful, concise assistant.".to_string()),
            router: RouterConfig::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
            progress: ProgressConfig::from_env()?,
        })
    }
}

/// Read and parse an optional env var. Unset is `None`; unparseable is an error.
fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_priority(raw: &str) -> Result<Vec<Backend>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Backend>().map_err(|message| ConfigError::InvalidValue {
                key: "SWITCHBOARD_PROVIDER_PRIORITY".to_string(),
                message,
            })
        })
        .collect()
}
