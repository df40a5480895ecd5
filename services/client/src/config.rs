use reqwest::Url;
use std::time::Duration;
use tracing::Level;
use voicelink_core::audio::PLAYBACK_SAMPLE_RATE;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Settings for one [`VoiceClient`](crate::VoiceClient).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub ws_url: Url,
    /// `None` disables the health check.
    pub health_url: Option<Url>,
    pub user_id: Option<String>,
    /// Connection attempts per `start_session` or `reconnect_session`.
    pub connect_attempts: u32,
    /// Attempt `n` that fails is followed by a wait of `n * backoff_step`.
    pub backoff_step: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on waiting for the close handshake during `end_session`.
    pub end_timeout: Duration,
    /// Upper bound on a single socket write; a peer that stops reading
    /// cannot hold the connection past it.
    pub send_timeout: Duration,
    pub playback_sample_rate: u32,
    pub log_level: Level,
}

impl ClientConfig {
    /// Builds a configuration with defaults for everything but the endpoint.
    pub fn new(ws_url: &str) -> Result<Self, ConfigError> {
        let ws_url = parse_ws_url(ws_url)?;
        Ok(Self {
            health_url: Some(health_url_for(&ws_url)),
            ws_url,
            user_id: None,
            connect_attempts: 3,
            backoff_step: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            end_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(5),
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            log_level: Level::INFO,
        })
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let ws_url = std::env::var("VOICE_WS_URL")
            .map_err(|_| ConfigError::MissingVar("VOICE_WS_URL".to_string()))?;
        let mut config = Self::new(&ws_url)?;

        if let Ok(health) = std::env::var("VOICE_HEALTH_URL") {
            config.health_url = Some(Url::parse(&health).map_err(|e| {
                ConfigError::InvalidValue("VOICE_HEALTH_URL".to_string(), e.to_string())
            })?);
        }
        if let Ok(enabled) = std::env::var("VOICE_HEALTH_CHECK") {
            let enabled = enabled.parse::<bool>().map_err(|_| {
                ConfigError::InvalidValue(
                    "VOICE_HEALTH_CHECK".to_string(),
                    format!("'{}' is not true or false", enabled),
                )
            })?;
            if !enabled {
                config.health_url = None;
            }
        }

        config.user_id = std::env::var("VOICE_USER_ID").ok().filter(|s| !s.is_empty());

        if let Some(attempts) = env_number::<u32>("VOICE_CONNECT_ATTEMPTS")? {
            if attempts == 0 {
                return Err(ConfigError::InvalidValue(
                    "VOICE_CONNECT_ATTEMPTS".to_string(),
                    "must be at least 1".to_string(),
                ));
            }
            config.connect_attempts = attempts;
        }
        if let Some(ms) = env_number::<u64>("VOICE_BACKOFF_MS")? {
            config.backoff_step = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("VOICE_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("VOICE_END_TIMEOUT_MS")? {
            config.end_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("VOICE_SEND_TIMEOUT_MS")? {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(rate) = env_number::<u32>("VOICE_PLAYBACK_RATE")? {
            config.playback_sample_rate = rate;
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        config.log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(config)
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

fn env_number<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}

fn parse_ws_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidValue("VOICE_WS_URL".to_string(), e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidValue(
            "VOICE_WS_URL".to_string(),
            format!("unsupported scheme '{}', expected ws or wss", other),
        )),
    }
}

/// The health endpoint served next to a WebSocket endpoint.
pub fn health_url_for(ws_url: &Url) -> Url {
    let mut url = ws_url.clone();
    let scheme = if ws_url.scheme() == "wss" { "https" } else { "http" };
    // Switching between these special schemes cannot fail.
    let _ = url.set_scheme(scheme);
    url.set_path("/api/health");
    url.set_query(None);
    url.set_fragment(None);
    url
}
