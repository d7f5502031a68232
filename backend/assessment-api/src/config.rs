use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Recorder endpoint for completed attempts. When unset the service
    /// keeps submissions in memory.
    pub recorder_url: Option<String>,
    pub recorder_timeout_seconds: u64,
    pub tick_interval_ms: u64,
    pub sse_max_stream_seconds: u32,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            // Fallback to current directory .env for backward compatibility
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let env_name = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let config_builder = config::Config::builder()
            // Load base config from TOML file
            .add_source(
                config::File::with_name(&format!("config/{}", env_name)).required(false), // Allow missing config file, fallback to ENV
            )
            // Override with environment variables (prefix: APP_)
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings = config_builder.build()?;

        // Extract values with fallbacks to ENV or defaults
        let recorder_url = settings
            .get_string("recorder.url")
            .ok()
            .or_else(|| env::var("RECORDER_URL").ok())
            .filter(|v| !v.is_empty());

        if let Some(ref raw) = recorder_url {
            url::Url::parse(raw).map_err(|e| {
                config::ConfigError::Message(format!("Invalid recorder URL '{}': {}", raw, e))
            })?;
        }

        let recorder_timeout_seconds = settings
            .get_int("recorder.timeout_seconds")
            .ok()
            .or_else(|| {
                env::var("RECORDER_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok())
            })
            .filter(|v| *v > 0)
            .unwrap_or(5) as u64;

        let tick_interval_ms = settings
            .get_int("timer.tick_interval_ms")
            .ok()
            .or_else(|| {
                env::var("TICK_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok())
            })
            .filter(|v| *v > 0)
            .unwrap_or(1000) as u64;

        let sse_max_stream_seconds = settings
            .get_int("sse.max_stream_seconds")
            .ok()
            .or_else(|| {
                env::var("SSE_MAX_STREAM_SECONDS")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok())
            })
            .filter(|v| *v > 0)
            .unwrap_or(3600) as u32;

        Ok(Config {
            recorder_url,
            recorder_timeout_seconds,
            tick_interval_ms,
            sse_max_stream_seconds,
        })
    }

    /// Cadence of the countdown. One second in production; tests shrink
    /// it so timeout scenarios finish quickly.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn recorder_timeout(&self) -> Duration {
        Duration::from_secs(self.recorder_timeout_seconds)
    }
}
