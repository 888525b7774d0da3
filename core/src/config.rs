/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8787";
const USAGE: &str = "[--api-url <url>] [--poll-ms <ms>] [--timeout-ms <ms>] [--single-send]";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the chat backend (no trailing slash required)
    pub api_base_url: String,

    /// Interval between poll ticks for the active conversation
    pub poll_interval: Duration,

    /// Upper bound for every backend request
    pub request_timeout: Duration,

    /// Reject a send while a previous one is still awaiting the backend
    pub single_outstanding_send: bool,

    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            single_outstanding_send: false,
            event_buffer: 256,
        }
    }
}

impl Config {
    /// Create config from command line flags. Flags the engine does not know are left for
    /// the caller; see `main.rs`.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config(format!("--api-url requires a value. Usage: {}", USAGE))
                    })?;
                    config.api_base_url = url.clone();
                    i += 2;
                }
                "--poll-ms" => {
                    config.poll_interval = parse_millis(args.get(i + 1), "--poll-ms")?;
                    i += 2;
                }
                "--timeout-ms" => {
                    config.request_timeout = parse_millis(args.get(i + 1), "--timeout-ms")?;
                    i += 2;
                }
                "--single-send" => {
                    config.single_outstanding_send = true;
                    i += 1;
                }
                _ => {
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("ESTATECHAT_API_URL") {
            if !url.trim().is_empty() {
                config.api_base_url = url;
            }
        }
        if let Some(ms) = std::env::var("ESTATECHAT_POLL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = std::env::var("ESTATECHAT_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.request_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(ChatError::Config("api base url is empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ChatError::Config("poll interval must be positive".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(ChatError::Config("request timeout must be positive".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(ChatError::Config("event buffer must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_millis(value: Option<&String>, flag: &str) -> Result<Duration> {
    let raw = value.ok_or_else(|| {
        ChatError::Config(format!("{} requires a value. Usage: {}", flag, USAGE))
    })?;
    raw.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ChatError::Config(format!("{} must be a number of milliseconds", flag)))
}
