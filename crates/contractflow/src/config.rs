use std::time::Duration;

use crate::jobs::poller::PollConfig;
use crate::push::{PushConfig, ReconnectConfig};

// Runtime configuration, loaded from the environment (and .env if present)
// into typed sub-configs for each component.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub ws_url: String,
    pub network: String,
    pub http_timeout: Duration,
    pub poll: PollConfig,
    pub push: PushConfig,
}

pub const DEFAULT_API_URL: &str = "http://localhost:3001/api";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let api_url = env_or_fallback("CONTRACTFLOW_API_URL", "API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            anyhow::bail!("CONTRACTFLOW_API_URL must be an http(s) URL, got {api_url}");
        }

        let ws_url = env_or_fallback("CONTRACTFLOW_WS_URL", "WS_URL")
            .unwrap_or_else(|| derive_ws_url(&api_url));

        let network =
            env_or_fallback("CONTRACTFLOW_NETWORK", "NETWORK").unwrap_or_else(|| "testnet".into());

        let http_timeout = Duration::from_secs(env_parse("CONTRACTFLOW_HTTP_TIMEOUT_SECS").unwrap_or(30));

        let poll_defaults = PollConfig::default();
        let poll = PollConfig {
            interval: env_parse("CONTRACTFLOW_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(poll_defaults.interval),
            compile_attempts: env_parse("CONTRACTFLOW_COMPILE_POLL_ATTEMPTS")
                .unwrap_or(poll_defaults.compile_attempts)
                .max(1),
            deploy_attempts: env_parse("CONTRACTFLOW_DEPLOY_POLL_ATTEMPTS")
                .unwrap_or(poll_defaults.deploy_attempts)
                .max(1),
        };

        let push_defaults = PushConfig::default();
        let push = PushConfig {
            reconnect: ReconnectConfig {
                max_attempts: env_parse("CONTRACTFLOW_RECONNECT_ATTEMPTS")
                    .unwrap_or(push_defaults.reconnect.max_attempts)
                    .max(1),
                base_ms: env_parse("CONTRACTFLOW_RECONNECT_DELAY_MS")
                    .unwrap_or(push_defaults.reconnect.base_ms),
                ..push_defaults.reconnect
            },
            join_wait: env_parse("CONTRACTFLOW_JOIN_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(push_defaults.join_wait),
            event_buffer: push_defaults.event_buffer,
        };

        Ok(Self {
            api_url,
            ws_url,
            network,
            http_timeout,
            poll,
            push,
        })
    }
}

/// `https://host/api` -> `wss://host/ws`
pub fn derive_ws_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = base.strip_suffix("/api").unwrap_or(base);
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws")
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
