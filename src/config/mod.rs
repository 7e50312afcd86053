//! Configuration for the wiretap proxy.
//!
//! The configuration file is YAML (`config.yaml` by default). Parsing is
//! strict about shape but forgiving about omissions: every field carries a
//! default, and `normalize()` expands comma-separated upstream lists before
//! the route table is handed to the router and health monitor.
//!
//! The raw file bytes are also served back over `GET /api/config`, so the
//! file itself is the source of truth rather than a re-serialization.

pub mod targets;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{info, warn};

pub use targets::RouteConfig;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Proxy listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Control listener (inspection UI, live channel, history API)
    #[serde(default)]
    pub web: WebConfig,
    /// Route table and forwarding behavior
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Live push channel tuning
    #[serde(default)]
    pub websocket: WebSocketConfig,
    /// Process log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Listener timeouts, in seconds. Read and write may be zero to allow
/// long-running streaming requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown: u64,
}

/// Control listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    /// Bind host; falls back to `server.host` when absent
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Defaults to true only when the key is absent; an explicit `false`
    /// disables the control listener.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,
}

/// Forwarding configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub targets: Vec<RouteConfig>,
    /// Seconds; applies to health probing, never to forwarded calls
    #[serde(default = "default_proxy_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Milliseconds between retry attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Global outbound HTTP proxy; per-route `http_proxy` wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
}

/// Live push channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSocketConfig {
    /// Per-subscriber read buffer for draining client bytes
    #[serde(default = "default_ws_buffer_size")]
    pub buffer_size: usize,
    /// Bounded broadcast channel depth; overflow drops with a warning
    #[serde(default = "default_broadcast_size")]
    pub broadcast_size: usize,
}

/// Process log configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    9727
}

fn default_web_port() -> u16 {
    9528
}

fn default_true() -> bool {
    true
}

fn default_max_logs() -> usize {
    1000
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_proxy_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_ws_buffer_size() -> usize {
    1024
}

fn default_broadcast_size() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_proxy_port(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read: 0,
            write: 0,
            idle: default_idle_timeout(),
            shutdown: default_shutdown_timeout(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_web_port(),
            enabled: true,
            max_logs: default_max_logs(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            timeout: default_proxy_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            http_proxy: None,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_ws_buffer_size(),
            broadcast_size: default_broadcast_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file with environment variable expansion
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let expanded = expand_env_vars(&content);

        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.normalize();
        config.validate()?;

        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Post-process parsed values: split multi-URL targets, fill per-route
    /// health check defaults, clamp out-of-range values.
    pub fn normalize(&mut self) {
        for route in &mut self.proxy.targets {
            route.normalize();
        }

        if self.websocket.broadcast_size == 0 {
            self.websocket.broadcast_size = default_broadcast_size();
        }
        if self.websocket.buffer_size == 0 {
            self.websocket.buffer_size = default_ws_buffer_size();
        }
        if self.proxy.retry_delay == 0 {
            self.proxy.retry_delay = default_retry_delay();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.proxy.targets.is_empty() {
            warn!("No proxy targets configured - every request will return 404");
        }

        for route in &self.proxy.targets {
            route.validate()?;
        }

        if self.server.port == self.web.port && self.web.enabled {
            return Err(anyhow::anyhow!(
                "server.port and web.port must differ (both are {})",
                self.server.port
            ));
        }

        Ok(())
    }

    /// Control listener bind host
    pub fn web_host(&self) -> &str {
        self.web.host.as_deref().unwrap_or(&self.server.host)
    }
}

/// Expand environment variables in configuration content.
/// Supports ${VAR} and ${VAR:-default} syntax.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_expr = &result[start + 2..start + end];
            let replacement = if let Some(default_pos) = var_expr.find(":-") {
                let var_name = &var_expr[..default_pos];
                let default_value = &var_expr[default_pos + 2..];
                env::var(var_name).unwrap_or_else(|_| default_value.to_string())
            } else {
                env::var(var_expr).unwrap_or_else(|_| {
                    warn!(
                        "Environment variable '{}' not found, using empty string",
                        var_expr
                    );
                    String::new()
                })
            };

            result.replace_range(start..start + end + 1, &replacement);
        } else {
            break; // Malformed ${VAR expression
        }
    }

    result
}
