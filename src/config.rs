// Configuration File Support
//
// This module provides configuration file parsing for the hostconsole server.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/hostconsole/config.toml

use crate::terminal::allowlist::CommandAllowlist;
use crate::terminal::runner::RunnerConfig;
use crate::terminal::session::SessionConfig;
use crate::terminal::timeout::CommandTimeout;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// HTTP/WebSocket listener and access gate
    pub server: ServerConfig,

    /// Terminal engine tuning
    pub terminal: TerminalConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.level.to_lowercase().parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub bind: IpAddr,

    /// Port to listen on
    pub port: u16,

    /// Role an operator must hold to open a terminal
    pub required_role: String,

    /// Header carrying the role set by the upstream access-control layer
    pub role_header: String,

    /// Header carrying the operator's display name
    pub operator_header: String,

    /// Reject upgrades whose Origin does not match Host
    pub enforce_same_origin: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([127, 0, 0, 1]),
            port: 8080,
            required_role: "superadmin".to_string(),
            role_header: "x-operator-role".to_string(),
            operator_header: "x-operator-name".to_string(),
            enforce_same_origin: true,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Terminal engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Per-command deadline
    pub command_timeout_secs: u64,

    /// Period of the `time` heartbeat
    pub heartbeat_interval_ms: u64,

    /// How long `/stop` waits for a command to wind down
    pub stop_grace_ms: u64,

    /// Inbound request queue capacity
    pub request_queue_capacity: usize,

    /// Line queue capacity in streaming mode
    pub stream_queue_capacity: usize,

    /// Longest accepted output line in streaming mode
    pub max_line_bytes: usize,

    /// How long session teardown waits for background tasks
    pub shutdown_grace_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            heartbeat_interval_ms: 1000,
            stop_grace_ms: 3000,
            request_queue_capacity: 20,
            stream_queue_capacity: 64,
            max_line_bytes: 512 * 1024,
            shutdown_grace_ms: 2000,
        }
    }
}

impl TerminalConfig {
    /// Build per-session settings from this section
    pub fn session_config(&self) -> SessionConfig {
        let runner = RunnerConfig {
            timeout: CommandTimeout::from_secs(self.command_timeout_secs),
            stream_capacity: self.stream_queue_capacity,
            max_line_bytes: self.max_line_bytes,
            ..RunnerConfig::default()
        };

        SessionConfig {
            allowlist: Arc::new(CommandAllowlist::default()),
            runner,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            request_queue: self.request_queue_capacity,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` on the main listener
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            terminal: TerminalConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// Environment overrides are applied on top of the file (or of the
    /// defaults when the file is missing) and the result is validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the merged configuration is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            config
        } else {
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/hostconsole/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "hostconsole", "hostconsole") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if XDG dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("hostconsole").join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - HOSTCONSOLE_LOG_LEVEL
    /// - HOSTCONSOLE_LOG_FORMAT
    /// - HOSTCONSOLE_BIND
    /// - HOSTCONSOLE_PORT
    /// - HOSTCONSOLE_COMMAND_TIMEOUT_SECS
    /// - HOSTCONSOLE_HEARTBEAT_MS
    /// - HOSTCONSOLE_METRICS_ENABLED
    ///
    /// Values that do not parse or are out of range are ignored.
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Logging overrides
        if let Some(level) = var("HOSTCONSOLE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("HOSTCONSOLE_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Server overrides
        if let Some(bind) = var("HOSTCONSOLE_BIND") {
            if let Ok(bind) = bind.parse::<IpAddr>() {
                self.server.bind = bind;
            }
        }
        if let Some(port) = var("HOSTCONSOLE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        // Terminal overrides
        if let Some(timeout) = var("HOSTCONSOLE_COMMAND_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                if timeout > 0 {
                    self.terminal.command_timeout_secs = timeout;
                }
            }
        }
        if let Some(interval) = var("HOSTCONSOLE_HEARTBEAT_MS") {
            if let Ok(interval) = interval.parse::<u64>() {
                if interval > 0 {
                    self.terminal.heartbeat_interval_ms = interval;
                }
            }
        }

        // Metrics overrides
        if let Some(enabled) = var("HOSTCONSOLE_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", self.logging.level),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", self.logging.format),
        }

        if self.server.required_role.trim().is_empty() {
            anyhow::bail!("Required role must not be empty");
        }

        let terminal = &self.terminal;
        if terminal.command_timeout_secs == 0 {
            anyhow::bail!("Command timeout must be > 0");
        }
        if terminal.heartbeat_interval_ms == 0 {
            anyhow::bail!("Heartbeat interval must be > 0");
        }
        if terminal.request_queue_capacity == 0 || terminal.stream_queue_capacity == 0 {
            anyhow::bail!("Queue capacities must be > 0");
        }
        if terminal.max_line_bytes == 0 {
            anyhow::bail!("Maximum line length must be > 0");
        }

        Ok(())
    }
}
