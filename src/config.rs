// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::rabbitmq::{BindingTable, RetryPolicy};

pub const CONFIG_FILE_NAME: &str = "rabbit-rpc.json";

// Configuration structures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Topic exchange shared by every service.
    pub exchange: String,
    pub connection_name: String,
    pub heartbeat_secs: u16,
    pub reply_timeout_secs: u64,
    pub prefetch_count: u16,
    pub retry: RetrySettings,
    /// Explicit `{queue -> patterns}`; unlisted queues use the naming convention.
    pub bindings: BindingTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    pub jitter: f64,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_exchange() -> String { "microservices_exchange".to_string() }
fn default_connection_name() -> String { "rabbit-rpc".to_string() }
fn default_heartbeat() -> u16 { 30 }
fn default_reply_timeout() -> u64 { 30 }
fn default_prefetch_count() -> u16 { 10 }

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            vhost: default_vhost(),
            exchange: default_exchange(),
            connection_name: default_connection_name(),
            heartbeat_secs: default_heartbeat(),
            reply_timeout_secs: default_reply_timeout(),
            prefetch_count: default_prefetch_count(),
            retry: RetrySettings::default(),
            bindings: BindingTable::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

impl RpcSettings {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    /// Connection target for logs; never includes the password.
    pub fn display_target(&self) -> String {
        format!("amqp://{}@{}:{}/{}", self.username, self.host, self.port, self.vhost.trim_start_matches('/'))
    }

    /// Collect every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.host.trim().is_empty() {
            errors.push("RabbitMQ host is required");
        }
        if self.port == 0 {
            errors.push("RabbitMQ port must be between 1 and 65535");
        }
        if self.username.trim().is_empty() {
            errors.push("RabbitMQ username is required");
        }
        if self.password.trim().is_empty() {
            errors.push("RabbitMQ password is required");
        }
        if self.exchange.trim().is_empty() {
            errors.push("exchange name is required");
        }
        if self.reply_timeout_secs == 0 {
            errors.push("reply_timeout_secs must be greater than zero");
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1");
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            errors.push("retry.jitter must be in [0, 1)");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("Configuration error: {}", errors.join("; ")))
        }
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Option<PathBuf> {
    // Check various locations
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path);
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{CONFIG_FILE_NAME}"));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn load_config_from(path: &Path) -> Result<RpcSettings> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or mistyped fields")
}

/// File settings (or defaults when no file exists) with environment
/// overrides applied, validated.
pub fn load_config() -> Result<RpcSettings> {
    let mut settings = match find_config_file() {
        Some(path) => load_config_from(&path)?,
        None => {
            debug!("No {} found, using defaults", CONFIG_FILE_NAME);
            RpcSettings::default()
        }
    };

    crate::env::apply_overrides(&mut settings)?;
    settings.validate()?;
    Ok(settings)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&RpcSettings::default())
        .context("Failed to serialize default configuration")?;

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
