//! Configuration for the pub/sub component host.
//!
//! Loaded from a TOML file, then overridden from the environment:
//! - `WADDLE_PUBSUB_HOSTS`: comma-separated hosts, replacing the configured ones
//! - `WADDLE_LOG_FORMAT`: `pretty` or `json`

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use waddle_pubsub::node::DEFAULT_MAX_ITEMS;
use waddle_pubsub::ServiceConfig;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directives used when `RUST_LOG` is unset
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,waddle_pubsub=debug".into(),
            format: LogFormat::Pretty,
        }
    }
}

/// Top-level server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// One entry per hosted pub/sub service
    pub pubsub: Vec<ServiceConfig>,
    /// Item bound for queries without `max_items`, shared by every host
    pub default_max_items: usize,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pubsub: Vec::new(),
            default_max_items: DEFAULT_MAX_ITEMS,
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                Self::from_toml(&content)
                    .with_context(|| format!("Failed to parse config file: {:?}", path))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from a variable lookup.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(hosts) = var("WADDLE_PUBSUB_HOSTS") {
            self.pubsub = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(ServiceConfig::new)
                .collect();
        }
        if let Some(format) = var("WADDLE_LOG_FORMAT") {
            match LogFormat::parse(&format) {
                Some(format) => self.log.format = format,
                None => bail!("Unknown log format '{format}'"),
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pubsub.is_empty() {
            bail!("No pub/sub hosts configured");
        }
        if self.pubsub.iter().any(|s| s.host.trim().is_empty()) {
            bail!("pubsub host value must be set");
        }
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        for service in &self.pubsub {
            tracing::info!(
                host = %service.host,
                name = %service.name,
                mailbox_size = service.mailbox_size,
                "Pub/sub service configured"
            );
        }
        tracing::info!(
            default_max_items = self.default_max_items,
            "Item repository configured"
        );
        tracing::info!(filter = %self.log.filter, format = ?self.log.format, "Logging configured");
    }
}
