//! Configuration system for symon

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::core::point::MetricKind;

/// Global daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub log: LogConfig,
    pub server: ServerConfig,
    pub metric: MetricConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("cannot parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("symon").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.max_seconds == 0 {
            anyhow::bail!("app.max_seconds must be positive");
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("invalid server.listen address {:?}", self.server.listen))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Retention window in seconds; also the largest N and M a client may ask for.
    pub max_seconds: u32,
    /// Stop ticking while nobody is subscribed.
    pub pause_without_clients: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_seconds: 600,
            pause_without_clients: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Write daily-rolling log files here instead of stdout.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub loadavg: bool,
    pub cpu: bool,
    pub loaddisks: bool,
    pub usedfs: bool,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            loadavg: true,
            cpu: true,
            loaddisks: true,
            usedfs: true,
        }
    }
}

impl MetricConfig {
    pub fn enabled(&self) -> Vec<MetricKind> {
        [
            (MetricKind::LoadAvg, self.loadavg),
            (MetricKind::Cpu, self.cpu),
            (MetricKind::LoadDisks, self.loaddisks),
            (MetricKind::UsedFs, self.usedfs),
        ]
        .into_iter()
        .filter_map(|(kind, on)| on.then_some(kind))
        .collect()
    }
}

/// Write a default configuration file
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    Config::default().save(path)?;
    println!("Created {}", path.display());
    Ok(())
}
