use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::sandbox::ResourceLimits;

const CONFIG_FILE: &str = "codebox.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Default Docker image for new containers
    #[serde(default = "default_image")]
    pub image: String,

    /// Container working directory; persistent workspaces live under
    /// `<workdir>/workspaces`
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Resource limits
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            workdir: default_workdir(),
            resources: ResourceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "256m", "1g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "1", "0.5")
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Per-command execution timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl ResourceConfig {
    /// Parses the configured limits into engine units.
    pub(crate) fn limits(&self) -> Result<ResourceLimits> {
        let memory_bytes = parse_memory_limit(&self.memory)?;
        let cpus: f64 = self
            .cpus
            .parse()
            .with_context(|| format!("Invalid cpu limit: {}", self.cpus))?;

        #[allow(clippy::cast_possible_truncation)]
        Ok(ResourceLimits {
            memory_bytes,
            nano_cpus: (cpus * 1_000_000_000.0) as i64,
        })
    }
}

// Default value functions
fn default_image() -> String {
    "python:3.9-slim".to_string()
}

fn default_workdir() -> String {
    "/app".to_string()
}

fn default_memory() -> String {
    "256m".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_timeout() -> u64 {
    300
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}
