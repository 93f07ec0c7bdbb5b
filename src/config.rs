//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GateError, Result};
use crate::http::HeaderPolicy;
use crate::ratelimit::RefillMode;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Burst size; the bucket starts with this many tokens
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Carry fractional tokens between requests instead of truncating them
    #[serde(default)]
    pub carry_fraction: bool,

    /// How the bucket regains tokens
    #[serde(default)]
    pub refill: RefillConfig,

    /// Which responses carry `X-Ratelimit-*` headers
    #[serde(default)]
    pub headers: HeaderPolicy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
            carry_fraction: false,
            refill: RefillConfig::default(),
            headers: HeaderPolicy::default(),
        }
    }
}

fn default_rate() -> f64 {
    0.5
}

fn default_capacity() -> u32 {
    2
}

/// Refill strategy as written in the config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RefillConfig {
    /// Refill from elapsed time on each request.
    #[default]
    Lazy,
    /// Add a fixed number of tokens on a timer.
    Interval {
        #[serde(default = "default_interval_ms")]
        every_ms: u64,
        #[serde(default = "default_interval_tokens")]
        tokens: u32,
    },
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_interval_tokens() -> u32 {
    2
}

impl RateLimitingConfig {
    /// Reject values the bucket cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate < 0.0 {
            return Err(GateError::Config(format!(
                "rate_limiting.rate must be a finite number >= 0, got {}",
                self.rate
            )));
        }

        if let RefillConfig::Interval { every_ms: 0, .. } = self.refill {
            return Err(GateError::Config(
                "rate_limiting.refill.every_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The refill mode the limiter should run with.
    pub fn refill_mode(&self) -> RefillMode {
        match self.refill {
            RefillConfig::Lazy => RefillMode::Lazy,
            RefillConfig::Interval { every_ms, tokens } => RefillMode::Interval {
                every: Duration::from_millis(every_ms),
                tokens,
            },
        }
    }
}

impl GateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()
    }
}
