//! Configuration module - environment variable parsing

use std::env;
use std::str::FromStr;

use serde::Serialize;

use crate::prediction::{ClientConfig, ServerConfig};
use crate::util::time::{interval_for, DEFAULT_PHYSICS_FPS, DEFAULT_UPDATE_FPS};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Simulated session settings for the demo binary
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DemoConfig {
    /// Number of predicting clients
    pub clients: u32,
    /// How long the demo runs, in seconds
    pub duration_secs: u64,
    /// Max one-way delay of the simulated network, in frames
    pub latency_ticks: u32,
    /// Probability of dropping a message
    pub packet_loss: f64,
    /// Seed for the simulated network
    pub seed: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            clients: 2,
            duration_secs: 5,
            latency_ticks: 6,
            packet_loss: 0.05,
            seed: 7,
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,

    /// Snapshot broadcasts per second
    pub update_fps: u32,
    /// Fixed simulation steps per second
    pub physics_fps: u32,
    /// Server-side queue bound per connection
    pub max_pending_inputs: usize,
    /// Client-side bound on unacknowledged inputs
    pub max_buffered_inputs: usize,
    /// INPUT messages per second per connection, 0 = unlimited
    pub input_rate_limit: u32,

    pub demo: DemoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            update_fps: DEFAULT_UPDATE_FPS,
            physics_fps: DEFAULT_PHYSICS_FPS,
            max_pending_inputs: 64,
            max_buffered_inputs: 1024,
            input_rate_limit: 0,
            demo: DemoConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse(&lookup, "LOG_FORMAT", defaults.log_format)?,

            update_fps: parse(&lookup, "CSP_UPDATE_FPS", defaults.update_fps)?,
            physics_fps: parse(&lookup, "CSP_PHYSICS_FPS", defaults.physics_fps)?,
            max_pending_inputs: parse(&lookup, "CSP_MAX_PENDING_INPUTS", defaults.max_pending_inputs)?,
            max_buffered_inputs: parse(
                &lookup,
                "CSP_MAX_BUFFERED_INPUTS",
                defaults.max_buffered_inputs,
            )?,
            input_rate_limit: parse(&lookup, "CSP_INPUT_RATE_LIMIT", defaults.input_rate_limit)?,

            demo: DemoConfig {
                clients: parse(&lookup, "DEMO_CLIENTS", defaults.demo.clients)?,
                duration_secs: parse(&lookup, "DEMO_DURATION_SECS", defaults.demo.duration_secs)?,
                latency_ticks: parse(&lookup, "DEMO_LATENCY_TICKS", defaults.demo.latency_ticks)?,
                packet_loss: parse(&lookup, "DEMO_PACKET_LOSS", defaults.demo.packet_loss)?,
                seed: parse(&lookup, "DEMO_SEED", defaults.demo.seed)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.update_fps == 0 {
            return Err(invalid("CSP_UPDATE_FPS", self.update_fps));
        }
        if self.physics_fps == 0 {
            return Err(invalid("CSP_PHYSICS_FPS", self.physics_fps));
        }
        if self.max_pending_inputs == 0 {
            return Err(invalid("CSP_MAX_PENDING_INPUTS", self.max_pending_inputs));
        }
        if self.max_buffered_inputs == 0 {
            return Err(invalid("CSP_MAX_BUFFERED_INPUTS", self.max_buffered_inputs));
        }
        if !(0.0..=1.0).contains(&self.demo.packet_loss) {
            return Err(invalid("DEMO_PACKET_LOSS", self.demo.packet_loss));
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            update_interval: interval_for(self.update_fps),
            timestep: interval_for(self.physics_fps),
            max_pending_inputs: self.max_pending_inputs,
            input_rate_limit: self.input_rate_limit,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timestep: interval_for(self.physics_fps),
            max_buffered_inputs: self.max_buffered_inputs,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
