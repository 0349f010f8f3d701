//! Relaycast configuration
//!
//! Configuration comes from:
//! 1. Built-in defaults
//! 2. Environment variables (`RELAYCAST_*`)
//! 3. Command line flags (applied by `main`)
//!
//! `main` owns the resulting [`Config`] and hands it to whatever needs it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::connection::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PONG_WAIT, DEFAULT_QUEUE_CAPACITY, DEFAULT_WRITE_WAIT,
    Timing,
};
use crate::hub::DEFAULT_COMMAND_CAPACITY;

pub const ENV_ADDR: &str = "RELAYCAST_ADDR";
pub const ENV_HOME_PAGE: &str = "RELAYCAST_HOME_PAGE";
pub const ENV_QUEUE_CAPACITY: &str = "RELAYCAST_QUEUE_CAPACITY";
pub const ENV_MAX_MESSAGE_SIZE: &str = "RELAYCAST_MAX_MESSAGE_SIZE";
pub const ENV_PONG_WAIT_SECS: &str = "RELAYCAST_PONG_WAIT_SECS";
pub const ENV_WRITE_WAIT_SECS: &str = "RELAYCAST_WRITE_WAIT_SECS";

/// Relaycast configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (default: 0.0.0.0:8080)
    pub listen_addr: SocketAddr,
    /// Page served at `/` (default: home.html)
    pub home_page: PathBuf,
    /// Outbound queue capacity per connection
    pub queue_capacity: usize,
    /// Hub command channel capacity
    pub hub_capacity: usize,
    /// Largest accepted inbound frame in bytes
    pub max_message_size: usize,
    /// Idle-read deadline, refreshed by pongs
    pub pong_wait: Duration,
    /// Per-write deadline
    pub write_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            home_page: PathBuf::from("home.html"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            hub_capacity: DEFAULT_COMMAND_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            pong_wait: DEFAULT_PONG_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
        }
    }
}

impl Config {
    /// Defaults overridden by any `RELAYCAST_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_vars(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_ADDR) {
            self.listen_addr = parse(ENV_ADDR, &addr, "expected host:port")?;
        }

        if let Some(path) = lookup(ENV_HOME_PAGE)
            && !path.trim().is_empty()
        {
            self.home_page = PathBuf::from(path.trim());
        }

        if let Some(capacity) = lookup(ENV_QUEUE_CAPACITY) {
            self.queue_capacity = parse_positive(ENV_QUEUE_CAPACITY, &capacity)?;
        }

        if let Some(size) = lookup(ENV_MAX_MESSAGE_SIZE) {
            self.max_message_size = parse_positive(ENV_MAX_MESSAGE_SIZE, &size)?;
        }

        if let Some(secs) = lookup(ENV_PONG_WAIT_SECS) {
            self.pong_wait = Duration::from_secs(parse_positive(ENV_PONG_WAIT_SECS, &secs)? as u64);
        }

        if let Some(secs) = lookup(ENV_WRITE_WAIT_SECS) {
            self.write_wait =
                Duration::from_secs(parse_positive(ENV_WRITE_WAIT_SECS, &secs)? as u64);
        }

        Ok(())
    }

    /// Heartbeat period, 9/10 of the idle-read deadline
    pub fn ping_period(&self) -> Duration {
        self.timing().ping_period
    }

    /// Pump deadlines derived from this config
    pub fn timing(&self) -> Timing {
        Timing::new(self.pong_wait, self.write_wait, self.max_message_size)
    }
}

fn parse<T: FromStr>(
    name: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv(name, expected))
}

fn parse_positive(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    match parse::<usize>(name, value, "expected a positive integer")? {
        0 => Err(ConfigError::InvalidEnv(name, "expected a positive integer")),
        n => Ok(n),
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
