//! Configuration parsing.
//!
//! Settings come from an optional YAML file plus command-line overrides;
//! the binary merges the two and hands the result here for validation.
//! Bad configuration is a fatal startup error, intentionally.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors produced by [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Error for a serde [`serde_yaml`].
    #[error("failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// No graphite address was given anywhere.
    #[error("a graphite (carbon) address is required")]
    MissingGraphite,
    /// A harold address was given without a secret.
    #[error("harold requires a secret for signing heartbeats")]
    MissingHaroldSecret,
}

fn default_port() -> u16 {
    8081
}

fn default_num_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

fn default_flush_interval_seconds() -> u64 {
    4
}

fn default_string_count_intervals() -> Vec<u64> {
    // Minute, hour, day.
    vec![60, 3_600, 86_400]
}

fn default_harold_tag() -> String {
    "tallier".to_owned()
}

/// Main configuration struct for this program.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port to listen for statgrams on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of parallel workers parsing and accumulating stats.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Interval at which stats are flushed to graphite.
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
    /// Address of the graphite (carbon) server.
    #[serde(default)]
    pub graphite: String,
    /// The harold watchdog to heartbeat, if any.
    #[serde(default)]
    pub harold: Option<HaroldConfig>,
    /// Rolling windows for string-frequency tracking, in seconds,
    /// shortest first.
    #[serde(default = "default_string_count_intervals")]
    pub string_count_interval_seconds: Vec<u64>,
    /// Address for the status server. Defaults to the statgram port, TCP.
    #[serde(default)]
    pub status_addr: Option<SocketAddr>,
}

/// Configuration for the harold heartbeat.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct HaroldConfig {
    /// Base URL of the harold service.
    pub base_url: String,
    /// Shared secret for signing heartbeat bodies.
    pub secret: String,
    /// The tag heartbeats are filed under.
    #[serde(default = "default_harold_tag")]
    pub tag: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            num_workers: default_num_workers(),
            flush_interval_seconds: default_flush_interval_seconds(),
            graphite: String::new(),
            harold: None,
            string_count_interval_seconds: default_string_count_intervals(),
            status_addr: None,
        }
    }
}

impl Config {
    /// Read configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or does not deserialize.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Check cross-field requirements after file and flag merging.
    ///
    /// # Errors
    ///
    /// Fails when required settings are missing.
    pub fn validate(&self) -> Result<(), Error> {
        if self.graphite.is_empty() {
            return Err(Error::MissingGraphite);
        }
        if let Some(harold) = &self.harold {
            if harold.secret.is_empty() {
                return Err(Error::MissingHaroldSecret);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds)
    }

    #[must_use]
    pub fn string_count_intervals(&self) -> Vec<Duration> {
        self.string_count_interval_seconds
            .iter()
            .map(|&seconds| Duration::from_secs(seconds))
            .collect()
    }

    /// Where the status server listens.
    #[must_use]
    pub fn status_addr(&self) -> SocketAddr {
        self.status_addr
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.port)))
    }
}
