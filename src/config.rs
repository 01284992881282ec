//! Configuration module for the GELF client.
//!
//! This module provides the client configuration: the list of destinations,
//! the host and facility labels stamped on every record, the compression
//! policy and the maximum datagram size. Configuration can be built in code
//! or loaded from environment variables, and is validated once before the
//! client is created.

use std::env;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::chunker::CHUNK_HEADER_LEN;

/// Default facility label
pub const DEFAULT_FACILITY: &str = "Rust";

/// Default maximum datagram size in bytes
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1400;

/// Largest payload a single IPv4 UDP datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Hostname used when the local host name cannot be determined
const FALLBACK_HOSTNAME: &str = "localhost";

/// Error type for configuration failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: None,
        }
    }

    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// A GELF receiver address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Dotted-quad IPv4 host
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Check that the host has exactly four dot-separated components, no
    /// whitespace, and that the port is non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.split('.').count() != 4 || self.host.chars().any(char::is_whitespace) {
            return Err(ConfigError::new(format!(
                "destination host '{}' is not a dotted-quad address",
                self.host
            )));
        }

        if self.port == 0 {
            return Err(ConfigError::new(format!(
                "destination '{}' has port 0",
                self.host
            )));
        }

        Ok(())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Destination {
    type Err = ConfigError;

    /// Parse `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::new(format!("'{}' is not in host:port form", s)))?;

        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::new(format!("'{}' is not a valid port", port)))?;

        let destination = Destination::new(host, port);
        destination.validate()?;
        Ok(destination)
    }
}

/// When to compress a serialized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    /// Compress only when the raw payload does not fit in one datagram
    #[default]
    Optimal,
    Always,
    Never,
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMode::Optimal => write!(f, "optimal"),
            CompressionMode::Always => write!(f, "always"),
            CompressionMode::Never => write!(f, "never"),
        }
    }
}

impl FromStr for CompressionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "optimal" => Ok(CompressionMode::Optimal),
            "always" => Ok(CompressionMode::Always),
            "never" => Ok(CompressionMode::Never),
            other => Err(ConfigError::new(format!(
                "'{}' is not one of optimal, always, never",
                other
            ))),
        }
    }
}

/// Configuration for the GELF client.
///
/// All settings can be loaded from environment variables:
/// - `GELF_DESTINATIONS`: comma-separated `host:port` list (required)
/// - `GELF_HOSTNAME`: host label (default: local host name)
/// - `GELF_FACILITY`: facility label (default: Rust)
/// - `GELF_COMPRESSION`: optimal, always or never (default: optimal)
/// - `GELF_MAX_DATAGRAM_SIZE`: bytes per datagram (default: 1400)
/// - `GELF_IGNORE_ERRORS`: suppress the warning output for errors (default: false)
#[derive(Debug, Clone)]
pub struct Config {
    /// Receivers, selected round robin per message
    pub destinations: Vec<Destination>,

    /// Value of the `host` field on every record
    pub hostname: String,

    /// Value of the `facility` field on every record
    pub facility: String,

    /// Compression policy
    pub compression: CompressionMode,

    /// Maximum size of one datagram, chunk header included
    pub max_datagram_size: usize,

    /// Suppress the fallback warning output for runtime errors
    pub ignore_errors: bool,
}

impl Config {
    /// Create a configuration for the given destinations with default settings.
    pub fn new(destinations: Vec<Destination>) -> Self {
        Self {
            destinations,
            hostname: local_hostname(),
            facility: DEFAULT_FACILITY.to_string(),
            compression: CompressionMode::default(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            ignore_errors: false,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_facility(mut self, facility: impl Into<String>) -> Self {
        self.facility = facility.into();
        self
    }

    pub fn with_compression(mut self, compression: CompressionMode) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_max_datagram_size(mut self, max_datagram_size: usize) -> Self {
        self.max_datagram_size = max_datagram_size;
        self
    }

    pub fn with_ignore_errors(mut self, ignore_errors: bool) -> Self {
        self.ignore_errors = ignore_errors;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - no destination is configured
    /// - a destination host is not a dotted quad or contains whitespace
    /// - the maximum datagram size cannot hold a chunk header plus data, or
    ///   exceeds the largest UDP payload
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destinations.is_empty() {
            return Err(ConfigError::new("at least one destination is required"));
        }

        for destination in &self.destinations {
            destination.validate()?;
        }

        if self.max_datagram_size <= CHUNK_HEADER_LEN {
            return Err(ConfigError::new(format!(
                "max datagram size {} must be greater than the {} byte chunk header",
                self.max_datagram_size, CHUNK_HEADER_LEN
            )));
        }

        if self.max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(ConfigError::new(format!(
                "max datagram size {} exceeds maximum UDP payload ({})",
                self.max_datagram_size, MAX_UDP_PAYLOAD
            )));
        }

        Ok(())
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `GELF_DESTINATIONS` is missing or malformed,
    /// if any optional variable cannot be parsed, or if the result fails
    /// [`Config::validate`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use gelf_udp::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Destinations: {}", config.destinations.len());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let destinations = Self::parse_destinations()?;
        let mut config = Config::new(destinations);

        if let Ok(hostname) = env::var("GELF_HOSTNAME") {
            config.hostname = hostname;
        }

        if let Ok(facility) = env::var("GELF_FACILITY") {
            config.facility = facility;
        }

        if let Ok(value) = env::var("GELF_COMPRESSION") {
            config.compression = value.parse().map_err(|e: ConfigError| {
                ConfigError::for_var("GELF_COMPRESSION", e.message)
            })?;
        }

        config.max_datagram_size = Self::parse_max_datagram_size()?;
        config.ignore_errors = Self::parse_ignore_errors()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse the destination list from the environment.
    fn parse_destinations() -> Result<Vec<Destination>, ConfigError> {
        let env_var = "GELF_DESTINATIONS";

        let value = env::var(env_var)
            .map_err(|_| ConfigError::for_var(env_var, "variable is not set"))?;

        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<Destination>()
                    .map_err(|e| ConfigError::for_var(env_var, e.message))
            })
            .collect()
    }

    /// Parse the maximum datagram size from the environment.
    fn parse_max_datagram_size() -> Result<usize, ConfigError> {
        let env_var = "GELF_MAX_DATAGRAM_SIZE";

        match env::var(env_var) {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
            }),
            Err(_) => Ok(DEFAULT_MAX_DATAGRAM_SIZE),
        }
    }

    /// Parse the ignore-errors flag from the environment.
    fn parse_ignore_errors() -> Result<bool, ConfigError> {
        let env_var = "GELF_IGNORE_ERRORS";

        match env::var(env_var) {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" | "" => Ok(false),
                _ => Err(ConfigError::for_var(
                    env_var,
                    format!("'{}' is not a valid boolean", value),
                )),
            },
            Err(_) => Ok(false),
        }
    }
}

/// Local host name as reported by the operating system.
///
/// Falls back to `localhost` if the name cannot be read or is not UTF-8.
pub fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => match name.into_string() {
            Ok(name) if !name.trim().is_empty() => return name.trim().to_string(),
            Ok(_) => warn!("System host name is empty"),
            Err(name) => warn!(hostname = ?name, "System host name is not valid UTF-8"),
        },
        Err(e) => warn!(error = %e, "Failed to read system host name"),
    }

    FALLBACK_HOSTNAME.to_string()
}
