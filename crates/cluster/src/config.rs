//! Cluster client configuration
//!
//! Configuration documents are plain serde structs so they can be embedded
//! in a larger application config. Durations are integer milliseconds.
//!
//! ```toml
//! configuration_uri = "redis://cache.internal:6379"
//! timeout = 3000
//!
//! [circuit_breaker]
//! failure_rate_threshold = 50.0
//! sliding_window_size = 100
//! wait_duration_in_open_state = 10000
//!
//! [retry]
//! max_attempts = 3
//! wait_duration = 50
//! ```

use std::fmt;
use std::time::Duration;

use faultline_common::duration_millis;
use faultline_common::error::{ConfigError, ConfigResult};
use faultline_common::resilience::{Backoff, CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Circuit breaker settings as they appear in configuration documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfiguration {
    /// Failure rate, in percent, at or above which the circuit opens
    pub failure_rate_threshold: f32,
    pub permitted_number_of_calls_in_half_open_state: u32,
    pub sliding_window_size: u32,
    pub sliding_window_minimum_number_of_calls: u32,
    #[serde(with = "duration_millis")]
    pub wait_duration_in_open_state: Duration,
}

impl Default for CircuitBreakerConfiguration {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            permitted_number_of_calls_in_half_open_state: 10,
            sliding_window_size: 100,
            sliding_window_minimum_number_of_calls: 100,
            wait_duration_in_open_state: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfiguration {
    /// Convert into a validated runtime breaker configuration
    pub fn to_circuit_breaker_config(&self) -> ConfigResult<CircuitBreakerConfig> {
        CircuitBreakerConfig::builder()
            .failure_rate_threshold(self.failure_rate_threshold)
            .permitted_calls_in_half_open_state(self.permitted_number_of_calls_in_half_open_state)
            .sliding_window_size(self.sliding_window_size)
            .minimum_number_of_calls(self.sliding_window_minimum_number_of_calls)
            .wait_duration_in_open_state(self.wait_duration_in_open_state)
            .build()
    }
}

/// Shape of the wait between retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfiguration {
    /// Wait `wait_duration` between every attempt
    Constant,
    /// Start at `wait_duration` and multiply after every attempt
    Exponential {
        multiplier: f64,
        #[serde(with = "duration_millis")]
        max_wait_duration: Duration,
        /// Randomize each wait between zero and the computed value
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for BackoffConfiguration {
    fn default() -> Self {
        Self::Constant
    }
}

/// Retry settings as they appear in configuration documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfiguration {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub wait_duration: Duration,
    pub backoff: BackoffConfiguration,
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait_duration: Duration::from_millis(50),
            backoff: BackoffConfiguration::Constant,
        }
    }
}

impl RetryConfiguration {
    /// Convert into a validated runtime retry configuration
    pub fn to_retry_config(&self) -> ConfigResult<RetryConfig> {
        let backoff = match self.backoff {
            BackoffConfiguration::Constant => Backoff::fixed(self.wait_duration),
            BackoffConfiguration::Exponential { multiplier, max_wait_duration, jitter: false } => {
                Backoff::exponential(self.wait_duration, multiplier, max_wait_duration)
            }
            BackoffConfiguration::Exponential { multiplier, max_wait_duration, jitter: true } => {
                Backoff::exponential_random(self.wait_duration, multiplier, max_wait_duration)
            }
        };

        RetryConfig::builder().max_attempts(self.max_attempts).backoff(backoff).build()
    }
}

/// Complete configuration of one cluster client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub configuration_uri: String,
    /// Per-command timeout enforced by the driver
    #[serde(default = "default_command_timeout", with = "duration_millis")]
    pub timeout: Duration,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfiguration,
    #[serde(default)]
    pub retry: RetryConfiguration,
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

impl ClusterConfiguration {
    /// Configuration with default policies for the given URI
    pub fn new(configuration_uri: impl Into<String>) -> Self {
        Self {
            configuration_uri: configuration_uri.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            circuit_breaker: CircuitBreakerConfiguration::default(),
            retry: RetryConfiguration::default(),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(document: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section, reporting the first invalid field
    pub fn validate(&self) -> ConfigResult<()> {
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than zero"));
        }
        self.cluster_uri()?;
        self.circuit_breaker.to_circuit_breaker_config()?;
        self.retry.to_retry_config()?;
        Ok(())
    }

    /// The configuration URI with the command timeout embedded
    pub fn cluster_uri(&self) -> ConfigResult<ClusterUri> {
        ClusterUri::parse(&self.configuration_uri, self.timeout)
    }
}

/// Address of a cluster seed node plus the command timeout to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterUri {
    url: Url,
    timeout: Duration,
}

impl ClusterUri {
    /// Parse a `redis://` or `rediss://` URI
    pub fn parse(uri: &str, timeout: Duration) -> ConfigResult<Self> {
        let url = Url::parse(uri)
            .map_err(|e| ConfigError::invalid("configuration_uri", e.to_string()))?;

        match url.scheme() {
            "redis" | "rediss" => {}
            other => {
                return Err(ConfigError::invalid(
                    "configuration_uri",
                    format!("unsupported scheme '{other}', expected redis or rediss"),
                ));
            }
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::invalid("configuration_uri", "missing host"));
        }

        Ok(Self { url, timeout })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Port, defaulting to 6379
    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(6379)
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "rediss"
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Display for ClusterUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut redacted = self.url.clone();
        if redacted.password().is_some() {
            let _ = redacted.set_password(Some("***"));
        }
        write!(f, "{redacted}")
    }
}
