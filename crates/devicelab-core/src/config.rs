//! Lab and tunnel manager configuration types.

use crate::error::ConfigError;
use crate::tunnel::DEFAULT_PORT;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the tunnel manager and the sidecar it launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelManagerConfig {
    /// Sidecar executable (default: `devicelab-tunneld` on `PATH`).
    pub program: String,
    /// Local port the sidecar listens on (default: 49151).
    pub port: u16,
    /// Sidecar log level (default: `info`).
    pub log_level: String,
    /// Command the sidecar runs per device. `{udid}` is substituted.
    pub provider: Vec<String>,
    /// Total time allowed to reach the sidecar after launch.
    pub connect_timeout: Duration,
    /// Timeout for a single request to the sidecar.
    pub request_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping the sidecar.
    pub stop_timeout: Duration,
}

impl Default for TunnelManagerConfig {
    fn default() -> Self {
        Self {
            program: "devicelab-tunneld".into(),
            port: DEFAULT_PORT,
            log_level: "info".into(),
            provider: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl TunnelManagerConfig {
    pub fn builder() -> TunnelManagerConfigBuilder {
        TunnelManagerConfigBuilder::default()
    }

    /// Defaults overridden by `DEVICELAB_TUNNEL_*` environment variables.
    ///
    /// | variable | field |
    /// |----------|-------|
    /// | `DEVICELAB_TUNNEL_PROGRAM` | `program` |
    /// | `DEVICELAB_TUNNEL_PORT` | `port` |
    /// | `DEVICELAB_TUNNEL_LOG_LEVEL` | `log_level` |
    /// | `DEVICELAB_TUNNEL_PROVIDER` | `provider` (whitespace separated) |
    /// | `DEVICELAB_TUNNEL_CONNECT_TIMEOUT_SECS` | `connect_timeout` |
    /// | `DEVICELAB_TUNNEL_REQUEST_TIMEOUT_SECS` | `request_timeout` |
    /// | `DEVICELAB_TUNNEL_STOP_TIMEOUT_SECS` | `stop_timeout` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(program) = lookup("DEVICELAB_TUNNEL_PROGRAM") {
            config.program = program;
        }
        if let Some(port) = lookup("DEVICELAB_TUNNEL_PORT") {
            config.port = parse("DEVICELAB_TUNNEL_PORT", &port)?;
        }
        if let Some(level) = lookup("DEVICELAB_TUNNEL_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(provider) = lookup("DEVICELAB_TUNNEL_PROVIDER") {
            config.provider = provider.split_whitespace().map(String::from).collect();
        }
        if let Some(secs) = lookup("DEVICELAB_TUNNEL_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = secs_from("DEVICELAB_TUNNEL_CONNECT_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("DEVICELAB_TUNNEL_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = secs_from("DEVICELAB_TUNNEL_REQUEST_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("DEVICELAB_TUNNEL_STOP_TIMEOUT_SECS") {
            config.stop_timeout = secs_from("DEVICELAB_TUNNEL_STOP_TIMEOUT_SECS", &secs)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.provider.is_empty() {
            return Err(ConfigError::EmptyProvider);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Zero("connect_timeout"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero("request_timeout"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TunnelManagerConfigBuilder {
    config: TunnelManagerConfig,
}

impl TunnelManagerConfigBuilder {
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.config.program = program.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn provider<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.provider = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    /// Build the configuration, validating all required fields.
    pub fn build(self) -> Result<TunnelManagerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Top-level configuration for a [`DeviceLab`](crate::DeviceLab).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabConfig {
    /// Directory receiving result bundles and traces (default: `out`).
    pub output_dir: PathBuf,
    /// Maximum concurrent blocking device calls (default: 8).
    pub blocking_pool_size: usize,
    pub tunnel: TunnelManagerConfig,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("out"),
            blocking_pool_size: 8,
            tunnel: TunnelManagerConfig::default(),
        }
    }
}

impl LabConfig {
    pub fn builder() -> LabConfigBuilder {
        LabConfigBuilder::default()
    }

    /// Defaults overridden by `DEVICELAB_OUTPUT_DIR`,
    /// `DEVICELAB_BLOCKING_POOL_SIZE` and the `DEVICELAB_TUNNEL_*` variables
    /// read by [`TunnelManagerConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self {
            tunnel: TunnelManagerConfig::from_lookup(&lookup)?,
            ..Self::default()
        };
        if let Some(dir) = lookup("DEVICELAB_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("DEVICELAB_BLOCKING_POOL_SIZE") {
            config.blocking_pool_size = parse("DEVICELAB_BLOCKING_POOL_SIZE", &size)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "output_dir",
                value: String::new(),
            });
        }
        if self.blocking_pool_size == 0 {
            return Err(ConfigError::Zero("blocking_pool_size"));
        }
        self.tunnel.validate()
    }
}

#[derive(Debug, Default)]
pub struct LabConfigBuilder {
    config: LabConfig,
}

impl LabConfigBuilder {
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn blocking_pool_size(mut self, size: usize) -> Self {
        self.config.blocking_pool_size = size;
        self
    }

    pub fn tunnel(mut self, tunnel: TunnelManagerConfig) -> Self {
        self.config.tunnel = tunnel;
        self
    }

    pub fn build(self) -> Result<LabConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

fn secs_from(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(name, value).map(Duration::from_secs)
}
