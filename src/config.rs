//! Proxy configuration
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `PORTHOLD_*` environment variables, then command-line flags. Each source
//! produces a [`PartialConfig`]; later sources win on [`PartialConfig::merge`]
//! and [`PartialConfig::resolve`] validates the result into a [`ProxyConfig`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy::backend::ExitReason;
use crate::proxy::endpoint::Endpoint;

pub const ENV_PREFIX: &str = "PORTHOLD_";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_MAX_RESTARTS: u32 = 3;
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_millis(200);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_CONNECT_RETRY: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// When the supervisor restarts a backend that exited on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    #[default]
    OnFailure,
    Always,
}

impl RestartPolicy {
    pub fn should_restart(&self, exit: &ExitReason) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => !exit.success(),
            RestartPolicy::Always => true,
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" | "no" => Ok(RestartPolicy::Never),
            "on-failure" | "on_failure" => Ok(RestartPolicy::OnFailure),
            "always" => Ok(RestartPolicy::Always),
            other => Err(ConfigError::Invalid {
                field: "restart_policy",
                reason: format!("unknown policy {:?} (expected never, on-failure or always)", other),
            }),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestartPolicy::Never => "never",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Always => "always",
        })
    }
}

/// Resolved, immutable configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Public `host:port` to accept clients on
    pub listen_addr: String,
    pub backend: Endpoint,
    /// Program and arguments that start the backend
    pub command: Vec<String>,
    /// Extra environment for the backend
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Library exported to the backend as `LD_PRELOAD`
    pub preload: Option<PathBuf>,
    /// Port whose `bind()` the preloaded hook redirects to the backend socket
    pub intercept_port: Option<u16>,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub startup_timeout: Duration,
    pub probe_interval: Duration,
    /// How long a client waits for the backend before giving up
    pub connect_retry: Duration,
    pub shutdown_grace: Duration,
}

impl ProxyConfig {
    /// Configuration with defaults for everything but the essentials
    pub fn new(listen_addr: impl Into<String>, backend: Endpoint, command: Vec<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            backend,
            command,
            env: BTreeMap::new(),
            working_dir: None,
            preload: None,
            intercept_port: None,
            restart_policy: RestartPolicy::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            connect_retry: DEFAULT_CONNECT_RETRY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Environment the backend is launched with, before user `env` entries
    ///
    /// With a preload hook configured, `PORTHOLD_PORT` names the port to
    /// intercept rather than the endpoint's own port.
    pub fn launch_env(&self) -> Vec<(String, String)> {
        let mut env = self.backend.launch_env();
        if let Some(library) = &self.preload {
            env.push(("LD_PRELOAD".to_string(), library.display().to_string()));
            if let Some(port) = self.intercept_port {
                env.retain(|(key, _)| key != "PORTHOLD_PORT");
                env.push(("PORTHOLD_PORT".to_string(), port.to_string()));
            }
        }
        env
    }

    /// Human-readable command line, for logs and errors
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// One layer of configuration; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialConfig {
    pub listen: Option<String>,
    pub backend: Option<String>,
    pub command: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub preload: Option<PathBuf>,
    pub intercept_port: Option<u16>,
    pub restart_policy: Option<RestartPolicy>,
    pub max_restarts: Option<u32>,
    pub restart_backoff_ms: Option<u64>,
    pub startup_timeout_ms: Option<u64>,
    pub probe_interval_ms: Option<u64>,
    pub connect_retry_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

impl PartialConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Read `PORTHOLD_*` variables from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Read `PORTHOLD_*` variables from the given pairs
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut cfg = PartialConfig::default();

        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();

            match name {
                "LISTEN" => cfg.listen = Some(value),
                "BACKEND" => cfg.backend = Some(value),
                "RESTART_POLICY" => cfg.restart_policy = Some(value.parse()?),
                "INTERCEPT_PORT" => {
                    cfg.intercept_port = Some(parse_number("intercept_port", &value)?)
                }
                "MAX_RESTARTS" => cfg.max_restarts = Some(parse_number("max_restarts", &value)?),
                "STARTUP_TIMEOUT_MS" => {
                    cfg.startup_timeout_ms = Some(parse_number("startup_timeout_ms", &value)?)
                }
                "CONNECT_RETRY_MS" => {
                    cfg.connect_retry_ms = Some(parse_number("connect_retry_ms", &value)?)
                }
                "SHUTDOWN_GRACE_MS" => {
                    cfg.shutdown_grace_ms = Some(parse_number("shutdown_grace_ms", &value)?)
                }
                _ => {}
            }
        }

        Ok(cfg)
    }

    /// Overlay `other` on top of `self`
    pub fn merge(mut self, other: PartialConfig) -> Self {
        self.listen = other.listen.or(self.listen);
        self.backend = other.backend.or(self.backend);
        self.command = other.command.filter(|c| !c.is_empty()).or(self.command);
        self.env.extend(other.env);
        self.working_dir = other.working_dir.or(self.working_dir);
        self.preload = other.preload.or(self.preload);
        self.intercept_port = other.intercept_port.or(self.intercept_port);
        self.restart_policy = other.restart_policy.or(self.restart_policy);
        self.max_restarts = other.max_restarts.or(self.max_restarts);
        self.restart_backoff_ms = other.restart_backoff_ms.or(self.restart_backoff_ms);
        self.startup_timeout_ms = other.startup_timeout_ms.or(self.startup_timeout_ms);
        self.probe_interval_ms = other.probe_interval_ms.or(self.probe_interval_ms);
        self.connect_retry_ms = other.connect_retry_ms.or(self.connect_retry_ms);
        self.shutdown_grace_ms = other.shutdown_grace_ms.or(self.shutdown_grace_ms);
        self
    }

    /// Fill in defaults and validate
    pub fn resolve(self) -> Result<ProxyConfig, ConfigError> {
        let listen_addr = self.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        validate_listen(&listen_addr)?;

        let backend = Endpoint::parse(&self.backend.ok_or(ConfigError::Missing("backend"))?)?;

        let command = self.command.unwrap_or_default();
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(ConfigError::Missing("command"));
        }

        if let Some(preload) = &self.preload {
            if !preload.is_file() {
                return Err(ConfigError::Invalid {
                    field: "preload",
                    reason: format!("library not found at {}", preload.display()),
                });
            }
            if backend.socket_path().is_some() && self.intercept_port.is_none() {
                return Err(ConfigError::Missing("intercept_port"));
            }
        }
        if self.intercept_port == Some(0) {
            return Err(ConfigError::Invalid {
                field: "intercept_port",
                reason: "must be a real port".to_string(),
            });
        }

        let startup_timeout = self
            .startup_timeout_ms
            .map_or(DEFAULT_STARTUP_TIMEOUT, Duration::from_millis);
        if startup_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "startup_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        let probe_interval = self
            .probe_interval_ms
            .map_or(DEFAULT_PROBE_INTERVAL, Duration::from_millis);
        if probe_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "probe_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(ProxyConfig {
            listen_addr,
            backend,
            command,
            env: self.env,
            working_dir: self.working_dir,
            preload: self.preload,
            intercept_port: self.intercept_port,
            restart_policy: self.restart_policy.unwrap_or_default(),
            max_restarts: self.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            restart_backoff: self
                .restart_backoff_ms
                .map_or(DEFAULT_RESTART_BACKOFF, Duration::from_millis),
            startup_timeout,
            probe_interval,
            connect_retry: self
                .connect_retry_ms
                .map_or(DEFAULT_CONNECT_RETRY, Duration::from_millis),
            shutdown_grace: self
                .shutdown_grace_ms
                .map_or(DEFAULT_SHUTDOWN_GRACE, Duration::from_millis),
        })
    }
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: format!("{:?}: {}", value, e),
    })
}

fn validate_listen(addr: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        field: "listen",
        reason: format!("{:?}: {}", addr, reason),
    };

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
    Ok(())
}
