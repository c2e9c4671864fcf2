//! Server configuration.
//!
//! Layering: built-in defaults, then the optional TOML file, then CLI flags
//! (which clap also fills from `SVAKLA_*` environment variables).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::paths;

pub const DEFAULT_HTTP_PORT: u16 = 992;
pub const DEFAULT_WS_PORT: u16 = 776;
pub const DEFAULT_API_PORT: u16 = 933;
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Echo,
    Command,
}

/// Which AI engine the WebSocket sessions talk to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Echo,
            command: None,
            args: Vec::new(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub http_port: u16,
    pub ws_port: u16,
    pub api_port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub io_timeout_secs: u64,
    /// Seconds between background compactions; 0 disables them.
    pub compact_interval_secs: u64,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: DEFAULT_HTTP_PORT,
            ws_port: DEFAULT_WS_PORT,
            api_port: DEFAULT_API_PORT,
            cert_path: paths::default_cert_path(),
            key_path: paths::default_key_path(),
            io_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            compact_interval_secs: 0,
            engine: EngineConfig::default(),
        }
    }
}

/// Values that override the file, usually coming from the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_addr: Option<IpAddr>,
    pub http_port: Option<u16>,
    pub ws_port: Option<u16>,
    pub api_port: Option<u16>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub engine_command: Option<String>,
}

impl ServerConfig {
    /// Load the config file at `path`, or the default location when `None`.
    ///
    /// An explicitly named file must exist; a missing default file just
    /// yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (paths::config_file_path(), false),
        };

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                return Ok(Self::default());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::MissingFile {
                    kind: "config",
                    path,
                });
            }
            Err(source) => {
                return Err(ConfigError::Unreadable {
                    kind: "config",
                    path,
                    source,
                })
            }
        };

        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(addr) = overrides.bind_addr {
            self.bind_addr = addr;
        }
        if let Some(port) = overrides.http_port {
            self.http_port = port;
        }
        if let Some(port) = overrides.ws_port {
            self.ws_port = port;
        }
        if let Some(port) = overrides.api_port {
            self.api_port = port;
        }
        if let Some(path) = overrides.cert_path {
            self.cert_path = path;
        }
        if let Some(path) = overrides.key_path {
            self.key_path = path;
        }
        if let Some(command) = overrides.engine_command {
            self.engine.kind = EngineKind::Command;
            self.engine.command = Some(command);
        }
        self
    }

    /// Reject combinations that would only fail later at bind or run time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_timeout_secs == 0 {
            return Err(ConfigError::Invalid("io_timeout_secs must be > 0".into()));
        }
        let ports = [self.http_port, self.ws_port, self.api_port];
        for (i, port) in ports.iter().enumerate() {
            if *port != 0 && ports[i + 1..].contains(port) {
                return Err(ConfigError::Invalid(format!(
                    "port {port} is assigned to more than one surface"
                )));
            }
        }
        if self.engine.kind == EngineKind::Command && self.engine.command.is_none() {
            return Err(ConfigError::Invalid(
                "engine kind \"command\" requires engine.command".into(),
            ));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn compact_interval(&self) -> Option<Duration> {
        (self.compact_interval_secs > 0).then(|| Duration::from_secs(self.compact_interval_secs))
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.http_port)
    }

    pub fn ws_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.ws_port)
    }
}
