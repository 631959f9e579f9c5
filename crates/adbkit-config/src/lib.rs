//! Configuration shared by the adbkit crates.
//!
//! Everything is loaded from a single TOML document; every section and field is optional
//! and falls back to the defaults documented on each field.
//!
//! ```toml
//! [logging]
//! level = "adbkit.fakeadb=debug,info"
//!
//! [fake_adb]
//! listen = "127.0.0.1:5037"
//!
//! [[fake_adb.devices]]
//! serial = "emulator-5554"
//! api_level = 30
//! processes = [{ pid = 1234, process_name = "com.example" }]
//! ```

mod logging;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use logging::{global_log_buffer, init_tracing, LogBuffer};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdbkitConfig {
    pub logging: LoggingConfig,
    pub codec: CodecConfig,
    pub fake_adb: FakeAdbConfig,
    pub inventory: InventoryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level for all adbkit crates.
    ///
    /// Either a simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr (in addition to the in-memory buffer).
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path (in addition to the in-memory buffer).
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks
    /// remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Number of log lines kept in memory.
    #[serde(default = "LoggingConfig::default_buffer_lines")]
    pub buffer_lines: usize,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn default_buffer_lines() -> usize {
        2_000
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: `level`, with `RUST_LOG` merged in when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
            buffer_lines: Self::default_buffer_lines(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodecConfig {
    /// Packets up to this many bytes are encoded in one buffer; larger ones stream their
    /// payload after the header.
    pub inline_buffer_threshold: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            inline_buffer_threshold: 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FakeAdbConfig {
    /// Address the fake server binds. Port 0 picks a free port.
    pub listen: SocketAddr,

    /// Devices at or above this API level queue a second `jdwp:<pid>` request until the
    /// first session ends; older devices reject it.
    pub exclusive_session_api_level: u32,

    pub session_handoff_poll_ms: u64,

    /// How long a queued session request waits before it is rejected.
    pub session_handoff_timeout_ms: u64,

    /// Devices connected when the server starts.
    pub devices: Vec<DeviceConfig>,
}

impl Default for FakeAdbConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            exclusive_session_api_level: 28,
            session_handoff_poll_ms: 100,
            session_handoff_timeout_ms: 30_000,
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub serial: String,
    #[serde(default = "DeviceConfig::default_api_level")]
    pub api_level: u32,
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
}

impl DeviceConfig {
    fn default_api_level() -> u32 {
        30
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    pub pid: i32,
    pub process_name: String,
    /// Defaults to the process name.
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventoryConfig {
    /// Name this process uses when it connects to a process inventory.
    pub client_description: String,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            client_description: "adbkit".to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep the message only; the default display quotes the offending input.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl AdbkitConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}
