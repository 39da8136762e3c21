//! Application settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform configuration directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the file failed
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File content is not valid TOML for this schema
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be rendered as TOML
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial (SPP) transport settings
    pub serial: SerialSettings,
    /// BLE transport settings
    pub ble: BleSettings,
    /// Sequence execution settings
    pub execution: ExecutionSettings,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load config from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save config to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Serial (SPP) transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate of the Bluetooth serial module
    pub baud_rate: u32,
    /// Read/write timeout in milliseconds
    pub timeout_ms: u64,
    /// Upper bound for port enumeration during discovery
    pub enumeration_timeout_ms: u64,
    /// Case-insensitive tokens that mark a port as Bluetooth serial
    pub bluetooth_markers: Vec<String>,
}

impl SerialSettings {
    /// Read/write timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Enumeration timeout
    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_millis(self.enumeration_timeout_ms)
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            timeout_ms: 1000,
            enumeration_timeout_ms: 2000,
            bluetooth_markers: ["HC", "LMB", "BLUETOOTH", "RFCOMM"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

/// BLE transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSettings {
    /// Duration of a discovery scan
    pub scan_timeout_secs: u64,
    /// GATT connection timeout
    pub connect_timeout_secs: u64,
    /// Rescan window when the address is not in the adapter cache
    pub lookup_scan_secs: u64,
}

impl BleSettings {
    /// Discovery scan duration
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Connection timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Lookup rescan window
    pub fn lookup_scan(&self) -> Duration {
        Duration::from_secs(self.lookup_scan_secs)
    }
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 5,
            connect_timeout_secs: 10,
            lookup_scan_secs: 3,
        }
    }
}

/// Sequence execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Speed scale (1-9) every run starts with
    pub default_speed: u8,
    /// Terminator appended to every frame
    pub line_ending: LineEnding,
    /// Pause after a Stop step, in milliseconds
    pub stop_delay_ms: u64,
    /// Pause after a SetSpeed step, in milliseconds
    pub speed_delay_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_speed: 5,
            line_ending: LineEnding::Lf,
            stop_delay_ms: 700,
            speed_delay_ms: 400,
        }
    }
}

/// Line ending type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LineEnding {
    /// No terminator
    None,
    /// Carriage Return only
    Cr,
    /// Line Feed only
    #[default]
    Lf,
    /// Both CR and LF
    CrLf,
}

impl LineEnding {
    /// Get the byte sequence for this line ending
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Self::None => b"",
            Self::Cr => b"\r",
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
    /// Also write a daily-rolling log file into this directory
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}
