//! Application configuration: TOML-based, platform-aware paths.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{
    MAX_METER_MAP_LEN, MAX_STEP0_SIZE, SEND_MAX_RETRIES, USB_TIMEOUT_MS,
};
use crate::transaction::RetryPolicy;

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str =
    "# fcp configuration: rewritten by `fcp-cli config --write`; comments are not preserved.\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Preferred device serial number. Empty = auto-select first device.
    #[serde(default)]
    pub device_serial: String,

    /// Bytes requested by the step 0 control transfer during init.
    #[serde(default = "default_step0_size")]
    pub step0_size: usize,

    /// Per control transfer timeout.
    #[serde(default = "default_timeout_ms")]
    pub transfer_timeout_ms: u64,

    /// How long a command waits for the device's ACK.
    #[serde(default = "default_timeout_ms")]
    pub completion_timeout_ms: u64,

    /// Send retries on a busy bus.
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,

    /// First retry delay; doubles on each retry.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default)]
    pub meter: MeterConfig,
}

/// Level meter setup applied after init.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Raw meter slots the device reports.
    #[serde(default)]
    pub slots: u16,

    /// Slot index per exposed channel; `-1` reports zero. Empty = no meter.
    #[serde(default)]
    pub map: Vec<i16>,

    /// NUL-separated channel names. Empty = no labels.
    #[serde(default)]
    pub labels_path: String,
}

fn default_step0_size() -> usize {
    24
}
fn default_timeout_ms() -> u64 {
    USB_TIMEOUT_MS
}
/// Upper bound for `retry_base_delay_ms`; the last of five retries waits 16x this.
pub const MAX_RETRY_BASE_DELAY_MS: u64 = 1000;

fn default_send_retries() -> u32 {
    SEND_MAX_RETRIES
}
fn default_retry_base_delay_ms() -> u64 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_serial: String::new(),
            step0_size: default_step0_size(),
            transfer_timeout_ms: default_timeout_ms(),
            completion_timeout_ms: default_timeout_ms(),
            send_retries: default_send_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            meter: MeterConfig::default(),
        }
    }
}

/// Validation errors that [`Config::validate`] can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Step0TooLarge(usize),
    /// A timeout field is zero (`field` names it).
    ZeroTimeout { field: &'static str },
    /// `retry_base_delay_ms` above [`MAX_RETRY_BASE_DELAY_MS`].
    RetryDelayTooLong(u64),
    MeterMapTooLong(usize),
    /// A map entry is below -1 or not below `slots`.
    MeterMapEntry { index: usize, value: i16, slots: u16 },
    LabelsPath(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Step0TooLarge(n) => {
                write!(f, "step0_size {n} exceeds {MAX_STEP0_SIZE}")
            }
            ValidationError::ZeroTimeout { field } => write!(f, "{field} must be non-zero"),
            ValidationError::RetryDelayTooLong(ms) => write!(
                f,
                "retry_base_delay_ms {ms} exceeds {MAX_RETRY_BASE_DELAY_MS}"
            ),
            ValidationError::MeterMapTooLong(n) => {
                write!(f, "meter.map has {n} entries (max {MAX_METER_MAP_LEN})")
            }
            ValidationError::MeterMapEntry {
                index,
                value,
                slots,
            } => write!(f, "meter.map[{index}] = {value} outside [-1, {slots})"),
            ValidationError::LabelsPath(e) => write!(f, "Invalid meter.labels_path: {e}"),
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fcp"))
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Load config from disk, or return defaults if not found.
    pub fn load() -> Self {
        let (config, warnings) = Self::load_with_warnings();
        for w in &warnings {
            log::warn!("{w}");
        }
        config
    }

    /// Save config to an arbitrary path atomically (write to temp file, then rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Rename can fail across filesystems; fall back to direct write + cleanup
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    /// Save config to the default platform path.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Load config from an arbitrary path, returning the config and any parse warnings.
    ///
    /// Returns `(defaults, [])` if the file doesn't exist, and
    /// `(defaults, [warning])` if it exists but can't be parsed.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Load config from the default path, returning the config and any parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Engine retry policy built from the timing fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.send_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            completion_timeout: Duration::from_millis(self.completion_timeout_ms),
        }
    }

    /// Read the configured label file, if any.
    pub fn meter_labels(&self) -> crate::error::Result<Option<Vec<u8>>> {
        let path = self.meter.labels_path.trim();
        if path.is_empty() {
            return Ok(None);
        }
        std::fs::read(path)
            .map(Some)
            .map_err(|e| crate::FcpError::Config(format!("meter labels {path}: {e}")))
    }

    /// Validate the entire config, collecting all errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.step0_size > MAX_STEP0_SIZE {
            errors.push(ValidationError::Step0TooLarge(self.step0_size));
        }

        if self.transfer_timeout_ms == 0 {
            errors.push(ValidationError::ZeroTimeout {
                field: "transfer_timeout_ms",
            });
        }
        if self.completion_timeout_ms == 0 {
            errors.push(ValidationError::ZeroTimeout {
                field: "completion_timeout_ms",
            });
        }
        if self.retry_base_delay_ms > MAX_RETRY_BASE_DELAY_MS {
            errors.push(ValidationError::RetryDelayTooLong(self.retry_base_delay_ms));
        }

        let map = &self.meter.map;
        if map.len() > MAX_METER_MAP_LEN {
            errors.push(ValidationError::MeterMapTooLong(map.len()));
        }
        for (index, &value) in map.iter().enumerate() {
            if value < -1 || i32::from(value) >= i32::from(self.meter.slots) {
                errors.push(ValidationError::MeterMapEntry {
                    index,
                    value,
                    slots: self.meter.slots,
                });
            }
        }

        let labels = self.meter.labels_path.trim();
        if !labels.is_empty() && !Path::new(labels).is_file() {
            errors.push(ValidationError::LabelsPath(format!("file not found: {labels}")));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
