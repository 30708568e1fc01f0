//! Session configuration
//!
//! Stored as TOML. A session is bound to one [`DeviceSpec`] and decodes an
//! ordered list of named fields from each input report.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hidpad_transport::DeviceSpec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::predicate::Predicate;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Duplicate field name '{0}'")]
    DuplicateField(String),

    #[error("Field #{0} has an empty name")]
    EmptyFieldName(usize),
}

/// One (value, label) entry of a status mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusState {
    pub value: u8,
    pub label: String,
}

impl StatusState {
    pub fn new(value: u8, label: impl Into<String>) -> Self {
        Self {
            value,
            label: label.into(),
        }
    }
}

/// A named logical field decoded from fixed report offsets ("pins")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldConfig {
    /// Two axis bytes
    Joystick { name: String, x_pin: u16, y_pin: u16 },
    /// One byte run through a predicate
    Button {
        name: String,
        pin: u16,
        predicate: Predicate,
    },
    /// One byte looked up in an ordered value/label list, first match wins
    Status {
        name: String,
        pin: u16,
        /// Bits of the byte that carry the status
        #[serde(default = "full_mask", skip_serializing_if = "is_full_mask")]
        mask: u8,
        #[serde(default)]
        states: Vec<StatusState>,
    },
    /// One byte passed through
    Scale { name: String, pin: u16 },
}

impl FieldConfig {
    pub fn name(&self) -> &str {
        match self {
            FieldConfig::Joystick { name, .. }
            | FieldConfig::Button { name, .. }
            | FieldConfig::Status { name, .. }
            | FieldConfig::Scale { name, .. } => name,
        }
    }

    /// Shortest report that contains every pin of this field
    pub fn min_report_len(&self) -> usize {
        let highest = match self {
            FieldConfig::Joystick { x_pin, y_pin, .. } => (*x_pin).max(*y_pin),
            FieldConfig::Button { pin, .. }
            | FieldConfig::Status { pin, .. }
            | FieldConfig::Scale { pin, .. } => *pin,
        };
        usize::from(highest) + 1
    }
}

fn full_mask() -> u8 {
    0xFF
}

fn is_full_mask(mask: &u8) -> bool {
    *mask == 0xFF
}

/// Connect/retry behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Delay between failed connect attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ConnectionSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Output report encoding used for rumble
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RumbleProfile {
    /// Device has no rumble motor
    #[default]
    None,
    /// Sony DualShock 4 over USB
    DualShock4,
}

/// Everything needed to run a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub rumble: RumbleProfile,
    pub device: DeviceSpec,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(rename = "field", default)]
    pub fields: Vec<FieldConfig>,
}

impl SessionConfig {
    pub fn new(device: DeviceSpec, fields: Vec<FieldConfig>) -> Self {
        Self {
            rumble: RumbleProfile::None,
            device,
            connection: ConnectionSettings::default(),
            fields,
        }
    }

    pub fn with_rumble(mut self, rumble: RumbleProfile) -> Self {
        self.rumble = rumble;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.connection.retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hidpad")
            .join("session.toml")
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(io_err)?;
        Ok(())
    }

    /// Check that field names are non-empty and unique
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (index, field) in self.fields.iter().enumerate() {
            if field.name().is_empty() {
                return Err(ConfigError::EmptyFieldName(index));
            }
            if !seen.insert(field.name()) {
                return Err(ConfigError::DuplicateField(field.name().to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
rumble = "dualshock4"

[device]
vendor_id = 0x054C
product_id = 0x05C4

[connection]
retry_delay_ms = 250

[[field]]
kind = "joystick"
name = "left"
x_pin = 1
y_pin = 2

[[field]]
kind = "button"
name = "cross"
pin = 5
predicate = "value & 0x20"

[[field]]
kind = "status"
name = "dpad"
pin = 5
mask = 0x0F
states = [{ value = 0, label = "up" }, { value = 8, label = "released" }]

[[field]]
kind = "scale"
name = "l2"
pin = 8
"#;

    #[test]
    fn test_parse_sample() {
        let config = SessionConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.rumble, RumbleProfile::DualShock4);
        assert_eq!(config.device, DeviceSpec::new(0x054C, 0x05C4));
        assert_eq!(config.connection.retry_delay(), Duration::from_millis(250));
        assert_eq!(config.fields.len(), 4);

        match &config.fields[1] {
            FieldConfig::Button { name, pin, predicate } => {
                assert_eq!(name, "cross");
                assert_eq!(*pin, 5);
                assert!(predicate.evaluate(0x28));
                assert!(!predicate.evaluate(0x08));
            }
            other => panic!("unexpected field {other:?}"),
        }
        match &config.fields[2] {
            FieldConfig::Status { mask, states, .. } => {
                assert_eq!(*mask, 0x0F);
                assert_eq!(states[1], StatusState::new(8, "released"));
            }
            other => panic!("unexpected field {other:?}"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::from_toml_str(
            r#"
[device]
vendor_id = 1118
product_id = 654
serial_number = "ABC"
"#,
        )
        .unwrap();
        assert_eq!(config.rumble, RumbleProfile::None);
        assert_eq!(config.connection.retry_delay_ms, 500);
        assert!(config.fields.is_empty());
        assert_eq!(config.device.serial_number.as_deref(), Some("ABC"));
    }

    #[test]
    fn test_roundtrip() {
        let config = SessionConfig::from_toml_str(SAMPLE).unwrap();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = SessionConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut config = SessionConfig::from_toml_str(SAMPLE).unwrap();
        config.fields.push(FieldConfig::Scale {
            name: "left".into(),
            pin: 3,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateField(name)) if name == "left"
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = SessionConfig::new(
            DeviceSpec::new(1, 2),
            vec![FieldConfig::Scale {
                name: String::new(),
                pin: 0,
            }],
        );
        assert!(matches!(config.validate(), Err(ConfigError::EmptyFieldName(0))));
    }

    #[test]
    fn test_bad_predicate_is_parse_error() {
        let bad = SAMPLE.replace("value & 0x20", "value ** 2");
        assert!(matches!(
            SessionConfig::from_toml_str(&bad),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_min_report_len() {
        let field = FieldConfig::Joystick {
            name: "left".into(),
            x_pin: 3,
            y_pin: 4,
        };
        assert_eq!(field.min_report_len(), 5);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("hidpad-config-{}", std::process::id()));
        let path = dir.join("nested").join("session.toml");
        let config = SessionConfig::from_toml_str(SAMPLE).unwrap();
        config.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), config);
        std::fs::remove_dir_all(&dir).unwrap();

        assert!(matches!(
            SessionConfig::load(&path),
            Err(ConfigError::Io { .. })
        ));
    }
}
