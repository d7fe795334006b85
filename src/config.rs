//! Configuration lookup
//!
//! Everything is addressed as `section/key`, the same way the radio daemon
//! config files are laid out. The file format is TOML with one table per
//! section:
//!
//! ```toml
//! [TrxUplink]
//! TX = "UplinkTx"
//! RX = "UplinkRx"
//! MUTE_RX_ON_TX = 1
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::{ConfigError, Result};

/// Section holding process wide settings
pub const GLOBAL_SECTION: &str = "GLOBAL";

/// Key/value configuration lookup
pub trait ConfigLookup: Send + Sync {
    /// Raw string value of `section/key`, if set
    fn get_value(&self, section: &str, key: &str) -> Option<String>;

    /// Value of a required key
    fn require(&self, section: &str, key: &str) -> std::result::Result<String, ConfigError> {
        self.get_value(section, key)
            .ok_or_else(|| ConfigError::MissingKey {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    /// Integer-as-boolean flag, false when absent
    fn get_flag(&self, section: &str, key: &str) -> bool {
        self.get_value(section, key)
            .map(|v| parse_flag(&v))
            .unwrap_or(false)
    }
}

/// Parsed numeric value of `section/key`, `default` when absent
pub fn get_number<T: std::str::FromStr>(
    cfg: &dyn ConfigLookup,
    section: &str,
    key: &str,
    default: T,
) -> std::result::Result<T, ConfigError> {
    match cfg.get_value(section, key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value,
        }),
    }
}

/// Interpret a config value the way `atoi(value) != 0` would
pub fn parse_flag(value: &str) -> bool {
    let s = value.trim_start();
    let s = s.strip_prefix(['+', '-']).unwrap_or(s);
    s.chars()
        .take_while(|c| c.is_ascii_digit())
        .any(|c| c != '0')
}

#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
struct ConfigFile {
    sections: BTreeMap<String, BTreeMap<String, toml::Value>>,
}

/// TOML backed configuration
#[derive(Debug, Default)]
pub struct Config {
    file: ConfigFile,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let cfg = Self::parse(&text)?;
        tracing::debug!(path = %path.display(), sections = cfg.file.sections.len(), "Loaded configuration");
        Ok(cfg)
    }

    /// Parse configuration from TOML text
    pub fn parse(text: &str) -> std::result::Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self { file })
    }

    /// Set a single value, creating the section if needed
    pub fn set_value(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.file
            .sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), toml::Value::String(value.into()));
    }

    /// Names of all sections
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.file.sections.keys().map(String::as_str)
    }
}

impl ConfigLookup for Config {
    fn get_value(&self, section: &str, key: &str) -> Option<String> {
        let value = self.file.sections.get(section)?.get(key)?;
        Some(match value {
            toml::Value::String(s) => s.clone(),
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
            other => other.to_string(),
        })
    }
}

/// Process wide audio format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    /// Frames per block
    pub block_size: usize,
    pub channels: usize,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl AudioParams {
    /// Read the audio format from the `GLOBAL` section
    pub fn from_config(cfg: &dyn ConfigLookup) -> std::result::Result<Self, ConfigError> {
        let defaults = Self::default();
        let params = Self {
            sample_rate: get_number(cfg, GLOBAL_SECTION, "CARD_SAMPLE_RATE", defaults.sample_rate)?,
            block_size: get_number(cfg, GLOBAL_SECTION, "BLOCK_SIZE", defaults.block_size)?,
            channels: get_number(cfg, GLOBAL_SECTION, "CARD_CHANNELS", defaults.channels)?,
        };
        if params.block_size == 0 || params.channels == 0 || params.sample_rate == 0 {
            return Err(ConfigError::InvalidValue {
                section: GLOBAL_SECTION.to_string(),
                key: "BLOCK_SIZE/CARD_CHANNELS/CARD_SAMPLE_RATE".to_string(),
                value: format!("{:?}", params),
            });
        }
        Ok(params)
    }

    /// Samples (all channels) in one block
    pub fn samples_per_block(&self) -> usize {
        self.block_size * self.channels
    }

    /// Bytes in one block on the wire
    pub fn bytes_per_block(&self) -> usize {
        self.samples_per_block() * std::mem::size_of::<i16>()
    }
}

/// Resolved settings of one uplink instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub name: String,
    pub uplink_tx: String,
    pub uplink_rx: String,
    pub mute_rx_on_tx: bool,
    pub loop_rx_to_tx: bool,
}

impl LinkConfig {
    /// Resolve the link settings stored in section `name`
    pub fn resolve(cfg: &dyn ConfigLookup, name: &str) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            name: name.to_string(),
            uplink_tx: cfg.require(name, "TX")?,
            uplink_rx: cfg.require(name, "RX")?,
            mute_rx_on_tx: cfg.get_flag(name, "MUTE_RX_ON_TX"),
            loop_rx_to_tx: cfg.get_flag(name, "LOOP_RX_TO_TX"),
        })
    }
}
