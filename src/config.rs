use crate::error::{Error, Result};
use crate::hal::{Format, Mode};
use anyhow::Context;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BUF_SIZE: usize = 384;
pub const DEFAULT_TX_MULTIPLE: usize = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub spi: SpiConfig,
    pub buffer: BufferConfig,
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiConfig {
    pub frequency_hz: u32,
    pub bits: u8,
    pub mode: Mode,
}

/// What the interrupt handler does with a received byte when the rx ring is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Discard the oldest unread byte
    #[default]
    OverwriteOldest,
    /// Discard the incoming byte
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// rx capacity, and the size of one tx message unit (also the printf limit)
    pub buf_size: usize,
    /// Number of message units the tx ring holds
    pub tx_multiple: usize,
    pub overrun: OverrunPolicy,
    /// Initial blocking mode of the file handle
    pub blocking: bool,
    /// Byte clocked out when only receiving
    pub filler: u8,
    /// Settle time after explicit enable_nss/disable_nss
    pub nss_delay_ms: u64,
    /// Diagnostic identifier used in log lines
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 1_000_000,
            bits: 8,
            mode: Mode::Mode0,
        }
    }
}

impl SpiConfig {
    pub fn format(&self) -> Format {
        Format {
            bits: self.bits,
            mode: self.mode,
        }
    }

    /// Check the bus settings and return the frame format they describe.
    pub fn validate(&self) -> Result<Format> {
        if self.frequency_hz == 0 {
            return Err(Error::InvalidConfig("frequency_hz must be non-zero"));
        }
        let format = self.format();
        if format.bits != 8 && format.bits != 16 {
            return Err(Error::InvalidConfig("bits must be 8 or 16"));
        }
        Ok(format)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buf_size: DEFAULT_BUF_SIZE,
            tx_multiple: DEFAULT_TX_MULTIPLE,
            overrun: OverrunPolicy::OverwriteOldest,
            blocking: true,
            filler: 0x00,
            nss_delay_ms: 0,
            name: None,
        }
    }
}

impl BufferConfig {
    /// Check the sizes and return the tx ring capacity.
    pub fn validate(&self) -> Result<usize> {
        if self.buf_size == 0 {
            return Err(Error::InvalidConfig("buf_size must be non-zero"));
        }
        if self.tx_multiple == 0 {
            return Err(Error::InvalidConfig("tx_multiple must be non-zero"));
        }
        self.buf_size
            .checked_mul(self.tx_multiple)
            .ok_or(Error::InvalidConfig("buf_size * tx_multiple overflows"))
    }

    pub fn nss_delay(&self) -> Duration {
        Duration::from_millis(self.nss_delay_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

impl Config {
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("Failed to parse configuration file")?;
        config.spi.validate()?;
        config.buffer.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
    }
}
