//! Audio device abstraction and the device type registry
//!
//! A device is named by a specifier whose first colon separated field is the
//! transport tag (`udp:127.0.0.1:10000`). The [`DeviceFactory`] maps tags to
//! constructors; it is populated explicitly at start-up.

use std::collections::HashMap;
use std::fmt;

use crate::audio::block::{BlockSink, BlockSource};
use crate::config::AudioParams;
use crate::error::{ConfigError, Result};
use crate::network::UdpAudioDevice;

/// Direction(s) a device is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceMode {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
}

impl DeviceMode {
    pub fn can_read(self) -> bool {
        matches!(self, DeviceMode::Read | DeviceMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, DeviceMode::Write | DeviceMode::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceMode::None => "NONE",
            DeviceMode::Read => "READ",
            DeviceMode::Write => "WRITE",
            DeviceMode::ReadWrite => "READ_WRITE",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block oriented audio device
///
/// Read side: incoming audio is cut into blocks and handed to the block sink.
/// Write side: blocks are pulled from the block source whenever the owner
/// signals that audio is available or asks for a flush.
pub trait AudioDevice: Send {
    /// Full device specifier
    fn dev_name(&self) -> &str;

    fn mode(&self) -> DeviceMode;

    /// Frames per block
    fn block_size(&self) -> usize;

    fn channels(&self) -> usize;

    fn is_full_duplex_capable(&self) -> bool;

    /// Open for `mode`, closing first if already open
    fn open(&mut self, mode: DeviceMode) -> Result<()>;

    /// Release the device; harmless when already closed
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Deliver whatever input is pending, returns the number of reads handled
    fn poll(&mut self) -> usize;

    /// The block source has new audio
    fn audio_to_write_available(&mut self) -> Result<usize>;

    /// Write out everything the block source holds
    fn flush_samples(&mut self) -> Result<usize>;

    /// Estimated frames (one sample per channel) still queued for output
    fn frames_to_write(&self) -> usize;

    fn set_block_source(&mut self, source: Box<dyn BlockSource>);

    fn set_block_sink(&mut self, sink: Box<dyn BlockSink>);
}

/// Constructor registered for one transport tag
pub type DeviceConstructor = fn(&str, AudioParams) -> Box<dyn AudioDevice>;

/// Registry of device types keyed by transport tag
pub struct DeviceFactory {
    params: AudioParams,
    constructors: HashMap<String, DeviceConstructor>,
}

impl DeviceFactory {
    /// Empty registry
    pub fn new(params: AudioParams) -> Self {
        Self {
            params,
            constructors: HashMap::new(),
        }
    }

    /// Registry with the built-in device types
    pub fn with_defaults(params: AudioParams) -> Self {
        let mut factory = Self::new(params);
        factory.register("udp", create_udp);
        factory
    }

    /// Register `constructor` for `tag`, returning the one it replaces
    pub fn register(&mut self, tag: &str, constructor: DeviceConstructor) -> Option<DeviceConstructor> {
        self.constructors.insert(tag.to_string(), constructor)
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    pub fn params(&self) -> AudioParams {
        self.params
    }

    /// Create an (unopened) device for `spec`
    pub fn create(&self, spec: &str) -> Result<Box<dyn AudioDevice>> {
        let (tag, _) = spec
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidSpecifier(spec.to_string()))?;
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| ConfigError::UnknownDeviceType(tag.to_string()))?;
        tracing::debug!("Creating {} audio device {}", tag, spec);
        Ok(constructor(spec, self.params))
    }
}

fn create_udp(name: &str, params: AudioParams) -> Box<dyn AudioDevice> {
    Box::new(UdpAudioDevice::new(name, params))
}

impl fmt::Debug for DeviceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.constructors.keys().collect();
        tags.sort();
        f.debug_struct("DeviceFactory")
            .field("params", &self.params)
            .field("types", &tags)
            .finish()
    }
}
