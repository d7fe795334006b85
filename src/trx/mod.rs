//! Transmitter and receiver contracts
//!
//! The router only talks to radios through these traits. Audio flows into a
//! transmitter through its [`AudioSink`] side and out of a receiver through
//! the [`AudioOutlet`] it has been given; everything else is control calls
//! and [`Signal`] notifications.

pub mod net;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use crate::audio::{AudioOutlet, AudioSink};
use crate::config::ConfigLookup;
use crate::error::Result;
use crate::events::Signal;

pub use net::{NetReceiver, NetTransmitter, NetTrxFactory};

/// How a transmitter decides to key up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxCtrlMode {
    /// Never transmit
    #[default]
    Off,
    /// Transmit continuously
    On,
    /// Transmit while audio is being written
    Auto,
}

/// A DTMF digit reported by a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfDigit {
    pub digit: char,
    pub duration_ms: u32,
}

pub trait Transmitter: AudioSink {
    fn name(&self) -> &str;

    /// Acquire the underlying device; must succeed before use
    fn initialize(&self) -> Result<()>;

    fn set_tx_ctrl_mode(&self, mode: TxCtrlMode);

    fn tx_ctrl_mode(&self) -> TxCtrlMode;

    /// Enable or disable the calling tone
    fn enable_ctcss(&self, enable: bool);

    /// Queue DTMF digits for transmission
    fn send_dtmf(&self, digits: &str);

    fn is_transmitting(&self) -> bool;

    /// Emits `true` on key up and `false` on key down
    fn transmitter_state_change(&self) -> &Signal<bool>;
}

pub trait Receiver: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire the underlying device; must succeed before use
    fn initialize(&self) -> Result<()>;

    /// Drop pending audio and close the squelch
    fn reset(&self);

    /// A muted receiver discards everything it receives
    fn mute(&self, mute: bool);

    fn is_muted(&self) -> bool;

    fn squelch_is_open(&self) -> bool;

    /// Where received audio goes; `None` disconnects
    fn set_audio_output(&self, outlet: Option<AudioOutlet>);

    fn squelch_open(&self) -> &Signal<bool>;

    fn dtmf_digit_detected(&self) -> &Signal<DtmfDigit>;
}

/// Builds transceivers from configuration sections
pub trait TrxFactory: Send + Sync {
    fn create_tx(&self, cfg: &dyn ConfigLookup, name: &str) -> Result<Arc<dyn Transmitter>>;

    fn create_rx(&self, cfg: &dyn ConfigLookup, name: &str) -> Result<Arc<dyn Receiver>>;
}
