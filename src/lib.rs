//! # Remote Transceiver Uplink
//!
//! Raw PCM audio over UDP between a radio site and a remote transceiver, plus
//! the router that ties a local receiver/transmitter pair to the uplink.
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────┐   ┌──────────────┐   ┌──────────┐   ┌──────────────┐
//!  │ Local Rx │──▶│ FIFO 8000    │──▶│ Splitter │──▶│  Uplink Tx   │──▶ UDP
//!  └──────────┘   │ prebuf 512   │   └────┬─────┘   │ AUTO + CTCSS │
//!                 └──────────────┘        │         └──────────────┘
//!                                         ▼
//!                                  ┌─────────────┐
//!                                  │ Passthrough │
//!                                  └──────┬──────┘
//!                                         │ prio 0
//!  ┌──────────┐                      ┌────▼─────┐   ┌──────────────┐
//!  │ Local Tx │◀─────────────────────│ Selector │◀──│  Uplink Rx   │◀── UDP
//!  └──────────┘                      └──────────┘   └──────────────┘
//!                                           prio 10
//!
//!  DTMF:          local rx ──▶ uplink tx,  uplink rx ──▶ local tx
//!  MUTE_RX_ON_TX: uplink tx keyed ──▶ uplink rx muted
//! ```
//!
//! Without loop-back the splitter, passthrough and selector are left out and
//! the uplink receiver feeds the local transmitter directly.

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod network;
pub mod trx;
pub mod uplink;

pub use error::{Error, Result};

/// Global constants
pub mod constants {
    /// Default sample rate (Hz)
    pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

    /// Default frames per device block
    pub const DEFAULT_BLOCK_SIZE: usize = 256;

    /// Default number of channels
    pub const DEFAULT_CHANNELS: usize = 1;

    /// Capacity of the buffer between the local receiver and the uplink
    pub const FIFO_CAPACITY_SAMPLES: usize = 8000;

    /// Samples held back before the buffer starts forwarding
    pub const FIFO_PREBUF_SAMPLES: usize = 512;

    /// Selector priority of the uplink receiver
    pub const UPLINK_RX_PRIORITY: i32 = 10;

    /// Selector priority of the local loop-back path
    pub const LOOPBACK_PRIORITY: i32 = 0;

    /// Default receiver squelch hang time (ms)
    pub const DEFAULT_SQL_HANGTIME_MS: u64 = 200;

    /// Blocks a network transmitter may queue ahead of its device
    pub const TX_QUEUE_BLOCKS: usize = 64;

    /// Blocks a network receiver may queue before they are consumed
    pub const RX_QUEUE_BLOCKS: usize = 64;

    /// Event loop poll interval (ms)
    pub const POLL_INTERVAL_MS: u64 = 5;
}
