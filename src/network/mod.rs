//! Network subsystem for UDP audio transport

pub mod device;
pub mod udp;

pub use device::{DeviceStats, UdpAudioDevice};
pub use udp::{DeviceSpec, EndpointAddress, OutputQueueProbe, SocketQueueProbe};
