//! Raw PCM over UDP audio device
//!
//! Streams interleaved 16 bit samples as headerless datagrams, one block per
//! datagram. Useful for feeding audio to and from SDR tool chains or another
//! instance of this program. Both peers must agree on block size and channel
//! count; nothing on the wire describes the framing.

use bytes::{BufMut, BytesMut};
use std::io;
use std::net::{SocketAddr, UdpSocket};

use crate::audio::block::{BlockSink, BlockSource};
use crate::config::AudioParams;
use crate::device::{AudioDevice, DeviceMode};
use crate::error::{ConfigError, DeviceError, Result, TransportError};
use crate::network::udp::{
    bind_socket, create_send_socket, create_socket, DeviceSpec, EndpointAddress,
    OutputQueueProbe, SocketQueueProbe,
};

/// Largest datagram we are prepared to receive
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Device statistics
#[derive(Debug, Clone, Default)]
pub struct DeviceStats {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub blocks_received: u64,
    /// Trailing bytes that did not form a whole frame
    pub partial_bytes_dropped: u64,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

/// Audio device streaming raw samples over UDP
pub struct UdpAudioDevice {
    dev_name: String,
    params: AudioParams,
    mode: DeviceMode,
    sock: Option<UdpSocket>,
    endpoint: EndpointAddress,
    /// One block of staged input
    read_buf: Vec<i16>,
    /// Frames staged in `read_buf`
    read_buf_pos: usize,
    recv_buf: Vec<u8>,
    source: Option<Box<dyn BlockSource>>,
    sink: Option<Box<dyn BlockSink>>,
    probe: Box<dyn OutputQueueProbe>,
    stats: DeviceStats,
}

impl UdpAudioDevice {
    pub fn new(dev_name: &str, params: AudioParams) -> Self {
        Self {
            dev_name: dev_name.to_string(),
            params,
            mode: DeviceMode::None,
            sock: None,
            endpoint: EndpointAddress::default(),
            read_buf: vec![0; params.samples_per_block()],
            read_buf_pos: 0,
            recv_buf: vec![0; MAX_DATAGRAM_SIZE],
            source: None,
            sink: None,
            probe: Box::new(SocketQueueProbe),
            stats: DeviceStats::default(),
        }
    }

    /// Replace the output queue introspection
    pub fn with_output_probe(mut self, probe: Box<dyn OutputQueueProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Current endpoint (empty while closed)
    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    /// Local address of the socket, if open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats.clone()
    }

    /// Estimated whole blocks still queued for output
    pub fn blocks_to_write(&self) -> usize {
        self.pending_output_bytes() / self.params.bytes_per_block()
    }

    fn pending_output_bytes(&self) -> usize {
        if !self.mode.can_write() {
            return 0;
        }
        self.sock
            .as_ref()
            .and_then(|sock| self.probe.pending_output_bytes(sock))
            .unwrap_or(0)
    }

    fn invalid(&self, what: &'static str, mode: DeviceMode) -> ConfigError {
        ConfigError::MissingEndpoint {
            spec: self.dev_name.clone(),
            what,
            mode: mode.as_str(),
        }
    }

    fn open_socket(&self, mode: DeviceMode, endpoint: &EndpointAddress) -> Result<Option<UdpSocket>> {
        match mode {
            DeviceMode::None => Ok(None),
            DeviceMode::Write => {
                if endpoint.socket_addr().is_none() {
                    return Err(self.invalid("a destination address and port", mode).into());
                }
                let sock = create_send_socket(endpoint).map_err(|source| DeviceError::SocketCreate {
                    spec: self.dev_name.clone(),
                    source,
                })?;
                Ok(Some(sock))
            }
            DeviceMode::Read | DeviceMode::ReadWrite => {
                if mode == DeviceMode::ReadWrite && endpoint.ip.is_none() {
                    return Err(self.invalid("a destination address", mode).into());
                }
                if endpoint.port == 0 {
                    return Err(self.invalid("a port", mode).into());
                }
                let socket = create_socket(endpoint).map_err(|source| DeviceError::SocketCreate {
                    spec: self.dev_name.clone(),
                    source,
                })?;
                let sock = bind_socket(socket, endpoint).map_err(|source| DeviceError::Bind {
                    spec: self.dev_name.clone(),
                    port: endpoint.port,
                    source,
                })?;
                Ok(Some(sock))
            }
        }
    }

    /// Read path: cut one datagram into frames and emit every completed block
    ///
    /// Staged frames carry over between datagrams; trailing bytes that do not
    /// make up a whole frame are dropped.
    pub fn handle_datagram(&mut self, from: SocketAddr, data: &[u8]) {
        let channels = self.params.channels;
        let frame_bytes = channels * std::mem::size_of::<i16>();
        let frames = data.len() / frame_bytes;
        let remainder = data.len() % frame_bytes;

        self.stats.datagrams_received += 1;
        self.stats.bytes_received += data.len() as u64;
        if remainder != 0 {
            self.stats.partial_bytes_dropped += remainder as u64;
            tracing::trace!(
                "Dropping {} trailing bytes of a {} byte datagram from {}",
                remainder,
                data.len(),
                from
            );
        }

        for frame in data[..frames * frame_bytes].chunks_exact(frame_bytes) {
            let base = self.read_buf_pos * channels;
            for (ch, sample) in frame.chunks_exact(2).enumerate() {
                self.read_buf[base + ch] = i16::from_le_bytes([sample[0], sample[1]]);
            }
            self.read_buf_pos += 1;
            if self.read_buf_pos == self.params.block_size {
                if let Some(sink) = self.sink.as_mut() {
                    sink.put_block(&self.read_buf, channels);
                }
                self.stats.blocks_received += 1;
                self.read_buf_pos = 0;
            }
        }
    }

    /// Write path: pull blocks until the source runs dry, one datagram each
    fn write_blocks(&mut self) -> Result<usize> {
        if !self.mode.can_write() {
            return Err(DeviceError::NotWritable(self.dev_name.clone()).into());
        }
        let (Some(sock), Some(dest)) = (self.sock.as_ref(), self.endpoint.socket_addr()) else {
            return Err(DeviceError::NotWritable(self.dev_name.clone()).into());
        };
        let Some(source) = self.source.as_mut() else {
            return Ok(0);
        };

        let mut block = vec![0i16; self.params.samples_per_block()];
        let mut packet = BytesMut::with_capacity(self.params.bytes_per_block());
        let mut sent = 0;

        while source.get_block(&mut block) {
            packet.clear();
            for &sample in &block {
                packet.put_i16_le(sample);
            }

            match sock.send_to(&packet, dest) {
                Ok(n) if n == packet.len() => {
                    sent += 1;
                    self.stats.datagrams_sent += 1;
                    self.stats.bytes_sent += n as u64;
                }
                Ok(n) => {
                    self.stats.send_errors += 1;
                    return Err(TransportError::ShortSend {
                        dest,
                        sent: n,
                        expected: packet.len(),
                    }
                    .into());
                }
                Err(source) => {
                    self.stats.send_errors += 1;
                    tracing::warn!("Write to {} failed on {}: {}", dest, self.dev_name, source);
                    return Err(TransportError::SendFailed { dest, source }.into());
                }
            }
        }

        Ok(sent)
    }
}

impl AudioDevice for UdpAudioDevice {
    fn dev_name(&self) -> &str {
        &self.dev_name
    }

    fn mode(&self) -> DeviceMode {
        self.mode
    }

    fn block_size(&self) -> usize {
        self.params.block_size
    }

    fn channels(&self) -> usize {
        self.params.channels
    }

    fn is_full_duplex_capable(&self) -> bool {
        true
    }

    fn open(&mut self, mode: DeviceMode) -> Result<()> {
        if self.is_open() || self.mode != DeviceMode::None {
            self.close();
        }

        let spec = DeviceSpec::parse(&self.dev_name).map_err(|e| {
            tracing::error!("{}", e);
            e
        })?;

        let sock = self.open_socket(mode, &spec.endpoint).map_err(|e| {
            tracing::error!("Could not open {} for {}: {}", self.dev_name, mode, e);
            e
        })?;

        self.sock = sock;
        self.endpoint = spec.endpoint;
        self.mode = mode;
        self.read_buf_pos = 0;

        tracing::debug!(
            "Opened {} in {} mode (local {:?})",
            self.dev_name,
            mode,
            self.local_addr()
        );
        Ok(())
    }

    fn close(&mut self) {
        if self.sock.take().is_some() {
            tracing::debug!("Closed {}", self.dev_name);
        }
        self.endpoint = EndpointAddress::default();
        self.mode = DeviceMode::None;
    }

    fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    fn poll(&mut self) -> usize {
        if !self.mode.can_read() {
            return 0;
        }

        let mut recv_buf = std::mem::take(&mut self.recv_buf);
        let mut handled = 0;
        loop {
            let Some(sock) = self.sock.as_ref() else {
                break;
            };
            match sock.recv_from(&mut recv_buf) {
                Ok((len, from)) => {
                    self.handle_datagram(from, &recv_buf[..len]);
                    handled += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("Read from {} failed: {}", self.dev_name, e);
                    break;
                }
            }
        }
        self.recv_buf = recv_buf;
        handled
    }

    fn audio_to_write_available(&mut self) -> Result<usize> {
        self.write_blocks()
    }

    fn flush_samples(&mut self) -> Result<usize> {
        self.write_blocks()
    }

    fn frames_to_write(&self) -> usize {
        self.pending_output_bytes() / (self.params.channels * std::mem::size_of::<i16>())
    }

    fn set_block_source(&mut self, source: Box<dyn BlockSource>) {
        self.source = Some(source);
    }

    fn set_block_sink(&mut self, sink: Box<dyn BlockSink>) {
        self.sink = Some(sink);
    }
}

impl Drop for UdpAudioDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::block::{BlockQueue, SampleBlock};
    use crate::error::Error;
    use proptest::prelude::*;
    use std::time::Duration;

    const BLOCK_SIZE: usize = 8;
    const CHANNELS: usize = 2;

    fn params() -> AudioParams {
        AudioParams {
            sample_rate: 8000,
            block_size: BLOCK_SIZE,
            channels: CHANNELS,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn to_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn free_port() -> u16 {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.local_addr().unwrap().port()
    }

    struct FixedProbe(Option<usize>);

    impl OutputQueueProbe for FixedProbe {
        fn pending_output_bytes(&self, _socket: &UdpSocket) -> Option<usize> {
            self.0
        }
    }

    #[test]
    fn test_open_close_reopen() {
        let mut dev = UdpAudioDevice::new("udp:127.0.0.1:5000", params());
        dev.open(DeviceMode::Write).unwrap();
        assert!(dev.is_open());
        assert_eq!(dev.endpoint().port, 5000);

        dev.close();
        assert!(!dev.is_open());
        assert!(dev.endpoint().is_empty());
        dev.close();

        let mut dev2 = UdpAudioDevice::new("udp:10.1.2.3:6000", params());
        dev2.open(DeviceMode::Write).unwrap();
        dev2.open(DeviceMode::Write).unwrap();
        assert_eq!(dev2.endpoint().socket_addr(), Some("10.1.2.3:6000".parse().unwrap()));
    }

    #[test]
    fn test_open_none_creates_no_socket() {
        let mut dev = UdpAudioDevice::new("udp::", params());
        dev.open(DeviceMode::None).unwrap();
        assert!(!dev.is_open());
    }

    #[test]
    fn test_open_rejects_bad_specifiers() {
        let cases = [
            ("udp:127.0.0.1", DeviceMode::Write),
            ("udp:127.0.0.1:5000:7", DeviceMode::Write),
            ("udp:127.0.0.1:abc", DeviceMode::Write),
            ("udp:not-an-ip:5000", DeviceMode::Write),
            ("udp::5000", DeviceMode::Write),
            ("udp:127.0.0.1:0", DeviceMode::Write),
            ("udp:127.0.0.1:", DeviceMode::Read),
            ("udp::5000", DeviceMode::ReadWrite),
        ];
        for (spec, mode) in cases {
            let mut dev = UdpAudioDevice::new(spec, params());
            let err = dev.open(mode).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{spec}: {err}");
            assert!(!dev.is_open(), "{spec} left a socket open");
            assert_eq!(dev.mode(), DeviceMode::None);
        }
    }

    #[test]
    fn test_failed_reopen_releases_previous_socket() {
        // Sending needs no bind, reading needs the port another socket holds
        let taken = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let mut dev = UdpAudioDevice::new(&format!("udp:127.0.0.1:{port}"), params());
        dev.open(DeviceMode::Write).unwrap();
        assert!(dev.is_open());

        let err = dev.open(DeviceMode::ReadWrite).unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::Bind { .. })), "{err}");
        assert!(!dev.is_open());
        assert_eq!(dev.mode(), DeviceMode::None);
        assert!(dev.endpoint().is_empty());
    }

    #[test]
    fn test_bind_conflict_is_device_error() {
        let taken = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let mut dev = UdpAudioDevice::new(&format!("udp::{port}"), params());
        let err = dev.open(DeviceMode::Read).unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::Bind { .. })), "{err}");
        assert!(!dev.is_open());
    }

    #[test]
    fn test_partial_frame_bytes_are_dropped() {
        let queue = BlockQueue::new(4);
        let mut dev = UdpAudioDevice::new("udp::", params());
        dev.set_block_sink(Box::new(queue.clone()));

        let samples: Vec<i16> = (0..(BLOCK_SIZE * CHANNELS) as i16).collect();
        let (head, tail) = samples.split_at(3 * CHANNELS);

        let mut first = to_bytes(head);
        first.extend_from_slice(&[0x7f, 0x7f, 0x7f]);
        dev.handle_datagram(peer(), &first);
        assert!(queue.is_empty());

        dev.handle_datagram(peer(), &to_bytes(tail));
        let block = queue.try_pop().unwrap();
        assert_eq!(block.samples, samples);
        assert!(queue.is_empty());
        assert_eq!(dev.stats().partial_bytes_dropped, 3);
    }

    #[test]
    fn test_datagram_spanning_blocks() {
        let queue = BlockQueue::new(4);
        let mut dev = UdpAudioDevice::new("udp::", params());
        dev.set_block_sink(Box::new(queue.clone()));

        let samples: Vec<i16> = (0..(BLOCK_SIZE * CHANNELS * 2 + 2) as i16).collect();
        dev.handle_datagram(peer(), &to_bytes(&samples));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().samples, samples[..16].to_vec());
        assert_eq!(queue.try_pop().unwrap().samples, samples[16..32].to_vec());
        assert_eq!(dev.stats().blocks_received, 2);
    }

    proptest! {
        #[test]
        fn prop_split_datagrams_rebuild_same_block(
            samples in proptest::collection::vec(any::<i16>(), BLOCK_SIZE * CHANNELS),
            split in 0..=BLOCK_SIZE,
        ) {
            let queue = BlockQueue::new(4);
            let mut dev = UdpAudioDevice::new("udp::", params());
            dev.set_block_sink(Box::new(queue.clone()));

            let (a, b) = samples.split_at(split * CHANNELS);
            dev.handle_datagram(peer(), &to_bytes(a));
            dev.handle_datagram(peer(), &to_bytes(b));

            prop_assert_eq!(queue.len(), 1);
            prop_assert_eq!(queue.try_pop().unwrap().samples, samples);
        }
    }

    #[test]
    fn test_flush_sends_one_datagram_per_block() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let queue = BlockQueue::new(8);
        let mut dev = UdpAudioDevice::new(&format!("udp:127.0.0.1:{port}"), params());
        dev.set_block_source(Box::new(queue.clone()));
        dev.open(DeviceMode::Write).unwrap();

        assert_eq!(dev.flush_samples().unwrap(), 0);

        for i in 0..3 {
            queue.push(SampleBlock::new(vec![i; BLOCK_SIZE * CHANNELS], CHANNELS));
        }
        assert_eq!(dev.audio_to_write_available().unwrap(), 3);

        let mut buf = [0u8; 1024];
        for i in 0..3i16 {
            let (len, _) = receiver.recv_from(&mut buf).unwrap();
            assert_eq!(len, BLOCK_SIZE * CHANNELS * 2);
            assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), i);
        }

        receiver
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        assert!(receiver.recv_from(&mut buf).is_err());
        assert_eq!(dev.stats().datagrams_sent, 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_send_failure_stops_write_cycle() {
        // Broadcast without SO_BROADCAST is refused with EACCES
        let queue = BlockQueue::new(8);
        let mut dev = UdpAudioDevice::new("udp:255.255.255.255:9", params());
        dev.set_block_source(Box::new(queue.clone()));
        dev.open(DeviceMode::Write).unwrap();

        for i in 0..3 {
            queue.push(SampleBlock::new(vec![i; BLOCK_SIZE * CHANNELS], CHANNELS));
        }

        let err = dev.flush_samples().unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::SendFailed { .. })), "{err}");
        assert_eq!(queue.len(), 2);

        // The failed block is gone; the next cycle starts with the following one
        assert!(dev.flush_samples().is_err());
        assert_eq!(queue.len(), 1);
        assert_eq!(dev.stats().send_errors, 2);
        assert_eq!(dev.stats().datagrams_sent, 0);
        assert!(dev.is_open());
    }

    #[test]
    fn test_write_requires_write_mode() {
        let mut dev = UdpAudioDevice::new("udp::", params());
        dev.set_block_source(Box::new(BlockQueue::new(1)));
        let err = dev.flush_samples().unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::NotWritable(_))));
    }

    #[test]
    fn test_read_write_loopback() {
        let port = free_port();
        let inbox = BlockQueue::new(4);
        let outbox = BlockQueue::new(4);

        let mut dev = UdpAudioDevice::new(&format!("udp:127.0.0.1:{port}"), params());
        dev.set_block_sink(Box::new(inbox.clone()));
        dev.set_block_source(Box::new(outbox.clone()));
        dev.open(DeviceMode::ReadWrite).unwrap();

        let block = SampleBlock::new((0..16).collect(), CHANNELS);
        outbox.push(block.clone());
        assert_eq!(dev.flush_samples().unwrap(), 1);

        for _ in 0..100 {
            if dev.poll() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(inbox.try_pop(), Some(block));
    }

    #[test]
    fn test_queue_depth() {
        let mut dev = UdpAudioDevice::new("udp:127.0.0.1:5000", params())
            .with_output_probe(Box::new(FixedProbe(Some(80))));
        assert_eq!(dev.frames_to_write(), 0);

        dev.open(DeviceMode::Write).unwrap();
        assert_eq!(dev.frames_to_write(), 20);
        assert_eq!(dev.blocks_to_write(), 2);

        let mut failing = UdpAudioDevice::new("udp:127.0.0.1:5000", params())
            .with_output_probe(Box::new(FixedProbe(None)));
        failing.open(DeviceMode::Write).unwrap();
        assert_eq!(failing.frames_to_write(), 0);
    }

    #[test]
    fn test_queue_depth_zero_for_read_mode() {
        let port = free_port();
        let mut dev = UdpAudioDevice::new(&format!("udp::{port}"), params())
            .with_output_probe(Box::new(FixedProbe(Some(4096))));
        dev.open(DeviceMode::Read).unwrap();
        assert_eq!(dev.frames_to_write(), 0);
    }
}
