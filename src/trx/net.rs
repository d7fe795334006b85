//! Transceivers backed by a datagram audio device
//!
//! A [`NetTransmitter`] cuts the audio written to it into device blocks and
//! sends them; a [`NetReceiver`] turns incoming blocks into a squelch-gated
//! audio stream. Section keys:
//!
//! ```toml
//! [UplinkTx]
//! AUDIO_DEV = "udp:192.168.1.20:10000"
//! CTCSS_FQ = 88.5          # optional, Hz
//!
//! [UplinkRx]
//! AUDIO_DEV = "udp::10001"
//! SQL_HANGTIME = 200       # optional, ms
//! ```

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::{DtmfDigit, Receiver, Transmitter, TrxFactory, TxCtrlMode};
use crate::audio::tone::{render_dtmf, CtcssMixer};
use crate::audio::{AudioOutlet, AudioSink, BlockQueue, SampleBlock};
use crate::config::{get_number, AudioParams, ConfigLookup};
use crate::constants::{DEFAULT_SQL_HANGTIME_MS, RX_QUEUE_BLOCKS, TX_QUEUE_BLOCKS};
use crate::device::{AudioDevice, DeviceFactory, DeviceMode};
use crate::error::{ConfigError, Result};
use crate::events::Signal;

/// Transmitter sending raw PCM to a datagram device
pub struct NetTransmitter {
    name: String,
    dev_spec: String,
    params: AudioParams,
    ctcss_fq: f32,
    devices: Arc<DeviceFactory>,
    queue: BlockQueue,
    inner: Mutex<TxInner>,
    state_change: Signal<bool>,
}

struct TxInner {
    device: Option<Box<dyn AudioDevice>>,
    /// Mono samples not yet forming a whole block
    pending: Vec<i16>,
    ctrl_mode: TxCtrlMode,
    transmitting: bool,
    ctcss: Option<CtcssMixer>,
}

impl NetTransmitter {
    pub fn new(cfg: &dyn ConfigLookup, name: &str, devices: Arc<DeviceFactory>) -> Result<Self> {
        let dev_spec = cfg.require(name, "AUDIO_DEV")?;
        let ctcss_fq: f32 = get_number(cfg, name, "CTCSS_FQ", 0.0)?;
        let params = devices.params();

        Ok(Self {
            name: name.to_string(),
            dev_spec,
            params,
            ctcss_fq,
            devices,
            queue: BlockQueue::new(TX_QUEUE_BLOCKS),
            inner: Mutex::new(TxInner {
                device: None,
                pending: Vec::with_capacity(params.block_size),
                ctrl_mode: TxCtrlMode::Off,
                transmitting: false,
                ctcss: None,
            }),
            state_change: Signal::new(),
        })
    }

    pub fn dev_spec(&self) -> &str {
        &self.dev_spec
    }

    /// Blocks cut but not yet taken by the device
    pub fn queued_blocks(&self) -> usize {
        self.queue.len()
    }

    fn set_transmitting(inner: &mut TxInner, on: bool) -> Option<bool> {
        if inner.transmitting == on {
            return None;
        }
        inner.transmitting = on;
        Some(on)
    }

    fn notify(&self, change: Option<bool>) {
        if let Some(on) = change {
            tracing::debug!("{}: transmitter {}", self.name, if on { "ON" } else { "OFF" });
            self.state_change.emit(&on);
        }
    }

    /// Move whole blocks from `pending` to the queue, padding the tail with
    /// silence when `pad` is set
    fn cut_blocks(&self, inner: &mut TxInner, pad: bool) {
        let frames = self.params.block_size;
        let channels = self.params.channels;

        let tail = inner.pending.len() % frames;
        if pad && tail != 0 {
            let padded = inner.pending.len() + frames - tail;
            inner.pending.resize(padded, 0);
        }

        while inner.pending.len() >= frames {
            let mut samples = Vec::with_capacity(frames * channels);
            for s in inner.pending.drain(..frames) {
                samples.extend(std::iter::repeat(s).take(channels));
            }
            if let Some(ctcss) = inner.ctcss.as_mut() {
                ctcss.mix(&mut samples, channels);
            }
            if !self.queue.push(SampleBlock::new(samples, channels)) && self.queue.overflow_count() == 1 {
                tracing::warn!("{}: transmit queue full, dropping audio", self.name);
            }
        }
    }

    fn kick_device(&self, inner: &mut TxInner, flush: bool) {
        let Some(device) = inner.device.as_mut() else {
            return;
        };
        let result = if flush {
            device.flush_samples()
        } else {
            device.audio_to_write_available()
        };
        if let Err(e) = result {
            tracing::warn!("{}: {}", self.name, e);
        }
    }
}

impl AudioSink for NetTransmitter {
    fn write_samples(&self, samples: &[i16]) -> usize {
        let change = {
            let mut inner = self.inner.lock();
            if inner.ctrl_mode == TxCtrlMode::Off {
                return samples.len();
            }
            let change = if inner.ctrl_mode == TxCtrlMode::Auto {
                Self::set_transmitting(&mut inner, true)
            } else {
                None
            };
            inner.pending.extend_from_slice(samples);
            self.cut_blocks(&mut inner, false);
            self.kick_device(&mut inner, false);
            change
        };
        self.notify(change);
        samples.len()
    }

    fn flush_samples(&self) {
        let change = {
            let mut inner = self.inner.lock();
            self.cut_blocks(&mut inner, true);
            self.kick_device(&mut inner, true);
            if inner.ctrl_mode == TxCtrlMode::Auto {
                Self::set_transmitting(&mut inner, false)
            } else {
                None
            }
        };
        self.notify(change);
    }
}

impl Transmitter for NetTransmitter {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.device.is_some() {
            return Ok(());
        }
        let mut device = self.devices.create(&self.dev_spec)?;
        device.set_block_source(Box::new(self.queue.clone()));
        device.open(DeviceMode::Write)?;
        tracing::info!("{}: transmitting to {}", self.name, self.dev_spec);
        inner.device = Some(device);
        Ok(())
    }

    fn set_tx_ctrl_mode(&self, mode: TxCtrlMode) {
        let change = {
            let mut inner = self.inner.lock();
            inner.ctrl_mode = mode;
            match mode {
                TxCtrlMode::Off => {
                    inner.pending.clear();
                    self.queue.clear();
                    Self::set_transmitting(&mut inner, false)
                }
                TxCtrlMode::On => Self::set_transmitting(&mut inner, true),
                TxCtrlMode::Auto => None,
            }
        };
        tracing::debug!("{}: tx control {:?}", self.name, mode);
        self.notify(change);
    }

    fn tx_ctrl_mode(&self) -> TxCtrlMode {
        self.inner.lock().ctrl_mode
    }

    fn enable_ctcss(&self, enable: bool) {
        let mixer = if enable && self.ctcss_fq > 0.0 {
            Some(CtcssMixer::new(self.ctcss_fq, self.params.sample_rate))
        } else {
            if enable {
                tracing::debug!("{}: no CTCSS_FQ configured, calling tone stays off", self.name);
            }
            None
        };
        self.inner.lock().ctcss = mixer;
    }

    fn send_dtmf(&self, digits: &str) {
        let tones = render_dtmf(digits, self.params.sample_rate);
        if tones.is_empty() {
            return;
        }
        tracing::debug!("{}: sending DTMF {:?}", self.name, digits);
        let was_transmitting = self.is_transmitting();
        self.write_samples(&tones);
        if !was_transmitting {
            self.flush_samples();
        }
    }

    fn is_transmitting(&self) -> bool {
        self.inner.lock().transmitting
    }

    fn transmitter_state_change(&self) -> &Signal<bool> {
        &self.state_change
    }
}

/// Receiver fed by a datagram device
///
/// Audio is only delivered from [`NetReceiver::poll`], so all outlet writes
/// happen on the event loop.
pub struct NetReceiver {
    name: String,
    dev_spec: String,
    hangtime: Duration,
    devices: Arc<DeviceFactory>,
    inbox: BlockQueue,
    device: Mutex<Option<Box<dyn AudioDevice>>>,
    state: Mutex<RxState>,
    squelch_open: Signal<bool>,
    dtmf: Signal<DtmfDigit>,
}

#[derive(Default)]
struct RxState {
    outlet: Option<AudioOutlet>,
    muted: bool,
    sql_open: bool,
    last_block: Option<Instant>,
}

impl NetReceiver {
    pub fn new(cfg: &dyn ConfigLookup, name: &str, devices: Arc<DeviceFactory>) -> Result<Self> {
        let dev_spec = cfg.require(name, "AUDIO_DEV")?;
        let hangtime_ms: u64 = get_number(cfg, name, "SQL_HANGTIME", DEFAULT_SQL_HANGTIME_MS)?;

        Ok(Self {
            name: name.to_string(),
            dev_spec,
            hangtime: Duration::from_millis(hangtime_ms),
            devices,
            inbox: BlockQueue::new(RX_QUEUE_BLOCKS),
            device: Mutex::new(None),
            state: Mutex::new(RxState::default()),
            squelch_open: Signal::new(),
            dtmf: Signal::new(),
        })
    }

    pub fn dev_spec(&self) -> &str {
        &self.dev_spec
    }

    pub fn hangtime(&self) -> Duration {
        self.hangtime
    }

    /// Read pending datagrams and run the squelch; returns blocks delivered
    pub fn poll(&self, now: Instant) -> usize {
        if let Some(device) = self.device.lock().as_mut() {
            device.poll();
        }

        let mut delivered = 0;
        while let Some(block) = self.inbox.try_pop() {
            if self.deliver(&block, now) {
                delivered += 1;
            }
        }

        let closing = {
            let mut st = self.state.lock();
            let expired = st
                .last_block
                .map_or(true, |t| now.saturating_duration_since(t) >= self.hangtime);
            if st.sql_open && (st.muted || expired) {
                st.sql_open = false;
                Some(st.outlet.clone())
            } else {
                None
            }
        };
        if let Some(outlet) = closing {
            self.squelch_closed(outlet);
        }

        delivered
    }

    fn deliver(&self, block: &SampleBlock, now: Instant) -> bool {
        let (opened, outlet) = {
            let mut st = self.state.lock();
            if st.muted {
                return false;
            }
            st.last_block = Some(now);
            let opened = !st.sql_open;
            st.sql_open = true;
            (opened, st.outlet.clone())
        };

        if opened {
            tracing::debug!("{}: squelch OPEN", self.name);
            self.squelch_open.emit(&true);
        }
        if let Some(outlet) = outlet {
            outlet.write_samples(&downmix(block));
        }
        true
    }

    fn squelch_closed(&self, outlet: Option<AudioOutlet>) {
        if let Some(outlet) = outlet {
            outlet.flush_samples();
        }
        tracing::debug!("{}: squelch CLOSED", self.name);
        self.squelch_open.emit(&false);
    }
}

/// Average interleaved frames down to mono
fn downmix(block: &SampleBlock) -> Vec<i16> {
    if block.channels <= 1 {
        return block.samples.clone();
    }
    block
        .samples
        .chunks(block.channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

impl Receiver for NetReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> Result<()> {
        let mut slot = self.device.lock();
        if slot.is_some() {
            return Ok(());
        }
        let mut device = self.devices.create(&self.dev_spec)?;
        device.set_block_sink(Box::new(self.inbox.clone()));
        device.open(DeviceMode::Read)?;
        tracing::info!("{}: receiving on {}", self.name, self.dev_spec);
        *slot = Some(device);
        Ok(())
    }

    fn reset(&self) {
        self.inbox.clear();
        let closing = {
            let mut st = self.state.lock();
            st.last_block = None;
            let was_open = std::mem::replace(&mut st.sql_open, false);
            was_open.then(|| st.outlet.clone())
        };
        if let Some(outlet) = closing {
            self.squelch_closed(outlet);
        }
    }

    // Called from transmitter callbacks that may run inside a graph write, so
    // the squelch is closed on the next poll rather than here.
    fn mute(&self, mute: bool) {
        let mut st = self.state.lock();
        if st.muted != mute {
            tracing::debug!("{}: {}", self.name, if mute { "muted" } else { "unmuted" });
            st.muted = mute;
        }
        if mute {
            self.inbox.clear();
        }
    }

    fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    fn squelch_is_open(&self) -> bool {
        self.state.lock().sql_open
    }

    fn set_audio_output(&self, outlet: Option<AudioOutlet>) {
        self.state.lock().outlet = outlet;
    }

    fn squelch_open(&self) -> &Signal<bool> {
        &self.squelch_open
    }

    fn dtmf_digit_detected(&self) -> &Signal<DtmfDigit> {
        &self.dtmf
    }
}

/// Creates network transceivers and keeps track of the receivers to poll
pub struct NetTrxFactory {
    devices: Arc<DeviceFactory>,
    receivers: Mutex<Vec<Weak<NetReceiver>>>,
}

impl NetTrxFactory {
    pub fn new(devices: DeviceFactory) -> Self {
        Self {
            devices: Arc::new(devices),
            receivers: Mutex::new(Vec::new()),
        }
    }

    pub fn create_net_tx(&self, cfg: &dyn ConfigLookup, name: &str) -> Result<Arc<NetTransmitter>> {
        check_type(cfg, name)?;
        Ok(Arc::new(NetTransmitter::new(cfg, name, self.devices.clone())?))
    }

    pub fn create_net_rx(&self, cfg: &dyn ConfigLookup, name: &str) -> Result<Arc<NetReceiver>> {
        check_type(cfg, name)?;
        let rx = Arc::new(NetReceiver::new(cfg, name, self.devices.clone())?);
        self.receivers.lock().push(Arc::downgrade(&rx));
        Ok(rx)
    }

    /// Poll every receiver still alive; returns blocks delivered
    pub fn poll(&self, now: Instant) -> usize {
        let receivers: Vec<Arc<NetReceiver>> = {
            let mut list = self.receivers.lock();
            list.retain(|rx| rx.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        receivers.iter().map(|rx| rx.poll(now)).sum()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers
            .lock()
            .iter()
            .filter(|rx| rx.strong_count() > 0)
            .count()
    }
}

fn check_type(cfg: &dyn ConfigLookup, name: &str) -> std::result::Result<(), ConfigError> {
    match cfg.get_value(name, "TYPE") {
        None => Ok(()),
        Some(t) if t.eq_ignore_ascii_case("net") => Ok(()),
        Some(value) => Err(ConfigError::InvalidValue {
            section: name.to_string(),
            key: "TYPE".to_string(),
            value,
        }),
    }
}

impl TrxFactory for NetTrxFactory {
    fn create_tx(&self, cfg: &dyn ConfigLookup, name: &str) -> Result<Arc<dyn Transmitter>> {
        let tx: Arc<dyn Transmitter> = self.create_net_tx(cfg, name)?;
        Ok(tx)
    }

    fn create_rx(&self, cfg: &dyn ConfigLookup, name: &str) -> Result<Arc<dyn Receiver>> {
        let rx: Arc<dyn Receiver> = self.create_net_rx(cfg, name)?;
        Ok(rx)
    }
}
