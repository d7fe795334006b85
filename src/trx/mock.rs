//! Recording transceivers for router tests

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{DtmfDigit, Receiver, Transmitter, TrxFactory, TxCtrlMode};
use crate::audio::{AudioOutlet, AudioSink};
use crate::config::ConfigLookup;
use crate::error::{InitError, Result};
use crate::events::Signal;

pub(crate) struct MockTx {
    name: String,
    fail_init: bool,
    initialized: AtomicBool,
    mode: Mutex<TxCtrlMode>,
    ctcss: AtomicBool,
    digits: Mutex<Vec<String>>,
    samples: Mutex<Vec<i16>>,
    flushes: AtomicUsize,
    transmitting: AtomicBool,
    state_change: Signal<bool>,
}

impl MockTx {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false))
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true))
    }

    fn build(name: &str, fail_init: bool) -> Self {
        Self {
            name: name.to_string(),
            fail_init,
            initialized: AtomicBool::new(false),
            mode: Mutex::new(TxCtrlMode::Off),
            ctcss: AtomicBool::new(false),
            digits: Mutex::new(Vec::new()),
            samples: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            transmitting: AtomicBool::new(false),
            state_change: Signal::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn ctcss_enabled(&self) -> bool {
        self.ctcss.load(Ordering::SeqCst)
    }

    pub fn digits(&self) -> Vec<String> {
        self.digits.lock().clone()
    }

    pub fn samples(&self) -> Vec<i16> {
        self.samples.lock().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Simulate a key up/down
    pub fn set_transmitting(&self, on: bool) {
        self.transmitting.store(on, Ordering::SeqCst);
        self.state_change.emit(&on);
    }
}

impl AudioSink for MockTx {
    fn write_samples(&self, samples: &[i16]) -> usize {
        self.samples.lock().extend_from_slice(samples);
        samples.len()
    }

    fn flush_samples(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Transmitter for MockTx {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> Result<()> {
        if self.fail_init {
            return Err(InitError::Transmitter {
                name: self.name.clone(),
                reason: "mock failure".to_string(),
            }
            .into());
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_tx_ctrl_mode(&self, mode: TxCtrlMode) {
        *self.mode.lock() = mode;
    }

    fn tx_ctrl_mode(&self) -> TxCtrlMode {
        *self.mode.lock()
    }

    fn enable_ctcss(&self, enable: bool) {
        self.ctcss.store(enable, Ordering::SeqCst);
    }

    fn send_dtmf(&self, digits: &str) {
        self.digits.lock().push(digits.to_string());
    }

    fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    fn transmitter_state_change(&self) -> &Signal<bool> {
        &self.state_change
    }
}

pub(crate) struct MockRx {
    name: String,
    fail_init: bool,
    initialized: AtomicBool,
    muted: AtomicBool,
    resets: AtomicUsize,
    outlet: Mutex<Option<AudioOutlet>>,
    squelch: Signal<bool>,
    dtmf: Signal<DtmfDigit>,
}

impl MockRx {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false))
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true))
    }

    fn build(name: &str, fail_init: bool) -> Self {
        Self {
            name: name.to_string(),
            fail_init,
            initialized: AtomicBool::new(false),
            // Starts muted so tests can see the router unmute it
            muted: AtomicBool::new(true),
            resets: AtomicUsize::new(0),
            outlet: Mutex::new(None),
            squelch: Signal::new(),
            dtmf: Signal::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn has_output(&self) -> bool {
        self.outlet.lock().is_some()
    }

    /// Simulate received audio
    pub fn feed(&self, samples: &[i16]) -> usize {
        if self.is_muted() {
            return samples.len();
        }
        let outlet = self.outlet.lock().clone();
        outlet.map_or(0, |o| o.write_samples(samples))
    }

    /// Simulate the end of a transmission
    pub fn end_of_stream(&self) {
        let outlet = self.outlet.lock().clone();
        if let Some(o) = outlet {
            o.flush_samples();
        }
    }

    pub fn detect_dtmf(&self, digit: char) {
        self.dtmf.emit(&DtmfDigit {
            digit,
            duration_ms: 120,
        });
    }

    pub fn set_squelch(&self, open: bool) {
        self.squelch.emit(&open);
    }
}

impl Receiver for MockRx {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> Result<()> {
        if self.fail_init {
            return Err(InitError::Receiver {
                name: self.name.clone(),
                reason: "mock failure".to_string(),
            }
            .into());
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn mute(&self, mute: bool) {
        self.muted.store(mute, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn squelch_is_open(&self) -> bool {
        false
    }

    fn set_audio_output(&self, outlet: Option<AudioOutlet>) {
        *self.outlet.lock() = outlet;
    }

    fn squelch_open(&self) -> &Signal<bool> {
        &self.squelch
    }

    fn dtmf_digit_detected(&self) -> &Signal<DtmfDigit> {
        &self.dtmf
    }
}

/// Hands out mock transceivers and keeps a handle on each one
#[derive(Default)]
pub(crate) struct MockFactory {
    fail_tx_init: bool,
    fail_rx_init: bool,
    txs: Mutex<Vec<Arc<MockTx>>>,
    rxs: Mutex<Vec<Arc<MockRx>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_failing_tx() -> Arc<Self> {
        Arc::new(Self {
            fail_tx_init: true,
            ..Self::default()
        })
    }

    pub fn with_failing_rx() -> Arc<Self> {
        Arc::new(Self {
            fail_rx_init: true,
            ..Self::default()
        })
    }

    pub fn tx(&self) -> Option<Arc<MockTx>> {
        self.txs.lock().last().cloned()
    }

    pub fn rx(&self) -> Option<Arc<MockRx>> {
        self.rxs.lock().last().cloned()
    }

    pub fn created(&self) -> (usize, usize) {
        (self.txs.lock().len(), self.rxs.lock().len())
    }
}

impl TrxFactory for MockFactory {
    fn create_tx(&self, _cfg: &dyn ConfigLookup, name: &str) -> Result<Arc<dyn Transmitter>> {
        let tx = if self.fail_tx_init {
            MockTx::failing(name)
        } else {
            MockTx::new(name)
        };
        self.txs.lock().push(tx.clone());
        Ok(tx)
    }

    fn create_rx(&self, _cfg: &dyn ConfigLookup, name: &str) -> Result<Arc<dyn Receiver>> {
        let rx = if self.fail_rx_init {
            MockRx::failing(name)
        } else {
            MockRx::new(name)
        };
        self.rxs.lock().push(rx.clone());
        Ok(rx)
    }
}
