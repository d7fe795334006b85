//! Uplink audio router
//!
//! Connects a local receiver/transmitter pair to an uplink transmitter and
//! receiver described by one configuration section:
//!
//! ```toml
//! [TrxUplink]
//! TX = "UplinkTx"
//! RX = "UplinkRx"
//! MUTE_RX_ON_TX = 1
//! LOOP_RX_TO_TX = 0
//! ```
//!
//! Local receiver audio goes out through the uplink transmitter, uplink
//! receiver audio comes back out of the local transmitter. With
//! `LOOP_RX_TO_TX` the local receiver is also looped to the local
//! transmitter whenever the uplink is quiet. DTMF digits are relayed in both
//! directions.

use std::sync::Arc;

use crate::audio::graph::SinkId;
use crate::audio::{AudioGraph, AudioOutlet, AudioSink, Node, SharedGraph, StageKind};
use crate::config::{ConfigLookup, LinkConfig};
use crate::constants::{FIFO_CAPACITY_SAMPLES, FIFO_PREBUF_SAMPLES, LOOPBACK_PRIORITY, UPLINK_RX_PRIORITY};
use crate::error::{Error, InitError, Result};
use crate::events::Subscription;
use crate::trx::{DtmfDigit, Receiver, Transmitter, TrxFactory, TxCtrlMode};

/// Lifecycle of a [`TrxUplink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkState {
    Uninitialized,
    Active,
}

/// Graph sink forwarding into a transmitter
struct TxSink(Arc<dyn Transmitter>);

impl AudioSink for TxSink {
    fn write_samples(&self, samples: &[i16]) -> usize {
        self.0.write_samples(samples)
    }

    fn flush_samples(&self) {
        self.0.flush_samples()
    }
}

/// Everything that exists only while the link is up
struct ActiveLink {
    // Dropped first so no callback can fire into a half torn down link
    _subscriptions: Vec<Subscription>,
    link: LinkConfig,
    graph: SharedGraph,
    local_tx_sink: SinkId,
    uplink_tx: Arc<dyn Transmitter>,
    uplink_rx: Arc<dyn Receiver>,
}

/// Router between the local transceiver pair and the uplink
pub struct TrxUplink {
    cfg: Arc<dyn ConfigLookup>,
    name: String,
    rx: Arc<dyn Receiver>,
    tx: Arc<dyn Transmitter>,
    factory: Arc<dyn TrxFactory>,
    active: Option<ActiveLink>,
}

impl TrxUplink {
    pub fn new(
        cfg: Arc<dyn ConfigLookup>,
        name: &str,
        rx: Arc<dyn Receiver>,
        tx: Arc<dyn Transmitter>,
        factory: Arc<dyn TrxFactory>,
    ) -> Self {
        Self {
            cfg,
            name: name.to_string(),
            rx,
            tx,
            factory,
            active: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> UplinkState {
        if self.active.is_some() {
            UplinkState::Active
        } else {
            UplinkState::Uninitialized
        }
    }

    /// Resolved link settings, once active
    pub fn link_config(&self) -> Option<&LinkConfig> {
        self.active.as_ref().map(|a| &a.link)
    }

    pub fn uplink_tx(&self) -> Option<&Arc<dyn Transmitter>> {
        self.active.as_ref().map(|a| &a.uplink_tx)
    }

    pub fn uplink_rx(&self) -> Option<&Arc<dyn Receiver>> {
        self.active.as_ref().map(|a| &a.uplink_rx)
    }

    /// Number of routing stages of `kind` currently wired
    pub fn stage_count(&self, kind: StageKind) -> usize {
        self.active
            .as_ref()
            .map_or(0, |a| a.graph.lock().count(kind))
    }

    /// Kind of the stage feeding the local transmitter, `None` when the
    /// uplink receiver feeds it directly
    pub fn local_tx_source(&self) -> Option<StageKind> {
        let active = self.active.as_ref()?;
        let graph = active.graph.lock();
        graph.feeder_of(active.local_tx_sink).and_then(|feed| graph.kind(feed))
    }

    /// Bring the link up
    ///
    /// Nothing is kept unless every step succeeds: on error the uplink
    /// transceivers are released, every subscription is dropped and the
    /// local receiver is left without an audio output.
    pub fn initialize(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Err(InitError::AlreadyActive(self.name.clone()).into());
        }

        let link = LinkConfig::resolve(self.cfg.as_ref(), &self.name).map_err(|e| {
            tracing::error!("{}: {}", self.name, e);
            e
        })?;
        tracing::debug!(
            "{}: TX={} RX={} MUTE_RX_ON_TX={} LOOP_RX_TO_TX={}",
            self.name,
            link.uplink_tx,
            link.uplink_rx,
            link.mute_rx_on_tx,
            link.loop_rx_to_tx
        );

        let mut subscriptions = Vec::new();

        subscriptions.push(self.rx.squelch_open().subscribe(rx_squelch_open));
        self.rx.reset();
        self.rx.mute(false);

        let mut graph = AudioGraph::new();
        let fifo = graph.add_fifo(FIFO_CAPACITY_SAMPLES);
        graph.set_prebuf_samples(fifo, FIFO_PREBUF_SAMPLES)?;

        let splitter = if link.loop_rx_to_tx {
            let splitter = graph.add_splitter();
            graph.connect(fifo, splitter)?;
            Some(splitter)
        } else {
            None
        };

        let uplink_tx = self.create_uplink_tx(&link)?;
        uplink_tx.set_tx_ctrl_mode(TxCtrlMode::Auto);
        uplink_tx.enable_ctcss(true);
        let uplink_tx_sink = graph.add_sink(Arc::new(TxSink(uplink_tx.clone())));
        graph.connect(splitter.unwrap_or(fifo), uplink_tx_sink)?;

        let relay_tx = uplink_tx.clone();
        subscriptions.push(
            self.rx
                .dtmf_digit_detected()
                .subscribe(move |digit| relay_dtmf(digit, relay_tx.as_ref())),
        );

        // Dropping uplink_tx and the subscriptions on the error path
        // releases the transmitter again
        let uplink_rx = self.create_uplink_rx(&link)?;
        let relay_tx = self.tx.clone();
        subscriptions.push(
            uplink_rx
                .dtmf_digit_detected()
                .subscribe(move |digit| relay_dtmf(digit, relay_tx.as_ref())),
        );
        uplink_rx.reset();
        uplink_rx.mute(false);

        if link.mute_rx_on_tx {
            let muted_rx = uplink_rx.clone();
            subscriptions.push(
                uplink_tx
                    .transmitter_state_change()
                    .subscribe(move |is_transmitting| muted_rx.mute(*is_transmitting)),
            );
        }

        let local_tx_sink = graph.add_sink(Arc::new(TxSink(self.tx.clone())));
        let uplink_rx_entry: Node = match splitter {
            Some(splitter) => {
                let selector = graph.add_selector();
                let from_uplink = graph.add_selector_source(selector, UPLINK_RX_PRIORITY)?;

                let passthrough = graph.add_passthrough();
                graph.connect(splitter, passthrough)?;
                let from_local = graph.add_selector_source(selector, LOOPBACK_PRIORITY)?;
                graph.connect(passthrough, from_local)?;

                graph.connect(selector, local_tx_sink)?;
                from_uplink.into()
            }
            None => local_tx_sink.into(),
        };

        self.tx.set_tx_ctrl_mode(TxCtrlMode::Auto);

        let graph = graph.into_shared();
        self.rx.set_audio_output(Some(AudioOutlet::new(&graph, fifo)));
        uplink_rx.set_audio_output(Some(AudioOutlet::new(&graph, uplink_rx_entry)));

        tracing::info!(
            "{}: uplink active (TX {}, RX {}{})",
            self.name,
            uplink_tx.name(),
            uplink_rx.name(),
            if link.loop_rx_to_tx { ", local loop" } else { "" }
        );

        self.active = Some(ActiveLink {
            _subscriptions: subscriptions,
            link,
            graph,
            local_tx_sink,
            uplink_tx,
            uplink_rx,
        });
        Ok(())
    }

    fn create_uplink_tx(&self, link: &LinkConfig) -> Result<Arc<dyn Transmitter>> {
        let name = &link.uplink_tx;
        let tx = self
            .factory
            .create_tx(self.cfg.as_ref(), name)
            .and_then(|tx| tx.initialize().map(|()| tx))
            .map_err(|e| init_failed(e, |reason| InitError::Transmitter { name: name.clone(), reason }))?;
        Ok(tx)
    }

    fn create_uplink_rx(&self, link: &LinkConfig) -> Result<Arc<dyn Receiver>> {
        let name = &link.uplink_rx;
        let rx = self
            .factory
            .create_rx(self.cfg.as_ref(), name)
            .and_then(|rx| rx.initialize().map(|()| rx))
            .map_err(|e| init_failed(e, |reason| InitError::Receiver { name: name.clone(), reason }))?;
        Ok(rx)
    }
}

fn init_failed(err: Error, wrap: impl FnOnce(String) -> InitError) -> Error {
    let err = match err {
        Error::Init(e) => e,
        other => wrap(other.to_string()),
    };
    tracing::error!("{}", err);
    err.into()
}

// Squelch state of the local receiver does not affect routing
fn rx_squelch_open(is_open: &bool) {
    tracing::trace!("Local receiver squelch {}", if *is_open { "open" } else { "closed" });
}

fn relay_dtmf(digit: &DtmfDigit, tx: &dyn Transmitter) {
    tracing::debug!("Relaying DTMF digit {} to {}", digit.digit, tx.name());
    tx.send_dtmf(digit.digit.encode_utf8(&mut [0; 4]));
}

impl Drop for TrxUplink {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            self.rx.set_audio_output(None);
            active.uplink_rx.set_audio_output(None);
            tracing::debug!("{}: uplink torn down", self.name);
        }
    }
}
