//! Remote transceiver uplink
//!
//! Builds the local receiver/transmitter pair and the uplink router from a
//! TOML configuration file, then polls the network receivers until Ctrl-C.
//!
//! Usage: `remotetrx [CONFIG]` (defaults to `remotetrx.toml`)

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remotetrx_uplink::{
    config::{AudioParams, Config, ConfigLookup, GLOBAL_SECTION},
    constants::POLL_INTERVAL_MS,
    device::DeviceFactory,
    trx::{NetTrxFactory, Receiver, Transmitter},
    uplink::TrxUplink,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "remotetrx.toml".into());
    let cfg = Arc::new(Config::load(&path).with_context(|| format!("Could not load {}", path))?);

    let params = AudioParams::from_config(cfg.as_ref())?;
    tracing::info!(
        "Starting remotetrx: {} Hz, {} frames/block, {} channel(s)",
        params.sample_rate,
        params.block_size,
        params.channels
    );

    let factory = Arc::new(NetTrxFactory::new(DeviceFactory::with_defaults(params)));

    // Local transceiver pair
    let rx_name = cfg.require(GLOBAL_SECTION, "RX")?;
    let tx_name = cfg.require(GLOBAL_SECTION, "TX")?;
    let rx = factory.create_net_rx(cfg.as_ref(), &rx_name)?;
    rx.initialize()
        .with_context(|| format!("Could not initialize receiver {}", rx_name))?;
    let tx = factory.create_net_tx(cfg.as_ref(), &tx_name)?;
    tx.initialize()
        .with_context(|| format!("Could not initialize transmitter {}", tx_name))?;

    let uplink_name = cfg.require(GLOBAL_SECTION, "UPLINK")?;
    let mut uplink = TrxUplink::new(cfg.clone(), &uplink_name, rx, tx, factory.clone());
    uplink
        .initialize()
        .with_context(|| format!("Could not start uplink {}", uplink_name))?;

    let mut ticker = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                factory.poll(Instant::now());
            }
            res = &mut shutdown => {
                res?;
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    drop(uplink);
    Ok(())
}
