use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::Context as _;
use clap::Parser as _;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use revend::config::Config;
use revend::coordinator::Coordinator;
use revend::hub::{PeerHub, Registry};
use revend::plc::{self, Plc};

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(
        serial_port = %config.serial_port,
        baudrate = config.baudrate,
        slave_address = config.slave_address,
        "starting control plane"
    );

    let running = Arc::new(AtomicBool::new(true));

    let plc = Arc::new(
        Plc::open(&config.plc_options())
            .with_context(|| format!("failed to open the PLC link on {}", config.serial_port))?,
    );
    let registry = Arc::new(Registry::new());
    let hub = PeerHub::start(&config.websocket_host, config.websocket_port, Arc::clone(&registry))
        .context("failed to start the peer hub")?;

    install_interrupt_handler(Arc::clone(&running));

    let poller = plc::spawn_poller(Arc::clone(&plc), Arc::clone(&running), config.poll_period());

    let mut coordinator = Coordinator::new(
        Arc::clone(&plc),
        registry,
        config.coordinator_settings(),
        Arc::clone(&running),
    );
    coordinator.run();

    info!("shutting down");
    let _ = poller.join();
    hub.stop();
    plc.stop();
    Ok(())
}

/// First Ctrl-C clears the running flag; every loop exits on its next pass.
fn install_interrupt_handler(running: Arc<AtomicBool>) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!("signal handler unavailable: {err}");
                return;
            }
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            info!("interrupt received");
            running.store(false, Ordering::SeqCst);
        }
    });
}
