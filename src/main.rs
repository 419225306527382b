#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate
)]
// now allow a few rules which are denied by the above's statement
#![allow(clippy::multiple_crate_versions)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::all)]

//! vxhcid

use std::os::unix::net::UnixListener;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vxhcid::async_runtime;
use vxhcid::cli::{Cli, XhciConfig};
use vxhcid::device::bus::{DynamicBus, MemorySegment};
use vxhcid::device::pci::vbdp;
use vxhcid::device::pci::xhci::{InstanceGuard, XhciController};
use vxhcid::hotplug_server::run_hotplug_server;

fn main() -> Result<()> {
    let args = Cli::parse();

    let config = XhciConfig::parse(&args.controller)
        .context("Failed to parse the controller configuration string")?;

    // The config string may override the verbosity switch.
    let level = config.log_level.unwrap_or(match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    });
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    // Log messages from the log crate as well.
    tracing_log::LogTracer::init()?;

    async_runtime::init_runtime()?;

    let _guard = InstanceGuard::claim().context("Failed to claim the controller instance")?;

    let dma_bus = Arc::new(DynamicBus::new());
    if let Some(memory) = &args.memory {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(memory)
            .with_context(|| format!("Failed to open guest memory backing {}", memory.display()))?;
        let segment =
            MemorySegment::from_file(&file).context("Failed to map guest memory backing")?;
        dma_bus.set_backing(Arc::new(segment));
    }

    let controller = Arc::new(Mutex::new(XhciController::new(&config, dma_bus)));

    // Wire the back-references and the VBDP poller.
    let (signal, tablets) = {
        let mut guard = controller.lock().unwrap();
        guard.connect_self(Arc::downgrade(&controller));
        (guard.vbdp_signal(), guard.take_tablet_handles())
    };
    async_runtime::runtime().spawn(vbdp::run_poller(Arc::downgrade(&controller), signal));

    // The tablet input handles would be handed to the VMM's input layer;
    // a standalone daemon has no input source for them.
    info!("controller up with {} internal input device(s)", tablets.len());

    let socket = UnixListener::bind(&args.hotplug_socket).with_context(|| {
        format!(
            "Failed to create the hotplug socket at {}",
            args.hotplug_socket.display()
        )
    })?;

    info!("We're up!");
    run_hotplug_server(socket, controller);

    // run_hotplug_server loops forever; reaching this point is a bug.
    unreachable!()
}
