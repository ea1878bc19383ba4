//! Simulate command implementation.
//!
//! Loads a finder into the simulated host, refreshes it on a fixed interval
//! (spawning the target part-way through), then unloads and shows the
//! restored channel. Ctrl-C ends the refresh loop early; unload still runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use owo_colors::OwoColorize;
use pidscope_core::host::sim::{SimLayout, SimulatedHost};
use pidscope_core::{Confidence, DiscoveryStatus, PidFinder, PidscopeConfig, load_entry};
use tracing::info;

use crate::shutdown::ShutdownSignal;

/// Processes present before the finder loads
const BACKGROUND: &[(&str, u32)] = &[
    ("init", 1),
    ("kthreadd", 2),
    ("ksoftirqd/0", 12),
    ("logd", 300),
    ("servicemanager", 301),
    ("surfaceflinger", 512),
];

pub struct SimulateOptions {
    pub target: String,
    pub pid: u32,
    pub spawn_after: u32,
    pub ticks: u32,
    pub interval_ms: u64,
}

/// Build a host populated with the background processes
pub fn populated_host(config: &PidscopeConfig) -> Arc<SimulatedHost> {
    let host = Arc::new(SimulatedHost::with_config(
        SimLayout::default(),
        config.clone(),
    ));
    for (name, pid) in BACKGROUND {
        host.spawn(name, *pid);
    }
    host
}

fn colored(status: DiscoveryStatus, text: &str) -> String {
    match status {
        DiscoveryStatus::Found(_) => text.green().to_string(),
        DiscoveryStatus::NotYetRunning => text.yellow().to_string(),
        DiscoveryStatus::Error(_) => text.red().to_string(),
    }
}

/// Drive `finder` for the configured number of ticks. Returns the last status.
pub fn refresh_loop(
    host: &SimulatedHost,
    finder: &PidFinder,
    options: &SimulateOptions,
    shutdown: &ShutdownSignal,
) -> DiscoveryStatus {
    let mut status = finder.status();

    for tick in 1..=options.ticks {
        if tick == options.spawn_after + 1 {
            host.spawn(&options.target, options.pid);
            println!("[tick {}] spawned {:?} as {}", tick, options.target, options.pid);
        }

        status = finder.refresh();
        let seen = host.uname_version();
        println!("[tick {}] {}", tick, colored(status, &seen));

        if tick < options.ticks && shutdown.wait(Duration::from_millis(options.interval_ms)) {
            info!("Interrupted, unloading...");
            break;
        }
    }

    status
}

/// Run the simulate command
pub fn run(config: PidscopeConfig, options: &SimulateOptions) -> Result<()> {
    let shutdown = Arc::new(ShutdownSignal::new());
    let shutdown_ctrlc = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping...");
        shutdown_ctrlc.trigger();
    })?;

    let host = populated_host(&config);
    let original = host.channel_text();
    println!("Channel before load: {:?}", original);

    let (code, finder) = load_entry(host.services(), config, &options.target);
    let Some(finder) = finder else {
        bail!("Load failed with status {}", code);
    };

    let calibration = finder.calibration();
    match &calibration.confidence {
        Confidence::Verified => println!(
            "Calibrated: identifier=0x{:X} name=0x{:X} link=0x{:X} ({})",
            calibration.offsets.identifier,
            calibration.offsets.name,
            calibration.offsets.link,
            "verified".green()
        ),
        Confidence::Fallback { profile, reason } => println!(
            "Using fallback profile {} ({}: {})",
            profile,
            "unverified".yellow(),
            reason
        ),
    }

    let status = refresh_loop(&host, &finder, options, &shutdown);
    print!("Status file: {}", finder.read_status());

    finder.unload();
    let restored = host.channel_text();
    println!("Channel after unload: {:?}", restored);
    if restored != original {
        bail!("Channel was not restored");
    }
    info!("Final status for {}: {}", finder.target(), status);

    Ok(())
}
