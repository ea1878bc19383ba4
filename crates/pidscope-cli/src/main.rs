use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pidscope_core::PidscopeConfig;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod commands;
mod dump_image;
mod shutdown;

#[derive(Parser)]
#[command(name = "pidscope")]
#[command(about = "Locate a process by name on a host with an unknown descriptor layout")]
struct Args {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true, env = "PIDSCOPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full load/refresh/unload cycle against the simulated host
    Simulate {
        /// Target process name (blank uses the configured default)
        #[arg(default_value = "worker-proc")]
        target: String,

        /// Identifier the target is spawned with
        #[arg(long, default_value_t = 4242)]
        pid: u32,

        /// Refresh ticks before the target is spawned
        #[arg(long, default_value_t = 3)]
        spawn_after: u32,

        /// Total refresh ticks
        #[arg(long, default_value_t = 6)]
        ticks: u32,

        /// Delay between ticks in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },

    /// Calibrate against a raw memory dump
    Calibrate {
        /// Dump file
        dump: PathBuf,

        /// Address the first byte of the dump was read from (hex)
        #[arg(long)]
        base: String,

        /// Address of the reference descriptor (hex, defaults to base)
        #[arg(long)]
        reference: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Hexdump a region of a raw memory dump
    Hexdump {
        /// Dump file
        dump: PathBuf,

        /// Address the first byte of the dump was read from (hex)
        #[arg(long)]
        base: String,

        /// Start address (hex, defaults to base)
        #[arg(long)]
        address: Option<String>,

        /// Number of bytes
        #[arg(long, default_value_t = 256)]
        size: usize,

        /// Show the ASCII column
        #[arg(long)]
        ascii: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<PidscopeConfig> {
    match path {
        Some(path) => {
            let config = PidscopeConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => {
            debug!("No config file, using defaults");
            Ok(PidscopeConfig::default())
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pidscope=info".parse()?)
                .add_directive("pidscope_core=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Simulate {
            target,
            pid,
            spawn_after,
            ticks,
            interval_ms,
        } => commands::simulate::run(
            config,
            &commands::simulate::SimulateOptions {
                target,
                pid,
                spawn_after,
                ticks,
                interval_ms,
            },
        ),
        Command::Calibrate {
            dump,
            base,
            reference,
            json,
        } => commands::calibrate::run(&config, &dump, &base, reference.as_deref(), json),
        Command::Hexdump {
            dump,
            base,
            address,
            size,
            ascii,
        } => commands::hexdump::run(&dump, &base, address.as_deref(), size, ascii),
    }
}
