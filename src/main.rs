//! CLI entry point: wires up the single coordinator instance, starts the
//! OSC tuning session, and blocks until Ctrl-C.

use clap::Parser;
use pitchgrid_bridge::config::default_descriptor_dir;
use pitchgrid_bridge::osc::{DEFAULT_LISTEN_PORT, DEFAULT_PEER_PORT};
use pitchgrid_bridge::Coordinator;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pitchgrid-bridge", about = "Real-time MIDI retuning bridge for isomorphic controllers")]
struct Cli {
    /// Directory to load controller descriptors from. Defaults to
    /// `PITCHGRID_DESCRIPTORS` or the platform config directory.
    #[arg(long)]
    descriptors: Option<PathBuf>,

    /// Device name of a descriptor to connect to at startup.
    #[arg(long)]
    device: Option<String>,

    /// UDP port this bridge listens on for OSC tuning updates.
    #[arg(long, default_value_t = DEFAULT_LISTEN_PORT)]
    osc_listen_port: u16,

    /// UDP port the tuning editor listens on for our heartbeats.
    #[arg(long, default_value_t = DEFAULT_PEER_PORT)]
    osc_peer_port: u16,

    /// Name of the virtual MIDI output port created for the downstream synth.
    #[arg(long, default_value = "PitchGrid Mapper")]
    virtual_port_name: String,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all but warning/error logs.
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let descriptor_dir = cli.descriptors.unwrap_or_else(default_descriptor_dir);
    let coordinator = Coordinator::new(descriptor_dir, cli.virtual_port_name);

    coordinator.start_osc(cli.osc_listen_port, cli.osc_peer_port);

    if let Some(device) = cli.device.as_deref() {
        if let Err(e) = coordinator.connect(device) {
            log::error!("failed to connect to {device}: {e}");
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        }) {
            log::warn!("failed to install Ctrl-C handler: {e}");
        }
    }

    log::info!("pitchgrid-bridge running, press Ctrl-C to exit");
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    coordinator.disconnect();
    log::info!("shut down");
}

fn init_logging(verbose: u8, quiet: bool) {
    let default_level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}
