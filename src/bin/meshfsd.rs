use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use meshfs::daemon::NodeDaemon;
use meshfs::{config, telemetry};

#[derive(Parser, Debug)]
#[command(
    name = "meshfsd",
    version,
    about = "Peer-to-peer replicated file service daemon"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let config = match config::load_or_init(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fatal: {err}");
            std::process::exit(1);
        }
    };
    let _telemetry_guard = telemetry::init(&config.logging);

    if let Err(err) = run(config) {
        tracing::error!("fatal: {err}");
        std::process::exit(1);
    }
}

fn run(config: meshfs::Config) -> meshfs::Result<()> {
    let handle = NodeDaemon::start(config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }
    tracing::info!("shutdown signal received");
    handle.shutdown();
    Ok(())
}
