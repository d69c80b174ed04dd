//! The sundial daemon: wires the REST platform client, the group informer
//! and the controller together and runs until SIGINT/SIGTERM.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::bounded;
use log::{error, info};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use sundial_client::{GroupInformer, InformerOptions, RestOptions, RestPlatform};
use sundial_core::{Controller, ControllerOptions, Engine, EngineOptions, Platform};

/// Scheduled snapshotting and point-in-time restore for persistent volumes.
#[derive(Parser, Debug)]
#[command(name = "sundial", version, about)]
struct Cli {
    #[command(flatten)]
    rest: RestOptions,

    #[command(flatten)]
    informer: InformerOptions,

    #[command(flatten)]
    engine: EngineOptions,

    #[command(flatten)]
    controller: ControllerOptions,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let term_config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .build();
    TermLogger::init(
        cli.log_level,
        term_config,
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    // Dropping the sender on the first signal disconnects every receiver
    // clone at once, so workers, informer and readiness polls all see it.
    let (stop_tx, stop) = bounded::<()>(0);
    let stop_tx = Mutex::new(Some(stop_tx));
    ctrlc::set_handler(move || {
        info!("Termination signal received, shutting down");
        drop(stop_tx.lock().unwrap().take());
    })?;

    let platform = Arc::new(RestPlatform::new(&cli.rest)?);
    info!("Reconciling against {}", platform.location());

    let informer = GroupInformer::new(Arc::clone(&platform), cli.informer);
    let (events, informer) = informer.spawn(stop.clone())?;

    let engine = Engine::new(platform, cli.engine, stop.clone());
    let controller = Controller::new(engine, cli.controller);
    controller.run(&events, &stop)?;

    drop(events);
    if informer.join().is_err() {
        error!("informer exited abnormally");
    }
    info!("Shutdown complete");
    Ok(())
}
