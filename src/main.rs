mod aggregate;
mod analysis;
mod calibrate;
mod config;
mod distribute;
mod engine;
mod error;
mod manager;
mod market;
mod model;
mod params;
mod scenario;
mod solver;
mod stats;

use crate::manager::Manager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Simulate at a given center and spread, or at the stored estimate.
    Simulate {
        #[arg(long, requires = "spread")]
        center: Option<f64>,

        #[arg(long, requires = "center")]
        spread: Option<f64>,
    },

    Calibrate,

    Sweep,

    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Simulate { center, spread } => mgr.simulate(center.zip(spread))?,
        Command::Calibrate => mgr.calibrate()?,
        Command::Sweep => mgr.sweep()?,
        Command::Clean => mgr.clean()?,
    }

    Ok(())
}
