use std::path::PathBuf;

use clap::Parser;
use shared::log::init_log;
use tracing::*;

use crate::manager::WorkerManager;

mod config;
mod keyspace;
mod ledger;
mod manager;
mod parse;
mod restful;
mod runner;
mod status;
mod telegram;


#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
    #[arg(
        long,
        value_name = "SETTINGS_FILE",
        help = "Path to the settings json file",
        default_value = "settings.json"
    )]
    settings: PathBuf,

    #[arg(
        long,
        value_name = "WORK_DIR",
        help = "Directory for the program I/O files and local state",
        default_value = "."
    )]
    dir: PathBuf,
}

#[tokio::main]
async fn main() {
    init_log();

    let args = Args::parse();

    let mut worker = match WorkerManager::new(args.settings, args.dir) {
        Ok(worker) => worker,
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = worker.run().await {
        error!("worker stopped with error: {err:#}");
        std::process::exit(1);
    }
    info!("worker finished");
}
