mod cli;
mod cmd;
mod command;
mod config;
mod engine;
mod error;
mod git;
mod images;
mod logger;
mod project;
mod readiness;
mod spinner;
mod sync;
mod tasks;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    match cli::run() {
        Ok(result) => {
            info!("gatebox finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "gatebox failed");
            Err(err)
        }
    }
}
