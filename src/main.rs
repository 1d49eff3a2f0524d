mod cli;
mod commands;
mod dataset;
mod embedding;
mod error;
mod geofence;
mod model;
mod record;
mod tags;
#[cfg(test)]
mod test_support;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Verify(args) => commands::verify::run(args),
        Commands::Preprocess(args) => commands::preprocess::run(args),
        Commands::Restore(args) => commands::restore::run(args),
        Commands::Organize(args) => commands::organize::run(args),
        Commands::Grid(args) => commands::grid::run(args),
        Commands::Evaluate(args) => commands::evaluate::run(args),
        Commands::Sections(args) => commands::sections::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
