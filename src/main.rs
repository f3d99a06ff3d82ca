use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use tracing_subscriber::EnvFilter;

mod args;
mod config;
mod env;
mod export;
mod http;
mod mlflow;
mod neptune;
mod plugin;
#[cfg(test)]
mod testing;
mod ui;
mod utils;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("NEPTUNE_MLFLOW_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

const LOG_ENV: &str = "NEPTUNE_MLFLOW_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "neptune-mlflow",
    about = "Copy MLflow tracking data into Neptune",
    version = CLI_VERSION
)]
struct Cli {
    /// Log more (-v for info, -vv for debug)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Copy MLflow experiments and runs into a Neptune project
    Sync(CLIArgs<export::SyncArgs>),
    /// Forward tracking calls to MLflow and mirror them into Neptune
    Relay(CLIArgs<plugin::relay::RelayArgs>),
    /// Build or inspect neptune:// tracking URIs
    Uri(CLIArgs<plugin::UriArgs>),
    /// Manage neptune-mlflow configuration
    Config(CLIArgs<config::ConfigArgs>),
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Sync(cmd) => export::run(cmd.base, cmd.args).await?,
        Commands::Relay(cmd) => plugin::relay::run(cmd.base, cmd.args).await?,
        Commands::Uri(cmd) => plugin::run(cmd.base, cmd.args)?,
        Commands::Config(cmd) => config::run(cmd.base, cmd.args)?,
    }

    Ok(())
}
