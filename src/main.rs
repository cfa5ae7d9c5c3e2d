//! `opstats` command line.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use opstats::{Config, DEFAULT_CONFIG_FILE};

mod cli_logger;
mod cmd;

use cli_logger::CliLogger;
use cmd::{Command, run_convert};

const LOG_ENV: &str = "OPSTATS_LOG";

#[derive(Debug, Parser)]
#[command(name = "opstats", version, about = "Op, step and kernel statistics from trace captures")]
struct Cli {
    /// Config file; `opstats.toml` in the working directory by default
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    no_color: bool,
    #[command(subcommand)]
    command: Command,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli, logger: &CliLogger) -> Result<()> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = Config::load_optional(&path);
    match &cli.command {
        Command::Convert(args) => run_convert(args, &config, logger),
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let logger = CliLogger::new(cli.json, cli.no_color);
    match run(&cli, &logger) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            logger.print_error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}
