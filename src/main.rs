//! trafficreplay entry point.
//!
//! Parses the command line, loads the optional tuning file, initializes logging and runs one
//! replay. Fatal errors map to distinct exit statuses.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

use trafficreplay::{
    config::{Config, ReplayOptions},
    constants::{DEFAULT_PACKET_TIMEOUT_SECS, EXIT_USAGE},
    errors::{Error, Result},
    replay::{ReplaySummary, TlsMode},
    run_replay,
};

/// trafficreplay - replays captured HTTP traffic against a target and records both responses.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Target URI, e.g. https://search.example.com:9200
    #[arg(value_name = "TARGET")]
    target: String,

    /// Do not verify the target's TLS certificate.
    #[arg(long)]
    insecure: bool,

    /// Value sent in the Authorization header of every replayed request.
    #[arg(long, value_name = "VALUE")]
    auth_header_value: Option<String>,

    /// Append tuples to this file instead of stdout.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Read capture records from this file instead of stdin.
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Finalize a captured connection after this many seconds without traffic.
    #[arg(short = 't', long, value_name = "SECS", default_value_t = DEFAULT_PACKET_TIMEOUT_SECS)]
    packet_timeout_seconds: u64,

    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE", env = "TRAFFICREPLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level.
    #[arg(long, value_name = "LEVEL", default_value = "")]
    log_level: String,
}

/// Application entry point.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE as u8)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return exit_code(&e);
        }
    };
    let log_level = if cli.log_level.is_empty() {
        config.log.level.clone()
    } else {
        cli.log_level.clone()
    };
    if let Err(e) = setup_logging(&log_level) {
        eprintln!("{e}");
        return exit_code(&e);
    }

    match cli_main(cli, config).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            exit_code(&e)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::from_file(path)?),
        None => Ok(Config::default()),
    }
}

pub async fn cli_main(cli: Cli, config: Config) -> Result<ReplaySummary> {
    let mut options = ReplayOptions::new(&cli.target, &config)?;
    options.tls_mode = if cli.insecure {
        TlsMode::Insecure
    } else {
        TlsMode::Verify
    };
    options.authorization = cli.auth_header_value;
    options.input = cli.input;
    options.output = cli.output;
    options.inactivity_timeout = Duration::from_secs(cli.packet_timeout_seconds);
    run_replay(options).await
}

fn exit_code(e: &Error) -> ExitCode {
    ExitCode::from(e.exit_code() as u8)
}

/// Configures the logging subsystem based on the specified log level. Logs go to stderr so
/// tuples written to stdout stay parseable.
///
/// # Arguments
/// * `level` - String representation of the desired log level
fn setup_logging(level: &str) -> Result<()> {
    let filter: EnvFilter = format!("trafficreplay={level}")
        .parse()
        .map_err(|e| Error::Config(format!("invalid log level {level}: {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
