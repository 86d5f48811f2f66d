//! # Resident Server
//!
//! TCP notification and chat server for apartment residents.
//! Serves chat relay between subscribed residents and periodically refreshed
//! weather/currency snapshots.
//!
//! ## Features
//! - Optional TOML configuration file, overridable from the command line.
//! - Simulated weather/currency feed refreshed in the background.
//! - Operator console on stdin: `help`, `open_connections`,
//!   `list_connections`, `update_rate <secs>`, `stop_server`.
//! - Logging support with configurable log levels.
//!
//! ## Command-line Options
//! - `--host` / `-H`: listen host (overrides the config file).
//! - `--port` / `-p`: listen port (overrides the config file).
//! - `--config` / `-c`: path to a TOML configuration file.
//! - `--update-interval` / `-u`: refresh interval in seconds (minimum 10).
//! - `--volatility` / `-v`: step size of the simulated feed, in `(0, 1]`.
//! - `--log-level` / `-l`: log level (`error`, `warn`, `info`, `debug`, `trace`).

use resident_hub::config::ServerConfig;
use resident_hub::errors::CliError;
use resident_hub::events::LogSink;
use resident_hub::feed::SimulatedFeed;
use resident_hub::server::ServerController;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use structopt::StructOpt;

/// Command-line options for the Resident Server
#[derive(Debug, StructOpt)]
#[structopt(
    name = "resident_server",
    about = "TCP chat and notification server for apartment residents"
)]
struct Opt {
    /// Listen host, e.g., 127.0.0.1
    #[structopt(short = "H", long)]
    host: Option<String>,

    /// Listen port, e.g., 9000
    #[structopt(short, long)]
    port: Option<u16>,

    /// Path to a TOML configuration file
    #[structopt(short, long)]
    config: Option<String>,

    /// Weather/currency refresh interval in seconds
    #[structopt(short, long)]
    update_interval: Option<u64>,

    /// Volatility of the simulated data feed
    #[structopt(short, long, default_value = "0.2")]
    volatility: f64,

    /// Log level: error, warn, info, debug, trace
    #[structopt(short, long, default_value = "info")]
    log_level: String,
}

/// Initializes the logger using env_logger with the given level
fn init_logger(level: &str) -> Result<(), CliError> {
    let mut builder = env_logger::Builder::new();

    let log_level = match level.to_lowercase().as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    builder.filter_level(log_level);
    builder.format_timestamp_micros();
    builder.format_module_path(false);
    builder.format_target(false);
    builder
        .try_init()
        .map_err(|e| CliError::GeneralError(e.to_string()))
}

/// Merges the config file (if any) with command-line overrides.
fn load_config(opt: &Opt) -> Result<ServerConfig, CliError> {
    let mut config = match &opt.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = &opt.host {
        config.host = host.clone();
    }
    if let Some(port) = opt.port {
        config.port = port;
    }
    if let Some(secs) = opt.update_interval {
        config.update_interval_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Help,
    OpenConnections,
    ListConnections,
    UpdateRate(u64),
    Stop,
    Invalid(String),
}

fn parse_console_command(line: &str) -> ConsoleCommand {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default().to_lowercase();
    let args: Vec<&str> = parts.collect();

    match (command.as_str(), args.as_slice()) {
        ("help", []) => ConsoleCommand::Help,
        ("open_connections", []) => ConsoleCommand::OpenConnections,
        ("list_connections", []) => ConsoleCommand::ListConnections,
        ("stop_server", []) => ConsoleCommand::Stop,
        ("update_rate", [secs]) => match secs.parse() {
            Ok(secs) => ConsoleCommand::UpdateRate(secs),
            Err(_) => ConsoleCommand::Invalid(line.to_string()),
        },
        _ => ConsoleCommand::Invalid(line.to_string()),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  help                 show this help");
    println!("  open_connections     number of open connections");
    println!("  list_connections     list open connections");
    println!("  update_rate <secs>   change the weather/currency refresh interval");
    println!("  stop_server          stop the server and exit");
}

/// Runs the operator console until `stop_server` or stdin EOF.
fn run_console(controller: &ServerController) -> Result<(), CliError> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    print_help();

    loop {
        print!("server> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            log::info!("Console input closed");
            return Ok(());
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match parse_console_command(&line) {
            ConsoleCommand::Help => print_help(),
            ConsoleCommand::OpenConnections => match controller.list_open_connections() {
                Ok(list) => println!("Open connections: {}", list.len()),
                Err(e) => eprintln!("{}", e),
            },
            ConsoleCommand::ListConnections => match controller.list_open_connections() {
                Ok(list) if list.is_empty() => println!("No open connections"),
                Ok(list) => list.iter().for_each(|entry| println!("{}", entry)),
                Err(e) => eprintln!("{}", e),
            },
            ConsoleCommand::UpdateRate(secs) => match controller.change_update_rate(secs) {
                Ok(()) => println!("Update rate set to {}s", secs),
                Err(e) => eprintln!("{}", e),
            },
            ConsoleCommand::Stop => return Ok(()),
            ConsoleCommand::Invalid(input) => {
                eprintln!("Unknown command: {}", input.trim());
                print_help();
            }
        }
    }
}

fn main() -> Result<(), CliError> {
    let opt = Opt::from_args();
    init_logger(&opt.log_level)?;

    log::info!("Starting Resident Server");
    log::debug!("Command line options: {:?}", opt);

    let config = load_config(&opt)?;
    let feed = Arc::new(SimulatedFeed::new(opt.volatility)?);
    let (host, port) = (config.host.clone(), config.port);
    let controller = ServerController::new(config, feed, Arc::new(LogSink));

    let addr = controller.start_server(&host, port)?;
    log::info!("Server listening on {}. Waiting for client connections...", addr);

    let console = run_console(&controller);

    log::info!("Stopping server");
    controller.stop_server()?;
    log::info!("Server shutdown complete");
    console
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_console_commands() {
        assert_eq!(parse_console_command("help"), ConsoleCommand::Help);
        assert_eq!(
            parse_console_command("  LIST_CONNECTIONS "),
            ConsoleCommand::ListConnections
        );
        assert_eq!(
            parse_console_command("update_rate 30"),
            ConsoleCommand::UpdateRate(30)
        );
        assert_eq!(parse_console_command("stop_server"), ConsoleCommand::Stop);
    }

    #[test]
    fn test_parse_console_rejects_bad_input() {
        assert!(matches!(
            parse_console_command("update_rate soon"),
            ConsoleCommand::Invalid(_)
        ));
        assert!(matches!(
            parse_console_command("update_rate"),
            ConsoleCommand::Invalid(_)
        ));
        assert!(matches!(
            parse_console_command("reboot"),
            ConsoleCommand::Invalid(_)
        ));
    }

    #[test]
    fn test_load_config_overrides() {
        let opt = Opt::from_iter(&["resident_server", "--port", "9100", "-u", "20"]);
        let config = load_config(&opt).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.update_interval_secs, 20);

        let opt = Opt::from_iter(&["resident_server", "-u", "5"]);
        assert!(load_config(&opt).is_err());
    }
}
