//! Replays a RON edit script through the volume edit log and prints a summary.

mod script;

use std::process::ExitCode;

use clap::Parser;
use volstore_config::{CliArgs, Config};

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone().map_or_else(Config::default_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to resolve config directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    volstore_log::init_logging(Some(&config_dir.join("logs")), cfg!(debug_assertions), Some(&config));

    match script::run(&config) {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("replay failed: {e}");
            eprintln!("Replay failed: {e}");
            ExitCode::FAILURE
        }
    }
}
