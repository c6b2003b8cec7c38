use std::{fs, path::Path, process::ExitCode};

use clap::Parser;
use log::error;

use capstan::{
    config::Config,
    engine,
    error::{CapstanError, InvalidConfigError, ReportError},
};

mod cli;

fn main() -> ExitCode {
    let args = cli::Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::new().filter_or("CAPSTAN_LOG", "info"))
        .filter_level(args.verbosity)
        .init();

    let result = match args.command {
        cli::Commands::Install { config } => {
            load_config(&config).and_then(|config| engine::install::run(&config))
        }
        cli::Commands::Upgrade { config } => {
            load_config(&config).and_then(|config| engine::upgrade::run(&config))
        }
        cli::Commands::Reset { config } => {
            load_config(&config).and_then(|config| engine::reset::run(&config))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // One-line summary always; the structured trace only under debug
            error!("{}", e.kind());
            if log::log_enabled!(log::Level::Debug) {
                error!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<Config, CapstanError> {
    let content = fs::read_to_string(path).structured(InvalidConfigError::LoadConfig {
        path: path.display().to_string(),
    })?;
    Config::from_yaml(&content)
}
