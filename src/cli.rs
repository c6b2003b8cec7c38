use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use capstan::CAPSTAN_VERSION;

#[derive(Parser, Debug)]
#[clap(version = CAPSTAN_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the OS onto a disk; irreversible
    Install {
        /// The merged configuration to apply
        #[clap(index = 1, default_value = "/etc/capstan/config.yaml")]
        config: PathBuf,
    },

    /// Upgrade the active or recovery slot; irreversible
    Upgrade {
        /// The merged configuration to apply
        #[clap(index = 1, default_value = "/etc/capstan/config.yaml")]
        config: PathBuf,
    },

    /// Reset persistent state and reseed the active slot; irreversible
    Reset {
        /// The merged configuration to apply
        #[clap(index = 1, default_value = "/etc/capstan/config.yaml")]
        config: PathBuf,
    },
}
