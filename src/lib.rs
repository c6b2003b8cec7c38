pub mod engine;
pub mod osimage;

pub use capstan_api::{config, constants, error};

/// Version reported by the CLI, taken from the crate metadata at build time.
pub const CAPSTAN_VERSION: &str = env!("CARGO_PKG_VERSION");
