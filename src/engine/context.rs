use std::path::{Path, PathBuf};

use capstan_api::{
    config::Config,
    constants::{LOADER_CONF_PATH, LOADER_ENTRIES_DIR},
};

/// Per-invocation state threaded through the engine. Created once per
/// command; components never reach for process-wide state.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Config,
}

impl EngineContext {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// ESP-relative directory holding per-role boot images.
    pub fn vendor_dir(&self) -> PathBuf {
        Path::new("EFI").join(&self.config.vendor)
    }

    /// Entries directory inside a mounted ESP.
    pub fn entries_dir(&self, esp_root: &Path) -> PathBuf {
        esp_root.join(LOADER_ENTRIES_DIR)
    }

    /// Top-level loader configuration inside a mounted ESP.
    pub fn loader_conf(&self, esp_root: &Path) -> PathBuf {
        esp_root.join(LOADER_CONF_PATH)
    }
}
