//! Host configuration
//!
//! Loaded from any format the kernel config loader understands, with
//! `TESSERA_`-prefixed environment overrides on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tessera_kernel::config::{ConfigResult, load_with_env};
use tessera_plugins::hot_reload::WatchConfig;
use tessera_plugins::{HotReloadConfig, ReloadStrategy};

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "TESSERA";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct HostConfig {
    /// Directories scanned for plugin libraries at startup
    pub plugin_dirs: Vec<PathBuf>,
    /// Reload plugins when their files change
    pub watch: bool,
    pub debounce_ms: u64,
    /// Where loaded libraries are copied to; a temporary directory when unset
    pub shadow_dir: Option<PathBuf>,
    /// Target frame time of the host loop
    pub step_interval_ms: u64,
    /// Start modules right after loading them
    pub auto_start: bool,
    pub max_reload_attempts: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: Vec::new(),
            watch: true,
            debounce_ms: 500,
            shadow_dir: None,
            step_interval_ms: 16,
            auto_start: true,
            max_reload_attempts: 3,
        }
    }
}

impl HostConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        load_with_env(path, ENV_PREFIX)
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms.max(1))
    }

    pub fn hot_reload(&self) -> HotReloadConfig {
        let debounce = Duration::from_millis(self.debounce_ms);
        let strategy = if self.watch {
            ReloadStrategy::Debounced(debounce)
        } else {
            ReloadStrategy::Manual
        };
        let watch = WatchConfig {
            debounce,
            ..WatchConfig::default()
        };

        let config = HotReloadConfig::new()
            .with_strategy(strategy)
            .with_max_attempts(self.max_reload_attempts)
            .with_watch_config(watch);
        match &self.shadow_dir {
            Some(dir) => config.with_shadow_dir(dir.clone()),
            None => config,
        }
    }
}
