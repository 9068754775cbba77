//! `tessera-host run`

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use anyhow::Context as _;
use tracing::{info, warn};

use tessera_kernel::Context;
use tessera_plugins::{PluginManager, ReloadEvent};

use super::report_error;
use crate::config::HostConfig;

pub fn run(config: Option<&Path>, plugin_dirs: &[PathBuf], frames: Option<u64>) -> anyhow::Result<()> {
    let mut host = match config {
        Some(path) => HostConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => HostConfig::default(),
    };
    host.plugin_dirs.extend(plugin_dirs.iter().cloned());
    if host.plugin_dirs.is_empty() {
        anyhow::bail!("no plugin directory configured; pass --plugin-dir or set plugin_dirs");
    }

    let mut manager =
        PluginManager::new(Context::new(), host.hot_reload()).context("creating plugin manager")?;
    let events = manager.subscribe();

    for dir in &host.plugin_dirs {
        let loaded = manager.load_directory(dir).map_err(report_error)?;
        info!(dir = ?dir, modules = ?loaded, "Plugin directory loaded");
        if host.watch {
            manager.watch(dir).map_err(report_error)?;
        }
    }
    if host.auto_start {
        manager.start_all();
    }

    let interval = host.step_interval();
    let mut last = Instant::now();
    let mut frame = 0u64;
    while frames.is_none_or(|limit| frame < limit) {
        let now = Instant::now();
        manager.step_all(now - last);
        last = now;

        manager.poll();
        let mut changed = false;
        for event in events.try_iter() {
            log_event(&event);
            changed = true;
        }
        // Modules discovered or reloaded while the host runs start right away.
        if changed && host.auto_start {
            manager.start_all();
        }

        frame += 1;
        let elapsed = now.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }

    info!(frames = frame, modules = manager.len(), "Shutting down");
    manager.shutdown();
    Ok(())
}

fn log_event(event: &ReloadEvent) {
    match event {
        ReloadEvent::PluginDiscovered { path } => info!(path = ?path, "Plugin discovered"),
        ReloadEvent::ModuleLoaded { module, generation } => info!(%module, generation, "Module loaded"),
        ReloadEvent::ReloadStarted { module } => info!(%module, "Reloading"),
        ReloadEvent::ReloadCompleted {
            module,
            generation,
            duration,
        } => info!(%module, generation, ?duration, "Reload completed"),
        ReloadEvent::ReloadFailed { module, error, attempt } => {
            warn!(%module, attempt, %error, "Reload failed")
        }
        ReloadEvent::RollbackTriggered { module, reason } => warn!(%module, %reason, "Rolled back"),
        ReloadEvent::ModuleUnloaded { module } => info!(%module, "Module unloaded"),
        ReloadEvent::PluginRemoved { module, path } => info!(%module, path = ?path, "Plugin removed"),
    }
}
