//! `tessera-host inspect`

use std::path::Path;

use anyhow::Context as _;

use tessera_plugins::{PluginKind, PluginLoader};

pub fn run(file: &Path) -> anyhow::Result<()> {
    let kind = PluginKind::inspect(file).with_context(|| format!("reading {}", file.display()))?;
    let hash = PluginLoader::calculate_hash(file).with_context(|| format!("hashing {}", file.display()))?;

    println!("file:   {}", file.display());
    println!("kind:   {kind}");
    println!("module: {}", PluginLoader::module_name(file));
    println!("sha256: {hash}");
    Ok(())
}
