//! Configuration loading
//!
//! Host and plugin settings can be written in any format the `config` crate
//! understands (TOML, YAML, JSON, INI, RON, JSON5); the format is picked from
//! the file extension. Every source goes through environment substitution
//! (`${VAR}` and `$VAR`) before it is parsed, and sources can be layered so
//! that later ones override earlier ones.

use std::path::Path;
use std::sync::LazyLock;

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;

pub use config::FileFormat as Format;

static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid pattern"));
static BARE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("valid pattern"));

/// Configuration error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration format for a file path, from its extension
pub fn detect_format(path: impl AsRef<Path>) -> ConfigResult<FileFormat> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat(format!("no extension on {}", path.display())))?;

    match ext.to_ascii_lowercase().as_str() {
        "toml" => Ok(FileFormat::Toml),
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "json" => Ok(FileFormat::Json),
        "json5" => Ok(FileFormat::Json5),
        "ron" => Ok(FileFormat::Ron),
        "ini" => Ok(FileFormat::Ini),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Replace `${VAR}` and `$VAR` references with environment values
///
/// Unset variables are left as written.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, env_value);
    BARE_VAR.replace_all(&braced, env_value).into_owned()
}

fn env_value(caps: &Captures<'_>) -> String {
    std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
}

fn read_source(path: &Path) -> ConfigResult<File<config::FileSourceString, FileFormat>> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    Ok(File::from_str(&substitute_env_vars(&content), format))
}

fn finish<T: DeserializeOwned>(builder: config::ConfigBuilder<config::builder::DefaultState>) -> ConfigResult<T> {
    builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Deserialize(e.to_string()))
}

/// Load a configuration file
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> ConfigResult<T> {
    finish(Cfg::builder().add_source(read_source(path.as_ref())?))
}

/// Parse configuration text in an explicit format
pub fn from_str<T: DeserializeOwned>(content: &str, format: FileFormat) -> ConfigResult<T> {
    finish(Cfg::builder().add_source(File::from_str(&substitute_env_vars(content), format)))
}

/// Layer several configuration texts; later sources override earlier ones
pub fn merge_configs<T: DeserializeOwned>(sources: &[(&str, FileFormat)]) -> ConfigResult<T> {
    let builder = sources.iter().fold(Cfg::builder(), |builder, (content, format)| {
        builder.add_source(File::from_str(&substitute_env_vars(content), *format))
    });
    finish(builder)
}

/// Layer several configuration files; later files override earlier ones
pub fn load_merged<T, P>(paths: &[P]) -> ConfigResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let mut builder = Cfg::builder();
    for path in paths {
        builder = builder.add_source(read_source(path.as_ref())?);
    }
    finish(builder)
}

/// Load a configuration file, then apply `PREFIX_`-prefixed environment overrides
///
/// Nested keys are separated by a double underscore, so
/// `TESSERA_WATCH__DEBOUNCE_MS` overrides `watch.debounce_ms`.
pub fn load_with_env<T: DeserializeOwned>(path: impl AsRef<Path>, env_prefix: &str) -> ConfigResult<T> {
    finish(
        Cfg::builder()
            .add_source(read_source(path.as_ref())?)
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            ),
    )
}
