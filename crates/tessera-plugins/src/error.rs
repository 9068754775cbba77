//! Plugin lifecycle errors

use thiserror::Error;

use crate::hot_reload::PluginLoadError;
use tessera_kernel::RegistryError;

/// Errors raised while driving a plugin through its lifecycle
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// Operation not allowed in the current lifecycle state
    #[error("{name}: cannot {operation} while {state}")]
    InvalidTransition {
        name: String,
        state: String,
        operation: &'static str,
    },

    /// Native entry point returned a failure status
    #[error("{name}: entry point returned {status} for {operation}")]
    EntryPoint {
        name: String,
        operation: &'static str,
        status: i32,
    },

    /// A plugin hook reported an error
    #[error("{name}: {hook} failed: {message}")]
    Hook {
        name: String,
        hook: &'static str,
        message: String,
    },

    /// A plugin hook panicked
    #[error("{name}: {hook} panicked: {message}")]
    Panicked {
        name: String,
        hook: &'static str,
        message: String,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Load error: {0}")]
    Load(#[from] PluginLoadError),
}

impl PluginError {
    /// Error for a hook that failed with a message
    pub fn hook(name: &str, hook: &'static str, message: impl Into<String>) -> Self {
        Self::Hook {
            name: name.to_string(),
            hook,
            message: message.into(),
        }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

