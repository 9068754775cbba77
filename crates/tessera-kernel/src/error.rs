//! Crate-level error types for `tessera-kernel`.
//!
//! [`KernelError`] composes the typed errors of each sub-module, and
//! [`KernelResult`] wraps it in an [`error_stack::Report`] so callers can
//! attach context as the error propagates.
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//! use tessera_kernel::error::{KernelError, KernelResult};
//!
//! fn spawn_player(context: &Context) -> KernelResult<SharedObject> {
//!     context
//!         .create_object(StringHash::new("Player"))
//!         .map_err(KernelError::from)
//!         .map_err(error_stack::Report::new)
//!         .attach("spawning the player")
//! }
//! ```

use thiserror::Error;

use crate::registry::RegistryError;

/// Crate-level error type for `tessera-kernel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// Type registry rejected an operation.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration could not be loaded (requires the `config` feature).
    #[cfg(feature = "config")]
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Attribute snapshot could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;

/// Text of a payload caught by `std::panic::catch_unwind`.
///
/// Shared by every boundary that turns a panic into a status code.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::StringHash;
    use error_stack::{Report, ResultExt};

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static text");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn registry_error_converts_via_from() {
        let err: KernelError = RegistryError::UnknownType(StringHash::new("Ghost")).into();
        assert!(matches!(err, KernelError::Registry(RegistryError::UnknownType(_))));
        assert!(err.to_string().starts_with("Registry error"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let err: KernelError = std::io::Error::new(std::io::ErrorKind::NotFound, "plugin.so").into();
        assert!(matches!(err, KernelError::Io(_)));
        assert!(err.to_string().contains("plugin.so"));
    }

    #[test]
    fn report_carries_context() {
        let result: KernelResult<()> =
            Err(Report::new(KernelError::Internal("root cause".into()))).attach("while restoring attributes");

        let display = format!("{:?}", result.unwrap_err());
        assert!(display.contains("root cause"));
        assert!(display.contains("while restoring attributes"));
    }

    #[cfg(feature = "config")]
    #[test]
    fn config_error_converts_via_from() {
        let err: KernelError = crate::config::ConfigError::UnsupportedFormat("xml".into()).into();
        assert!(matches!(err, KernelError::Config(_)));
        assert!(err.to_string().contains("xml"));
    }
}
