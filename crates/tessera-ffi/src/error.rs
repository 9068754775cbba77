//! Status codes returned across the C boundary

use thiserror::Error;

use tessera_kernel::{RegistryError, TypeId};

/// Call succeeded
pub const TESSERA_OK: i32 = 0;
/// Operation failed or panicked
pub const TESSERA_ERR_FAILED: i32 = -1;
/// A required pointer was null or the bridge is not set up
pub const TESSERA_ERR_INVALID_STATE: i32 = -2;
/// Requested type is not registered
pub const TESSERA_ERR_UNKNOWN_TYPE: i32 = -4;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FfiError {
    #[error("null pointer passed as `{0}`")]
    NullPointer(&'static str),

    #[error("handle callbacks have not been installed")]
    RuntimeNotInstalled,

    #[error("object is not attached to a live event hub")]
    Detached,

    #[error("invalid UTF-8 in `{0}`")]
    InvalidString(&'static str),

    #[error("unknown type {0}")]
    UnknownType(TypeId),

    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for FfiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownType(type_id) => FfiError::UnknownType(type_id),
            other => FfiError::Registry(other),
        }
    }
}

impl FfiError {
    /// Status code reported to the caller
    pub fn status(&self) -> i32 {
        match self {
            FfiError::NullPointer(_) | FfiError::RuntimeNotInstalled | FfiError::Detached => {
                TESSERA_ERR_INVALID_STATE
            }
            FfiError::UnknownType(_) => TESSERA_ERR_UNKNOWN_TYPE,
            FfiError::InvalidString(_) | FfiError::Registry(_) => TESSERA_ERR_FAILED,
        }
    }
}

pub type FfiResult<T> = Result<T, FfiError>;
