//! Registry errors

use thiserror::Error;

use crate::hash::TypeId;

/// Errors reported by [`TypeRegistry`](super::TypeRegistry)
///
/// All of them are configuration errors: the registry is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("Type {type_name} ({type_id}) is already registered")]
    AlreadyRegistered { type_id: TypeId, type_name: String },

    #[error("Unknown type: {0}")]
    UnknownType(TypeId),

    #[error("Type {type_id} belongs to retired plugin generation {generation}")]
    RetiredGeneration { type_id: TypeId, generation: u64 },
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
