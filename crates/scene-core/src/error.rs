//! Error types for the scene core.

use thiserror::Error;

use crate::{
    component::KindId,
    handle::{AnyHandle, RawHandle},
    object::ObjectHandle,
    world::WorldState,
};

/// Scene core error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Handle does not resolve to a live object or component.
    #[error("handle not found: {0}")]
    NotFound(RawHandle),

    /// Component owner does not resolve to a live game object.
    #[error("invalid owner: {0:?}")]
    InvalidOwner(ObjectHandle),

    /// Hard capacity ceiling reached.
    #[error("{what} capacity exceeded ({capacity})")]
    CapacityExceeded {
        /// What ran out of room.
        what: &'static str,
        /// The configured ceiling.
        capacity: usize,
    },

    /// Reparenting would make an object its own ancestor.
    #[error("reparenting {object:?} under {parent:?} would create a cycle")]
    CycleDetected {
        object: ObjectHandle,
        parent: ObjectHandle,
    },

    /// Non-cascading destroy of an object that still has children.
    #[error("object {0:?} has children")]
    HasChildren(ObjectHandle),

    /// Same-kind create or destroy while that kind is iterating.
    #[error("concurrent modification of {kind} during its update")]
    ConcurrentModification { kind: &'static str },

    /// Manager dependencies do not form a DAG.
    #[error("dependency cycle between kinds: {}", kinds.join(", "))]
    DependencyCycle { kinds: Vec<&'static str> },

    /// Malformed serialized data.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Kind id not registered.
    #[error("unknown component kind: {0:?}")]
    UnknownKind(KindId),

    /// Kind id registered twice.
    #[error("component kind {id:?} registered twice ({name})")]
    DuplicateKind { id: KindId, name: &'static str },

    /// Operation not allowed in the current world state.
    #[error("operation not allowed while {0:?}")]
    InvalidState(WorldState),

    /// Component update reported a failure.
    #[error("update failed: {0}")]
    Update(String),

    /// Parent transform has zero scale, so world placement cannot be solved.
    #[error("transform of {0:?} is not invertible")]
    Degenerate(ObjectHandle),

    /// Component handle is not attached to the object.
    #[error("component {0:?} is not attached")]
    Detached(AnyHandle),

    /// IO error from a serialize hook.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker pool could not be built.
    #[error("worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    /// Whether this is a recoverable "entity gone" error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InvalidOwner(_))
    }
}

/// Result type for scene core operations.
pub type Result<T> = std::result::Result<T, Error>;
