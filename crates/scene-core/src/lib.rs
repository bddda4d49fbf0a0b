#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::float_cmp)]

//! Scene core - game objects, block-allocated components and phased updates.
//!
//! # Key Concepts
//!
//! - **Handle**: `(index, generation)` reference that stops resolving once its
//!   target is destroyed, even if the slot is reused
//! - **Component kind**: a concrete type implementing [`Component`], registered
//!   on a [`KindRegistry`] with its phases and dependencies
//! - **Component manager**: block storage plus handle table for one kind
//! - **Game object**: node in the hierarchy with a transform and attached
//!   component handles
//! - **World**: owns everything and runs frames
//!
//! # Frame Structure
//!
//! ```ignore
//! let mut registry = KindRegistry::new();
//! registry
//!     .register::<Physics>(Registration::new().phases(Phase::Simulation))?
//!     .register::<Rendering>(
//!         Registration::new()
//!             .phases(Phase::PostSimulation)
//!             .depends_on::<Physics>(),
//!     )?;
//!
//! let mut world = World::new(&registry, WorldConfig::from_env())?;
//! let ship = world.create_object(None)?;
//! world.create_component(ship, Physics::default())?;
//!
//! let report = world.update(1.0 / 60.0)?;
//! for failure in report.failures() {
//!     eprintln!("{} failed: {:?}", failure.name, failure.failure);
//! }
//! ```
//!
//! Structural changes requested during an update go through
//! [`UpdateContext::defer`] and are applied at the next phase boundary.

mod command;
mod component;
mod config;
mod context;
mod error;
mod handle;
mod manager;
mod object;
mod schedule;
mod storage;
mod transform;
mod world;

pub use command::{Command, CommandQueue, Deferred, ObjectSpawn, PendingComponent};
pub use component::{
    Component, KindDescriptor, KindId, KindRegistry, Phase, PhaseSet, Registration,
};
pub use config::WorldConfig;
pub use context::{FrameContext, UpdateContext};
pub use error::{Error, Result};
pub use handle::{AnyHandle, Generation, GenerationTable, Handle, HandleStore, RawHandle};
pub use manager::{ComponentManager, ComponentRef, ErasedManager, ManagerCell, ManagerRef, ManagerTable};
pub use object::{DestroyedObject, GameObject, GameObjectStore, ObjectDesc, ObjectHandle};
pub use schedule::Schedule;
pub use storage::{BlockStorage, Freed, Relocation, StorageConfig, StorageLayout};
pub use transform::Transform;
pub use world::{FrameReport, Invalidation, ManagerOutcome, World, WorldState};

/// Re-exported so component authors use the same math types.
pub use nalgebra;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{
        AnyHandle, Component, Error, Handle, KindId, KindRegistry, ObjectHandle, ObjectSpawn,
        Phase, PhaseSet, Registration, Result, StorageLayout, Transform, UpdateContext, World,
        WorldConfig,
    };
}
