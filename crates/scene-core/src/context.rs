//! What a component sees while it updates.

use crate::{
    command::{CommandQueue, Deferred},
    component::{Component, Phase},
    error::{Error, Result},
    handle::{AnyHandle, Handle, RawHandle},
    manager::{ManagerCell, ManagerRef, ManagerTable},
    object::{GameObjectStore, ObjectHandle},
};

/// Shared state of one phase. Borrowed by every manager running in it.
pub struct FrameContext<'w> {
    pub(crate) objects: &'w GameObjectStore,
    pub(crate) commands: &'w CommandQueue,
    pub(crate) managers: &'w ManagerTable,
    pub(crate) phase: Phase,
    pub(crate) delta_time: f32,
    pub(crate) frame: u64,
}

/// Per-component view handed to [`Component::update`].
pub struct UpdateContext<'a> {
    frame: &'a FrameContext<'a>,
    slot: &'a ManagerCell,
    this: RawHandle,
    owner: ObjectHandle,
}

impl<'a> UpdateContext<'a> {
    pub(crate) const fn new(
        frame: &'a FrameContext<'a>,
        slot: &'a ManagerCell,
        this: RawHandle,
        owner: ObjectHandle,
    ) -> Self {
        Self {
            frame,
            slot,
            this,
            owner,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.frame.phase
    }

    /// Seconds since the previous frame.
    #[must_use]
    pub const fn delta_time(&self) -> f32 {
        self.frame.delta_time
    }

    /// Index of the frame being updated.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame.frame
    }

    /// The object this component is attached to.
    #[must_use]
    pub const fn owner(&self) -> ObjectHandle {
        self.owner
    }

    /// Handle of the component being updated.
    #[must_use]
    pub fn this<T: Component>(&self) -> Option<Handle<T>> {
        (T::KIND == self.slot.kind()).then(|| Handle::from_raw(self.this))
    }

    /// The object hierarchy. Structure is frozen during updates; transforms
    /// may be read and written.
    #[must_use]
    pub const fn objects(&self) -> &'a GameObjectStore {
        self.frame.objects
    }

    /// Queue structural changes for the next phase boundary.
    #[must_use]
    pub fn defer(&self) -> Deferred<'a> {
        Deferred::new(self.frame.commands, self.slot.origin)
    }

    /// Read the manager of a declared dependency. Returns `None` for kinds
    /// this kind does not depend on.
    #[must_use]
    pub fn read<U: Component>(&self) -> Option<ManagerRef<'a, U>> {
        if !self.slot.dependencies().contains(&U::KIND) {
            return None;
        }
        self.frame.managers.read::<U>()
    }

    /// Whether `handle` still names a live component, of any kind. Needs no
    /// declared dependency and never waits on a running manager.
    #[must_use]
    pub fn is_valid(&self, handle: AnyHandle) -> bool {
        self.frame
            .managers
            .cell(handle.kind())
            .is_some_and(|cell| cell.is_valid(handle.raw()))
    }

    /// Queue creation of a component of another kind.
    ///
    /// The kind being updated cannot be modified from inside its own
    /// update and reports [`Error::ConcurrentModification`].
    pub fn create<U: Component>(&self, owner: ObjectHandle, value: U) -> Result<()> {
        self.check_other_kind::<U>()?;
        self.defer().create(owner, value);
        Ok(())
    }

    /// Queue destruction of a component of another kind.
    pub fn destroy<U: Component>(&self, handle: Handle<U>) -> Result<()> {
        self.check_other_kind::<U>()?;
        self.defer().destroy(handle);
        Ok(())
    }

    fn check_other_kind<U: Component>(&self) -> Result<()> {
        if U::KIND == self.slot.kind() {
            return Err(Error::ConcurrentModification { kind: U::NAME });
        }
        Ok(())
    }
}

impl std::fmt::Debug for UpdateContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateContext")
            .field("kind", &self.slot.name())
            .field("phase", &self.frame.phase)
            .field("frame", &self.frame.frame)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
