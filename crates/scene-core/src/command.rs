//! Deferred structural changes.
//!
//! While managers iterate, the object hierarchy and the component managers
//! are frozen. Structural changes are queued instead and applied by the
//! world at the next phase boundary. Each thread writes to its own buffer;
//! draining merges the buffers and orders them by the schedule position of
//! the issuing kind, so the applied order does not depend on which worker
//! ran which manager.

use std::{any::Any, cell::RefCell, fmt};

use thread_local::ThreadLocal;

use crate::{
    component::{Component, KindId},
    handle::{AnyHandle, Handle},
    object::ObjectHandle,
    transform::Transform,
};

/// Origin used for commands queued by the host outside of updates.
pub(crate) const HOST_ORIGIN: u32 = u32::MAX;

/// A component value waiting to be inserted.
pub struct PendingComponent {
    pub(crate) kind: KindId,
    pub(crate) value: Box<dyn Any + Send>,
}

impl PendingComponent {
    #[must_use]
    pub fn new<T: Component>(value: T) -> Self {
        Self {
            kind: T::KIND,
            value: Box::new(value),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> KindId {
        self.kind
    }
}

impl fmt::Debug for PendingComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingComponent")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Object to spawn, with its initial components.
#[derive(Debug)]
pub struct ObjectSpawn {
    pub(crate) parent: Option<ObjectHandle>,
    pub(crate) name: Option<String>,
    pub(crate) local: Transform,
    pub(crate) active: bool,
    pub(crate) components: Vec<PendingComponent>,
}

impl ObjectSpawn {
    /// An active root object with an identity transform.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parent: None,
            name: None,
            local: Transform::identity(),
            active: true,
            components: Vec::new(),
        }
    }

    #[must_use]
    pub fn parent(mut self, parent: ObjectHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn local(mut self, local: Transform) -> Self {
        self.local = local;
        self
    }

    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    #[must_use]
    pub fn with<T: Component>(mut self, component: T) -> Self {
        self.components.push(PendingComponent::new(component));
        self
    }

    /// Attach an already decoded component.
    #[must_use]
    pub fn with_pending(mut self, component: PendingComponent) -> Self {
        self.components.push(component);
        self
    }
}

impl Default for ObjectSpawn {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued structural change.
#[derive(Debug)]
pub enum Command {
    SpawnObject(ObjectSpawn),
    DestroyObject {
        object: ObjectHandle,
        cascade: bool,
    },
    SetParent {
        object: ObjectHandle,
        parent: Option<ObjectHandle>,
    },
    CreateComponent {
        owner: ObjectHandle,
        component: PendingComponent,
    },
    DestroyComponent(AnyHandle),
}

#[derive(Debug)]
struct Queued {
    origin: u32,
    command: Command,
}

/// Per-thread command buffers.
#[derive(Default)]
pub struct CommandQueue {
    buffers: ThreadLocal<RefCell<Vec<Queued>>>,
}

impl CommandQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, origin: u32, command: Command) {
        self.buffers
            .get_or_default()
            .borrow_mut()
            .push(Queued { origin, command });
    }

    /// Take every queued command, ordered by origin. Commands from the same
    /// origin keep their queue order.
    pub fn drain(&mut self) -> Vec<Command> {
        let mut queued: Vec<Queued> = self
            .buffers
            .iter_mut()
            .flat_map(|cell| cell.get_mut().drain(..))
            .collect();
        queued.sort_by_key(|q| q.origin);
        queued.into_iter().map(|q| q.command).collect()
    }

    /// Number of queued commands across all threads.
    pub fn pending(&mut self) -> usize {
        self.buffers.iter_mut().map(|cell| cell.get_mut().len()).sum()
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue").finish_non_exhaustive()
    }
}

/// Writer for deferred commands, tagged with the issuing origin.
#[derive(Clone, Copy)]
pub struct Deferred<'a> {
    queue: &'a CommandQueue,
    origin: u32,
}

impl<'a> Deferred<'a> {
    pub(crate) const fn new(queue: &'a CommandQueue, origin: u32) -> Self {
        Self { queue, origin }
    }

    pub fn spawn(&self, spawn: ObjectSpawn) {
        self.queue.push(self.origin, Command::SpawnObject(spawn));
    }

    pub fn destroy_object(&self, object: ObjectHandle, cascade: bool) {
        self.queue
            .push(self.origin, Command::DestroyObject { object, cascade });
    }

    pub fn set_parent(&self, object: ObjectHandle, parent: Option<ObjectHandle>) {
        self.queue
            .push(self.origin, Command::SetParent { object, parent });
    }

    pub fn create<T: Component>(&self, owner: ObjectHandle, value: T) {
        self.queue.push(
            self.origin,
            Command::CreateComponent {
                owner,
                component: PendingComponent::new(value),
            },
        );
    }

    pub fn destroy<T: Component>(&self, handle: Handle<T>) {
        self.destroy_any(handle.into());
    }

    pub fn destroy_any(&self, handle: AnyHandle) {
        self.queue.push(self.origin, Command::DestroyComponent(handle));
    }
}

impl fmt::Debug for Deferred<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
