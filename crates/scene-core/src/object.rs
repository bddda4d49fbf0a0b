//! Game object store - the object hierarchy.
//!
//! Objects form a forest through parent/child links. Each object carries its
//! local transform, a lazily resolved world transform, its attached component
//! handles (grouped by kind), an optional name and an active flag.
//!
//! World transforms are never pushed down the tree. Every write stamps the
//! object with a fresh value from a store-wide counter, and a cached world
//! transform stays valid only while the local stamp and the parent's world
//! stamp it was computed from are both unchanged.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    component::KindId,
    error::{Error, Result},
    handle::{AnyHandle, Generation, Handle, HandleStore, HandleTable},
    storage::{BlockStorage, StorageConfig},
    transform::Transform,
};

/// Handle to a game object.
pub type ObjectHandle = Handle<GameObject>;

#[derive(Debug, Clone, Copy)]
struct TransformState {
    local: Transform,
    local_stamp: u64,
    world: Transform,
    /// Zero until the first resolve.
    world_stamp: u64,
    seen_local: u64,
    seen_parent: u64,
}

impl TransformState {
    fn new(local: Transform, stamp: u64) -> Self {
        Self {
            local,
            local_stamp: stamp,
            world: local,
            world_stamp: 0,
            seen_local: 0,
            seen_parent: 0,
        }
    }
}

/// A node in the object hierarchy.
#[derive(Debug)]
pub struct GameObject {
    handle: ObjectHandle,
    name: Option<String>,
    parent: Option<ObjectHandle>,
    children: Vec<ObjectHandle>,
    components: SmallVec<[AnyHandle; 4]>,
    active: bool,
    transform: Mutex<TransformState>,
}

impl GameObject {
    #[must_use]
    pub const fn handle(&self) -> ObjectHandle {
        self.handle
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub const fn parent(&self) -> Option<ObjectHandle> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[ObjectHandle] {
        &self.children
    }

    /// Attached components, grouped by kind.
    #[must_use]
    pub fn components(&self) -> &[AnyHandle] {
        &self.components
    }

    /// The object's own flag, ignoring ancestors.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn local_transform(&self) -> Transform {
        self.transform.lock().local
    }
}

/// Creation parameters for an object.
#[derive(Debug, Clone, Default)]
pub struct ObjectDesc {
    pub parent: Option<ObjectHandle>,
    pub name: Option<String>,
    pub local: Transform,
    /// Defaults to active when `None`.
    pub active: Option<bool>,
}

/// An object removed from the store.
#[derive(Debug, Clone)]
pub struct DestroyedObject {
    pub handle: ObjectHandle,
    /// Components that were still attached. Their managers still hold them.
    pub components: SmallVec<[AnyHandle; 4]>,
}

/// All game objects of a world.
pub struct GameObjectStore {
    handles: HandleTable,
    storage: BlockStorage<GameObject>,
    names: FxHashMap<String, SmallVec<[ObjectHandle; 1]>>,
    stamps: AtomicU64,
}

impl GameObjectStore {
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        Self {
            handles: HandleTable::new(),
            storage: BlockStorage::new(config),
            names: FxHashMap::default(),
            stamps: AtomicU64::new(1),
        }
    }

    fn next_stamp(&self) -> u64 {
        self.stamps.fetch_add(1, Ordering::Relaxed)
    }

    // ==================== Lookup ====================

    #[must_use]
    pub fn get(&self, handle: ObjectHandle) -> Option<&GameObject> {
        let position = self.handles.resolve(handle.raw())?;
        self.storage.get(position)
    }

    fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut GameObject> {
        let position = self.handles.resolve(handle.raw())?;
        self.storage.get_mut(position)
    }

    fn require(&self, handle: ObjectHandle) -> Result<&GameObject> {
        self.get(handle).ok_or(Error::NotFound(handle.raw()))
    }

    fn require_mut(&mut self, handle: ObjectHandle) -> Result<&mut GameObject> {
        self.get_mut(handle).ok_or(Error::NotFound(handle.raw()))
    }

    #[must_use]
    pub fn is_alive(&self, handle: ObjectHandle) -> bool {
        self.handles.resolve(handle.raw()).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.live_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Live objects in index order.
    pub fn iter(&self) -> impl Iterator<Item = &GameObject> + '_ {
        self.storage.iter().map(|(_, object)| object)
    }

    /// Objects without a parent, in index order.
    pub fn roots(&self) -> impl Iterator<Item = ObjectHandle> + '_ {
        self.iter()
            .filter(|object| object.parent.is_none())
            .map(|object| object.handle)
    }

    #[must_use]
    pub fn parent(&self, handle: ObjectHandle) -> Option<ObjectHandle> {
        self.get(handle)?.parent
    }

    #[must_use]
    pub fn children(&self, handle: ObjectHandle) -> Option<&[ObjectHandle]> {
        self.get(handle).map(GameObject::children)
    }

    #[must_use]
    pub fn components(&self, handle: ObjectHandle) -> Option<&[AnyHandle]> {
        self.get(handle).map(GameObject::components)
    }

    /// Components of one kind in attachment order.
    #[must_use]
    pub fn components_of_kind(&self, handle: ObjectHandle, kind: KindId) -> &[AnyHandle] {
        let Some(object) = self.get(handle) else {
            return &[];
        };
        let start = object.components.partition_point(|c| c.kind() < kind);
        let end = object.components.partition_point(|c| c.kind() <= kind);
        &object.components[start..end]
    }

    // ==================== Lifecycle ====================

    /// Create an active object with an identity transform.
    pub fn create_object(&mut self, parent: Option<ObjectHandle>) -> Result<ObjectHandle> {
        self.create_object_with(ObjectDesc {
            parent,
            ..ObjectDesc::default()
        })
    }

    pub fn create_object_with(&mut self, desc: ObjectDesc) -> Result<ObjectHandle> {
        if let Some(parent) = desc.parent {
            self.require(parent)?;
        }
        if self.storage.is_full() {
            return Err(Error::CapacityExceeded {
                what: "game objects",
                capacity: self.storage.config().capacity,
            });
        }

        let raw = self.handles.acquire(0).ok_or(Error::CapacityExceeded {
            what: "game objects",
            capacity: u32::MAX as usize,
        })?;
        let handle = ObjectHandle::from_raw(raw);
        let stamp = self.next_stamp();

        let object = GameObject {
            handle,
            name: desc.name.clone(),
            parent: desc.parent,
            children: Vec::new(),
            components: SmallVec::new(),
            active: desc.active.unwrap_or(true),
            transform: Mutex::new(TransformState::new(desc.local, stamp)),
        };
        let position = match self.storage.allocate(object) {
            Ok(position) => position,
            Err(err) => {
                self.handles.release(raw);
                return Err(err);
            }
        };
        self.handles.retarget(raw.index(), position);

        if let Some(parent) = desc.parent {
            self.require_mut(parent)?.children.push(handle);
        }
        if let Some(name) = desc.name {
            self.names.entry(name).or_default().push(handle);
        }

        tracing::trace!(%raw, parent = ?desc.parent, "object created");
        Ok(handle)
    }

    /// Objects `destroy_object(handle, cascade)` would remove, children
    /// before parents.
    pub fn destruction_order(&self, handle: ObjectHandle, cascade: bool) -> Result<Vec<ObjectHandle>> {
        let root = self.require(handle)?;
        if !cascade && !root.children.is_empty() {
            return Err(Error::HasChildren(handle));
        }

        // Iterative post-order: a node is emitted once all its children are.
        let mut order = Vec::new();
        let mut stack = vec![(handle, 0usize)];
        while let Some((current, next_child)) = stack.pop() {
            let children = self.require(current)?.children.as_slice();
            if let Some(&child) = children.get(next_child) {
                stack.push((current, next_child + 1));
                stack.push((child, 0));
            } else {
                order.push(current);
            }
        }
        Ok(order)
    }

    /// Remove one childless object. Attached component handles are returned,
    /// not destroyed.
    pub(crate) fn remove_leaf(&mut self, handle: ObjectHandle) -> Result<DestroyedObject> {
        let object = self.require(handle)?;
        if !object.children.is_empty() {
            return Err(Error::HasChildren(handle));
        }
        let parent = object.parent;
        let position = self
            .handles
            .release(handle.raw())
            .ok_or(Error::NotFound(handle.raw()))?;
        let object = self.storage.free(position)?.value;

        if let Some(parent) = parent.and_then(|p| self.get_mut(p)) {
            parent.children.retain(|child| *child != handle);
        }
        if let Some(name) = &object.name {
            self.unindex_name(name, handle);
        }

        tracing::trace!(raw = %handle.raw(), "object destroyed");
        Ok(DestroyedObject {
            handle,
            components: object.components,
        })
    }

    /// Destroy an object, and with `cascade` all of its descendants.
    ///
    /// Fails with [`Error::HasChildren`] when `cascade` is false and the
    /// object has children. Component handles of the removed objects are
    /// returned and stay alive in their managers;
    /// [`World::destroy_object`](crate::World::destroy_object) destroys them.
    pub(crate) fn destroy_object(&mut self, handle: ObjectHandle, cascade: bool) -> Result<Vec<DestroyedObject>> {
        let order = self.destruction_order(handle, cascade)?;
        order
            .into_iter()
            .map(|object| self.remove_leaf(object))
            .collect()
    }

    // ==================== Components ====================

    /// Record a component handle on its owner, keeping kinds grouped.
    pub fn attach_component(&mut self, object: ObjectHandle, component: AnyHandle) -> Result<()> {
        let object = self.require_mut(object)?;
        if object.components.contains(&component) {
            return Ok(());
        }
        let at = object
            .components
            .partition_point(|c| c.kind() <= component.kind());
        object.components.insert(at, component);
        Ok(())
    }

    pub fn detach_component(&mut self, object: ObjectHandle, component: AnyHandle) -> Result<()> {
        let object = self.require_mut(object)?;
        let at = object
            .components
            .iter()
            .position(|c| *c == component)
            .ok_or(Error::Detached(component))?;
        object.components.remove(at);
        Ok(())
    }

    // ==================== Hierarchy ====================

    /// Move `object` under `new_parent`, or make it a root with `None`.
    ///
    /// Fails with [`Error::CycleDetected`] if `new_parent` is `object` or one
    /// of its descendants; the hierarchy is left unchanged.
    pub fn set_parent(&mut self, object: ObjectHandle, new_parent: Option<ObjectHandle>) -> Result<()> {
        let old_parent = self.require(object)?.parent;

        if let Some(parent) = new_parent {
            self.require(parent)?;
            let mut cursor = Some(parent);
            while let Some(ancestor) = cursor {
                if ancestor == object {
                    return Err(Error::CycleDetected { object, parent });
                }
                cursor = self.parent(ancestor);
            }
        }

        if old_parent == new_parent {
            return Ok(());
        }

        if let Some(old) = old_parent.and_then(|p| self.get_mut(p)) {
            old.children.retain(|child| *child != object);
        }
        if let Some(parent) = new_parent {
            self.require_mut(parent)?.children.push(object);
        }
        self.require_mut(object)?.parent = new_parent;
        Ok(())
    }

    /// Reparent while keeping the object's world placement.
    pub fn set_parent_keep_world(
        &mut self,
        object: ObjectHandle,
        new_parent: Option<ObjectHandle>,
    ) -> Result<()> {
        let world = self.world_transform(object)?;
        self.set_parent(object, new_parent)?;
        self.set_world_transform(object, world)
    }

    // ==================== Transforms ====================

    pub fn local_transform(&self, object: ObjectHandle) -> Result<Transform> {
        Ok(self.require(object)?.transform.lock().local)
    }

    /// Write the local transform. Descendants pick the change up on their
    /// next world query.
    pub fn set_local_transform(&self, object: ObjectHandle, local: Transform) -> Result<()> {
        let object = self.require(object)?;
        let stamp = self.next_stamp();
        let mut state = object.transform.lock();
        state.local = local;
        state.local_stamp = stamp;
        Ok(())
    }

    /// Place the object in world space by solving for its local transform.
    pub fn set_world_transform(&self, object: ObjectHandle, world: Transform) -> Result<()> {
        let local = match self.require(object)?.parent {
            Some(parent) => {
                let parent_world = self.world_transform(parent)?;
                let inverse = parent_world.inverse().ok_or(Error::Degenerate(parent))?;
                inverse.compose(&world)
            }
            None => world,
        };
        self.set_local_transform(object, local)
    }

    /// World transform, recomputing stale cache entries from the root down.
    pub fn world_transform(&self, object: ObjectHandle) -> Result<Transform> {
        let mut chain: SmallVec<[&GameObject; 16]> = SmallVec::new();
        let mut cursor = Some(object);
        while let Some(handle) = cursor {
            let node = self.require(handle)?;
            chain.push(node);
            cursor = node.parent;
        }

        let mut parent: Option<(Transform, u64)> = None;
        for node in chain.iter().rev() {
            let mut state = node.transform.lock();
            let parent_stamp = parent.map_or(0, |(_, stamp)| stamp);
            if state.world_stamp == 0
                || state.seen_local != state.local_stamp
                || state.seen_parent != parent_stamp
            {
                state.world = match parent {
                    Some((parent_world, _)) => parent_world.compose(&state.local),
                    None => state.local,
                };
                state.seen_local = state.local_stamp;
                state.seen_parent = parent_stamp;
                state.world_stamp = self.next_stamp();
            }
            parent = Some((state.world, state.world_stamp));
        }

        parent
            .map(|(world, _)| world)
            .ok_or(Error::NotFound(object.raw()))
    }

    // ==================== Names ====================

    #[must_use]
    pub fn name(&self, object: ObjectHandle) -> Option<&str> {
        self.get(object)?.name()
    }

    pub fn set_name(&mut self, object: ObjectHandle, name: Option<String>) -> Result<()> {
        let old = self.require_mut(object)?.name.take();
        if let Some(old) = old {
            self.unindex_name(&old, object);
        }
        if let Some(name) = &name {
            self.names.entry(name.clone()).or_default().push(object);
        }
        self.require_mut(object)?.name = name;
        Ok(())
    }

    /// First live object created or renamed with `name`.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<ObjectHandle> {
        self.names.get(name)?.first().copied()
    }

    /// Every live object named `name`.
    #[must_use]
    pub fn find_all_by_name(&self, name: &str) -> &[ObjectHandle] {
        self.names.get(name).map_or(&[][..], |handles| handles.as_slice())
    }

    fn unindex_name(&mut self, name: &str, object: ObjectHandle) {
        if let Some(handles) = self.names.get_mut(name) {
            handles.retain(|h| *h != object);
            if handles.is_empty() {
                self.names.remove(name);
            }
        }
    }

    // ==================== Active state ====================

    #[must_use]
    pub fn is_active(&self, object: ObjectHandle) -> bool {
        self.get(object).is_some_and(GameObject::is_active)
    }

    /// Active and every ancestor active.
    #[must_use]
    pub fn is_active_in_hierarchy(&self, object: ObjectHandle) -> bool {
        let mut cursor = Some(object);
        while let Some(handle) = cursor {
            match self.get(handle) {
                Some(node) if node.active => cursor = node.parent,
                _ => return false,
            }
        }
        true
    }

    pub fn set_active(&mut self, object: ObjectHandle, active: bool) -> Result<()> {
        self.require_mut(object)?.active = active;
        Ok(())
    }
}

impl HandleStore<GameObject> for GameObjectStore {
    fn generation_at(&self, index: u32) -> Option<Generation> {
        self.handles.generation_at(index)
    }
}

impl std::fmt::Debug for GameObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameObjectStore")
            .field("objects", &self.storage.live_count())
            .field("names", &self.names.len())
            .finish_non_exhaustive()
    }
}
