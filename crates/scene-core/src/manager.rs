//! Component managers.
//!
//! A [`ComponentManager<T>`] owns the block storage for one kind and the handle
//! table that maps component handles to storage slots. The world stores one
//! manager per kind behind [`ErasedManager`] so kinds can be driven without
//! knowing their concrete types.

use std::{
    any::Any,
    io::{Cursor, Read, Write},
    sync::Arc,
};

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    component::{Component, KindId, PhaseSet},
    context::{FrameContext, UpdateContext},
    error::{Error, Result},
    handle::{AnyHandle, Generation, GenerationTable, Handle, HandleStore, HandleTable, RawHandle},
    object::{GameObjectStore, ObjectHandle},
    storage::{BlockStorage, StorageConfig},
};

/// Stored component with its bookkeeping.
struct ComponentEntry<T> {
    handle: Handle<T>,
    owner: ObjectHandle,
    active: bool,
    value: T,
}

/// Storage and lifecycle for all components of kind `T`.
pub struct ComponentManager<T> {
    handles: HandleTable,
    storage: BlockStorage<ComponentEntry<T>>,
}

impl<T: Component> ComponentManager<T> {
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        Self {
            handles: HandleTable::new(),
            storage: BlockStorage::new(config),
        }
    }

    /// Number of live components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.live_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    #[must_use]
    pub fn storage_config(&self) -> &StorageConfig {
        self.storage.config()
    }

    /// Create a component attached to `owner`.
    pub fn create(
        &mut self,
        objects: &mut GameObjectStore,
        owner: ObjectHandle,
        value: T,
    ) -> Result<Handle<T>> {
        if !objects.is_alive(owner) {
            return Err(Error::InvalidOwner(owner));
        }
        if self.storage.is_full() {
            return Err(Error::CapacityExceeded {
                what: T::NAME,
                capacity: self.storage.config().capacity,
            });
        }

        let raw = self
            .handles
            .acquire(0)
            .ok_or(Error::CapacityExceeded {
                what: T::NAME,
                capacity: u32::MAX as usize,
            })?;
        let handle = Handle::from_raw(raw);

        let entry = ComponentEntry {
            handle,
            owner,
            active: true,
            value,
        };
        let position = match self.storage.allocate(entry) {
            Ok(position) => position,
            Err(err) => {
                self.handles.release(raw);
                return Err(err);
            }
        };
        self.handles.retarget(raw.index(), position);
        objects.attach_component(owner, AnyHandle::from(handle))?;

        tracing::trace!(kind = T::NAME, %raw, ?owner, "component created");
        Ok(handle)
    }

    /// Destroy a component and return its value.
    ///
    /// The handle is invalid as soon as this returns; a second call yields
    /// [`Error::NotFound`].
    pub fn destroy(&mut self, objects: &mut GameObjectStore, handle: Handle<T>) -> Result<T> {
        let position = self
            .handles
            .resolve(handle.raw())
            .ok_or(Error::NotFound(handle.raw()))?;
        let freed = self.storage.free(position)?;

        if let Some(moved) = freed.relocated {
            if let Some(entry) = self.storage.get(moved.to) {
                self.handles.retarget(entry.handle.index(), moved.to);
            }
        }
        self.handles.release(handle.raw());

        let entry = freed.value;
        // The owner may already be gone when the object store was torn down directly.
        if objects.is_alive(entry.owner) {
            objects.detach_component(entry.owner, AnyHandle::from(handle))?;
        }

        tracing::trace!(kind = T::NAME, raw = %handle.raw(), "component destroyed");
        Ok(entry.value)
    }

    fn entry(&self, handle: Handle<T>) -> Option<&ComponentEntry<T>> {
        let position = self.handles.resolve(handle.raw())?;
        self.storage.get(position)
    }

    fn entry_mut(&mut self, handle: Handle<T>) -> Option<&mut ComponentEntry<T>> {
        let position = self.handles.resolve(handle.raw())?;
        self.storage.get_mut(position)
    }

    #[must_use]
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.entry(handle).map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.entry_mut(handle).map(|entry| &mut entry.value)
    }

    #[must_use]
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.handles.resolve(handle.raw()).is_some()
    }

    /// Owning object of a live component.
    #[must_use]
    pub fn owner(&self, handle: Handle<T>) -> Option<ObjectHandle> {
        self.entry(handle).map(|entry| entry.owner)
    }

    #[must_use]
    pub fn is_active(&self, handle: Handle<T>) -> Option<bool> {
        self.entry(handle).map(|entry| entry.active)
    }

    /// Inactive components are skipped by update.
    pub fn set_active(&mut self, handle: Handle<T>, active: bool) -> Result<()> {
        let entry = self.entry_mut(handle).ok_or(Error::NotFound(handle.raw()))?;
        entry.active = active;
        Ok(())
    }

    /// Live components in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.storage
            .iter()
            .map(|(_, entry)| (entry.handle, &entry.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> + '_ {
        self.storage
            .iter_mut()
            .map(|(_, entry)| (entry.handle, &mut entry.value))
    }

    /// Run [`Component::update`] over every active component whose owner is
    /// active in hierarchy. The first error aborts the remaining components.
    ///
    /// `processed` counts the components that finished, and stays accurate
    /// when an update fails or panics part way.
    pub fn update(
        &mut self,
        frame: &FrameContext<'_>,
        slot: &ManagerCell,
        processed: &mut usize,
    ) -> Result<()> {
        for (_, entry) in self.storage.iter_mut() {
            if !entry.active || !frame.objects.is_active_in_hierarchy(entry.owner) {
                continue;
            }
            let mut ctx = UpdateContext::new(frame, slot, entry.handle.raw(), entry.owner);
            entry.value.update(&mut ctx)?;
            *processed += 1;
        }
        Ok(())
    }

    /// Lock-free generations of this manager's handles.
    #[must_use]
    pub fn generations(&self) -> Arc<GenerationTable> {
        self.handles.shared()
    }

    fn clear(&mut self, objects: &mut GameObjectStore) {
        for (_, entry) in self.storage.iter() {
            if objects.is_alive(entry.owner) {
                // Attached by construction, so a detach failure cannot happen here.
                let _ = objects.detach_component(entry.owner, AnyHandle::from(entry.handle));
            }
        }
        self.storage.clear();
        self.handles.clear();
    }
}

impl<T: Component> HandleStore<T> for ComponentManager<T> {
    fn generation_at(&self, index: u32) -> Option<Generation> {
        self.handles.generation_at(index)
    }
}

impl<T> std::fmt::Debug for ComponentManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentManager")
            .field("kind", &std::any::type_name::<T>())
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

// ==================== Type-erased access ====================

/// Kind-agnostic view of a [`ComponentManager`].
pub trait ErasedManager: Any + Send + Sync {
    fn kind(&self) -> KindId;

    fn name(&self) -> &'static str;

    /// Payload version new serializations are written with.
    fn version(&self) -> u16;

    fn len(&self) -> usize;

    fn contains(&self, raw: RawHandle) -> bool;

    fn owner(&self, raw: RawHandle) -> Option<ObjectHandle>;

    /// Live component handles in storage order.
    fn handles(&self) -> Vec<RawHandle>;

    /// Create from a boxed value of the concrete component type.
    fn create_erased(
        &mut self,
        objects: &mut GameObjectStore,
        owner: ObjectHandle,
        value: Box<dyn Any + Send>,
    ) -> Result<RawHandle>;

    fn destroy_erased(&mut self, objects: &mut GameObjectStore, raw: RawHandle) -> Result<()>;

    fn set_active_erased(&mut self, raw: RawHandle, active: bool) -> Result<()>;

    fn update(
        &mut self,
        frame: &FrameContext<'_>,
        slot: &ManagerCell,
        processed: &mut usize,
    ) -> Result<()>;

    fn generations(&self) -> Arc<GenerationTable>;

    /// Write a component payload. Returns the version it was written with.
    fn serialize_erased(&self, raw: RawHandle, writer: &mut dyn Write) -> Result<u16>;

    /// Decode a payload into a boxed component value without inserting it.
    fn decode_erased(&self, version: u16, payload: &[u8]) -> Result<Box<dyn Any + Send>>;

    /// Destroy every component.
    fn clear(&mut self, objects: &mut GameObjectStore);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> ErasedManager for ComponentManager<T> {
    fn kind(&self) -> KindId {
        T::KIND
    }

    fn name(&self) -> &'static str {
        T::NAME
    }

    fn version(&self) -> u16 {
        T::VERSION
    }

    fn len(&self) -> usize {
        self.storage.live_count()
    }

    fn contains(&self, raw: RawHandle) -> bool {
        self.handles.resolve(raw).is_some()
    }

    fn owner(&self, raw: RawHandle) -> Option<ObjectHandle> {
        Self::owner(self, Handle::from_raw(raw))
    }

    fn handles(&self) -> Vec<RawHandle> {
        self.storage
            .iter()
            .map(|(_, entry)| entry.handle.raw())
            .collect()
    }

    fn create_erased(
        &mut self,
        objects: &mut GameObjectStore,
        owner: ObjectHandle,
        value: Box<dyn Any + Send>,
    ) -> Result<RawHandle> {
        let value = value.downcast::<T>().map_err(|_| {
            Error::Corrupt(format!("value passed to {} manager has the wrong type", T::NAME))
        })?;
        self.create(objects, owner, *value).map(Handle::raw)
    }

    fn destroy_erased(&mut self, objects: &mut GameObjectStore, raw: RawHandle) -> Result<()> {
        self.destroy(objects, Handle::from_raw(raw)).map(drop)
    }

    fn set_active_erased(&mut self, raw: RawHandle, active: bool) -> Result<()> {
        self.set_active(Handle::from_raw(raw), active)
    }

    fn update(
        &mut self,
        frame: &FrameContext<'_>,
        slot: &ManagerCell,
        processed: &mut usize,
    ) -> Result<()> {
        Self::update(self, frame, slot, processed)
    }

    fn generations(&self) -> Arc<GenerationTable> {
        Self::generations(self)
    }

    fn serialize_erased(&self, raw: RawHandle, writer: &mut dyn Write) -> Result<u16> {
        let value = self.get(Handle::from_raw(raw)).ok_or(Error::NotFound(raw))?;
        value.serialize(writer)?;
        Ok(T::VERSION)
    }

    fn decode_erased(&self, version: u16, payload: &[u8]) -> Result<Box<dyn Any + Send>> {
        if version > T::VERSION {
            return Err(Error::Corrupt(format!(
                "{} payload version {version} is newer than {}",
                T::NAME,
                T::VERSION
            )));
        }

        let mut cursor = Cursor::new(payload);
        let value = T::deserialize(version, &mut cursor).map_err(|err| match err {
            Error::Io(io) => Error::Corrupt(format!("{} payload: {io}", T::NAME)),
            other => other,
        })?;

        let consumed = cursor.position() as usize;
        if consumed != payload.len() {
            return Err(Error::Corrupt(format!(
                "{} payload has {} trailing bytes",
                T::NAME,
                payload.len() - consumed
            )));
        }
        Ok(Box::new(value))
    }

    fn clear(&mut self, objects: &mut GameObjectStore) {
        Self::clear(self, objects);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Read guard on one concrete manager.
pub type ManagerRef<'a, T> = MappedRwLockReadGuard<'a, ComponentManager<T>>;

/// Read guard on one component value.
pub type ComponentRef<'a, T> = MappedRwLockReadGuard<'a, T>;

// ==================== Manager table ====================

/// One registered manager with its scheduling metadata.
pub struct ManagerCell {
    pub(crate) kind: KindId,
    pub(crate) name: &'static str,
    /// Position in the schedule. Orders deferred commands.
    pub(crate) origin: u32,
    pub(crate) dependencies: SmallVec<[KindId; 4]>,
    pub(crate) phases: PhaseSet,
    pub(crate) manager: RwLock<Box<dyn ErasedManager>>,
    /// Outlives the lock; validity checks never touch `manager`.
    pub(crate) generations: Arc<GenerationTable>,
}

impl ManagerCell {
    #[must_use]
    pub const fn kind(&self) -> KindId {
        self.kind
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn dependencies(&self) -> &[KindId] {
        &self.dependencies
    }

    #[must_use]
    pub const fn phases(&self) -> PhaseSet {
        self.phases
    }

    /// Whether `handle` names a live component of this kind. Lock-free and
    /// callable while the manager is updating.
    #[must_use]
    pub fn is_valid(&self, handle: RawHandle) -> bool {
        self.generations.is_live(handle)
    }

    pub(crate) fn get_mut(&mut self) -> &mut dyn ErasedManager {
        self.manager.get_mut().as_mut()
    }
}

impl std::fmt::Debug for ManagerCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerCell")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("phases", &self.phases)
            .finish_non_exhaustive()
    }
}

/// All managers of a world, in schedule order.
#[derive(Debug, Default)]
pub struct ManagerTable {
    cells: Vec<ManagerCell>,
    by_kind: FxHashMap<KindId, usize>,
}

impl ManagerTable {
    pub(crate) fn push(&mut self, mut cell: ManagerCell) {
        cell.origin = self.cells.len() as u32;
        self.by_kind.insert(cell.kind, self.cells.len());
        self.cells.push(cell);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub fn position(&self, kind: KindId) -> Option<usize> {
        self.by_kind.get(&kind).copied()
    }

    #[must_use]
    pub fn cell(&self, kind: KindId) -> Option<&ManagerCell> {
        self.position(kind).map(|index| &self.cells[index])
    }

    pub(crate) fn cell_mut(&mut self, kind: KindId) -> Result<&mut ManagerCell> {
        let index = self.position(kind).ok_or(Error::UnknownKind(kind))?;
        Ok(&mut self.cells[index])
    }

    #[must_use]
    pub fn at(&self, index: usize) -> &ManagerCell {
        &self.cells[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagerCell> {
        self.cells.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ManagerCell> {
        self.cells.iter_mut()
    }

    /// Shared read access to the concrete manager for `T`.
    #[must_use]
    pub fn read<T: Component>(&self) -> Option<ManagerRef<'_, T>> {
        let cell = self.cell(T::KIND)?;
        RwLockReadGuard::try_map(cell.manager.read(), |manager| {
            manager.as_any().downcast_ref::<ComponentManager<T>>()
        })
        .ok()
    }

    /// Exclusive access without locking.
    pub fn get_mut<T: Component>(&mut self) -> Option<&mut ComponentManager<T>> {
        let index = self.position(T::KIND)?;
        self.cells[index]
            .manager
            .get_mut()
            .as_any_mut()
            .downcast_mut::<ComponentManager<T>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageLayout;

    #[derive(Debug, PartialEq)]
    struct Health(u32);

    impl Component for Health {
        const KIND: KindId = KindId::new(10);
        const NAME: &'static str = "Health";

        fn serialize(&self, writer: &mut dyn Write) -> Result<()> {
            writer.write_all(&self.0.to_le_bytes())?;
            Ok(())
        }

        fn deserialize(_version: u16, reader: &mut dyn Read) -> Result<Self> {
            let mut bytes = [0; 4];
            reader.read_exact(&mut bytes)?;
            Ok(Self(u32::from_le_bytes(bytes)))
        }
    }

    fn setup(layout: StorageLayout) -> (GameObjectStore, ComponentManager<Health>) {
        let objects = GameObjectStore::new(StorageConfig::free_list());
        let manager = ComponentManager::new(StorageConfig {
            layout,
            block_size: 8,
            capacity: 1024,
        });
        (objects, manager)
    }

    #[test]
    fn test_create_attaches_to_owner() {
        let (mut objects, mut manager) = setup(StorageLayout::Compact);
        let owner = objects.create_object(None).unwrap();

        let handle = manager.create(&mut objects, owner, Health(10)).unwrap();

        assert_eq!(manager.get(handle), Some(&Health(10)));
        assert_eq!(manager.owner(handle), Some(owner));
        assert_eq!(objects.components(owner).unwrap(), &[AnyHandle::from(handle)]);
        assert!(handle.is_valid(&manager));
    }

    #[test]
    fn test_create_with_dead_owner() {
        let (mut objects, mut manager) = setup(StorageLayout::Compact);
        let owner = objects.create_object(None).unwrap();
        objects.destroy_object(owner, false).unwrap();

        let err = manager.create(&mut objects, owner, Health(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidOwner(o) if o == owner));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_double_destroy() {
        let (mut objects, mut manager) = setup(StorageLayout::Compact);
        let owner = objects.create_object(None).unwrap();
        let handle = manager.create(&mut objects, owner, Health(5)).unwrap();

        assert_eq!(manager.destroy(&mut objects, handle).unwrap(), Health(5));
        assert!(matches!(
            manager.destroy(&mut objects, handle),
            Err(Error::NotFound(_))
        ));
        assert!(manager.get(handle).is_none());
        assert!(objects.components(owner).unwrap().is_empty());
    }

    #[test]
    fn test_compact_relocation_keeps_handles() {
        let (mut objects, mut manager) = setup(StorageLayout::Compact);
        let owner = objects.create_object(None).unwrap();
        let handles: Vec<_> = (0..20)
            .map(|i| manager.create(&mut objects, owner, Health(i)).unwrap())
            .collect();

        for handle in handles.iter().step_by(3) {
            manager.destroy(&mut objects, *handle).unwrap();
        }

        for (i, handle) in handles.iter().enumerate() {
            if i % 3 == 0 {
                assert!(manager.get(*handle).is_none());
            } else {
                assert_eq!(manager.get(*handle), Some(&Health(i as u32)));
            }
        }
        assert_eq!(manager.len(), 13);
    }

    #[test]
    fn test_reused_slot_rejects_stale_handle() {
        let (mut objects, mut manager) = setup(StorageLayout::FreeList);
        let owner = objects.create_object(None).unwrap();

        let stale = manager.create(&mut objects, owner, Health(1)).unwrap();
        manager.destroy(&mut objects, stale).unwrap();
        let fresh = manager.create(&mut objects, owner, Health(2)).unwrap();

        assert!(!stale.is_valid(&manager));
        assert!(fresh.is_valid(&manager));
        assert!(manager.get(stale).is_none());
        assert_eq!(manager.get(fresh), Some(&Health(2)));
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut objects = GameObjectStore::new(StorageConfig::free_list());
        let mut manager =
            ComponentManager::<Health>::new(StorageConfig::compact().with_capacity(1));
        let owner = objects.create_object(None).unwrap();

        manager.create(&mut objects, owner, Health(1)).unwrap();
        let err = manager.create(&mut objects, owner, Health(2)).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { what: "Health", capacity: 1 }));
        assert_eq!(objects.components(owner).unwrap().len(), 1);
    }

    #[test]
    fn test_decode_checks_version_and_length() {
        let manager = ComponentManager::<Health>::new(StorageConfig::compact());

        let value = manager.decode_erased(1, &7u32.to_le_bytes()).unwrap();
        assert_eq!(*value.downcast::<Health>().unwrap(), Health(7));

        assert!(matches!(
            manager.decode_erased(2, &7u32.to_le_bytes()),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(
            manager.decode_erased(1, &[1, 2]),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(
            manager.decode_erased(1, &[1, 2, 3, 4, 5]),
            Err(Error::Corrupt(_))
        ));
    }
}
