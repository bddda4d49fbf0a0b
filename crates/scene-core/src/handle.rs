//! Generation-checked handles.
//!
//! Handles are `(index, generation)` pairs that refer to pooled objects and
//! components without exposing storage addresses. A handle is valid only while
//! the generation recorded at its index in the owning store matches its own.

use std::{
    fmt, hash,
    marker::PhantomData,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU16, Ordering},
    },
};

use crate::component::KindId;

/// Generation counter stored per handle slot.
///
/// Odd generations mark occupied slots, even generations mark free ones.
/// Every allocation and every release bumps the counter by one, so a slot
/// is recycled with a fresh odd generation each time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(u16);

impl Generation {
    /// Last generation a slot is handed out with. Releasing it yields the
    /// final free generation, after which the slot is retired.
    pub const LAST_OCCUPIED: Self = Self(u16::MAX - 2);

    /// Create a generation from a raw value.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Get the raw generation value.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// The following generation, or `None` once the counter is exhausted.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Whether this generation marks an occupied slot.
    #[must_use]
    pub const fn is_occupied(self) -> bool {
        self.0 & 1 == 1
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Untyped `(index, generation)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle {
    index: u32,
    generation: Generation,
}

impl RawHandle {
    /// Create a raw handle.
    #[must_use]
    pub const fn new(index: u32, generation: Generation) -> Self {
        Self { index, generation }
    }

    /// Slot index in the owning store.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation the handle was issued with.
    #[must_use]
    pub const fn generation(self) -> Generation {
        self.generation
    }

    /// Pack into 48 significant bits.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation.0 as u64) << 32) | (self.index as u64)
    }

    /// Unpack from [`RawHandle::to_bits`].
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: Generation((bits >> 32) as u16),
        }
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation.0)
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation.0)
    }
}

/// A store that can report the current generation of its slots.
///
/// Implemented by the game object store and by every component manager.
pub trait HandleStore<T> {
    /// Generation currently recorded at `index`, if the slot exists.
    fn generation_at(&self, index: u32) -> Option<Generation>;
}

/// Typed handle to a `T` living in some [`HandleStore<T>`].
///
/// Carries no ownership: copying or dropping a handle never affects the target.
pub struct Handle<T> {
    raw: RawHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Wrap a raw handle.
    #[must_use]
    pub const fn from_raw(raw: RawHandle) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Create a handle from its parts.
    #[must_use]
    pub const fn new(index: u32, generation: Generation) -> Self {
        Self::from_raw(RawHandle::new(index, generation))
    }

    /// The untyped handle.
    #[must_use]
    pub const fn raw(self) -> RawHandle {
        self.raw
    }

    /// Slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.raw.index
    }

    /// Generation the handle was issued with.
    #[must_use]
    pub const fn generation(self) -> Generation {
        self.raw.generation
    }

    /// O(1) validity check against the owning store.
    pub fn is_valid<S: HandleStore<T> + ?Sized>(self, store: &S) -> bool {
        store.generation_at(self.raw.index) == Some(self.raw.generation)
            && self.raw.generation.is_occupied()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T> hash::Hash for Handle<T> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{short}>({:?})", self.raw)
    }
}

/// Component handle with its kind tag, used where the kind is only known at runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnyHandle {
    kind: KindId,
    raw: RawHandle,
}

impl AnyHandle {
    /// Tag a raw handle with a kind.
    #[must_use]
    pub const fn new(kind: KindId, raw: RawHandle) -> Self {
        Self { kind, raw }
    }

    /// The component kind.
    #[must_use]
    pub const fn kind(self) -> KindId {
        self.kind
    }

    /// The untyped handle.
    #[must_use]
    pub const fn raw(self) -> RawHandle {
        self.raw
    }

    /// Recover a typed handle if the kind matches.
    #[must_use]
    pub fn typed<T: crate::Component>(self) -> Option<Handle<T>> {
        (self.kind == T::KIND).then(|| Handle::from_raw(self.raw))
    }
}

impl fmt::Debug for AnyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyHandle({:?}:{:?})", self.kind, self.raw)
    }
}

impl<T: crate::Component> From<Handle<T>> for AnyHandle {
    fn from(handle: Handle<T>) -> Self {
        Self::new(T::KIND, handle.raw)
    }
}

/// Slots in the first bucket of a [`GenerationTable`]; each further bucket
/// doubles.
const FIRST_BUCKET: u64 = 32;
/// Enough doubling buckets to cover every `u32` index.
const BUCKETS: usize = 28;

/// Generations of a handle table, readable without locks.
///
/// Storage grows in doubling buckets that are never moved or freed, so a
/// reader on any thread sees either a slot's current generation or a
/// bucket that does not exist yet. Only the owning [`HandleTable`] writes.
pub struct GenerationTable {
    buckets: [OnceLock<Box<[AtomicU16]>>; BUCKETS],
}

impl GenerationTable {
    fn locate(index: u32) -> (usize, usize) {
        let block = u64::from(index) / FIRST_BUCKET + 1;
        let bucket = 63 - block.leading_zeros() as usize;
        let start = FIRST_BUCKET * ((1 << bucket) - 1);
        (bucket, (u64::from(index) - start) as usize)
    }

    /// Generation recorded at `index`. Slots never handed out read as 0.
    #[must_use]
    pub fn generation_at(&self, index: u32) -> Option<Generation> {
        let (bucket, offset) = Self::locate(index);
        let slot = self.buckets[bucket].get()?.get(offset)?;
        Some(Generation(slot.load(Ordering::Acquire)))
    }

    /// Whether `handle` is the live occupant of its slot.
    #[must_use]
    pub fn is_live(&self, handle: RawHandle) -> bool {
        self.generation_at(handle.index())
            .is_some_and(|generation| generation == handle.generation() && generation.is_occupied())
    }

    fn publish(&self, index: u32, generation: Generation) {
        let (bucket, offset) = Self::locate(index);
        let slots = self.buckets[bucket].get_or_init(|| {
            let len = FIRST_BUCKET << bucket;
            (0..len).map(|_| AtomicU16::new(0)).collect()
        });
        slots[offset].store(generation.0, Ordering::Release);
    }
}

impl Default for GenerationTable {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| OnceLock::new()),
        }
    }
}

impl fmt::Debug for GenerationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocated = self.buckets.iter().filter(|b| b.get().is_some()).count();
        f.debug_struct("GenerationTable")
            .field("buckets", &allocated)
            .finish()
    }
}

impl<T> HandleStore<T> for GenerationTable {
    fn generation_at(&self, index: u32) -> Option<Generation> {
        Self::generation_at(self, index)
    }
}

/// Slot bookkeeping shared by the object store and component managers.
///
/// Maps a handle index to a position in block storage and owns the generation
/// of every slot. Released slots are reused first-in first-out so a freed
/// index stays out of circulation as long as possible. A slot whose generation
/// is exhausted is retired instead of being reused, so generations never repeat.
/// Every generation change is mirrored into a shared [`GenerationTable`].
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    entries: Vec<HandleEntry>,
    free: std::collections::VecDeque<u32>,
    live: usize,
    shared: Arc<GenerationTable>,
}

#[derive(Debug, Clone, Copy)]
struct HandleEntry {
    generation: Generation,
    target: u32,
}

impl HandleTable {
    /// Create an empty table.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Hand out a slot pointing at `target`.
    pub(crate) fn acquire(&mut self, target: u32) -> Option<RawHandle> {
        if let Some(index) = self.free.pop_front() {
            let entry = &mut self.entries[index as usize];
            // Queued slots are below LAST_OCCUPIED, so this cannot fail.
            entry.generation = entry.generation.next()?;
            entry.target = target;
            self.live += 1;
            self.shared.publish(index, entry.generation);
            return Some(RawHandle::new(index, entry.generation));
        }

        let index = u32::try_from(self.entries.len()).ok()?;
        let generation = Generation(1);
        self.entries.push(HandleEntry { generation, target });
        self.live += 1;
        self.shared.publish(index, generation);
        Some(RawHandle::new(index, generation))
    }

    /// Release a live slot. Returns the target it pointed at.
    pub(crate) fn release(&mut self, handle: RawHandle) -> Option<u32> {
        let target = self.resolve(handle)?;
        let entry = &mut self.entries[handle.index() as usize];
        // Occupied generations are odd, so the next one always exists.
        entry.generation = entry.generation.next()?;
        self.live -= 1;
        self.shared.publish(handle.index(), entry.generation);

        if entry.generation < Generation::LAST_OCCUPIED {
            self.free.push_back(handle.index());
        } else {
            tracing::trace!(index = handle.index(), "retiring exhausted handle slot");
        }
        Some(target)
    }

    /// Storage position of a live handle.
    pub(crate) fn resolve(&self, handle: RawHandle) -> Option<u32> {
        let entry = self.entries.get(handle.index() as usize)?;
        (entry.generation == handle.generation() && entry.generation.is_occupied())
            .then_some(entry.target)
    }

    /// Point a live slot at a new storage position.
    pub(crate) fn retarget(&mut self, index: u32, target: u32) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            debug_assert!(entry.generation.is_occupied());
            entry.target = target;
        }
    }

    /// Current generation at `index`.
    pub(crate) fn generation_at(&self, index: u32) -> Option<Generation> {
        self.entries.get(index as usize).map(|e| e.generation)
    }

    /// Live handle currently issued at `index`.
    pub(crate) fn live_at(&self, index: u32) -> Option<RawHandle> {
        let generation = self.generation_at(index)?;
        generation
            .is_occupied()
            .then_some(RawHandle::new(index, generation))
    }

    /// Lock-free view of this table's generations.
    pub(crate) fn shared(&self) -> Arc<GenerationTable> {
        Arc::clone(&self.shared)
    }

    /// Number of live handles.
    pub(crate) const fn live(&self) -> usize {
        self.live
    }

    /// Release every live slot.
    pub(crate) fn clear(&mut self) {
        for index in 0..self.entries.len() as u32 {
            if let Some(handle) = self.live_at(index) {
                self.release(handle);
            }
        }
    }
}
