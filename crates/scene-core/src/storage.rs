//! Block storage - pooled slots for one concrete kind.
//!
//! Storage grows one fixed-size block at a time. Growing never moves an
//! existing element, so a slot index stays meaningful until the element at
//! it is freed (or, for compact layout, relocated by a later free).

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    handle::{Generation, RawHandle},
};

/// How freed slots are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageLayout {
    /// Keep occupied slots contiguous from index 0. Freeing moves the last
    /// element into the hole, so iteration order changes across frees.
    #[default]
    Compact,
    /// Leave holes behind and reuse them on later allocations. Indices of
    /// live elements never change.
    FreeList,
}

/// Sizing for a [`BlockStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConfig {
    pub layout: StorageLayout,
    /// Slots per block.
    pub block_size: usize,
    /// Hard ceiling on live elements.
    pub capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            layout: StorageLayout::Compact,
            block_size: 64,
            capacity: u32::MAX as usize,
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn compact() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn free_list() -> Self {
        Self {
            layout: StorageLayout::FreeList,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Element moved by a compact free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Index the element used to live at.
    pub from: u32,
    /// Index the element lives at now.
    pub to: u32,
}

/// Result of [`BlockStorage::free`].
#[derive(Debug)]
pub struct Freed<T> {
    /// The removed element.
    pub value: T,
    /// Set when another element was moved into the freed slot.
    pub relocated: Option<Relocation>,
}

/// Block-allocated pool of `T`.
pub struct BlockStorage<T> {
    blocks: Vec<Box<[Option<T>]>>,
    config: StorageConfig,
    /// Compact: number of occupied slots. FreeList: high-water mark.
    end: u32,
    /// FreeList holes, most recently freed last.
    free: Vec<u32>,
    live: usize,
}

impl<T> BlockStorage<T> {
    /// Create empty storage. No block is allocated until the first insert.
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        Self {
            blocks: Vec::new(),
            config: StorageConfig {
                block_size: config.block_size.max(1),
                ..config
            },
            end: 0,
            free: Vec::new(),
            live: 0,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[must_use]
    pub const fn layout(&self) -> StorageLayout {
        self.config.layout
    }

    /// Number of live elements.
    #[must_use]
    pub const fn live_count(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Whether the capacity ceiling has been reached.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.live >= self.config.capacity
    }

    /// Number of allocated blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Index one past the highest slot that may be occupied.
    #[must_use]
    pub const fn slot_end(&self) -> u32 {
        self.end
    }

    fn locate(&self, index: u32) -> (usize, usize) {
        let index = index as usize;
        (index / self.config.block_size, index % self.config.block_size)
    }

    fn slot(&self, index: u32) -> Option<&Option<T>> {
        let (block, offset) = self.locate(index);
        self.blocks.get(block).map(|b| &b[offset])
    }

    fn slot_mut(&mut self, index: u32) -> Option<&mut Option<T>> {
        let (block, offset) = self.locate(index);
        self.blocks.get_mut(block).map(|b| &mut b[offset])
    }

    fn grow(&mut self) {
        let block: Box<[Option<T>]> = (0..self.config.block_size).map(|_| None).collect();
        self.blocks.push(block);
        tracing::trace!(blocks = self.blocks.len(), "storage grew by one block");
    }

    /// Store `value` and return its slot index.
    pub fn allocate(&mut self, value: T) -> Result<u32> {
        if self.is_full() {
            return Err(Error::CapacityExceeded {
                what: "block storage",
                capacity: self.config.capacity,
            });
        }

        let index = match self.config.layout {
            StorageLayout::FreeList => match self.free.pop() {
                Some(hole) => hole,
                None => self.bump()?,
            },
            StorageLayout::Compact => self.bump()?,
        };

        let (block, offset) = self.locate(index);
        if block == self.blocks.len() {
            self.grow();
        }
        self.blocks[block][offset] = Some(value);
        self.live += 1;
        Ok(index)
    }

    fn bump(&mut self) -> Result<u32> {
        let index = self.end;
        self.end = self.end.checked_add(1).ok_or(Error::CapacityExceeded {
            what: "block storage",
            capacity: u32::MAX as usize,
        })?;
        Ok(index)
    }

    /// Remove the element at `index`.
    pub fn free(&mut self, index: u32) -> Result<Freed<T>> {
        let not_found = || Error::NotFound(RawHandle::new(index, Generation::default()));

        if index >= self.end {
            return Err(not_found());
        }
        let value = self
            .slot_mut(index)
            .and_then(Option::take)
            .ok_or_else(not_found)?;
        self.live -= 1;

        let relocated = match self.config.layout {
            StorageLayout::FreeList => {
                self.free.push(index);
                None
            }
            StorageLayout::Compact => {
                self.end -= 1;
                let last = self.end;
                if last == index {
                    None
                } else {
                    let moved = self.slot_mut(last).and_then(Option::take);
                    if let Some(slot) = self.slot_mut(index) {
                        *slot = moved;
                    }
                    Some(Relocation {
                        from: last,
                        to: index,
                    })
                }
            }
        };

        Ok(Freed { value, relocated })
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<&T> {
        if index >= self.end {
            return None;
        }
        self.slot(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        if index >= self.end {
            return None;
        }
        self.slot_mut(index).and_then(Option::as_mut)
    }

    #[must_use]
    pub fn contains(&self, index: u32) -> bool {
        self.get(index).is_some()
    }

    /// Iterate live elements with their indices, skipping holes.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.blocks
            .iter()
            .flat_map(|block| block.iter())
            .take(self.end as usize)
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index as u32, value)))
    }

    /// Mutable variant of [`BlockStorage::iter`].
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> + '_ {
        let end = self.end as usize;
        self.blocks
            .iter_mut()
            .flat_map(|block| block.iter_mut())
            .take(end)
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|value| (index as u32, value)))
    }

    /// Drop every element. Blocks stay allocated.
    pub fn clear(&mut self) {
        for block in &mut self.blocks {
            for slot in block.iter_mut() {
                *slot = None;
            }
        }
        self.end = 0;
        self.free.clear();
        self.live = 0;
    }
}

impl<T> std::fmt::Debug for BlockStorage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStorage")
            .field("layout", &self.config.layout)
            .field("live", &self.live)
            .field("blocks", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_stays_dense() {
        let mut storage = BlockStorage::new(StorageConfig::compact().with_block_size(16));

        for i in 0..1000u32 {
            assert_eq!(storage.allocate(i).unwrap(), i);
        }

        // Track where each original value lives as frees relocate elements.
        let mut position: Vec<u32> = (0..1000).collect();
        let mut at: Vec<u32> = (0..1000).collect();
        for value in 0..500u32 {
            let index = position[value as usize];
            let freed = storage.free(index).unwrap();
            assert_eq!(freed.value, value);
            if let Some(moved) = freed.relocated {
                let moved_value = at[moved.from as usize];
                position[moved_value as usize] = moved.to;
                at[moved.to as usize] = moved_value;
            }
        }

        assert_eq!(storage.live_count(), 500);
        for (index, value) in storage.iter() {
            assert!(index < 500);
            assert!(*value >= 500);
            assert_eq!(position[*value as usize], index);
        }
        assert_eq!(storage.iter().count(), 500);
    }

    #[test]
    fn test_compact_relocation_report() {
        let mut storage = BlockStorage::new(StorageConfig::compact());
        storage.allocate('a').unwrap();
        storage.allocate('b').unwrap();
        storage.allocate('c').unwrap();

        let freed = storage.free(0).unwrap();
        assert_eq!(freed.value, 'a');
        assert_eq!(freed.relocated, Some(Relocation { from: 2, to: 0 }));
        assert_eq!(storage.get(0), Some(&'c'));

        let freed = storage.free(1).unwrap();
        assert_eq!(freed.relocated, None);
        assert_eq!(storage.live_count(), 1);
    }

    #[test]
    fn test_free_list_keeps_indices() {
        let mut storage = BlockStorage::new(StorageConfig::free_list().with_block_size(4));
        let indices: Vec<u32> = (0..10).map(|i| storage.allocate(i).unwrap()).collect();

        let freed = storage.free(indices[3]).unwrap();
        assert!(freed.relocated.is_none());
        assert_eq!(storage.get(3), None);
        assert_eq!(storage.get(9), Some(&9));
        assert_eq!(storage.iter().count(), 9);

        // Hole is reused before growing.
        assert_eq!(storage.allocate(42).unwrap(), 3);
        assert_eq!(storage.block_count(), 3);
    }

    #[test]
    fn test_double_free_is_not_found() {
        let mut storage = BlockStorage::new(StorageConfig::free_list());
        let index = storage.allocate(1).unwrap();
        storage.free(index).unwrap();
        assert!(matches!(storage.free(index), Err(Error::NotFound(_))));
        assert!(matches!(storage.free(100), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_capacity_ceiling() {
        let mut storage = BlockStorage::new(StorageConfig::compact().with_capacity(2));
        storage.allocate(()).unwrap();
        storage.allocate(()).unwrap();
        assert!(matches!(
            storage.allocate(()),
            Err(Error::CapacityExceeded { capacity: 2, .. })
        ));

        storage.free(0).unwrap();
        storage.allocate(()).unwrap();
    }

    #[test]
    fn test_growth_keeps_addresses() {
        let mut storage = BlockStorage::new(StorageConfig::free_list().with_block_size(2));
        let first = storage.allocate(String::from("first")).unwrap();
        let before = std::ptr::from_ref(storage.get(first).unwrap());
        for i in 0..20 {
            storage.allocate(i.to_string()).unwrap();
        }
        let after = std::ptr::from_ref(storage.get(first).unwrap());
        assert_eq!(before, after);
    }
}
