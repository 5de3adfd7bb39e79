//! Slab allocator (C1): O(1) allocation of fixed-size nodes, reused across a
//! batch's lifetime instead of going through the global allocator per node.
//!
//! Grounded in `allocator.c`'s free-list-over-chunks design. The original
//! threads an intrusive "next" pointer and a chunk-head flag through the raw
//! bytes of each object; Rust's ownership model makes that unsafe and
//! unnecessary, so the redesign keeps the *behavior* (bump a chunk at a
//! time, free list of indices, `reset` requires everything returned) while
//! representing storage as a `Vec<Option<T>>` slab and the free list as a
//! `Vec<usize>` of slot indices — no raw pointers, no unsafe.

use crate::errors::LoaderError;

/// Target chunk size in objects, chosen to mirror the original's "~90% of a
/// page" chunking without depending on the platform page size for a pool of
/// plain Rust values.
const DEFAULT_CHUNK_OBJECTS: usize = 64;

/// A fixed-size object pool with chunked growth and free-list reuse.
pub struct SlabAllocator<T> {
    chunk_objects: usize,
    slots: Vec<Option<T>>,
    free_list: Vec<usize>,
    outstanding: usize,
}

impl<T> SlabAllocator<T> {
    /// `init(object_size, prealloc_count)` — `object_size` is implicit in
    /// `T`; `prealloc_count` seeds the first chunk(s).
    pub fn new(prealloc_count: usize) -> Self {
        let mut allocator = SlabAllocator {
            chunk_objects: DEFAULT_CHUNK_OBJECTS,
            slots: Vec::new(),
            free_list: Vec::new(),
            outstanding: 0,
        };
        let chunks_needed = prealloc_count.div_ceil(allocator.chunk_objects.max(1)).max(1);
        for _ in 0..chunks_needed {
            allocator.grow_chunk();
        }
        allocator
    }

    fn grow_chunk(&mut self) {
        let start = self.slots.len();
        for _ in 0..self.chunk_objects {
            self.slots.push(None);
        }
        // Free list is filled back-to-front so `take` draws low indices
        // first, matching the original's "take from head of free list"
        // behavior for a freshly grown chunk.
        for i in (start..self.slots.len()).rev() {
            self.free_list.push(i);
        }
    }

    /// `take() -> object` — draws from the free list, growing by one chunk
    /// when exhausted.
    pub fn take(&mut self, value: T) -> usize {
        if self.free_list.is_empty() {
            self.grow_chunk();
        }
        let slot = self.free_list.pop().expect("grow_chunk just replenished the free list");
        self.slots[slot] = Some(value);
        self.outstanding += 1;
        slot
    }

    /// `return(object)` — prepends the slot back onto the free list.
    pub fn give_back(&mut self, slot: usize) -> Option<T> {
        let value = self.slots.get_mut(slot).and_then(Option::take);
        if value.is_some() {
            self.free_list.push(slot);
            self.outstanding -= 1;
        }
        value
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// `reset()` — releases all chunks. Fails loudly if objects are still
    /// outstanding, exactly as the original's invariant requires.
    pub fn reset(&mut self) -> Result<(), LoaderError> {
        if self.outstanding != 0 {
            return Err(LoaderError::Internal(format!(
                "allocator reset with {} outstanding objects",
                self.outstanding
            )));
        }
        self.slots.clear();
        self.free_list.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_return_preserves_free_list_size() {
        let mut pool: SlabAllocator<u32> = SlabAllocator::new(4);
        let free_before = pool.free_list.len();
        let a = pool.take(1);
        let b = pool.take(2);
        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.free_list.len(), free_before);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn grows_by_chunk_when_exhausted() {
        let mut pool: SlabAllocator<u32> = SlabAllocator::new(1);
        let initial_len = pool.slots.len();
        let mut taken = Vec::new();
        for i in 0..initial_len + 1 {
            taken.push(pool.take(i as u32));
        }
        assert!(pool.slots.len() > initial_len);
    }

    #[test]
    fn reset_fails_loudly_with_outstanding_objects() {
        let mut pool: SlabAllocator<u32> = SlabAllocator::new(2);
        let _slot = pool.take(7);
        assert!(pool.reset().is_err());
    }

    #[test]
    fn reset_succeeds_once_everything_is_returned() {
        let mut pool: SlabAllocator<u32> = SlabAllocator::new(2);
        let a = pool.take(1);
        let b = pool.take(2);
        pool.give_back(a);
        pool.give_back(b);
        assert!(pool.reset().is_ok());
    }
}
