//! A fixed-capacity arena of reusable cells, the backing store for every dynamic object in the
//!  protocol engine.
//!
//! Cells are handed out as [`SlabHandle`]s - an index plus a generation counter that is bumped
//!  every time a cell is secured. A handle that outlives its cell (i.e. the cell was freed and
//!  possibly secured again) no longer matches the cell's generation, so all operations on it
//!  are rejected instead of touching somebody else's data.
//!
//! Each cell carries `prev` / `next` links in addition to its payload. Free cells are chained
//!  through `next` into the free list, secured cells use both links to be threaded into a
//!  [`List`](crate::buffers::list::List) without any additional allocation.
//!
//! The arena never grows. `secure()` returning `None` is the single source of all 'out of
//!  resources' conditions in the engine.

use crate::safe_converter::{PrecheckedCast, SafeCast};
use parking_lot::{Mutex, MutexGuard};
use std::fmt::{Debug, Formatter};
use tracing::trace;

/// Identifies a secured cell in a [`Slab`]. Handles are plain data and can be copied freely;
///  validity is checked against the slab on every access.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SlabHandle {
    index: u32,
    generation: u32,
}

impl SlabHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    fn slot(&self) -> usize {
        self.index.safe_cast()
    }
}

impl Debug for SlabHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

struct SlabCell<T> {
    value: T,
    prev: Option<u32>,
    next: Option<u32>,
    /// generation 0 is never handed out, so `SlabHandle::default()` is always invalid
    generation: u32,
    active: bool,
    linked: bool,
}

pub struct Slab<T> {
    cells: Vec<SlabCell<T>>,
    free_head: Option<u32>,
    num_secured: usize,
}

impl<T: Default> Slab<T> {
    pub fn with_capacity(capacity: usize) -> Slab<T> {
        assert!(capacity < u32::MAX as usize, "slab capacity must be addressable by a u32 index");

        let mut cells = Vec::with_capacity(capacity);
        for i in 0..capacity {
            cells.push(SlabCell {
                value: T::default(),
                prev: None,
                next: if i + 1 < capacity { Some((i + 1).prechecked_cast()) } else { None },
                generation: 0,
                active: false,
                linked: false,
            });
        }

        Slab {
            cells,
            free_head: if capacity > 0 { Some(0) } else { None },
            num_secured: 0,
        }
    }

    /// Check out a free cell, resetting its payload to the default value. Returns `None` if the
    ///  slab is exhausted - this is a back-pressure signal, not an error.
    pub fn secure(&mut self) -> Option<SlabHandle> {
        let index = self.free_head?;
        let slot: usize = index.safe_cast();
        let cell = &mut self.cells[slot];

        self.free_head = cell.next;

        cell.value = T::default();
        cell.prev = None;
        cell.next = None;
        cell.active = true;
        cell.linked = false;
        cell.generation = cell.generation.wrapping_add(1).max(1);

        self.num_secured += 1;
        Some(SlabHandle { index, generation: cell.generation })
    }
}

impl<T> Slab<T> {
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn num_secured(&self) -> usize {
        self.num_secured
    }

    pub fn num_free(&self) -> usize {
        self.capacity() - self.num_secured
    }

    pub fn is_valid(&self, handle: SlabHandle) -> bool {
        self.cells.get(handle.slot())
            .map(|cell| cell.active && cell.generation == handle.generation)
            .unwrap_or(false)
    }

    /// Return a cell to the free list. Stale or foreign handles are ignored and reported as
    ///  `false`. A cell that is still threaded into a list must be unlinked first.
    pub fn free(&mut self, handle: SlabHandle) -> bool {
        if !self.is_valid(handle) {
            trace!("ignoring free of invalid handle {:?}", handle);
            return false;
        }

        let cell = &mut self.cells[handle.slot()];
        if cell.linked {
            trace!("ignoring free of handle {:?} that is still linked into a list", handle);
            return false;
        }

        cell.active = false;
        cell.prev = None;
        cell.next = self.free_head;
        self.free_head = Some(handle.index);
        self.num_secured -= 1;
        true
    }

    pub fn get(&self, handle: SlabHandle) -> Option<&T> {
        if self.is_valid(handle) {
            Some(&self.cells[handle.slot()].value)
        }
        else {
            None
        }
    }

    pub fn get_mut(&mut self, handle: SlabHandle) -> Option<&mut T> {
        if self.is_valid(handle) {
            Some(&mut self.cells[handle.slot()].value)
        }
        else {
            None
        }
    }

    // --- link plumbing, used by List

    pub(crate) fn is_linked(&self, handle: SlabHandle) -> bool {
        self.is_valid(handle) && self.cells[handle.slot()].linked
    }

    pub(crate) fn set_linked(&mut self, handle: SlabHandle, linked: bool) {
        let cell = &mut self.cells[handle.slot()];
        cell.linked = linked;
        if !linked {
            cell.prev = None;
            cell.next = None;
        }
    }

    pub(crate) fn next_of(&self, handle: SlabHandle) -> Option<SlabHandle> {
        let next = self.cells[handle.slot()].next?;
        self.handle_at(next)
    }

    pub(crate) fn prev_of(&self, handle: SlabHandle) -> Option<SlabHandle> {
        let prev = self.cells[handle.slot()].prev?;
        self.handle_at(prev)
    }

    pub(crate) fn set_next(&mut self, handle: SlabHandle, next: Option<SlabHandle>) {
        self.cells[handle.slot()].next = next.map(|h| h.index);
    }

    pub(crate) fn set_prev(&mut self, handle: SlabHandle, prev: Option<SlabHandle>) {
        self.cells[handle.slot()].prev = prev.map(|h| h.index);
    }

    /// handle for a linked neighbour - `None` if the neighbour is not an active, linked cell
    fn handle_at(&self, index: u32) -> Option<SlabHandle> {
        let slot: usize = index.safe_cast();
        let cell = self.cells.get(slot)?;
        if cell.active && cell.linked {
            Some(SlabHandle { index, generation: cell.generation })
        }
        else {
            None
        }
    }
}

/// A [`Slab`] shared between the application thread and the pump. Single `secure` / `free`
///  calls lock internally; multi-step work (building or walking lists) takes the lock once via
///  [`SlabPool::lock`].
pub struct SlabPool<T> {
    slab: Mutex<Slab<T>>,
}

impl<T: Default> SlabPool<T> {
    pub fn new(capacity: usize) -> SlabPool<T> {
        SlabPool {
            slab: Mutex::new(Slab::with_capacity(capacity)),
        }
    }

    pub fn secure(&self) -> Option<SlabHandle> {
        self.slab.lock().secure()
    }
}

impl<T> SlabPool<T> {
    pub fn free(&self, handle: SlabHandle) -> bool {
        self.slab.lock().free(handle)
    }

    pub fn lock(&self) -> MutexGuard<'_, Slab<T>> {
        self.slab.lock()
    }

    pub fn capacity(&self) -> usize {
        self.slab.lock().capacity()
    }

    pub fn num_secured(&self) -> usize {
        self.slab.lock().num_secured()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::some(7)]
    fn test_secure_until_exhausted(#[case] capacity: usize) {
        let mut slab = Slab::<u32>::with_capacity(capacity);

        let handles = (0..capacity)
            .map(|_| slab.secure().unwrap())
            .collect::<Vec<_>>();

        assert!(slab.secure().is_none());
        assert_eq!(slab.num_secured(), capacity);
        assert_eq!(slab.num_free(), 0);

        for (i, h) in handles.iter().enumerate() {
            for other in &handles[i + 1..] {
                assert_ne!(h.index(), other.index());
            }
        }
    }

    #[test]
    fn test_secure_resets_value() {
        let mut slab = Slab::<u32>::with_capacity(1);
        let h = slab.secure().unwrap();
        *slab.get_mut(h).unwrap() = 99;
        assert!(slab.free(h));

        let h = slab.secure().unwrap();
        assert_eq!(slab.get(h), Some(&0));
    }

    #[test]
    fn test_stale_handle() {
        let mut slab = Slab::<u32>::with_capacity(1);
        let stale = slab.secure().unwrap();
        assert!(slab.free(stale));

        let fresh = slab.secure().unwrap();
        assert_eq!(stale.index(), fresh.index());

        assert!(!slab.is_valid(stale));
        assert!(slab.get(stale).is_none());
        assert!(!slab.free(stale));
        assert!(slab.is_valid(fresh));
        assert_eq!(slab.num_secured(), 1);
    }

    #[rstest]
    #[case::default_handle(SlabHandle::default())]
    #[case::out_of_range(SlabHandle { index: 100, generation: 1 })]
    #[case::wrong_generation(SlabHandle { index: 0, generation: 17 })]
    fn test_foreign_handle(#[case] handle: SlabHandle) {
        let mut slab = Slab::<u32>::with_capacity(2);
        let _ = slab.secure().unwrap();

        assert!(!slab.is_valid(handle));
        assert!(!slab.free(handle));
        assert_eq!(slab.num_secured(), 1);
    }

    #[test]
    fn test_pool() {
        let pool = SlabPool::<u64>::new(2);
        let a = pool.secure().unwrap();
        let _b = pool.secure().unwrap();
        assert!(pool.secure().is_none());
        assert_eq!(pool.num_secured(), 2);

        assert!(pool.free(a));
        assert!(!pool.free(a));
        assert_eq!(pool.num_secured(), 1);
        assert!(pool.secure().is_some());
        assert_eq!(pool.capacity(), 2);
    }

    proptest! {
        #[test]
        fn prop_pool_conservation(ops in proptest::collection::vec(any::<(bool, usize)>(), 0..200)) {
            const CAPACITY: usize = 16;
            let mut slab = Slab::<u8>::with_capacity(CAPACITY);
            let mut held: Vec<SlabHandle> = Vec::new();
            let mut freed: Vec<SlabHandle> = Vec::new();

            for (do_secure, idx) in ops {
                if do_secure {
                    match slab.secure() {
                        Some(h) => held.push(h),
                        None => prop_assert_eq!(held.len(), CAPACITY),
                    }
                }
                else if !held.is_empty() {
                    let h = held.swap_remove(idx % held.len());
                    prop_assert!(slab.free(h));
                    freed.push(h);
                }

                prop_assert!(slab.num_secured() <= CAPACITY);
                prop_assert_eq!(slab.num_secured(), held.len());
                for h in &freed {
                    prop_assert!(!slab.is_valid(*h));
                }
            }

            // every freed cell is securable again
            while slab.secure().is_some() {}
            prop_assert_eq!(slab.num_secured(), CAPACITY);
        }
    }
}
