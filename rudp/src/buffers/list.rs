//! Doubly-linked lists threaded through the cells of a [`Slab`]. A list does not own its cells,
//!  it only holds head and tail handles; links live in the cells themselves, so moving an
//!  element between lists or splicing whole lists is O(1) and allocation-free.
//!
//! All operations take the backing slab explicitly. Handles that are stale, not linked, or
//!  (where detectable) belong to a different list are rejected as a no-op.

use crate::buffers::slab::{Slab, SlabHandle};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::mem;

pub struct List<T> {
    head: Option<SlabHandle>,
    tail: Option<SlabHandle>,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        List {
            head: None,
            tail: None,
            len: 0,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for List<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("List")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}

impl<T> List<T> {
    pub fn new() -> List<T> {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn peek(&self) -> Option<SlabHandle> {
        self.head
    }

    pub fn peek_end(&self) -> Option<SlabHandle> {
        self.tail
    }

    /// the element after `handle`, or `None` at the end of the list or if `handle` was removed
    pub fn next(&self, slab: &Slab<T>, handle: SlabHandle) -> Option<SlabHandle> {
        if !slab.is_linked(handle) {
            return None;
        }
        slab.next_of(handle)
    }

    pub fn prev(&self, slab: &Slab<T>, handle: SlabHandle) -> Option<SlabHandle> {
        if !slab.is_linked(handle) {
            return None;
        }
        slab.prev_of(handle)
    }

    fn can_insert(slab: &Slab<T>, handle: SlabHandle) -> bool {
        slab.is_valid(handle) && !slab.is_linked(handle)
    }

    /// append a secured, unlinked cell
    pub fn push(&mut self, slab: &mut Slab<T>, handle: SlabHandle) -> bool {
        match self.tail {
            Some(tail) => self.push_after(slab, tail, handle),
            None => self.push_into_empty(slab, handle),
        }
    }

    pub fn push_front(&mut self, slab: &mut Slab<T>, handle: SlabHandle) -> bool {
        match self.head {
            Some(head) => self.push_before(slab, head, handle),
            None => self.push_into_empty(slab, handle),
        }
    }

    fn push_into_empty(&mut self, slab: &mut Slab<T>, handle: SlabHandle) -> bool {
        if !Self::can_insert(slab, handle) {
            return false;
        }
        slab.set_linked(handle, true);
        self.head = Some(handle);
        self.tail = Some(handle);
        self.len = 1;
        true
    }

    pub fn push_after(&mut self, slab: &mut Slab<T>, anchor: SlabHandle, handle: SlabHandle) -> bool {
        if !slab.is_linked(anchor) || !Self::can_insert(slab, handle) {
            return false;
        }

        let next = slab.next_of(anchor);
        if next.is_none() && self.tail != Some(anchor) {
            // anchor is the tail of some other list
            return false;
        }

        slab.set_linked(handle, true);
        slab.set_prev(handle, Some(anchor));
        slab.set_next(handle, next);
        slab.set_next(anchor, Some(handle));
        match next {
            Some(next) => slab.set_prev(next, Some(handle)),
            None => self.tail = Some(handle),
        }
        self.len += 1;
        true
    }

    pub fn push_before(&mut self, slab: &mut Slab<T>, anchor: SlabHandle, handle: SlabHandle) -> bool {
        if !slab.is_linked(anchor) || !Self::can_insert(slab, handle) {
            return false;
        }

        let prev = slab.prev_of(anchor);
        if prev.is_none() && self.head != Some(anchor) {
            return false;
        }

        slab.set_linked(handle, true);
        slab.set_next(handle, Some(anchor));
        slab.set_prev(handle, prev);
        slab.set_prev(anchor, Some(handle));
        match prev {
            Some(prev) => slab.set_next(prev, Some(handle)),
            None => self.head = Some(handle),
        }
        self.len += 1;
        true
    }

    /// Unlink an element from anywhere in the list. The cell stays secured - freeing it is the
    ///  caller's decision.
    ///
    /// `handle` must be an element of this list. The cells do not record which list they belong
    ///  to, so only a handle at either end of another list is detected (and rejected) in release
    ///  builds; debug builds check membership.
    pub fn remove(&mut self, slab: &mut Slab<T>, handle: SlabHandle) -> bool {
        if self.len == 0 || !slab.is_linked(handle) {
            return false;
        }

        let prev = slab.prev_of(handle);
        let next = slab.next_of(handle);

        if (prev.is_none() && self.head != Some(handle)) || (next.is_none() && self.tail != Some(handle)) {
            return false;
        }
        debug_assert!(self.iter(slab).any(|h| h == handle), "removing {:?} from a list it is not an element of", handle);

        match prev {
            Some(prev) => slab.set_next(prev, next),
            None => self.head = next,
        }
        match next {
            Some(next) => slab.set_prev(next, prev),
            None => self.tail = prev,
        }

        slab.set_linked(handle, false);
        self.len -= 1;
        true
    }

    pub fn pop(&mut self, slab: &mut Slab<T>) -> Option<SlabHandle> {
        let head = self.head?;
        if self.remove(slab, head) {
            Some(head)
        }
        else {
            None
        }
    }

    /// Splice all of `other` onto the end of `self`, leaving `other` empty.
    pub fn inherit_from(&mut self, slab: &mut Slab<T>, other: &mut List<T>) {
        let other = mem::take(other);
        let (Some(other_head), Some(other_tail)) = (other.head, other.tail) else {
            return;
        };

        match self.tail {
            None => {
                self.head = Some(other_head);
            }
            Some(tail) => {
                slab.set_next(tail, Some(other_head));
                slab.set_prev(other_head, Some(tail));
            }
        }
        self.tail = Some(other_tail);
        self.len += other.len;
    }

    /// Unlink and free every element, returning the number of cells released
    pub fn free_all(&mut self, slab: &mut Slab<T>) -> usize {
        let mut num_freed = 0;
        while let Some(handle) = self.pop(slab) {
            if slab.free(handle) {
                num_freed += 1;
            }
        }
        num_freed
    }

    pub fn iter<'a>(&self, slab: &'a Slab<T>) -> ListIter<'a, T> {
        ListIter {
            slab,
            cursor: self.head,
        }
    }
}

pub struct ListIter<'a, T> {
    slab: &'a Slab<T>,
    cursor: Option<SlabHandle>,
}

impl<T> Iterator for ListIter<'_, T> {
    type Item = SlabHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        self.cursor = self.slab.next_of(current);
        Some(current)
    }
}

/// A list that is handed over between threads. It deliberately has no per-element API: a
///  producer builds a batch in a private [`List`] and splices it in, a consumer takes the entire
///  content in one step, so the lock is only ever held for a few pointer updates.
pub struct SharedQueue<T> {
    list: Mutex<List<T>>,
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        SharedQueue {
            list: Mutex::new(List::new()),
        }
    }
}

impl<T> SharedQueue<T> {
    pub fn new() -> SharedQueue<T> {
        Self::default()
    }

    /// NB: the caller holds the slab lock, so lock order is always slab before queue
    pub fn append(&self, slab: &mut Slab<T>, batch: &mut List<T>) {
        self.list.lock().inherit_from(slab, batch);
    }

    pub fn take_all(&self) -> List<T> {
        mem::take(&mut *self.list.lock())
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}
