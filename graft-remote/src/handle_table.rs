//! Handle table
//!
//! Maps integer handles to live values held on behalf of the master. Slots
//! of released handles are tombstoned and reused smallest-first, so the
//! table stays as small as the peak number of live handles.

use std::collections::BTreeSet;

use graft_core::Handle;

use crate::error::HandleError;

#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    free: BTreeSet<usize>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
        }
    }

    /// Store `value`, reusing the lowest released slot if there is one
    pub fn allocate(&mut self, value: T) -> Handle {
        match self.free.pop_first() {
            Some(index) => {
                self.slots[index] = Some(value);
                Handle::from(index)
            }
            None => {
                self.slots.push(Some(value));
                Handle::from(self.slots.len() - 1)
            }
        }
    }

    pub fn resolve(&self, handle: Handle) -> Result<&T, HandleError> {
        match self.slots.get(handle.index()) {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(HandleError::Released(handle)),
            None => Err(HandleError::Unknown(handle)),
        }
    }

    /// Release a handle and return its value. Releasing twice is an error
    /// and leaves the table untouched.
    pub fn release(&mut self, handle: Handle) -> Result<T, HandleError> {
        let index = handle.index();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(HandleError::Unknown(handle))?;
        let value = slot.take().ok_or(HandleError::Released(handle))?;
        self.free.insert(index);
        Ok(value)
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots ever allocated, live or not
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (Handle::from(index), value)))
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_appends() {
        let mut table = HandleTable::new();
        assert_eq!(table.allocate("a"), Handle(0));
        assert_eq!(table.allocate("b"), Handle(1));
        assert_eq!(table.resolve(Handle(1)), Ok(&"b"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_release_then_reuse() {
        let mut table = HandleTable::new();
        let first = table.allocate("old");
        table.allocate("keep");
        assert_eq!(table.release(first), Ok("old"));
        assert_eq!(table.resolve(first), Err(HandleError::Released(first)));

        let again = table.allocate("new");
        assert_eq!(again, first);
        assert_eq!(table.resolve(again), Ok(&"new"));
        assert_eq!(table.capacity(), 2);
    }

    #[test]
    fn test_smallest_free_slot_first() {
        let mut table = HandleTable::new();
        let handles: Vec<_> = (0..4).map(|i| table.allocate(i)).collect();
        table.release(handles[3]).unwrap();
        table.release(handles[1]).unwrap();
        table.release(handles[2]).unwrap();
        assert_eq!(table.allocate(10), Handle(1));
        assert_eq!(table.allocate(11), Handle(2));
        assert_eq!(table.allocate(12), Handle(3));
        assert_eq!(table.allocate(13), Handle(4));
    }

    #[test]
    fn test_double_release_does_not_duplicate_free_slots() {
        let mut table = HandleTable::new();
        let h = table.allocate(1);
        table.allocate(2);
        table.release(h).unwrap();
        assert_eq!(table.release(h), Err(HandleError::Released(h)));

        let a = table.allocate(3);
        let b = table.allocate(4);
        assert_ne!(a, b);
        assert_eq!(a, h);
        assert_eq!(b, Handle(2));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_unknown_handle() {
        let mut table: HandleTable<u8> = HandleTable::new();
        assert_eq!(table.resolve(Handle(5)), Err(HandleError::Unknown(Handle(5))));
        assert_eq!(table.release(Handle(5)), Err(HandleError::Unknown(Handle(5))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_iter_skips_tombstones() {
        let mut table = HandleTable::new();
        let a = table.allocate('a');
        let b = table.allocate('b');
        table.release(a).unwrap();
        let live: Vec<_> = table.iter().collect();
        assert_eq!(live, vec![(b, &'b')]);
    }
}
