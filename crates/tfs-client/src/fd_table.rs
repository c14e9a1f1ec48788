//! File descriptor table
//!
//! An arena of slots with a free list. Each slot carries a generation that
//! is bumped when the slot is freed, and the handle handed to callers encodes
//! both, so a handle to a closed file never reaches the file that later
//! reuses its slot.

use derive_more::Display;
use parking_lot::RwLock;
use std::sync::Arc;

use tfs_common::{Error, Result};

const SLOT_BITS: u32 = 16;
const SLOT_MASK: i32 = (1 << SLOT_BITS) - 1;
const MAX_GENERATION: u16 = 0x7FFF;

/// Largest number of simultaneously open descriptors a table can hold
pub const MAX_SLOTS: usize = SLOT_MASK as usize - 1;

/// Opaque positive file handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{_0}")]
pub struct Fd(i32);

impl Fd {
    fn new(slot: usize, generation: u16) -> Self {
        // slot + 1 keeps handle 0 unused
        Self((i32::from(generation) << SLOT_BITS) | (slot as i32 + 1))
    }

    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    fn slot(self) -> Option<usize> {
        let low = self.0 & SLOT_MASK;
        if self.0 <= 0 || low == 0 {
            return None;
        }
        Some((low - 1) as usize)
    }

    fn generation(self) -> u16 {
        (self.0 >> SLOT_BITS) as u16
    }
}

enum SlotState<T> {
    Free,
    /// Allocated, value not stored yet
    Reserved,
    Live(Arc<T>),
}

struct Slot<T> {
    generation: u16,
    state: SlotState<T>,
}

impl<T> Slot<T> {
    fn is_free(&self) -> bool {
        matches!(self.state, SlotState::Free)
    }

    fn release(&mut self) -> SlotState<T> {
        self.generation = if self.generation >= MAX_GENERATION {
            1
        } else {
            self.generation + 1
        };
        std::mem::replace(&mut self.state, SlotState::Free)
    }
}

struct TableState<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

/// Process-wide table of open files
pub struct FdTable<T> {
    state: RwLock<TableState<T>>,
    max_open: usize,
}

impl<T> FdTable<T> {
    pub fn new(max_open: usize) -> Self {
        Self {
            state: RwLock::new(TableState {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            max_open: max_open.clamp(1, MAX_SLOTS),
        }
    }

    /// Claim a slot whose value arrives later through [`FdTable::fill`].
    /// Until then the handle is counted as open but `get` rejects it.
    pub fn reserve(&self) -> Result<Fd> {
        let mut state = self.state.write();
        if state.live >= self.max_open {
            return Err(Error::TableExhausted { max: self.max_open });
        }

        let slot = match state.free.pop() {
            Some(slot) => slot,
            None => {
                state.slots.push(Slot {
                    generation: 1,
                    state: SlotState::Free,
                });
                state.slots.len() - 1
            }
        };
        let entry = &mut state.slots[slot];
        entry.state = SlotState::Reserved;
        let fd = Fd::new(slot, entry.generation);
        state.live += 1;
        Ok(fd)
    }

    /// Store the value of a reserved handle. Hands the value back if the
    /// reservation is gone.
    pub fn fill(&self, fd: Fd, value: T) -> std::result::Result<(), T> {
        let mut state = self.state.write();
        let entry = fd
            .slot()
            .and_then(|slot| state.slots.get_mut(slot))
            .filter(|entry| {
                entry.generation == fd.generation() && matches!(entry.state, SlotState::Reserved)
            });
        match entry {
            Some(entry) => {
                entry.state = SlotState::Live(Arc::new(value));
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Store `value` and return its handle
    pub fn insert(&self, value: T) -> Result<Fd> {
        let fd = self.reserve()?;
        self.fill(fd, value)
            .map_err(|_| Error::internal("reserved descriptor slot vanished"))?;
        Ok(fd)
    }

    /// Look up a live handle
    pub fn get(&self, fd: Fd) -> Result<Arc<T>> {
        let state = self.state.read();
        fd.slot()
            .and_then(|slot| state.slots.get(slot))
            .filter(|entry| entry.generation == fd.generation())
            .and_then(|entry| match &entry.state {
                SlotState::Live(value) => Some(Arc::clone(value)),
                _ => None,
            })
            .ok_or(Error::InvalidFd(fd.raw()))
    }

    /// Remove a handle; it is invalid from now on. Returns the value, or
    /// `None` for a handle that was only reserved.
    pub fn remove(&self, fd: Fd) -> Result<Option<Arc<T>>> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let slot = fd.slot().ok_or(Error::InvalidFd(fd.raw()))?;
        let entry = state
            .slots
            .get_mut(slot)
            .filter(|entry| entry.generation == fd.generation() && !entry.is_free())
            .ok_or(Error::InvalidFd(fd.raw()))?;

        let value = match entry.release() {
            SlotState::Live(value) => Some(value),
            _ => None,
        };
        state.free.push(slot);
        state.live -= 1;
        Ok(value)
    }

    /// Remove every handle, returning the live values
    pub fn drain(&self) -> Vec<Arc<T>> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut drained = Vec::with_capacity(state.live);
        for (slot, entry) in state.slots.iter_mut().enumerate() {
            if entry.is_free() {
                continue;
            }
            if let SlotState::Live(value) = entry.release() {
                drained.push(value);
            }
            state.free.push(slot);
        }
        state.live = 0;
        drained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let table = FdTable::new(16);
        let fd = table.insert("a").unwrap();
        assert!(fd.raw() > 0);
        assert_eq!(*table.get(fd).unwrap(), "a");
        assert_eq!(table.len(), 1);

        assert_eq!(*table.remove(fd).unwrap().unwrap(), "a");
        assert!(matches!(table.get(fd), Err(Error::InvalidFd(_))));
        // Double close
        assert!(matches!(table.remove(fd), Err(Error::InvalidFd(_))));
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let table = FdTable::new(16);
        let first = table.insert(1).unwrap();
        table.remove(first).unwrap();

        let second = table.insert(2).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.slot(), second.slot());
        assert!(table.get(first).is_err());
        assert!(table.remove(first).is_err());
        assert_eq!(*table.get(second).unwrap(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let table = FdTable::new(2);
        table.insert(()).unwrap();
        table.insert(()).unwrap();
        assert!(matches!(
            table.insert(()),
            Err(Error::TableExhausted { max: 2 })
        ));
    }

    #[test]
    fn test_reserved_slot() {
        let table = FdTable::new(1);
        let fd = table.reserve().unwrap();
        assert!(table.get(fd).is_err());
        assert!(table.insert(0).is_err());

        table.fill(fd, 5).unwrap();
        assert!(table.fill(fd, 6).is_err());
        assert_eq!(*table.get(fd).unwrap(), 5);

        let other = FdTable::<u8>::new(1);
        let fd = other.reserve().unwrap();
        assert!(other.remove(fd).unwrap().is_none());
        assert!(other.is_empty());
    }

    #[test]
    fn test_garbage_handles() {
        let table: FdTable<()> = FdTable::new(4);
        for raw in [0, -1, -1005, 1, 0x10000, i32::MAX] {
            assert!(table.get(Fd::from_raw(raw)).is_err(), "{raw}");
        }
    }

    #[test]
    fn test_drain() {
        let table = FdTable::new(4);
        let a = table.insert('a').unwrap();
        table.insert('b').unwrap();
        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
        assert!(table.get(a).is_err());
    }
}
