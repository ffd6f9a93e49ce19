//! Generation-checked handle arena with explicit ownership counts
//!
//! Snapshots and packed entities are shared by many holders (consumers,
//! explicit snapshot lists, demo writers, later snapshots reusing a packet).
//! Each record lives in one arena slot addressed by a small `Handle`; the
//! generation stored in the handle detects use of a freed slot, and the
//! ownership count decides when the record is dropped.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Generation counter to detect stale handles.
/// Incremented each time a slot is recycled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(u32);

impl Generation {
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Typed handle into a `HandleArena<T>`.
///
/// The type parameter only tags which arena the handle belongs to, so a
/// snapshot handle can never be passed where a packed-entity handle is expected.
pub struct Handle<T> {
    index: u32,
    generation: Generation,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: Generation) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> Generation {
        self.generation
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
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation.0)
    }
}

/// Arena errors. Both are programming-contract violations at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("stale or unknown handle (slot {index}, {generation:?})")]
    StaleHandle { index: u32, generation: Generation },
    #[error("ownership count overflow on slot {0}")]
    CountOverflow(u32),
}

struct Slot<T> {
    generation: Generation,
    refs: u32,
    value: Option<T>,
}

/// Slot arena whose records carry an ownership count.
///
/// Not internally synchronized: owners wrap it in a lock.
pub struct HandleArena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    live: usize,
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleArena<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::with_capacity(capacity / 4),
            live: 0,
        }
    }

    /// Store a value with ownership count 1.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.insert_with(|_| value)
    }

    /// Like `insert`, for values that need to know their own handle.
    pub fn insert_with(&mut self, make: impl FnOnce(Handle<T>) -> T) -> Handle<T> {
        self.live += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            let handle = Handle::new(index, slot.generation);
            slot.refs = 1;
            slot.value = Some(make(handle));
            handle
        } else {
            let index = self.slots.len() as u32;
            let handle = Handle::new(index, Generation::new());
            self.slots.push(Slot {
                generation: Generation::new(),
                refs: 1,
                value: Some(make(handle)),
            });
            handle
        }
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    fn slot_mut(&mut self, handle: Handle<T>) -> Result<&mut Slot<T>, ArenaError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
            .ok_or(ArenaError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            })
    }

    #[must_use]
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slot(handle).and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slot_mut(handle).ok().and_then(|slot| slot.value.as_mut())
    }

    #[must_use]
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    #[must_use]
    pub fn ref_count(&self, handle: Handle<T>) -> Option<u32> {
        self.slot(handle).map(|slot| slot.refs)
    }

    /// Add one owner. Returns the new count.
    pub fn add_ref(&mut self, handle: Handle<T>) -> Result<u32, ArenaError> {
        let slot = self.slot_mut(handle)?;
        slot.refs = slot
            .refs
            .checked_add(1)
            .ok_or(ArenaError::CountOverflow(handle.index))?;
        Ok(slot.refs)
    }

    /// Drop one owner. Returns the value once the last owner is gone.
    pub fn release(&mut self, handle: Handle<T>) -> Result<Option<T>, ArenaError> {
        let slot = self.slot_mut(handle)?;
        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(None);
        }

        let value = slot.value.take();
        slot.generation = slot.generation.next();
        self.free_list.push(handle.index);
        self.live -= 1;
        Ok(value)
    }

    /// Number of live records.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate live records with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_starts_with_one_owner() {
        let mut arena = HandleArena::new();
        let h = arena.insert("a");
        assert_eq!(arena.ref_count(h), Some(1));
        assert_eq!(arena.get(h), Some(&"a"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_release_frees_at_zero() {
        let mut arena = HandleArena::new();
        let h = arena.insert(7u32);
        assert_eq!(arena.add_ref(h), Ok(2));

        assert_eq!(arena.release(h), Ok(None));
        assert!(arena.contains(h));
        assert_eq!(arena.release(h), Ok(Some(7)));
        assert!(!arena.contains(h));
        assert!(arena.is_empty());
    }

    #[test]
    fn test_recycled_slot_rejects_stale_handle() {
        let mut arena = HandleArena::new();
        let old = arena.insert(1u32);
        arena.release(old).unwrap();

        let new = arena.insert(2u32);
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        assert_eq!(arena.get(old), None);
        assert!(matches!(arena.release(old), Err(ArenaError::StaleHandle { .. })));
        assert!(matches!(arena.add_ref(old), Err(ArenaError::StaleHandle { .. })));
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn test_release_after_free_is_an_error() {
        let mut arena = HandleArena::new();
        let h = arena.insert(());
        arena.release(h).unwrap();
        assert!(arena.release(h).is_err());
    }

    #[test]
    fn test_insert_with_sees_own_handle() {
        let mut arena: HandleArena<(u32, u32)> = HandleArena::new();
        let first = arena.insert_with(|h| (h.index(), h.generation().get()));
        arena.release(first).unwrap();
        let second = arena.insert_with(|h| (h.index(), h.generation().get()));
        assert_eq!(arena.get(second), Some(&(0, 1)));
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut arena = HandleArena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let _c = arena.insert(3);
        arena.release(b).unwrap();

        let values: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1, 3]);
        assert_eq!(arena.iter().next().map(|(h, _)| h), Some(a));
    }
}
