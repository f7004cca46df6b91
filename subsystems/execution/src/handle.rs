//! # Handle Tables
//!
//! Fixed-capacity arenas addressed by generation-stamped ids.
//!
//! Each slot remembers the last id it issued so the next allocation can
//! advance that id's generation. Free slots sit on an index stack; the
//! first allocations hand out slot 0, 1, 2... and a freed slot is the
//! next one reused.

use alloc::vec::Vec;
use core::fmt;

/// An id that names a slot in a [`HandleTable`]
pub trait Handle: Copy + Eq + fmt::Debug {
    /// Table slot encoded in the id
    fn slot(self) -> usize;
}

#[derive(Debug)]
struct Slot<K, T> {
    /// Last id issued for this slot (kept after free)
    id: Option<K>,
    /// Live entity, `None` while the slot is free
    value: Option<T>,
}

/// Generation-checked arena with an explicit free-index stack
#[derive(Debug)]
pub struct HandleTable<K, T> {
    slots: Vec<Slot<K, T>>,
    free: Vec<usize>,
}

impl<K: Handle, T> HandleTable<K, T> {
    /// Create a table with `capacity` free slots
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot { id: None, value: None });
        Self {
            slots,
            free: (0..capacity).rev().collect(),
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Whether no entity is live
    pub fn is_empty(&self) -> bool {
        self.free.len() == self.slots.len()
    }

    /// Whether every slot is taken
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Pop a free slot and fill it.
    ///
    /// `make_id` receives the slot's previous id (if any) and the slot
    /// index; `make_value` receives the new id.
    pub fn alloc(
        &mut self,
        make_id: impl FnOnce(Option<K>, usize) -> K,
        make_value: impl FnOnce(K) -> T,
    ) -> Option<K> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index];
        let id = make_id(slot.id, index);
        debug_assert_eq!(id.slot(), index);
        slot.id = Some(id);
        slot.value = Some(make_value(id));
        Some(id)
    }

    /// Resolve `id` if it names the live generation of its slot
    pub fn get(&self, id: K) -> Option<&T> {
        let slot = self.slots.get(id.slot())?;
        match (&slot.value, slot.id) {
            (Some(value), Some(live)) if live == id => Some(value),
            _ => None,
        }
    }

    /// Mutable variant of [`HandleTable::get`]
    pub fn get_mut(&mut self, id: K) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.slot())?;
        match (&mut slot.value, slot.id) {
            (Some(value), Some(live)) if live == id => Some(value),
            _ => None,
        }
    }

    /// Whether `id` resolves
    pub fn contains(&self, id: K) -> bool {
        self.get(id).is_some()
    }

    /// Return the entity's slot to the free stack
    pub fn free(&mut self, id: K) -> Option<T> {
        let index = id.slot();
        let slot = self.slots.get_mut(index)?;
        if slot.id != Some(id) {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(index);
        Some(value)
    }

    /// Live id occupying `slot`
    pub fn id_at(&self, slot: usize) -> Option<K> {
        let s = self.slots.get(slot)?;
        s.value.as_ref().and(s.id)
    }

    /// Whether `slot` is on the free stack
    pub fn is_free_slot(&self, slot: usize) -> bool {
        self.slots.get(slot).map_or(false, |s| s.value.is_none())
    }

    /// Free slots, most recently freed last
    pub fn free_slots(&self) -> &[usize] {
        &self.free
    }

    /// Live entities in slot order
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.slots.iter().filter_map(|s| match (s.id, &s.value) {
            (Some(id), Some(value)) => Some((id, value)),
            _ => None,
        })
    }

    /// Live ids in slot order
    pub fn ids(&self) -> Vec<K> {
        self.iter().map(|(id, _)| id).collect()
    }
}
