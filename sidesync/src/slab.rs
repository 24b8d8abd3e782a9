//! Growable generational slab backing the producer registry and the
//! pending-completion set.
//!
//! Keys carry the generation of the slot they were issued for, so a key that
//! outlives its entry is rejected instead of aliasing whatever reuses the slot.

use core::fmt;
use core::marker::PhantomData;

use crate::error::Error;

/// Generational key into a [`Slab<T>`].
// Manual Copy/Clone/Eq: derives would require the same bounds on T.
pub struct Key<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    #[inline]
    const fn slot(self) -> usize {
        self.index as usize
    }
}

impl<T> Copy for Key<T> {}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Key<T> {}

impl<T> core::hash::Hash for Key<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

enum Entry<T> {
    Occupied { value: T, generation: u32 },
    Free { next: Option<u32>, generation: u32 },
}

/// Slab with an intrusive free list; grows on demand.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of occupied entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Stores `value`, reusing a free slot when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the backing vector cannot grow or
    /// the slot index space is exhausted.
    pub fn insert(&mut self, value: T) -> Result<Key<T>, Error> {
        self.try_insert(value).map_err(|_| Error::OutOfMemory)
    }

    /// Like [`insert`](Self::insert), but hands `value` back on failure so
    /// the caller can still finalize it.
    ///
    /// # Errors
    ///
    /// Returns `value` if no slot could be allocated.
    pub fn try_insert(&mut self, value: T) -> Result<Key<T>, T> {
        if let Some(head) = self.free_head {
            let generation = match &self.entries[head as usize] {
                Entry::Free { next, generation } => {
                    self.free_head = *next;
                    *generation
                }
                Entry::Occupied { .. } => unreachable!("free_head must point to a free slot"),
            };
            self.entries[head as usize] = Entry::Occupied { value, generation };
            self.len += 1;
            return Ok(Key::new(head, generation));
        }

        let Ok(index) = u32::try_from(self.entries.len()) else {
            return Err(value);
        };
        if self.entries.try_reserve(1).is_err() {
            return Err(value);
        }
        self.entries.push(Entry::Occupied {
            value,
            generation: 0,
        });
        self.len += 1;
        Ok(Key::new(index, 0))
    }

    /// Removes and returns the entry for `key`; `None` if the key is stale.
    pub fn remove(&mut self, key: Key<T>) -> Option<T> {
        match self.entries.get(key.slot()) {
            Some(Entry::Occupied { generation, .. }) if *generation == key.generation => {}
            _ => return None,
        }
        let freed = Entry::Free {
            next: self.free_head,
            generation: key.generation.wrapping_add(1),
        };
        let old = core::mem::replace(&mut self.entries[key.slot()], freed);
        self.free_head = Some(key.index);
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    #[must_use]
    pub fn get(&self, key: Key<T>) -> Option<&T> {
        match self.entries.get(key.slot()) {
            Some(Entry::Occupied { value, generation }) if *generation == key.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: Key<T>) -> Option<&mut T> {
        match self.entries.get_mut(key.slot()) {
            Some(Entry::Occupied { value, generation }) if *generation == key.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, key: Key<T>) -> bool {
        self.get(key).is_some()
    }

    /// Iterates occupied entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Key<T>, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                // Slot count never exceeds u32::MAX (checked in insert).
                #[allow(clippy::cast_possible_truncation)]
                Entry::Occupied { value, generation } => {
                    Some((Key::new(i as u32, *generation), value))
                }
                Entry::Free { .. } => None,
            })
    }

    /// Removes every entry matching `pred`, returning them in slot order.
    pub fn extract_if(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let keys: Vec<Key<T>> = self
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| k)
            .collect();
        keys.into_iter().filter_map(|k| self.remove(k)).collect()
    }
}
