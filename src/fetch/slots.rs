//-----------------------------------------------------------------------------
// Module slots
// Growable slot array with a free index stack
// Used for span groups, fetch channels, caller channel handles and request ids

use super::LinkError;

/// Slot array which hands out small, stable u32 ids
/// Freed ids are pushed to a free stack and reused before the array grows
/// The array never shrinks
#[derive(Debug)]
pub(crate) struct Slots<T> {
    what: &'static str,
    entries: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Slots<T> {
    pub fn new(what: &'static str) -> Slots<T> {
        Slots {
            what,
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Store a value in a recycled or fresh slot and return its id
    pub fn insert(&mut self, value: T) -> Result<u32, LinkError> {
        if let Some(id) = self.free.pop() {
            debug_assert!(self.entries[id as usize].is_none(), "{} slot {} is free but occupied", self.what, id);
            self.entries[id as usize] = Some(value);
            return Ok(id);
        }

        // Grow by 16 + 25%
        if self.entries.len() == self.entries.capacity() {
            let additional = 16 + (self.entries.len() >> 2);
            self.entries.try_reserve_exact(additional).map_err(|_| LinkError::OutOfMemory(self.what))?;
            self.free.try_reserve_exact(self.entries.capacity() - self.free.len()).map_err(|_| LinkError::OutOfMemory(self.what))?;
        }
        let id = u32::try_from(self.entries.len()).map_err(|_| LinkError::OutOfMemory(self.what))?;
        self.entries.push(Some(value));
        Ok(id)
    }

    /// Free a slot, returns the value or None if the id is unknown or already free
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let value = self.entries.get_mut(id as usize)?.take()?;
        self.free.push(id);
        Some(value)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(id as usize)?.as_mut()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// Number of occupied slots
    pub fn used(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}

//-----------------------------------------------------------------------------
