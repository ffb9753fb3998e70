//! Handle table for kernel objects
//!
//! Every object the guest can name is reached through a 32-bit handle. The
//! slot index lives in bits 2 and up; the low two bits are ignored on lookup.
//! Slot 0 is never handed out, so handle 0 is always invalid.

use crate::objects::{Object, ObjectType};
use ob_core::Errno;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Guest-visible object handle.
pub type Handle = u32;

/// Initial and minimum growth capacity.
pub const INITIAL_CAPACITY: usize = 16384;

/// Slots addressable by a 32-bit handle.
const MAX_CAPACITY: usize = 1 << 30;

#[derive(Default)]
struct Entry {
    handle_ref_count: u32,
    object: Option<Arc<Object>>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    cursor: usize,
    names: HashMap<String, Handle>,
}

/// Slot array plus name map, both behind one lock.
pub struct ObjectTable {
    inner: Mutex<Inner>,
}

fn slot_of(handle: Handle) -> usize {
    (handle >> 2) as usize
}

fn handle_of(slot: usize) -> Handle {
    (slot as Handle) << 2
}

impl Inner {
    fn find_free_slot(&mut self) -> Result<usize, Errno> {
        let capacity = self.entries.len();
        if capacity > 0 {
            let start = self.cursor.clamp(1, capacity);
            let candidates = (start..capacity).chain(1..start);
            for slot in candidates {
                if self.entries[slot].object.is_none() {
                    return Ok(slot);
                }
            }
        }

        let new_capacity = (capacity * 2).max(INITIAL_CAPACITY);
        if new_capacity > MAX_CAPACITY {
            return Err(Errno::ENOMEM);
        }
        self.entries.resize_with(new_capacity, Entry::default);
        Ok(capacity.max(1))
    }

    fn entry(&self, handle: Handle) -> Option<&Entry> {
        self.entries.get(slot_of(handle)).filter(|e| e.object.is_some())
    }

    fn entry_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        self.entries.get_mut(slot_of(handle)).filter(|e| e.object.is_some())
    }

    fn remove(&mut self, handle: Handle) -> Option<Arc<Object>> {
        let slot = slot_of(handle);
        let object = self.entries.get_mut(slot)?.object.take()?;
        self.entries[slot].handle_ref_count = 0;

        let canonical = handle_of(slot);
        let remaining = object.remove_handle(canonical);
        let stale: Vec<String> = self
            .names
            .iter()
            .filter(|&(_, &h)| h == canonical)
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            match remaining.first() {
                Some(&other) => {
                    self.names.insert(name, other);
                }
                None => {
                    self.names.remove(&name);
                }
            }
        }
        Some(object)
    }
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Number of slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Store `object` under a fresh handle with one handle reference.
    pub fn add(&self, object: Arc<Object>) -> Result<Handle, Errno> {
        let mut inner = self.inner.lock();
        let slot = inner.find_free_slot()?;
        let handle = handle_of(slot);
        object.push_handle(handle);
        inner.entries[slot] = Entry {
            handle_ref_count: 1,
            object: Some(object),
        };
        inner.cursor = slot;
        Ok(handle)
    }

    /// Give the object behind `handle` a second, independent handle.
    pub fn duplicate(&self, handle: Handle) -> Result<Handle, Errno> {
        let object = self.lookup(handle).ok_or(Errno::EBADF)?;
        self.add(object)
    }

    pub fn retain_handle(&self, handle: Handle) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(handle).ok_or(Errno::EBADF)?;
        entry.handle_ref_count += 1;
        Ok(())
    }

    /// Drop one handle reference; the slot is freed when none remain.
    pub fn release(&self, handle: Handle) -> Result<(), Errno> {
        let removed = {
            let mut inner = self.inner.lock();
            let entry = inner.entry_mut(handle).ok_or(Errno::EBADF)?;
            entry.handle_ref_count -= 1;
            if entry.handle_ref_count == 0 {
                inner.remove(handle)
            } else {
                None
            }
        };
        // The object may be destroyed here, outside the table lock.
        drop(removed);
        Ok(())
    }

    /// Free the slot regardless of outstanding handle references.
    pub fn remove(&self, handle: Handle) -> Result<(), Errno> {
        let removed = self.inner.lock().remove(handle);
        removed.map(drop).ok_or(Errno::EBADF)
    }

    pub fn lookup(&self, handle: Handle) -> Option<Arc<Object>> {
        let inner = self.inner.lock();
        inner.entry(handle).and_then(|e| e.object.clone())
    }

    /// Look `handle` up, requiring the object to be of `object_type`.
    pub fn lookup_typed(&self, handle: Handle, object_type: ObjectType) -> Option<Arc<Object>> {
        self.lookup(handle).filter(|o| o.object_type() == object_type)
    }

    pub fn handle_ref_count(&self, handle: Handle) -> Option<u32> {
        let inner = self.inner.lock();
        inner.entry(handle).map(|e| e.handle_ref_count)
    }

    /// Register `name` (case-insensitive) for `handle`.
    pub fn add_name(&self, name: &str, handle: Handle) -> Result<(), Errno> {
        let key = name.to_lowercase();
        let handle = handle_of(slot_of(handle));
        let mut inner = self.inner.lock();
        if inner.names.contains_key(&key) {
            return Err(Errno::EINVAL);
        }
        let object = inner.entry(handle).and_then(|e| e.object.clone()).ok_or(Errno::EBADF)?;
        object.set_name(name);
        inner.names.insert(key, handle);
        Ok(())
    }

    pub fn remove_name(&self, name: &str) -> Option<Handle> {
        self.inner.lock().names.remove(&name.to_lowercase())
    }

    /// Find a named object and take a handle reference on it.
    pub fn lookup_by_name(&self, name: &str) -> Option<Handle> {
        let mut inner = self.inner.lock();
        let handle = *inner.names.get(&name.to_lowercase())?;
        let entry = inner.entry_mut(handle)?;
        entry.handle_ref_count += 1;
        Some(handle)
    }

    /// Distinct objects of one type, in slot order.
    pub fn objects_by_type(&self, object_type: ObjectType) -> Vec<Arc<Object>> {
        self.collect_objects(|o| o.object_type() == object_type)
    }

    /// Distinct live objects, in slot order.
    pub fn all_objects(&self) -> Vec<Arc<Object>> {
        self.collect_objects(|_| true)
    }

    fn collect_objects(&self, filter: impl Fn(&Object) -> bool) -> Vec<Arc<Object>> {
        let inner = self.inner.lock();
        let mut seen: HashSet<*const Object> = HashSet::new();
        let objects = inner
            .entries
            .iter()
            .filter_map(|e| e.object.as_ref())
            .filter(|o| filter(o) && seen.insert(Arc::as_ptr(*o)))
            .cloned()
            .collect();
        objects
    }

    /// Drop every object and name.
    pub fn purge(&self) {
        let removed: Vec<Arc<Object>> = {
            let mut inner = self.inner.lock();
            inner.names.clear();
            inner.cursor = 0;
            inner.entries.iter_mut().filter_map(|e| {
                e.handle_ref_count = 0;
                e.object.take()
            }).collect()
        };
        for object in &removed {
            object.clear_handles();
        }
        tracing::debug!("Purged {} object handles", removed.len());
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
