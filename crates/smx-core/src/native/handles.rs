//! Opaque handle table
//!
//! Natives hand host objects to plugins as integer ids. Each id maps to a
//! type tag, a shared owned value and an optional close callback. Cloning a
//! handle creates a second id for the same object; the callback runs once
//! the last id referring to the object is closed.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Id plugins use for "no handle"
pub const INVALID_HANDLE: i32 = 0;

/// Callback run when the last reference to an object is closed
pub type CloseFn = Arc<dyn Fn(&mut (dyn Any + Send)) + Send + Sync>;

/// Handle table errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// No object with this id
    #[error("Invalid handle {0}")]
    Invalid(i32),

    /// Object exists but has another type
    #[error("Handle {id} is a {actual}, expected {expected}")]
    TypeMismatch {
        /// Handle id
        id: i32,
        /// Tag the caller asked for
        expected: &'static str,
        /// Tag of the stored object
        actual: &'static str,
    },
}

type SharedObject = Arc<Mutex<Box<dyn Any + Send>>>;

struct HandleEntry {
    type_tag: &'static str,
    object: SharedObject,
    on_close: Option<CloseFn>,
}

/// Integer id to host object map
pub struct HandleTable {
    entries: FxHashMap<i32, HandleEntry>,
    next_id: i32,
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("count", &self.entries.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if id != INVALID_HANDLE && !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Store `value` and return its new id
    pub fn create<T: Any + Send>(
        &mut self,
        type_tag: &'static str,
        value: T,
        on_close: Option<CloseFn>,
    ) -> i32 {
        let id = self.allocate_id();
        let object: Box<dyn Any + Send> = Box::new(value);
        self.entries.insert(
            id,
            HandleEntry {
                type_tag,
                object: Arc::new(Mutex::new(object)),
                on_close,
            },
        );
        log::trace!("created handle {id} ({type_tag})");
        id
    }

    /// Type tag of handle `id`
    pub fn type_tag(&self, id: i32) -> Result<&'static str, HandleError> {
        self.entries
            .get(&id)
            .map(|entry| entry.type_tag)
            .ok_or(HandleError::Invalid(id))
    }

    /// Check if `id` refers to a live object
    pub fn contains(&self, id: i32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Run `f` on the object behind `id`, which must carry `type_tag` and be a `T`
    pub fn with<T: Any, R>(
        &self,
        id: i32,
        type_tag: &'static str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, HandleError> {
        let entry = self.entries.get(&id).ok_or(HandleError::Invalid(id))?;
        if entry.type_tag != type_tag {
            return Err(HandleError::TypeMismatch {
                id,
                expected: type_tag,
                actual: entry.type_tag,
            });
        }
        let mut guard = entry.object.lock();
        let value = (**guard)
            .downcast_mut::<T>()
            .ok_or(HandleError::TypeMismatch {
                id,
                expected: type_tag,
                actual: entry.type_tag,
            })?;
        Ok(f(value))
    }

    /// Create a second id for the object behind `id`
    pub fn clone_handle(&mut self, id: i32) -> Result<i32, HandleError> {
        let entry = self.entries.get(&id).ok_or(HandleError::Invalid(id))?;
        let copy = HandleEntry {
            type_tag: entry.type_tag,
            object: Arc::clone(&entry.object),
            on_close: entry.on_close.clone(),
        };
        let new_id = self.allocate_id();
        self.entries.insert(new_id, copy);
        Ok(new_id)
    }

    /// Close `id`; runs the close callback if it was the last reference
    pub fn close(&mut self, id: i32) -> Result<(), HandleError> {
        let entry = self.entries.remove(&id).ok_or(HandleError::Invalid(id))?;
        if Arc::strong_count(&entry.object) == 1 {
            if let Some(on_close) = &entry.on_close {
                let mut guard = entry.object.lock();
                on_close(&mut **guard);
            }
        }
        log::trace!("closed handle {id} ({})", entry.type_tag);
        Ok(())
    }

    /// Number of live ids
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no handle is open
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every handle, running pending callbacks
    pub fn clear(&mut self) {
        let mut ids: Vec<i32> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let _ = self.close(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_and_access() {
        let mut table = HandleTable::new();
        let id = table.create("ArrayList", vec![1, 2, 3], None);
        assert_ne!(id, INVALID_HANDLE);
        assert_eq!(table.type_tag(id), Ok("ArrayList"));

        let len = table.with(id, "ArrayList", |v: &mut Vec<i32>| {
            v.push(4);
            v.len()
        });
        assert_eq!(len, Ok(4));
    }

    #[test]
    fn test_type_mismatch() {
        let mut table = HandleTable::new();
        let id = table.create("ArrayList", vec![1], None);
        assert!(matches!(
            table.with(id, "StringMap", |_: &mut Vec<i32>| ()),
            Err(HandleError::TypeMismatch { .. })
        ));
        assert!(matches!(
            table.with(id, "ArrayList", |_: &mut String| ()),
            Err(HandleError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_close_runs_callback_on_last_reference() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let on_close: CloseFn = Arc::new(move |_: &mut (dyn Any + Send)| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut table = HandleTable::new();
        let id = table.create("Timer", 5u32, Some(on_close));
        let copy = table.clone_handle(id).unwrap();
        assert_ne!(id, copy);

        table.close(id).unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        assert_eq!(table.with(copy, "Timer", |v: &mut u32| *v), Ok(5));

        table.close(copy).unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(table.close(copy), Err(HandleError::Invalid(copy)));
        assert!(table.is_empty());
    }
}
