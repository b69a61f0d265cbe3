//! Typed side-table for provider extension state
//!
//! Each [`AttachmentKey`] carries its value type, so lookups downcast
//! without a runtime type-mismatch path.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_KEY: AtomicU64 = AtomicU64::new(0);

type Slot = Arc<dyn Any + Send + Sync>;

/// Key for one attachment slot holding values of type `T`
pub struct AttachmentKey<T> {
    id: u64,
    _type: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> AttachmentKey<T> {
    /// Allocate a fresh key, distinct from every other key
    pub fn new() -> Self {
        Self {
            id: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            _type: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Default for AttachmentKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AttachmentKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentKey({})", self.id)
    }
}

/// Concurrent attachment store
#[derive(Default)]
pub struct Attachments {
    slots: Mutex<HashMap<u64, Slot>>,
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachments")
            .field("len", &self.slots.lock().len())
            .finish()
    }
}

fn downcast<T: Send + Sync + 'static>(slot: Slot) -> Option<Arc<T>> {
    slot.downcast::<T>().ok()
}

impl Attachments {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning the previous value
    pub fn attach<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
        value: T,
    ) -> Option<Arc<T>> {
        self.slots
            .lock()
            .insert(key.id, Arc::new(value))
            .and_then(downcast)
    }

    /// Store `value` unless a value is present; returns the existing value
    pub fn attach_if_absent<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
        value: T,
    ) -> Option<Arc<T>> {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get(&key.id) {
            return downcast(Arc::clone(existing));
        }
        slots.insert(key.id, Arc::new(value));
        None
    }

    /// Replace the value only if the current one is `expect` (pointer equality)
    pub fn replace_attachment<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
        expect: &Arc<T>,
        replacement: T,
    ) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&key.id).cloned().and_then(downcast::<T>) {
            Some(current) if Arc::ptr_eq(&current, expect) => {
                slots.insert(key.id, Arc::new(replacement));
                true
            }
            _ => false,
        }
    }

    /// Remove and return the value
    pub fn remove_attachment<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
    ) -> Option<Arc<T>> {
        self.slots.lock().remove(&key.id).and_then(downcast)
    }

    /// Remove the value only if it is `expected` (pointer equality)
    pub fn remove_attachment_if<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
        expected: &Arc<T>,
    ) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&key.id).cloned().and_then(downcast::<T>) {
            Some(current) if Arc::ptr_eq(&current, expected) => {
                slots.remove(&key.id);
                true
            }
            _ => false,
        }
    }

    /// Current value
    pub fn get_attachment<T: Send + Sync + 'static>(
        &self,
        key: &AttachmentKey<T>,
    ) -> Option<Arc<T>> {
        self.slots.lock().get(&key.id).cloned().and_then(downcast)
    }
}
