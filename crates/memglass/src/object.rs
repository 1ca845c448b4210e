//! Object lifecycle: registration, destruction, label lookup.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::layout::{self, HeaderRef, ObjectEntry, ObjectState};
use crate::metadata::MetadataManager;
use crate::region::RegionManager;

/// Handle to a registered object.
///
/// Valid only while the owning [`Context`](crate::Context) is alive; the
/// entry it points at lives in session shared memory.
#[derive(Clone, Copy)]
pub struct ObjectHandle {
    entry: NonNull<ObjectEntry>,
    ptr: usize,
}

// SAFETY: the entry lives in shared memory for the session lifetime, and
// every mutation goes through the atomic `state` field or the object
// manager's mutex.
unsafe impl Send for ObjectHandle {}
unsafe impl Sync for ObjectHandle {}

impl ObjectHandle {
    fn entry(&self) -> &ObjectEntry {
        // SAFETY: see the Send/Sync justification above.
        unsafe { self.entry.as_ref() }
    }

    pub fn label(&self) -> String {
        layout::read_inline_name(&self.entry().label).to_owned()
    }

    pub fn type_id(&self) -> u32 {
        self.entry().type_id
    }

    pub fn generation(&self) -> u32 {
        self.entry().generation
    }

    pub fn is_alive(&self) -> bool {
        self.entry().state.load(Ordering::Acquire) == ObjectState::Alive as u32
    }
}

/// Producer-side object directory manager.
///
/// Holds the process-local ptr → entry map used for fast destruction; the
/// map never leaves the producer and observers never need it.
pub(crate) struct ObjectManager {
    header: HeaderRef,
    by_ptr: Mutex<HashMap<usize, NonNull<ObjectEntry>>>,
}

// SAFETY: the NonNull values point into session shared memory, which
// outlives the manager; the map itself is behind a mutex.
unsafe impl Send for ObjectManager {}
unsafe impl Sync for ObjectManager {}

impl ObjectManager {
    pub(crate) fn new(header: HeaderRef) -> Self {
        Self {
            header,
            by_ptr: Mutex::new(HashMap::new()),
        }
    }

    /// Register the live object at `ptr`.
    ///
    /// `ptr` must point into session-allocated memory; the label should be
    /// unique among alive objects (uniqueness is the producer's contract,
    /// not enforced here).
    pub(crate) fn register_object(
        &self,
        regions: &RegionManager,
        metadata: &MetadataManager,
        ptr: *const u8,
        type_id: u32,
        label: &str,
    ) -> Result<ObjectHandle> {
        let mut by_ptr = self.by_ptr.lock();

        let (region_id, offset) = regions.get_location(ptr).ok_or(Error::NotInSession)?;

        let entry = metadata.allocate_object_entry(|entry| {
            entry.type_id = type_id;
            entry.region_id = region_id;
            entry.offset = offset;
            entry.generation = 1;
            layout::write_inline_name(&mut entry.label, label);
            entry._pad = [0; 4];
            // Body first, then liveness: an observer that sees Alive sees a
            // complete entry.
            entry
                .state
                .store(ObjectState::Alive as u32, Ordering::Release);
        })?;

        self.header.bump_sequence();
        by_ptr.insert(ptr as usize, entry);

        Ok(ObjectHandle {
            entry,
            ptr: ptr as usize,
        })
    }

    /// Mark the object behind `handle` destroyed. The entry slot is kept
    /// for historical inspection and never reused; destroying an already
    /// destroyed handle is a no-op.
    pub(crate) fn destroy_object(&self, handle: ObjectHandle) {
        let mut by_ptr = self.by_ptr.lock();
        let Some(entry) = by_ptr.remove(&handle.ptr) else {
            return;
        };

        // SAFETY: entry points into live session memory; generation is
        // advisory and only ever touched under this manager's lock.
        unsafe {
            let generation = std::ptr::addr_of_mut!((*entry.as_ptr()).generation);
            std::ptr::write_volatile(generation, generation.read_volatile() + 1);
            entry
                .as_ref()
                .state
                .store(ObjectState::Destroyed as u32, Ordering::Release);
        }
        self.header.bump_sequence();
    }

    /// Find the first alive object with this exact label.
    ///
    /// Scans the header object pool only; overflow pools are intentionally
    /// not searched, keeping the call O(header capacity). Labels of
    /// interest are expected to be registered early and stay stable.
    pub(crate) fn find_object(&self, regions: &RegionManager, label: &str) -> Option<ObjectHandle> {
        let header = self.header.header();
        let count = header.object_dir.count.load(Ordering::Acquire);

        let entries = unsafe {
            // SAFETY: the pool was laid out inside the header mapping;
            // entries below `count` are published.
            self.header.base().add(header.object_dir.offset as usize) as *mut ObjectEntry
        };

        for i in 0..count {
            // SAFETY: i < count <= capacity.
            let entry = unsafe { &*entries.add(i as usize) };
            if entry.state.load(Ordering::Acquire) != ObjectState::Alive as u32 {
                continue;
            }
            if layout::read_inline_name(&entry.label) != label {
                continue;
            }
            let base = regions.get_region_data(entry.region_id)?;
            // SAFETY: alive entries always point inside their region.
            let ptr = unsafe { base.add(entry.offset as usize) };
            return Some(ObjectHandle {
                // SAFETY: entry derives from a non-null pool pointer.
                entry: unsafe { NonNull::new_unchecked(entries.add(i as usize)) },
                ptr: ptr as usize,
            });
        }
        None
    }

    /// Handles for every currently alive object, in no particular order.
    pub(crate) fn alive_objects(&self) -> Vec<ObjectHandle> {
        let by_ptr = self.by_ptr.lock();
        by_ptr
            .iter()
            .map(|(&ptr, &entry)| ObjectHandle { entry, ptr })
            .collect()
    }
}
