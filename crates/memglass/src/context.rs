//! Producer session context.
//!
//! A [`Context`] owns the header region, wires the three managers
//! together, and is the whole producer-facing API: register types, allocate
//! payload storage, register and destroy objects. One context per session
//! name per process; the session dies with the context.

use std::collections::BTreeSet;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::layout::{HeaderLayout, HeaderRef, TelemetryHeader};
use crate::metadata::MetadataManager;
use crate::object::{ObjectHandle, ObjectManager};
use crate::region::RegionManager;
use crate::shm::{header_shm_name, validate_session_name, SharedMemory};
use crate::types::{FieldDef, TypeRegistry};

/// Session names with a live producer context in this process.
static OPEN_SESSIONS: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

/// Producer-side handle to a telemetry session.
///
/// All methods take `&self` and may be called from any thread; each manager
/// serialises its own mutations. Dropping the context tears the session
/// down: every region name is unbound, though observers holding mappings
/// keep them until their last close.
pub struct Context {
    session: String,
    config: Config,
    regions: RegionManager,
    metadata: MetadataManager,
    objects: ObjectManager,
    types: TypeRegistry,
    header: HeaderRef,
    header_shm: SharedMemory,
}

impl Context {
    /// Create the session `session` and its first data region.
    ///
    /// Fails with [`Error::SessionAlreadyOpen`] if this process already has
    /// a context for the name, and [`Error::NameExists`] if another process
    /// left the name bound.
    pub fn create(session: &str, config: Config) -> Result<Self> {
        validate_session_name(session)?;

        {
            let mut open = OPEN_SESSIONS.lock();
            if !open.insert(session.to_owned()) {
                return Err(Error::SessionAlreadyOpen {
                    name: session.to_owned(),
                });
            }
        }

        match Self::build(session, config) {
            Ok(ctx) => Ok(ctx),
            Err(e) => {
                OPEN_SESSIONS.lock().remove(session);
                Err(e)
            }
        }
    }

    fn build(session: &str, config: Config) -> Result<Self> {
        let layout = HeaderLayout::calculate(
            config.header_object_capacity,
            config.header_type_capacity,
            config.header_field_capacity,
        );
        let header_shm = SharedMemory::create(&header_shm_name(session), layout.total_size)?;

        // SAFETY: fresh zero-filled mapping, at least layout.total_size
        // bytes, which includes the header struct.
        unsafe {
            (*(header_shm.data() as *mut TelemetryHeader))
                .init(std::process::id() as u64, &layout);
        }
        // SAFETY: the header mapping lives as long as the context; the ref
        // is handed only to the managers the context owns.
        let header = unsafe { HeaderRef::new(header_shm.data()) };

        let regions = RegionManager::new(header, session, &config)?;
        let metadata = MetadataManager::new(header, session, &config);
        let objects = ObjectManager::new(header);
        let types = TypeRegistry::new();

        tracing::debug!(session, pid = std::process::id(), "telemetry session created");

        Ok(Self {
            session: session.to_owned(),
            config,
            regions,
            metadata,
            objects,
            types,
            header,
            header_shm,
        })
    }

    /// Register a composite type and get its id.
    ///
    /// Field names encode nesting as `parent.child`; atomicity per field
    /// tells observers how to read it. Re-registering a known name returns
    /// the existing id.
    pub fn register_type(&self, name: &str, size: u32, fields: &[FieldDef<'_>]) -> Result<u32> {
        self.types.register(&self.metadata, name, size, fields)
    }

    /// Bump-allocate `size` bytes of session storage at `align`.
    ///
    /// The pointer is stable for the session lifetime and the bytes start
    /// zeroed. Grows the region chain as needed.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.regions.allocate(size, align)
    }

    /// Allocate session storage for a `T` and return it zero-initialised.
    ///
    /// # Safety
    ///
    /// All-zero bytes must be a valid `T` (atomics, integers, floats, and
    /// `repr(C)` aggregates of those are fine).
    pub unsafe fn allocate_zeroed<T>(&self) -> Result<&T> {
        let ptr = self.allocate(core::mem::size_of::<T>(), core::mem::align_of::<T>())?;
        // SAFETY: freshly allocated session bytes are zeroed; the caller
        // guarantees zeroed bytes are a valid T.
        Ok(unsafe { &*(ptr.as_ptr() as *const T) })
    }

    /// Register the object at `ptr` under `label`.
    ///
    /// `ptr` must lie in session storage obtained from
    /// [`allocate`](Self::allocate); anything else fails with
    /// [`Error::NotInSession`]. The label should be unique among alive
    /// objects.
    pub fn register_object(&self, ptr: *const u8, type_id: u32, label: &str) -> Result<ObjectHandle> {
        self.objects
            .register_object(&self.regions, &self.metadata, ptr, type_id, label)
    }

    /// Convenience: register a session-allocated value.
    pub fn register_value<T>(&self, value: &T, type_id: u32, label: &str) -> Result<ObjectHandle> {
        self.register_object(value as *const T as *const u8, type_id, label)
    }

    /// Mark the object destroyed. Its directory entry is retained for
    /// historical inspection but leaves every discovery scan.
    pub fn destroy_object(&self, handle: ObjectHandle) {
        self.objects.destroy_object(handle);
    }

    /// First alive object labelled exactly `label`, scanning the header
    /// directory pool only.
    pub fn find_object(&self, label: &str) -> Option<ObjectHandle> {
        self.objects.find_object(&self.regions, label)
    }

    /// Every currently alive object.
    pub fn alive_objects(&self) -> Vec<ObjectHandle> {
        self.objects.alive_objects()
    }

    /// Current change-detection sequence.
    pub fn sequence(&self) -> u64 {
        self.header
            .header()
            .sequence
            .load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn producer_pid(&self) -> u64 {
        self.header.header().producer_pid
    }

    pub fn session_name(&self) -> &str {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Published object entries, header and overflow pools combined.
    pub fn object_entry_count(&self) -> u32 {
        self.metadata.total_object_count()
    }

    /// Published type entries, header and overflow pools combined.
    pub fn type_entry_count(&self) -> u32 {
        self.metadata.total_type_count()
    }

    /// Published field entries, header and overflow pools combined.
    pub fn field_entry_count(&self) -> u32 {
        self.metadata.total_field_count()
    }

    /// OS-visible name of the header region, as observers open it.
    pub fn header_region_name(&self) -> &str {
        self.header_shm.name()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Region and header mappings unlink as their owners drop.
        OPEN_SESSIONS.lock().remove(&self.session);
        tracing::debug!(session = %self.session, "telemetry session closed");
    }
}
