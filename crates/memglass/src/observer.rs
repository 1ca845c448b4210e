//! Out-of-process observation of a session.
//!
//! The observer opens the header region by its canonical name, follows the
//! data and overflow chains, and materialises a consistent snapshot of
//! types and objects. Consistency comes from the header `sequence` counter:
//! a snapshot is committed only when the counter reads the same before and
//! after, retried a bounded number of times.
//!
//! Field values are read straight out of the producer's regions using the
//! protocol each field declared at registration: plain load, acquire-load,
//! seqlock read-twice-compare, or not at all. A field that cannot be read
//! (locked, unmapped region, unstable seqlock) is *unavailable*, never an
//! error; observers degrade per field, not per session.

use std::collections::BTreeMap;
use std::sync::atomic::{fence, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::layout::{
    self, Atomicity, FieldEntry, MetadataOverflowDescriptor, ObjectEntry, ObjectState,
    PoolDescriptor, RegionDescriptor, TelemetryHeader, TypeEntry, OVERFLOW_MAGIC, REGION_MAGIC,
};
use crate::shm::{header_shm_name, overflow_shm_name, region_shm_name, validate_session_name, SharedMemory};
use crate::types::Primitive;

/// Attempts before `refresh` gives up on a stable snapshot.
const MAX_REFRESH_RETRIES: u32 = 8;
/// Attempts before a single seqlock field read reports unavailable.
const SEQLOCK_READ_RETRIES: u32 = 16;

/// A field of an observed type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedField {
    pub name: String,
    pub type_id: u32,
    pub offset: u32,
    pub size: u32,
    pub atomicity: Atomicity,
}

/// A type discovered in the session's registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedType {
    pub type_id: u32,
    pub name: String,
    pub size: u32,
    pub fields: Vec<ObservedField>,
}

/// An alive object discovered in the session's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedObject {
    pub label: String,
    pub type_id: u32,
    pub type_name: String,
    pub region_id: u64,
    pub offset: u64,
    pub generation: u32,
}

/// A decoded primitive field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Char(char),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::I8(v) => write!(f, "{v}"),
            FieldValue::I16(v) => write!(f, "{v}"),
            FieldValue::I32(v) => write!(f, "{v}"),
            FieldValue::I64(v) => write!(f, "{v}"),
            FieldValue::U8(v) => write!(f, "{v}"),
            FieldValue::U16(v) => write!(f, "{v}"),
            FieldValue::U32(v) => write!(f, "{v}"),
            FieldValue::U64(v) => write!(f, "{v}"),
            FieldValue::F32(v) => write!(f, "{v}"),
            FieldValue::F64(v) => write!(f, "{v}"),
            FieldValue::Char(v) => write!(f, "'{v}'"),
        }
    }
}

/// Read-only attachment to a session.
pub struct Observer {
    session: String,
    header: SharedMemory,
    regions: BTreeMap<u64, SharedMemory>,
    overflows: Vec<SharedMemory>,
    overflow_ids: Vec<u64>,
    last_sequence: u64,
    types: Vec<ObservedType>,
    objects: Vec<ObservedObject>,
}

impl Observer {
    /// Attach to the session named `session`.
    ///
    /// Verifies the header magic and version, records the producer pid, and
    /// maps every region currently linked into the chains. Call
    /// [`refresh`](Self::refresh) to materialise types and objects.
    pub fn connect(session: &str) -> Result<Self> {
        validate_session_name(session)?;

        let header = SharedMemory::open(&header_shm_name(session))?;
        if header.len() < core::mem::size_of::<TelemetryHeader>() {
            return Err(Error::VersionMismatch {
                expected: layout::WIRE_VERSION,
                found: 0,
            });
        }

        let mut observer = Self {
            session: session.to_owned(),
            header,
            regions: BTreeMap::new(),
            overflows: Vec::new(),
            overflow_ids: Vec::new(),
            last_sequence: 0,
            types: Vec::new(),
            objects: Vec::new(),
        };
        observer.header_view().validate()?;
        observer.walk_chains();
        Ok(observer)
    }

    /// Drop all mappings. The producer and other observers are unaffected.
    pub fn disconnect(self) {}

    fn header_view(&self) -> &TelemetryHeader {
        // SAFETY: length and magic were validated at connect.
        unsafe { &*(self.header.data() as *const TelemetryHeader) }
    }

    /// PID of the producer that created the session.
    pub fn producer_pid(&self) -> u64 {
        self.header_view().producer_pid
    }

    /// Session sequence at the last committed snapshot.
    pub fn sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Session name this observer is attached to.
    pub fn session_name(&self) -> &str {
        &self.session
    }

    /// Alive objects from the last committed snapshot.
    pub fn objects(&self) -> &[ObservedObject] {
        &self.objects
    }

    /// Registered types from the last committed snapshot.
    pub fn types(&self) -> &[ObservedType] {
        &self.types
    }

    /// Re-snapshot the session.
    ///
    /// Maps any regions that appeared since the last call, then rebuilds
    /// the type table and object list. If the producer mutated structure
    /// mid-snapshot (the header sequence moved), the snapshot is retried;
    /// after [`MAX_REFRESH_RETRIES`] unstable attempts this fails with
    /// [`Error::SnapshotUnstable`] and the previous snapshot stays in
    /// place.
    pub fn refresh(&mut self) -> Result<()> {
        for attempt in 0..MAX_REFRESH_RETRIES {
            let s0 = self.header_view().sequence.load(Ordering::Acquire);
            self.walk_chains();
            let (types, objects) = self.materialise();
            let s1 = self.header_view().sequence.load(Ordering::Acquire);

            if s0 == s1 {
                self.types = types;
                self.objects = objects;
                self.last_sequence = s1;
                return Ok(());
            }
            tracing::debug!(
                session = %self.session,
                attempt,
                "structure changed mid-snapshot, retrying"
            );
        }
        Err(Error::SnapshotUnstable {
            retries: MAX_REFRESH_RETRIES,
        })
    }

    /// A view over an alive object's payload, or `None` while its region
    /// is not mapped or its type is unknown.
    pub fn get<'a>(&'a self, object: &ObservedObject) -> Option<ObjectView<'a>> {
        let ty = self.types.iter().find(|t| t.type_id == object.type_id)?;
        let region = self.regions.get(&object.region_id)?;
        let offset = object.offset as usize;
        if offset.checked_add(ty.size as usize)? > region.len() {
            return None;
        }
        Some(ObjectView {
            // SAFETY: offset + size is inside the mapping, checked above.
            base: unsafe { region.data().add(offset) } as *const u8,
            limit: region.len() - offset,
            region_base: region.data() as usize,
            ty,
        })
    }

    /// Follow both region chains and map anything new.
    ///
    /// A link that cannot be opened (producer mid-teardown, region mid-
    /// creation) stops the walk; the affected objects read as unavailable
    /// until a later refresh succeeds.
    fn walk_chains(&mut self) {
        let (first_region, first_overflow) = {
            let header = self.header_view();
            (
                header.first_region_id.load(Ordering::Acquire),
                header.first_overflow_region_id.load(Ordering::Acquire),
            )
        };

        let mut id = first_region;
        while id != 0 {
            if let Some(shm) = self.regions.get(&id) {
                // SAFETY: mapped regions were magic-checked below.
                let descriptor = unsafe { &*(shm.data() as *const RegionDescriptor) };
                let next = descriptor.next_region_id.load(Ordering::Acquire);
                if next != 0 && next <= id {
                    tracing::warn!(region_id = id, next, "non-monotonic region link, stopping walk");
                    break;
                }
                id = next;
                continue;
            }
            let name = region_shm_name(&self.session, id);
            let shm = match SharedMemory::open(&name) {
                Ok(shm) if shm.len() >= core::mem::size_of::<RegionDescriptor>() => shm,
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(region_id = id, error = %e, "data region unreachable");
                    break;
                }
            };
            // SAFETY: length checked above.
            let descriptor = unsafe { &*(shm.data() as *const RegionDescriptor) };
            if descriptor.magic != REGION_MAGIC || descriptor.region_id != id {
                tracing::warn!(region_id = id, "data region failed validation");
                break;
            }
            self.regions.insert(id, shm);
        }

        let mut id = first_overflow;
        while id != 0 {
            if let Some(pos) = self.overflow_ids.iter().position(|&known| known == id) {
                let shm = &self.overflows[pos];
                // SAFETY: mapped overflows were magic-checked below.
                let descriptor = unsafe { &*(shm.data() as *const MetadataOverflowDescriptor) };
                let next = descriptor.next_region_id.load(Ordering::Acquire);
                if next != 0 && next <= id {
                    tracing::warn!(overflow_id = id, next, "non-monotonic overflow link, stopping walk");
                    break;
                }
                id = next;
                continue;
            }
            let name = overflow_shm_name(&self.session, id);
            let shm = match SharedMemory::open(&name) {
                Ok(shm) if shm.len() >= core::mem::size_of::<MetadataOverflowDescriptor>() => shm,
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(overflow_id = id, error = %e, "overflow region unreachable");
                    break;
                }
            };
            // SAFETY: length checked above.
            let descriptor = unsafe { &*(shm.data() as *const MetadataOverflowDescriptor) };
            if descriptor.magic != OVERFLOW_MAGIC || descriptor.region_id != id {
                tracing::warn!(overflow_id = id, "overflow region failed validation");
                break;
            }
            self.overflow_ids.push(id);
            self.overflows.push(shm);
        }
    }

    /// Build the type table and object list from the current pool counts.
    fn materialise(&self) -> (Vec<ObservedType>, Vec<ObservedObject>) {
        let header = self.header_view();

        // The field pools in virtual-index order: header pool, then each
        // overflow's field sub-pool in chain order.
        let mut field_pools: Vec<FieldPoolView> = Vec::with_capacity(1 + self.overflows.len());
        if let Some(pool) = FieldPoolView::from_pool(&self.header, &header.field_entries, 0) {
            field_pools.push(pool);
        }
        let mut virtual_base = header.field_entries.capacity;
        for shm in &self.overflows {
            // SAFETY: magic-checked when mapped.
            let descriptor = unsafe { &*(shm.data() as *const MetadataOverflowDescriptor) };
            if let Some(pool) = FieldPoolView::from_pool(shm, &descriptor.fields, virtual_base) {
                field_pools.push(pool);
            }
            virtual_base += descriptor.fields.capacity;
        }

        let mut types = Vec::new();
        self.collect_types(&self.header, &header.type_registry, &field_pools, &mut types);
        for shm in &self.overflows {
            let descriptor = unsafe { &*(shm.data() as *const MetadataOverflowDescriptor) };
            self.collect_types(shm, &descriptor.types, &field_pools, &mut types);
        }

        let mut objects = Vec::new();
        self.collect_objects(&self.header, &header.object_dir, &types, &mut objects);
        for shm in &self.overflows {
            let descriptor = unsafe { &*(shm.data() as *const MetadataOverflowDescriptor) };
            self.collect_objects(shm, &descriptor.objects, &types, &mut objects);
        }

        (types, objects)
    }

    fn collect_types(
        &self,
        shm: &SharedMemory,
        pool: &PoolDescriptor,
        field_pools: &[FieldPoolView],
        out: &mut Vec<ObservedType>,
    ) {
        let Some(entries) = pool_entries::<TypeEntry>(shm, pool) else {
            return;
        };
        for entry in entries {
            let fields = match resolve_fields(field_pools, entry.field_offset, entry.field_count) {
                Some(fields) => fields,
                None => {
                    tracing::warn!(
                        type_id = entry.type_id,
                        "type references unresolved field entries, skipping"
                    );
                    continue;
                }
            };
            out.push(ObservedType {
                type_id: entry.type_id,
                name: layout::read_inline_name(&entry.name).to_owned(),
                size: entry.size,
                fields,
            });
        }
    }

    fn collect_objects(
        &self,
        shm: &SharedMemory,
        pool: &PoolDescriptor,
        types: &[ObservedType],
        out: &mut Vec<ObservedObject>,
    ) {
        let Some(entries) = pool_entries::<ObjectEntry>(shm, pool) else {
            return;
        };
        for entry in entries {
            if entry.state.load(Ordering::Acquire) != ObjectState::Alive as u32 {
                continue;
            }
            let type_name = types
                .iter()
                .find(|t| t.type_id == entry.type_id)
                .map(|t| t.name.clone())
                .unwrap_or_default();
            out.push(ObservedObject {
                label: layout::read_inline_name(&entry.label).to_owned(),
                type_id: entry.type_id,
                type_name,
                region_id: entry.region_id,
                offset: entry.offset,
                generation: entry.generation,
            });
        }
    }
}

/// Published entries of one pool, bounds-checked against the mapping.
fn pool_entries<'a, T>(shm: &'a SharedMemory, pool: &PoolDescriptor) -> Option<&'a [T]> {
    let count = pool.count.load(Ordering::Acquire) as usize;
    let offset = pool.offset as usize;
    let bytes = count.checked_mul(core::mem::size_of::<T>())?;
    if offset.checked_add(bytes)? > shm.len() {
        return None;
    }
    // SAFETY: count entries starting at offset lie inside the mapping and
    // are published (and therefore initialised) per the wire contract.
    Some(unsafe { std::slice::from_raw_parts(shm.data().add(offset) as *const T, count) })
}

/// One field sub-pool positioned in the virtual index space.
struct FieldPoolView {
    base: *const FieldEntry,
    virtual_base: u32,
    capacity: u32,
    count: u32,
}

impl FieldPoolView {
    fn from_pool(shm: &SharedMemory, pool: &PoolDescriptor, virtual_base: u32) -> Option<Self> {
        let count = pool.count.load(Ordering::Acquire);
        let offset = pool.offset as usize;
        let bytes = (pool.capacity as usize).checked_mul(core::mem::size_of::<FieldEntry>())?;
        if offset.checked_add(bytes)? > shm.len() {
            return None;
        }
        Some(Self {
            // SAFETY: capacity entries at offset fit the mapping.
            base: unsafe { shm.data().add(offset) } as *const FieldEntry,
            virtual_base,
            capacity: pool.capacity,
            count,
        })
    }
}

/// Map a `(virtual index, run length)` pair onto a single pool slot index.
fn locate_field_run(
    pools: &[(u32, u32, u32)], // (virtual_base, capacity, count)
    virtual_index: u32,
    n: u32,
) -> Option<(usize, u32)> {
    for (pool_index, &(virtual_base, capacity, count)) in pools.iter().enumerate() {
        if virtual_index < virtual_base || virtual_index >= virtual_base + capacity {
            continue;
        }
        let slot = virtual_index - virtual_base;
        // Runs never straddle pools and must be fully published.
        if slot.checked_add(n)? <= count {
            return Some((pool_index, slot));
        }
        return None;
    }
    None
}

fn resolve_fields(
    pools: &[FieldPoolView],
    virtual_index: u32,
    n: u32,
) -> Option<Vec<ObservedField>> {
    if n == 0 {
        return Some(Vec::new());
    }
    let keys: Vec<(u32, u32, u32)> = pools
        .iter()
        .map(|p| (p.virtual_base, p.capacity, p.count))
        .collect();
    let (pool_index, slot) = locate_field_run(&keys, virtual_index, n)?;
    let pool = &pools[pool_index];

    let mut fields = Vec::with_capacity(n as usize);
    for i in 0..n {
        // SAFETY: slot + n <= count <= capacity, checked in locate_field_run.
        let entry = unsafe { &*pool.base.add((slot + i) as usize) };
        fields.push(ObservedField {
            name: layout::read_inline_name(&entry.name).to_owned(),
            type_id: entry.type_id,
            offset: entry.offset,
            size: entry.size,
            atomicity: Atomicity::from_u8(entry.atomicity)?,
        });
    }
    Some(fields)
}

// =============================================================================
// Value access
// =============================================================================

/// A view over one object's payload bytes.
pub struct ObjectView<'a> {
    base: *const u8,
    limit: usize,
    region_base: usize,
    ty: &'a ObservedType,
}

impl<'a> ObjectView<'a> {
    /// The observed type behind this view.
    pub fn observed_type(&self) -> &'a ObservedType {
        self.ty
    }

    /// Proxy for the field with this exact name (dotted for nested
    /// structs), or `None` if the type has no such field or it falls
    /// outside the mapped payload.
    pub fn field(&self, name: &str) -> Option<FieldProxy<'a>> {
        let field = self.ty.fields.iter().find(|f| f.name == name)?;
        let end = (field.offset as usize).checked_add(field.size as usize)?;
        if end > self.limit {
            return None;
        }
        Some(FieldProxy {
            // SAFETY: offset + size <= limit keeps the address in-mapping.
            addr: unsafe { self.base.add(field.offset as usize) },
            region_base: self.region_base,
            field,
        })
    }
}

/// Typed reads of a single field.
pub struct FieldProxy<'a> {
    addr: *const u8,
    region_base: usize,
    field: &'a ObservedField,
}

impl<'a> FieldProxy<'a> {
    /// The field metadata this proxy reads through.
    pub fn info(&self) -> &'a ObservedField {
        self.field
    }

    /// Decode the current value using the field's declared protocol.
    ///
    /// Returns `None` for `Locked` fields, non-primitive field types,
    /// misaligned atomics, and seqlock reads that stay unstable past the
    /// retry bound.
    pub fn load(&self) -> Option<FieldValue> {
        let primitive = Primitive::from_type_id(self.field.type_id)?;
        let width = primitive.size() as usize;

        let bits = match self.field.atomicity {
            Atomicity::Locked => return None,
            Atomicity::None => plain_read(self.addr, width)?,
            Atomicity::Atomic => atomic_read(self.addr, width)?,
            Atomicity::Seqlock => seqlock_read(self.addr, width, self.region_base)?,
        };
        Some(decode(primitive, bits))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.load()? {
            FieldValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self.load()? {
            FieldValue::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.load()? {
            FieldValue::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self.load()? {
            FieldValue::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self.load()? {
            FieldValue::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self.load()? {
            FieldValue::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.load()? {
            FieldValue::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_char(&self) -> Option<char> {
        match self.load()? {
            FieldValue::Char(v) => Some(v),
            _ => None,
        }
    }
}

fn plain_read(addr: *const u8, width: usize) -> Option<u64> {
    // SAFETY: the caller bounds-checked addr..addr+width against the
    // mapping; volatile keeps the compiler from caching producer-mutated
    // bytes.
    unsafe {
        Some(match width {
            1 => addr.read_volatile() as u64,
            2 => (addr as *const u16).read_volatile() as u64,
            4 => (addr as *const u32).read_volatile() as u64,
            8 => (addr as *const u64).read_volatile(),
            _ => return None,
        })
    }
}

fn atomic_read(addr: *const u8, width: usize) -> Option<u64> {
    if (addr as usize) % width != 0 {
        return None;
    }
    // SAFETY: in-bounds and aligned for the width; atomic loads cannot
    // tear and acquire pairs with the producer's release stores.
    unsafe {
        Some(match width {
            1 => (*(addr as *const AtomicU8)).load(Ordering::Acquire) as u64,
            2 => (*(addr as *const AtomicU16)).load(Ordering::Acquire) as u64,
            4 => (*(addr as *const AtomicU32)).load(Ordering::Acquire) as u64,
            8 => (*(addr as *const AtomicU64)).load(Ordering::Acquire),
            _ => return None,
        })
    }
}

/// Seqlock protocol: the sequence word is the `u64` immediately preceding
/// the value. Copy between two stable, even reads of the word.
fn seqlock_read(addr: *const u8, width: usize, region_base: usize) -> Option<u64> {
    let seq_addr = (addr as usize).checked_sub(8)?;
    if seq_addr < region_base || seq_addr % 8 != 0 {
        return None;
    }
    // SAFETY: seq_addr is inside the mapping (above the region base) and
    // 8-aligned.
    let seq = unsafe { &*(seq_addr as *const AtomicU64) };

    for _ in 0..SEQLOCK_READ_RETRIES {
        let s1 = seq.load(Ordering::Acquire);
        if s1 & 1 != 0 {
            std::hint::spin_loop();
            continue;
        }
        let bits = plain_read(addr, width)?;
        fence(Ordering::Acquire);
        if seq.load(Ordering::Relaxed) == s1 {
            return Some(bits);
        }
    }
    None
}

fn decode(primitive: Primitive, bits: u64) -> FieldValue {
    match primitive {
        Primitive::Bool => FieldValue::Bool(bits != 0),
        Primitive::Int8 => FieldValue::I8(bits as u8 as i8),
        Primitive::Int16 => FieldValue::I16(bits as u16 as i16),
        Primitive::Int32 => FieldValue::I32(bits as u32 as i32),
        Primitive::Int64 => FieldValue::I64(bits as i64),
        Primitive::UInt8 => FieldValue::U8(bits as u8),
        Primitive::UInt16 => FieldValue::U16(bits as u16),
        Primitive::UInt32 => FieldValue::U32(bits as u32),
        Primitive::UInt64 => FieldValue::U64(bits),
        Primitive::Float32 => FieldValue::F32(f32::from_bits(bits as u32)),
        Primitive::Float64 => FieldValue::F64(f64::from_bits(bits)),
        Primitive::Char => FieldValue::Char(bits as u8 as char),
    }
}
