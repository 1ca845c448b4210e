//! Metadata entry allocation: header pools first, overflow regions after.
//!
//! The header region carries three fixed pools (objects, types, fields).
//! They are always filled before any overflow region exists, so typical
//! short-lived sessions stay single-region. When a pool is full the manager
//! creates an overflow region whose body splits 50/10/40 between the three
//! entry kinds, links it into the overflow chain, and satisfies the request
//! from the matching sub-pool.
//!
//! Every allocator writes the entry body through an init closure and only
//! then release-stores the pool `count`, so an observer that acquires
//! `count = k` can read entries `[0, k)` without seeing uninitialised bytes.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::layout::{
    FieldEntry, HeaderRef, MetadataOverflowDescriptor, ObjectEntry, OverflowLayout,
    PoolDescriptor, TypeEntry,
};
use crate::shm::{overflow_shm_name, SharedMemory};

struct Overflow {
    shm: SharedMemory,
    id: u64,
    /// Virtual index of this region's first field slot: the header field
    /// capacity plus the field capacity of every earlier overflow region.
    field_virtual_base: u32,
}

impl Overflow {
    fn descriptor(&self) -> &MetadataOverflowDescriptor {
        // SAFETY: written at creation; the mapping outlives this view.
        unsafe { &*(self.shm.data() as *const MetadataOverflowDescriptor) }
    }
}

struct OverflowChain {
    session: String,
    layout: OverflowLayout,
    overflows: Vec<Overflow>,
    next_overflow_id: u64,
}

/// Producer-side allocator for object, type, and field entries.
pub(crate) struct MetadataManager {
    header: HeaderRef,
    chain: Mutex<OverflowChain>,
}

impl MetadataManager {
    pub(crate) fn new(header: HeaderRef, session: &str, config: &Config) -> Self {
        Self {
            header,
            chain: Mutex::new(OverflowChain {
                session: session.to_owned(),
                layout: OverflowLayout::calculate(config.overflow_region_size),
                overflows: Vec::new(),
                next_overflow_id: 1,
            }),
        }
    }

    /// Allocate one object entry; `init` writes the body before the slot is
    /// published.
    pub(crate) fn allocate_object_entry(
        &self,
        init: impl FnOnce(&mut ObjectEntry),
    ) -> Result<NonNull<ObjectEntry>> {
        let mut chain = self.chain.lock();
        let header = self.header.header();

        if let Some((slot, count)) = pool_slots::<ObjectEntry>(self.header.base(), &header.object_dir, 1) {
            // SAFETY: slot is unpublished, so nothing else reads or writes it.
            unsafe { init(&mut *slot) };
            header.object_dir.count.store(count + 1, Ordering::Release);
            return Ok(NonNull::new(slot).expect("pool slot is never null"));
        }

        if let Some(overflow) = chain.overflows.last() {
            let descriptor = overflow.descriptor();
            if let Some((slot, count)) = pool_slots::<ObjectEntry>(overflow.shm.data(), &descriptor.objects, 1) {
                unsafe { init(&mut *slot) };
                descriptor.objects.count.store(count + 1, Ordering::Release);
                return Ok(NonNull::new(slot).expect("pool slot is never null"));
            }
        }

        if chain.layout.object_capacity == 0 {
            return Err(Error::CapacityExhausted { pool: "objects" });
        }
        let overflow = create_overflow(&mut chain, self.header)?;
        let descriptor = overflow.descriptor();
        let (slot, count) = pool_slots::<ObjectEntry>(overflow.shm.data(), &descriptor.objects, 1)
            .ok_or(Error::CapacityExhausted { pool: "objects" })?;
        unsafe { init(&mut *slot) };
        descriptor.objects.count.store(count + 1, Ordering::Release);
        Ok(NonNull::new(slot).expect("pool slot is never null"))
    }

    /// Allocate one type entry; `init` writes the body before the slot is
    /// published.
    pub(crate) fn allocate_type_entry(
        &self,
        init: impl FnOnce(&mut TypeEntry),
    ) -> Result<NonNull<TypeEntry>> {
        let mut chain = self.chain.lock();
        let header = self.header.header();

        if let Some((slot, count)) = pool_slots::<TypeEntry>(self.header.base(), &header.type_registry, 1) {
            unsafe { init(&mut *slot) };
            header.type_registry.count.store(count + 1, Ordering::Release);
            return Ok(NonNull::new(slot).expect("pool slot is never null"));
        }

        if let Some(overflow) = chain.overflows.last() {
            let descriptor = overflow.descriptor();
            if let Some((slot, count)) = pool_slots::<TypeEntry>(overflow.shm.data(), &descriptor.types, 1) {
                unsafe { init(&mut *slot) };
                descriptor.types.count.store(count + 1, Ordering::Release);
                return Ok(NonNull::new(slot).expect("pool slot is never null"));
            }
        }

        if chain.layout.type_capacity == 0 {
            return Err(Error::CapacityExhausted { pool: "types" });
        }
        let overflow = create_overflow(&mut chain, self.header)?;
        let descriptor = overflow.descriptor();
        let (slot, count) = pool_slots::<TypeEntry>(overflow.shm.data(), &descriptor.types, 1)
            .ok_or(Error::CapacityExhausted { pool: "types" })?;
        unsafe { init(&mut *slot) };
        descriptor.types.count.store(count + 1, Ordering::Release);
        Ok(NonNull::new(slot).expect("pool slot is never null"))
    }

    /// Allocate `n` contiguous field entries and return the virtual index of
    /// the first one. A run never straddles pools; a run larger than one
    /// overflow sub-pool fails with [`Error::RequestTooLarge`].
    pub(crate) fn allocate_field_entries(
        &self,
        n: u32,
        init: impl FnOnce(&mut [FieldEntry]),
    ) -> Result<u32> {
        if n == 0 {
            return Ok(0);
        }

        let mut chain = self.chain.lock();
        let header = self.header.header();

        if let Some((slot, count)) = pool_slots::<FieldEntry>(self.header.base(), &header.field_entries, n) {
            // SAFETY: n unpublished consecutive slots, bounds checked.
            let slots = unsafe { std::slice::from_raw_parts_mut(slot, n as usize) };
            init(slots);
            header.field_entries.count.store(count + n, Ordering::Release);
            return Ok(count);
        }

        if let Some(overflow) = chain.overflows.last() {
            let descriptor = overflow.descriptor();
            if let Some((slot, count)) = pool_slots::<FieldEntry>(overflow.shm.data(), &descriptor.fields, n) {
                let slots = unsafe { std::slice::from_raw_parts_mut(slot, n as usize) };
                init(slots);
                descriptor.fields.count.store(count + n, Ordering::Release);
                return Ok(overflow.field_virtual_base + count);
            }
        }

        if n > chain.layout.field_capacity {
            return Err(Error::RequestTooLarge {
                count: n,
                capacity: chain.layout.field_capacity,
            });
        }
        let overflow = create_overflow(&mut chain, self.header)?;
        let descriptor = overflow.descriptor();
        let (slot, count) = pool_slots::<FieldEntry>(overflow.shm.data(), &descriptor.fields, n)
            .ok_or(Error::CapacityExhausted { pool: "fields" })?;
        let slots = unsafe { std::slice::from_raw_parts_mut(slot, n as usize) };
        init(slots);
        descriptor.fields.count.store(count + n, Ordering::Release);
        Ok(overflow.field_virtual_base + count)
    }

    /// Published object entries across the header pool and every overflow
    /// region.
    pub(crate) fn total_object_count(&self) -> u32 {
        let chain = self.chain.lock();
        let mut total = self.header.header().object_dir.count.load(Ordering::Acquire);
        for overflow in &chain.overflows {
            total += overflow.descriptor().objects.count.load(Ordering::Acquire);
        }
        total
    }

    /// Published type entries across all pools.
    pub(crate) fn total_type_count(&self) -> u32 {
        let chain = self.chain.lock();
        let mut total = self.header.header().type_registry.count.load(Ordering::Acquire);
        for overflow in &chain.overflows {
            total += overflow.descriptor().types.count.load(Ordering::Acquire);
        }
        total
    }

    /// Published field entries across all pools.
    pub(crate) fn total_field_count(&self) -> u32 {
        let chain = self.chain.lock();
        let mut total = self.header.header().field_entries.count.load(Ordering::Acquire);
        for overflow in &chain.overflows {
            total += overflow.descriptor().fields.count.load(Ordering::Acquire);
        }
        total
    }
}

/// Next `n` unpublished slots of a pool, or `None` if they do not fit.
fn pool_slots<T>(region_base: *mut u8, pool: &PoolDescriptor, n: u32) -> Option<(*mut T, u32)> {
    let count = pool.count.load(Ordering::Acquire);
    if count.checked_add(n)? > pool.capacity {
        return None;
    }
    // SAFETY: offset and capacity were laid out inside the mapping at region
    // creation; count + n <= capacity keeps the slot pointer in bounds.
    let slot = unsafe {
        (region_base.add(pool.offset as usize) as *mut T).add(count as usize)
    };
    Some((slot, count))
}

/// Create the next overflow region, link it (header on first creation,
/// previous overflow otherwise), and publish the change.
fn create_overflow<'a>(chain: &'a mut OverflowChain, header: HeaderRef) -> Result<&'a Overflow> {
    let id = chain.next_overflow_id;
    let name = overflow_shm_name(&chain.session, id);
    let shm = SharedMemory::create(&name, chain.layout.total_size)?;

    // SAFETY: fresh zero-filled mapping, at least descriptor-sized.
    let descriptor = unsafe { &mut *(shm.data() as *mut MetadataOverflowDescriptor) };
    descriptor.init(id, &chain.layout, &name);

    let field_virtual_base = match chain.overflows.last() {
        Some(prev) => prev.field_virtual_base + chain.layout.field_capacity,
        None => header.header().field_entries.capacity,
    };

    // Descriptor is complete; now make the region reachable.
    match chain.overflows.last() {
        Some(prev) => prev
            .descriptor()
            .next_region_id
            .store(id, Ordering::Release),
        None => header
            .header()
            .first_overflow_region_id
            .store(id, Ordering::Release),
    }

    tracing::debug!(session = %chain.session, overflow_id = id, "created metadata overflow region");

    chain.next_overflow_id += 1;
    chain.overflows.push(Overflow {
        shm,
        id,
        field_virtual_base,
    });
    header.bump_sequence();

    Ok(chain.overflows.last().expect("just pushed"))
}
