//! Data-region chain and bump allocation.
//!
//! Regions are created on demand and never shrunk; each one carries a
//! [`RegionDescriptor`] whose `used` cursor is the allocation frontier.
//! Growth doubles the previous body size (clamped to the configured cap), so
//! the chain stays logarithmic in the total footprint.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::layout::{HeaderRef, RegionDescriptor};
use crate::shm::{region_shm_name, SharedMemory};

const DESCRIPTOR_SIZE: usize = core::mem::size_of::<RegionDescriptor>();

struct Region {
    shm: SharedMemory,
    id: u64,
}

impl Region {
    fn descriptor(&self) -> &RegionDescriptor {
        // SAFETY: the descriptor is written at creation and the mapping
        // outlives this view.
        unsafe { &*(self.shm.data() as *const RegionDescriptor) }
    }
}

struct RegionChain {
    session: String,
    regions: Vec<Region>,
    next_region_id: u64,
    current_region_size: usize,
    max_region_size: usize,
}

impl RegionChain {
    /// Create the next region with the given body size and link it into the
    /// chain. The descriptor is fully written before the previous region's
    /// `next_region_id` publishes it.
    fn create_region(&mut self, body_size: usize) -> Result<()> {
        let id = self.next_region_id;
        let name = region_shm_name(&self.session, id);
        let shm = SharedMemory::create(&name, DESCRIPTOR_SIZE + body_size)?;

        // SAFETY: fresh zero-filled mapping, at least descriptor-sized.
        let descriptor = unsafe { &mut *(shm.data() as *mut RegionDescriptor) };
        descriptor.init(id, shm.len() as u64, &name);

        if let Some(prev) = self.regions.last() {
            prev.descriptor()
                .next_region_id
                .store(id, std::sync::atomic::Ordering::Release);
        }

        tracing::debug!(session = %self.session, region_id = id, size = shm.len(), "created data region");

        self.next_region_id += 1;
        self.regions.push(Region { shm, id });
        Ok(())
    }

    fn current(&self) -> &Region {
        self.regions.last().expect("region chain is never empty")
    }
}

/// Producer-side manager of the data-region chain.
pub(crate) struct RegionManager {
    header: HeaderRef,
    chain: Mutex<RegionChain>,
}

impl RegionManager {
    /// Create region 1 and publish it as the chain head.
    pub(crate) fn new(header: HeaderRef, session: &str, config: &Config) -> Result<Self> {
        let mut chain = RegionChain {
            session: session.to_owned(),
            regions: Vec::new(),
            next_region_id: 1,
            current_region_size: config.initial_region_size,
            max_region_size: config.max_region_size,
        };
        chain.create_region(config.initial_region_size)?;

        header
            .header()
            .first_region_id
            .store(chain.current().id, std::sync::atomic::Ordering::Release);

        Ok(Self {
            header,
            chain: Mutex::new(chain),
        })
    }

    /// Bump-allocate `size` bytes at the given alignment.
    ///
    /// The pointer stays valid until session teardown. Grows the chain when
    /// the current region is full.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub(crate) fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        let mut chain = self.chain.lock();

        let mut region = chain.current();
        let mut descriptor = region.descriptor();
        let used = descriptor
            .used
            .load(std::sync::atomic::Ordering::Acquire) as usize;
        let mut aligned = align_up(used, align);
        let mut new_used = aligned + size;

        if new_used > descriptor.size as usize {
            let body = grow_size(size, align, chain.current_region_size, chain.max_region_size);
            let base_used = align_up(DESCRIPTOR_SIZE, align);
            if base_used + size > DESCRIPTOR_SIZE + body {
                return Err(Error::OutOfSpace { requested: size });
            }

            chain.create_region(body)?;
            chain.current_region_size = body;
            self.header.bump_sequence();

            region = chain.current();
            descriptor = region.descriptor();
            let used = descriptor
                .used
                .load(std::sync::atomic::Ordering::Acquire) as usize;
            aligned = align_up(used, align);
            new_used = aligned + size;
        }

        descriptor
            .used
            .store(new_used as u64, std::sync::atomic::Ordering::Release);

        // SAFETY: aligned + size <= mapping length, checked above.
        let ptr = unsafe { region.shm.data().add(aligned) };
        Ok(NonNull::new(ptr).expect("mapping base is never null"))
    }

    /// Resolve a pointer to `(region_id, offset)`. Used at registration
    /// time only; linear in the number of regions.
    pub(crate) fn get_location(&self, ptr: *const u8) -> Option<(u64, u64)> {
        let chain = self.chain.lock();
        for region in &chain.regions {
            let base = region.shm.data() as usize;
            let p = ptr as usize;
            if p >= base && p < base + region.shm.len() {
                return Some((region.id, (p - base) as u64));
            }
        }
        None
    }

    /// Base address of a mapped region, by id.
    pub(crate) fn get_region_data(&self, region_id: u64) -> Option<*mut u8> {
        let chain = self.chain.lock();
        chain
            .regions
            .iter()
            .find(|r| r.id == region_id)
            .map(|r| r.shm.data())
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Body size for the region that absorbs a `size`-byte allocation the
/// current region could not hold.
fn grow_size(size: usize, align: usize, current: usize, max: usize) -> usize {
    (size + align).max(current.saturating_mul(2)).min(max)
}
