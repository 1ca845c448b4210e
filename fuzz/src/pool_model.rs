//! In-memory model of the metadata pools for property testing.
//!
//! Mirrors the header-then-overflow allocation order, the contiguous field
//! runs, and the virtual field index that observers resolve by walking the
//! pools by capacity.

/// The three entry kinds sharing the spill machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Object,
    Type,
    Field,
}

impl EntryKind {
    fn index(self) -> usize {
        match self {
            EntryKind::Object => 0,
            EntryKind::Type => 1,
            EntryKind::Field => 2,
        }
    }
}

/// `(capacity, count)` of one pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolModel {
    pub capacity: u32,
    pub count: u32,
}

impl PoolModel {
    fn new(capacity: u32) -> Self {
        Self { capacity, count: 0 }
    }

    fn take(&mut self, n: u32) -> Option<u32> {
        let slot = self.count;
        if slot.checked_add(n)? > self.capacity {
            return None;
        }
        self.count += n;
        Some(slot)
    }
}

/// Where an allocation landed: pool 0 is the header, pool `k >= 1` is the
/// `k`-th overflow region in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub pool: usize,
    pub slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    RequestTooLarge,
}

/// Model of the header pools plus the overflow chain.
pub struct MetadataModel {
    header: [PoolModel; 3],
    overflow_caps: [u32; 3],
    overflows: Vec<[PoolModel; 3]>,
    /// Mirrors `header.sequence`: bumped once per overflow creation and once
    /// per published entry batch.
    pub sequence: u64,
}

impl MetadataModel {
    pub fn new(header_caps: [u32; 3], overflow_caps: [u32; 3]) -> Self {
        Self {
            header: [
                PoolModel::new(header_caps[0]),
                PoolModel::new(header_caps[1]),
                PoolModel::new(header_caps[2]),
            ],
            overflow_caps,
            overflows: Vec::new(),
            sequence: 0,
        }
    }

    /// Mirror of the three `MetadataManager` allocators; `n > 1` only makes
    /// sense for [`EntryKind::Field`].
    pub fn allocate(&mut self, kind: EntryKind, n: u32) -> Result<Placement, AllocError> {
        assert!(n >= 1);
        let k = kind.index();

        if let Some(slot) = self.header[k].take(n) {
            self.sequence += 1;
            return Ok(Placement { pool: 0, slot });
        }

        if let Some(last) = self.overflows.last_mut() {
            if let Some(slot) = last[k].take(n) {
                self.sequence += 1;
                return Ok(Placement {
                    pool: self.overflows.len(),
                    slot,
                });
            }
        }

        if n > self.overflow_caps[k] {
            return Err(AllocError::RequestTooLarge);
        }

        self.overflows.push([
            PoolModel::new(self.overflow_caps[0]),
            PoolModel::new(self.overflow_caps[1]),
            PoolModel::new(self.overflow_caps[2]),
        ]);
        self.sequence += 1; // overflow creation is published

        let last = self.overflows.last_mut().expect("just pushed");
        let slot = last[k].take(n).expect("fresh overflow fits the run");
        self.sequence += 1;
        Ok(Placement {
            pool: self.overflows.len(),
            slot,
        })
    }

    /// Producer-side virtual index of a field placement: pools are counted
    /// by capacity in chain order.
    pub fn field_virtual_index(&self, placement: Placement) -> u32 {
        let k = EntryKind::Field.index();
        if placement.pool == 0 {
            return placement.slot;
        }
        let mut base = self.header[k].capacity;
        base += (placement.pool as u32 - 1) * self.overflow_caps[k];
        base + placement.slot
    }

    /// Observer-side resolution: subtract pool capacities along the chain
    /// until the index lands, then demand the run be fully published.
    pub fn resolve_field_run(&self, virtual_index: u32, n: u32) -> Option<Placement> {
        let k = EntryKind::Field.index();
        let mut pools = Vec::with_capacity(1 + self.overflows.len());
        pools.push(self.header[k]);
        pools.extend(self.overflows.iter().map(|pools| pools[k]));

        let mut base = 0u32;
        for (pool_index, pool) in pools.iter().enumerate() {
            if virtual_index >= base && virtual_index < base + pool.capacity {
                let slot = virtual_index - base;
                if slot + n <= pool.count {
                    return Some(Placement {
                        pool: pool_index,
                        slot,
                    });
                }
                return None;
            }
            base += pool.capacity;
        }
        None
    }

    pub fn header_pools(&self) -> &[PoolModel; 3] {
        &self.header
    }

    pub fn overflows(&self) -> &[[PoolModel; 3]] {
        &self.overflows
    }

    /// Invariants that must hold after every operation.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (k, pool) in self.header.iter().enumerate() {
            if pool.count > pool.capacity {
                return Err(format!("header pool {k} overran its capacity"));
            }
        }
        for (region, pools) in self.overflows.iter().enumerate() {
            for (k, pool) in pools.iter().enumerate() {
                if pool.count > pool.capacity {
                    return Err(format!("overflow {region} pool {k} overran its capacity"));
                }
                if pool.capacity != self.overflow_caps[k] {
                    return Err(format!("overflow {region} pool {k} has a foreign capacity"));
                }
            }
        }
        // Single-entry kinds only ever spill once the header pool is full.
        for kind in [EntryKind::Object, EntryKind::Type] {
            let k = kind.index();
            let spilled: u32 = self.overflows.iter().map(|pools| pools[k].count).sum();
            if spilled > 0 && self.header[k].count < self.header[k].capacity {
                return Err(format!(
                    "kind {kind:?} spilled while the header pool had room"
                ));
            }
        }
        Ok(())
    }
}

/// One fuzzed operation against the pools.
#[derive(Debug, Clone, Copy)]
pub enum PoolOp {
    AllocObject,
    AllocType,
    AllocFields { n: u32 },
}

/// Run an operation sequence and verify every invariant after each step.
pub fn execute_and_verify(
    header_caps: [u32; 3],
    overflow_caps: [u32; 3],
    ops: &[PoolOp],
) -> Result<(), String> {
    let header_caps = header_caps.map(|c| c % 32);
    let overflow_caps = overflow_caps.map(|c| c % 32 + 1);
    let mut model = MetadataModel::new(header_caps, overflow_caps);

    for op in ops {
        let sequence_before = model.sequence;
        let (kind, n) = match *op {
            PoolOp::AllocObject => (EntryKind::Object, 1),
            PoolOp::AllocType => (EntryKind::Type, 1),
            PoolOp::AllocFields { n } => (EntryKind::Field, n % 48 + 1),
        };

        match model.allocate(kind, n) {
            Ok(placement) => {
                if model.sequence <= sequence_before {
                    return Err("publication did not move the sequence".to_owned());
                }
                if kind == EntryKind::Field {
                    // The producer's virtual index and the observer's
                    // resolution must agree on the placement.
                    let virtual_index = model.field_virtual_index(placement);
                    if model.resolve_field_run(virtual_index, n) != Some(placement) {
                        return Err(format!(
                            "virtual index {virtual_index} did not resolve back to {placement:?}"
                        ));
                    }
                }
            }
            Err(AllocError::RequestTooLarge) => {
                if kind != EntryKind::Field {
                    return Err("single-entry allocation reported RequestTooLarge".to_owned());
                }
                if n <= overflow_caps[2] {
                    return Err(format!(
                        "run of {n} rejected although overflow holds {}",
                        overflow_caps[2]
                    ));
                }
                if model.sequence != sequence_before {
                    return Err("failed request must not publish".to_owned());
                }
            }
        }

        model.check_invariants()?;
    }
    Ok(())
}
