//! Bolero fuzzer for the metadata pool spill logic.
//!
//! Properties tested:
//! - Pool counts never exceed capacities
//! - Header pools fill before single-entry kinds spill into overflow
//! - Every successful allocation publishes (sequence moves)
//! - Field runs stay contiguous in one pool, and the producer's virtual
//!   index resolves back to the same slot the observer way
//! - Oversized field runs fail with RequestTooLarge without publishing

use bolero::check;
use memglass_fuzz::pool_model::{execute_and_verify, PoolOp};

fn main() {
    check!()
        .with_type::<([u32; 3], [u32; 3], Vec<(u8, u32)>)>()
        .for_each(|(header_caps, overflow_caps, ops_data)| {
            let ops: Vec<PoolOp> = ops_data
                .iter()
                .map(|(kind, n)| match kind % 3 {
                    0 => PoolOp::AllocObject,
                    1 => PoolOp::AllocType,
                    _ => PoolOp::AllocFields { n: *n },
                })
                .collect();

            if let Err(e) = execute_and_verify(*header_caps, *overflow_caps, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

#[cfg(test)]
mod tests {
    use memglass_fuzz::pool_model::{execute_and_verify, PoolOp};

    #[test]
    fn fuzz_pools_basic() {
        let ops = vec![
            PoolOp::AllocType,
            PoolOp::AllocFields { n: 2 },
            PoolOp::AllocObject,
            PoolOp::AllocObject,
            PoolOp::AllocFields { n: 7 },
        ];
        execute_and_verify([4, 2, 8], [8, 8, 8], &ops).unwrap();
    }

    #[test]
    fn fuzz_pools_forced_spill() {
        // Two header object slots, then a long tail through overflow.
        let ops: Vec<PoolOp> = (0..100).map(|_| PoolOp::AllocObject).collect();
        execute_and_verify([2, 2, 2], [7, 7, 7], &ops).unwrap();
    }

    #[test]
    fn fuzz_pools_field_runs_across_regions() {
        // Mixed run lengths exercise the virtual-index round trip in every
        // pool of the chain.
        let ops: Vec<PoolOp> = (0..40)
            .map(|i| PoolOp::AllocFields { n: (i % 5) + 1 })
            .collect();
        execute_and_verify([3, 3, 6], [4, 4, 9], &ops).unwrap();
    }

    #[test]
    fn fuzz_pools_oversized_run() {
        let ops = vec![
            PoolOp::AllocFields { n: 40 },
            PoolOp::AllocFields { n: 3 },
        ];
        execute_and_verify([0, 0, 4], [4, 4, 8], &ops).unwrap();
    }
}
