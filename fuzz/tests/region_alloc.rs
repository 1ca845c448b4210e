//! Bolero fuzzer for the data-region bump allocator.
//!
//! Properties tested:
//! - Allocations are aligned and never overlap the region descriptor
//! - The `used` cursor always covers every allocation and never regresses
//! - Region bodies never exceed the configured cap
//! - Refusal only happens for requests no maximally grown region can hold

use bolero::check;
use memglass_fuzz::region_model::{execute_and_verify, RegionOp};

fn main() {
    check!()
        .with_type::<(u64, u64, Vec<(u64, u8)>)>()
        .for_each(|(initial_body, max_body, ops_data)| {
            let ops: Vec<RegionOp> = ops_data
                .iter()
                .map(|(size, align_pow)| RegionOp::Allocate {
                    size: *size,
                    align_pow: *align_pow,
                })
                .collect();

            if let Err(e) = execute_and_verify(*initial_body, *max_body, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

#[cfg(test)]
mod tests {
    use memglass_fuzz::region_model::{execute_and_verify, RegionOp};

    #[test]
    fn fuzz_region_basic() {
        let ops = vec![
            RegionOp::Allocate { size: 64, align_pow: 3 },
            RegionOp::Allocate { size: 4000, align_pow: 0 },
            RegionOp::Allocate { size: 4000, align_pow: 6 },
            RegionOp::Allocate { size: 1, align_pow: 0 },
        ];
        execute_and_verify(4096, 1 << 20, &ops).unwrap();
    }

    #[test]
    fn fuzz_region_growth_pressure() {
        // Repeated near-region-sized allocations force growth every time.
        let ops: Vec<RegionOp> = (0..64)
            .map(|_| RegionOp::Allocate { size: 4000, align_pow: 3 })
            .collect();
        execute_and_verify(512, 8192, &ops).unwrap();
    }

    #[test]
    fn fuzz_region_degenerate_config() {
        // Cap below the initial size and tiny bodies.
        let ops = vec![
            RegionOp::Allocate { size: 8000, align_pow: 5 },
            RegionOp::Allocate { size: 8000, align_pow: 5 },
        ];
        execute_and_verify(1, 1, &ops).unwrap();
    }
}
