//! Region growth and metadata overflow behaviour.

use std::sync::atomic::{AtomicUsize, Ordering};

use memglass::{Atomicity, Config, Context, Error, FieldDef, Observer, Primitive};

static SESSION_ID: AtomicUsize = AtomicUsize::new(0);

fn unique_session(tag: &str) -> String {
    format!(
        "grow-{}-{}-{}",
        std::process::id(),
        tag,
        SESSION_ID.fetch_add(1, Ordering::SeqCst)
    )
}

fn counter_type(ctx: &Context) -> u32 {
    ctx.register_type(
        "Counter",
        8,
        &[FieldDef::new("value", Primitive::UInt64, 0, Atomicity::Atomic)],
    )
    .unwrap()
}

#[test]
fn oversized_allocation_grows_a_single_region() {
    let session = unique_session("big");
    let config = Config::default()
        .with_initial_region_size(4096)
        .with_max_region_size(16 << 20);
    let ctx = Context::create(&session, config).unwrap();

    let seq_before = ctx.sequence();
    let size = 10 << 20;
    let ptr = ctx.allocate(size, 8).unwrap();
    assert!(ctx.sequence() > seq_before, "growth is published");

    // The whole payload is usable.
    // SAFETY: `size` bytes were just allocated at `ptr`.
    unsafe {
        ptr.as_ptr().write(0xA5);
        ptr.as_ptr().add(size - 1).write(0x5A);
    }
}

#[test]
fn allocation_beyond_max_region_size_fails() {
    let session = unique_session("cap");
    let config = Config::default()
        .with_initial_region_size(4096)
        .with_max_region_size(64 * 1024);
    let ctx = Context::create(&session, config).unwrap();

    assert!(matches!(
        ctx.allocate(1 << 20, 8),
        Err(Error::OutOfSpace { .. })
    ));

    // Telemetry failure is not fatal: the session keeps working.
    let ptr = ctx.allocate(64, 8).unwrap();
    assert!(!ptr.as_ptr().is_null());
}

#[test]
fn small_allocations_walk_the_doubling_chain() {
    let session = unique_session("chain");
    let config = Config::default()
        .with_initial_region_size(4096)
        .with_max_region_size(1 << 20);
    let ctx = Context::create(&session, config).unwrap();

    // Far more than one initial region's worth of 512-byte allocations.
    let mut pointers = Vec::new();
    for _ in 0..256 {
        pointers.push(ctx.allocate(512, 8).unwrap());
    }
    pointers.sort_by_key(|p| p.as_ptr() as usize);
    pointers.dedup_by_key(|p| p.as_ptr() as usize);
    assert_eq!(pointers.len(), 256, "allocations never alias");
}

#[test]
fn object_registrations_spill_into_overflow_regions() {
    let session = unique_session("spill");
    let config = Config::default()
        .with_header_object_capacity(32)
        .with_header_type_capacity(8)
        .with_header_field_capacity(64)
        .with_overflow_region_size(16 * 1024);
    let ctx = Context::create(&session, config).unwrap();
    let counter = counter_type(&ctx);

    let total = 200u32;
    let seq_before = ctx.sequence();
    for i in 0..total {
        let ptr = ctx.allocate(8, 8).unwrap();
        ctx.register_object(ptr.as_ptr(), counter, &format!("counter-{i}"))
            .unwrap();
    }

    assert_eq!(ctx.object_entry_count(), total);
    assert!(
        ctx.sequence() >= seq_before + total as u64,
        "one publication per registration plus overflow creations"
    );

    let mut obs = Observer::connect(&session).unwrap();
    obs.refresh().unwrap();
    assert_eq!(obs.objects().len(), total as usize, "header + overflow union");

    let mut labels: Vec<_> = obs.objects().iter().map(|o| o.label.clone()).collect();
    labels.sort();
    labels.dedup();
    assert_eq!(labels.len(), total as usize);
}

#[test]
fn type_registrations_spill_and_resolve_across_pools() {
    // Tiny header pools force both type and field entries into overflow;
    // observers must still resolve every field list through the virtual
    // index.
    let session = unique_session("types");
    let config = Config::default()
        .with_header_type_capacity(2)
        .with_header_field_capacity(5)
        .with_overflow_region_size(16 * 1024);
    let ctx = Context::create(&session, config).unwrap();

    let total = 12;
    for i in 0..total {
        ctx.register_type(
            &format!("Pair{i}"),
            16,
            &[
                FieldDef::new("first", Primitive::UInt64, 0, Atomicity::Atomic),
                FieldDef::new("second", Primitive::UInt64, 8, Atomicity::Atomic),
            ],
        )
        .unwrap();
    }

    let mut obs = Observer::connect(&session).unwrap();
    obs.refresh().unwrap();
    assert_eq!(obs.types().len(), total);
    for ty in obs.types() {
        assert_eq!(ty.fields.len(), 2, "{} lost its fields", ty.name);
        assert_eq!(ty.fields[0].name, "first");
        assert_eq!(ty.fields[1].name, "second");
    }
}

#[test]
fn field_run_too_large_for_any_pool_is_rejected() {
    let session = unique_session("toolarge");
    let config = Config::default()
        .with_header_field_capacity(4)
        .with_overflow_region_size(4096);
    let ctx = Context::create(&session, config).unwrap();

    // 4096-byte overflow regions hold well under 64 field entries.
    let fields: Vec<String> = (0..64).map(|i| format!("f{i}")).collect();
    let defs: Vec<FieldDef<'_>> = fields
        .iter()
        .enumerate()
        .map(|(i, name)| FieldDef::new(name, Primitive::UInt64, (i * 8) as u32, Atomicity::None))
        .collect();

    assert!(matches!(
        ctx.register_type("Wide", 512, &defs),
        Err(Error::RequestTooLarge { .. })
    ));

    // A modest type still registers afterwards.
    assert!(counter_type(&ctx) >= 100);
}

#[test]
fn objects_in_grown_regions_are_readable() {
    // An object landing in region 2+ must come back with the right region
    // id and be readable once the observer maps the grown chain.
    let session = unique_session("late");
    let config = Config::default()
        .with_initial_region_size(4096)
        .with_max_region_size(1 << 20);
    let ctx = Context::create(&session, config).unwrap();
    let counter = counter_type(&ctx);

    let mut obs = Observer::connect(&session).unwrap();
    obs.refresh().unwrap();

    // Exhaust region 1 (one page, minus its descriptor), then place the
    // object of interest in the grown region.
    ctx.allocate(7000, 8).unwrap();
    let ptr = ctx.allocate(2000, 8).unwrap();
    ctx.register_object(ptr.as_ptr(), counter, "late").unwrap();
    // SAFETY: 1024 session bytes at 8-byte alignment.
    unsafe { (ptr.as_ptr() as *mut u64).write(4242) };

    obs.refresh().unwrap();
    let obj = obs
        .objects()
        .iter()
        .find(|o| o.label == "late")
        .expect("late object discovered")
        .clone();
    assert!(obj.region_id >= 1);

    let view = obs.get(&obj).unwrap();
    assert_eq!(view.field("value").unwrap().as_u64(), Some(4242));
}
