//! End-to-end producer/observer scenarios over real shared memory.
//!
//! Every test runs against its own uniquely named session so the suite can
//! run in parallel and leftover names from a crashed run never collide.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use memglass::{
    Atomicity, Config, Context, Error, FieldDef, Observer, Primitive, Seqlock,
};

static SESSION_ID: AtomicUsize = AtomicUsize::new(0);

fn unique_session(tag: &str) -> String {
    format!(
        "e2e-{}-{}-{}",
        std::process::id(),
        tag,
        SESSION_ID.fetch_add(1, Ordering::SeqCst)
    )
}

/// The canonical test payload: two atomically published f64 bit patterns.
#[repr(C)]
struct Quote {
    bid: AtomicU64,
    ask: AtomicU64,
}

fn register_quote_type(ctx: &Context) -> u32 {
    ctx.register_type(
        "Quote",
        core::mem::size_of::<Quote>() as u32,
        &[
            FieldDef::new("bid", Primitive::Float64, 0, Atomicity::Atomic),
            FieldDef::new("ask", Primitive::Float64, 8, Atomicity::Atomic),
        ],
    )
    .unwrap()
}

#[test]
fn quote_discovery_and_typed_reads() {
    let session = unique_session("quote");
    let config = Config::default().with_initial_region_size(4096);
    let ctx = Context::create(&session, config).unwrap();

    let quote_type = register_quote_type(&ctx);
    assert_eq!(quote_type, 100, "first composite id");

    // SAFETY: Quote is all atomics; zeroed is valid.
    let quote: &Quote = unsafe { ctx.allocate_zeroed().unwrap() };
    ctx.register_value(quote, quote_type, "eurusd").unwrap();

    quote.bid.store(1.10f64.to_bits(), Ordering::Release);
    quote.ask.store(1.11f64.to_bits(), Ordering::Release);

    let mut obs = Observer::connect(&session).unwrap();
    obs.refresh().unwrap();

    assert_eq!(obs.producer_pid(), std::process::id() as u64);
    assert_eq!(obs.objects().len(), 1);

    let obj = obs.objects()[0].clone();
    assert_eq!(obj.label, "eurusd");
    assert_eq!(obj.type_name, "Quote");
    assert_eq!(obj.generation, 1);

    // The registered field list comes back with the same names, offsets,
    // sizes, and atomicity, in order.
    let ty = obs.types().iter().find(|t| t.name == "Quote").unwrap();
    assert_eq!(ty.size, 16);
    let summary: Vec<_> = ty
        .fields
        .iter()
        .map(|f| (f.name.as_str(), f.offset, f.size, f.atomicity))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("bid", 0, 8, Atomicity::Atomic),
            ("ask", 8, 8, Atomicity::Atomic),
        ]
    );

    let view = obs.get(&obj).unwrap();
    assert_eq!(view.field("bid").unwrap().as_f64(), Some(1.10));
    assert_eq!(view.field("ask").unwrap().as_f64(), Some(1.11));
    assert!(view.field("mid").is_none(), "unknown field name");
}

#[test]
fn observer_before_first_object_sees_empty_session() {
    let session = unique_session("empty");
    let ctx = Context::create(&session, Config::default()).unwrap();

    let mut obs = Observer::connect(&session).unwrap();
    obs.refresh().unwrap();

    assert!(obs.objects().is_empty());
    assert!(obs.types().is_empty());
    assert_ne!(obs.producer_pid(), 0);

    drop(ctx);
}

#[test]
fn connect_to_missing_session_fails() {
    let session = unique_session("nosuch");
    assert!(matches!(
        Observer::connect(&session),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn destroyed_object_leaves_discovery_but_type_stays() {
    let session = unique_session("destroy");
    let ctx = Context::create(&session, Config::default()).unwrap();
    let quote_type = register_quote_type(&ctx);

    let quote: &Quote = unsafe { ctx.allocate_zeroed().unwrap() };
    let handle = ctx.register_value(quote, quote_type, "eurusd").unwrap();

    let mut obs = Observer::connect(&session).unwrap();
    obs.refresh().unwrap();
    assert_eq!(obs.objects().len(), 1);

    let seq_before = ctx.sequence();
    ctx.destroy_object(handle);
    assert!(ctx.sequence() > seq_before, "destruction is published");

    obs.refresh().unwrap();
    assert!(obs.objects().is_empty());
    assert!(obs.types().iter().any(|t| t.name == "Quote"));

    // Destroying a stale handle is a no-op.
    ctx.destroy_object(handle);
}

#[test]
fn find_object_matches_alive_labels_exactly() {
    let session = unique_session("find");
    let ctx = Context::create(&session, Config::default()).unwrap();
    let quote_type = register_quote_type(&ctx);

    let a: &Quote = unsafe { ctx.allocate_zeroed().unwrap() };
    let b: &Quote = unsafe { ctx.allocate_zeroed().unwrap() };
    ctx.register_value(a, quote_type, "eurusd").unwrap();
    let gbp = ctx.register_value(b, quote_type, "gbpusd").unwrap();

    assert_eq!(ctx.find_object("eurusd").unwrap().label(), "eurusd");
    assert!(ctx.find_object("eur").is_none(), "prefix does not match");
    assert!(ctx.find_object("EURUSD").is_none(), "comparison is exact");

    ctx.destroy_object(gbp);
    assert!(ctx.find_object("gbpusd").is_none(), "destroyed is excluded");
}

#[test]
fn register_foreign_pointer_is_not_in_session() {
    let session = unique_session("foreign");
    let ctx = Context::create(&session, Config::default()).unwrap();
    let quote_type = register_quote_type(&ctx);

    let outside = 0u64;
    assert!(matches!(
        ctx.register_object(&outside as *const u64 as *const u8, quote_type, "stray"),
        Err(Error::NotInSession)
    ));
}

#[test]
fn two_observers_see_identical_snapshots() {
    let session = unique_session("pair");
    let ctx = Context::create(&session, Config::default()).unwrap();
    let quote_type = register_quote_type(&ctx);

    for label in ["eurusd", "gbpusd", "usdjpy"] {
        let q: &Quote = unsafe { ctx.allocate_zeroed().unwrap() };
        ctx.register_value(q, quote_type, label).unwrap();
    }

    let mut first = Observer::connect(&session).unwrap();
    let mut second = Observer::connect(&session).unwrap();
    first.refresh().unwrap();
    second.refresh().unwrap();

    assert_eq!(first.objects(), second.objects());
    assert_eq!(first.types(), second.types());
    assert_eq!(first.sequence(), second.sequence());
}

#[test]
fn refresh_is_idempotent_while_producer_is_idle() {
    let session = unique_session("idem");
    let ctx = Context::create(&session, Config::default()).unwrap();
    let quote_type = register_quote_type(&ctx);
    let q: &Quote = unsafe { ctx.allocate_zeroed().unwrap() };
    ctx.register_value(q, quote_type, "eurusd").unwrap();

    let mut obs = Observer::connect(&session).unwrap();
    obs.refresh().unwrap();
    let objects = obs.objects().to_vec();
    let types = obs.types().to_vec();
    let sequence = obs.sequence();

    obs.refresh().unwrap();
    assert_eq!(obs.objects(), objects.as_slice());
    assert_eq!(obs.types(), types.as_slice());
    assert_eq!(obs.sequence(), sequence);
}

#[test]
fn observed_sequence_is_monotonic() {
    let session = unique_session("seq");
    let ctx = Context::create(&session, Config::default()).unwrap();
    let quote_type = register_quote_type(&ctx);

    let mut obs = Observer::connect(&session).unwrap();
    let mut last = {
        obs.refresh().unwrap();
        obs.sequence()
    };

    for i in 0..20 {
        let q: &Quote = unsafe { ctx.allocate_zeroed().unwrap() };
        let handle = ctx.register_value(q, quote_type, &format!("pair-{i}")).unwrap();
        if i % 3 == 0 {
            ctx.destroy_object(handle);
        }
        obs.refresh().unwrap();
        assert!(obs.sequence() >= last);
        last = obs.sequence();
    }
}

#[test]
fn seqlock_fields_never_decode_torn_values() {
    #[repr(C)]
    struct Ticker {
        price: Seqlock<f64>,
    }

    let session = unique_session("seqlock");
    let ctx = Context::create(&session, Config::default()).unwrap();
    let ticker_type = ctx
        .register_type(
            "Ticker",
            core::mem::size_of::<Ticker>() as u32,
            &[FieldDef::new(
                "price",
                Primitive::Float64,
                Seqlock::<f64>::value_offset(),
                Atomicity::Seqlock,
            )],
        )
        .unwrap();

    // SAFETY: a zeroed seqlock cell is valid.
    let ticker: &Ticker = unsafe { ctx.allocate_zeroed().unwrap() };
    let handle = ctx.register_value(ticker, ticker_type, "ticker").unwrap();

    let mut obs = Observer::connect(&session).unwrap();
    obs.refresh().unwrap();
    let obj = obs.objects()[0].clone();

    // Writer alternates between two values; every observed decode must be
    // one of them (or unavailable while a write is in flight), never a mix
    // of their bytes.
    let stop = AtomicU64::new(0);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            while stop.load(Ordering::Relaxed) == 0 {
                ticker.price.write(1.25);
                ticker.price.write(2.5);
            }
        });

        let view = obs.get(&obj).unwrap();
        let mut observed = 0u32;
        for _ in 0..200_000 {
            if let Some(price) = view.field("price").unwrap().as_f64() {
                assert!(
                    price == 0.0 || price == 1.25 || price == 2.5,
                    "torn seqlock read: {price}"
                );
                observed += 1;
            }
        }
        assert!(observed > 0, "seqlock reads never became available");
        stop.store(1, Ordering::Relaxed);
    });

    ctx.destroy_object(handle);
}

#[test]
fn locked_fields_read_as_unavailable() {
    let session = unique_session("locked");
    let ctx = Context::create(&session, Config::default()).unwrap();
    let ty = ctx
        .register_type(
            "Guarded",
            16,
            &[
                FieldDef::new("open", Primitive::UInt64, 0, Atomicity::None),
                FieldDef::new("guarded", Primitive::UInt64, 8, Atomicity::Locked),
            ],
        )
        .unwrap();

    let ptr = ctx.allocate(16, 8).unwrap();
    ctx.register_object(ptr.as_ptr(), ty, "guarded").unwrap();
    // SAFETY: 16 session bytes at 8-byte alignment.
    unsafe {
        (ptr.as_ptr() as *mut u64).write(7);
        (ptr.as_ptr().add(8) as *mut u64).write(9);
    }

    let mut obs = Observer::connect(&session).unwrap();
    obs.refresh().unwrap();
    let obj = obs.objects()[0].clone();
    let view = obs.get(&obj).unwrap();

    assert_eq!(view.field("open").unwrap().as_u64(), Some(7));
    assert!(view.field("guarded").unwrap().load().is_none());
}
