//! Basic example demonstrating a memglass producer.
//!
//! This example shows:
//! - Creating a session context
//! - Registering a composite type with atomic and seqlock fields
//! - Allocating an instance in session memory and registering it
//! - Mutating the live values while observers watch
//!
//! Run with: `cargo run --example basic -p memglass`, then attach an
//! observer to the `fxdemo` session from another process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use memglass::{Atomicity, Config, Context, FieldDef, Primitive, Seqlock};

/// The live object we expose. Zeroed bytes are a valid instance, so it can
/// be placed with `allocate_zeroed`.
#[repr(C)]
struct Quote {
    /// f64 bits, published with release stores.
    bid: AtomicU64,
    /// f64 bits, published with release stores.
    ask: AtomicU64,
    /// Published through the seqlock protocol.
    last_trade: Seqlock<f64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let ctx = Context::create("fxdemo", Config::default())?;

    let last_trade_offset =
        core::mem::offset_of!(Quote, last_trade) as u32 + Seqlock::<f64>::value_offset();
    let quote_type = ctx.register_type(
        "Quote",
        core::mem::size_of::<Quote>() as u32,
        &[
            FieldDef::new("bid", Primitive::Float64, 0, Atomicity::Atomic),
            FieldDef::new("ask", Primitive::Float64, 8, Atomicity::Atomic),
            FieldDef::new(
                "last_trade.value",
                Primitive::Float64,
                last_trade_offset,
                Atomicity::Seqlock,
            ),
        ],
    )?;

    // SAFETY: Quote is all atomics and a seqlock cell; zeroed is valid.
    let quote: &Quote = unsafe { ctx.allocate_zeroed()? };
    ctx.register_value(quote, quote_type, "eurusd")?;

    println!(
        "session '{}' up (pid {}), header region {}",
        ctx.session_name(),
        ctx.producer_pid(),
        ctx.header_region_name()
    );

    let mut bid = 1.1000f64;
    loop {
        bid += 0.0001;
        let ask = bid + 0.0002;
        quote.bid.store(bid.to_bits(), Ordering::Release);
        quote.ask.store(ask.to_bits(), Ordering::Release);
        quote.last_trade.write(bid);
        std::thread::sleep(Duration::from_millis(100));
    }
}
