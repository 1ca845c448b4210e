//! memglass: live introspection of producer memory over shared memory.
//!
//! A *producer* process exposes named, typed objects residing in its own
//! memory; out-of-process *observers* attach by session name, discover the
//! schema, and read field values directly while the producer keeps mutating
//! them. Reads are sub-millisecond and the fast path involves no
//! coordination at all: the producer release-publishes, observers
//! acquire-read, and a header sequence counter tells observers when to
//! re-walk the structure.
//!
//! # Session Anatomy
//!
//! ```text
//! ┌──────────────────────┐   first_region_id   ┌─────────────────────┐
//! │  header region       │ ──────────────────► │  data region 1      │
//! │  mg.<S>.hdr          │                     │  mg.<S>.r.1         │──► r.2 ─► …
//! │  ├─ TelemetryHeader  │                     │  (object payloads)  │
//! │  ├─ object directory │  first_overflow_id  └─────────────────────┘
//! │  ├─ type registry    │ ──────────────────► ┌─────────────────────┐
//! │  └─ field entries    │                     │  overflow region 1  │──► o.2 ─► …
//! └──────────────────────┘                     │  mg.<S>.o.1         │
//!                                              │  (metadata spill)   │
//!                                              └─────────────────────┘
//! ```
//!
//! # Producer
//!
//! ```no_run
//! use memglass::{Atomicity, Config, Context, FieldDef, Primitive};
//!
//! # fn main() -> memglass::Result<()> {
//! let ctx = Context::create("fxcore", Config::default())?;
//!
//! let quote = ctx.register_type("Quote", 16, &[
//!     FieldDef::new("bid", Primitive::Float64, 0, Atomicity::Atomic),
//!     FieldDef::new("ask", Primitive::Float64, 8, Atomicity::Atomic),
//! ])?;
//!
//! let storage = ctx.allocate(16, 8)?;
//! ctx.register_object(storage.as_ptr(), quote, "eurusd")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Observer
//!
//! ```no_run
//! # fn main() -> memglass::Result<()> {
//! let mut obs = memglass::Observer::connect("fxcore")?;
//! obs.refresh()?;
//! for obj in obs.objects() {
//!     if let Some(view) = obs.get(obj) {
//!         println!("{} bid={:?}", obj.label, view.field("bid").and_then(|f| f.as_f64()));
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The session is lifetime-bound to the producer: dropping the [`Context`]
//! unbinds every region name. There is exactly one writer per session; any
//! number of observers may attach and detach freely.

#![forbid(unsafe_op_in_unsafe_fn)]

mod config;
mod context;
mod error;
pub mod layout;
mod metadata;
mod object;
mod observer;
mod region;
mod seqlock;
mod shm;
mod types;

pub use config::Config;
pub use context::Context;
pub use error::{Error, Result};
pub use layout::{Atomicity, ObjectState};
pub use object::ObjectHandle;
pub use observer::{
    FieldProxy, FieldValue, ObjectView, ObservedField, ObservedObject, ObservedType, Observer,
};
pub use seqlock::Seqlock;
pub use shm::{SharedMemory, MAX_SESSION_NAME_LEN};
pub use types::{FieldDef, Primitive, FIRST_COMPOSITE_TYPE_ID};
