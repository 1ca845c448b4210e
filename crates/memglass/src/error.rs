//! Error type for the telemetry substrate.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by producers and observers.
///
/// Producers should treat [`Error::OutOfSpace`] and [`Error::CapacityExhausted`]
/// as fatal for telemetry but non-fatal for the application: a failed
/// registration never has to abort the process being observed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A shared-memory name is already bound in the OS namespace.
    #[error("shared memory name already exists: {name}")]
    NameExists { name: String },

    /// No shared-memory object is bound to this name.
    #[error("shared memory not found: {name}")]
    NotFound { name: String },

    /// The OS refused access to the shared-memory object.
    #[error("permission denied: {name}")]
    PermissionDenied { name: String },

    /// A region could not be created or grown far enough for the request.
    #[error("out of shared-memory space ({requested} bytes requested)")]
    OutOfSpace { requested: usize },

    /// A metadata pool is full and no overflow region could absorb the entry.
    #[error("metadata pool exhausted: {pool}")]
    CapacityExhausted { pool: &'static str },

    /// A contiguous field-entry run larger than any single overflow region
    /// can hold. This is a hard failure; runs never straddle regions.
    #[error("{count} field entries exceed overflow capacity of {capacity}")]
    RequestTooLarge { count: u32, capacity: u32 },

    /// The pointer passed to `register_object` lies outside every session
    /// region.
    #[error("pointer does not belong to any session region")]
    NotInSession,

    /// The session header carries an unknown magic or version.
    #[error("header version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// The structural view kept changing under the observer across every
    /// retry of `refresh`.
    #[error("snapshot unstable after {retries} refresh attempts")]
    SnapshotUnstable { retries: u32 },

    /// A producer context for this session name is already open in this
    /// process.
    #[error("session already open: {name}")]
    SessionAlreadyOpen { name: String },

    /// The session name is empty, too long, or contains path separators.
    #[error("invalid session name: {reason}")]
    InvalidSessionName { reason: &'static str },

    /// An OS-level mapping failure with no more precise classification.
    #[error("shared memory backing error: {0}")]
    Backing(#[from] shared_memory::ShmemError),
}
