//! Named shared-memory mappings and the session naming scheme.
//!
//! Thin wrapper over the `shared_memory` crate using OS-id naming, so a
//! region created here is visible to any process that knows its name. The
//! producer owns the names it creates (they unlink when the mapping drops);
//! observers open the same names without taking ownership.

use std::ffi::CString;
use std::sync::OnceLock;

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::error::{Error, Result};

/// Longest accepted session name, in bytes.
pub const MAX_SESSION_NAME_LEN: usize = 64;

/// Canonical name of the session header region.
pub(crate) fn header_shm_name(session: &str) -> String {
    format!("mg.{session}.hdr")
}

/// Canonical name of data region `id`.
pub(crate) fn region_shm_name(session: &str, id: u64) -> String {
    format!("mg.{session}.r.{id}")
}

/// Canonical name of overflow region `id`.
pub(crate) fn overflow_shm_name(session: &str, id: u64) -> String {
    format!("mg.{session}.o.{id}")
}

/// Sessions are short UTF-8 names with no path separators; everything
/// OS-visible is derived from them.
pub(crate) fn validate_session_name(session: &str) -> Result<()> {
    if session.is_empty() {
        return Err(Error::InvalidSessionName { reason: "empty" });
    }
    if session.len() > MAX_SESSION_NAME_LEN {
        return Err(Error::InvalidSessionName {
            reason: "longer than 64 bytes",
        });
    }
    if session.bytes().any(|b| b == b'/' || b == b'\\' || b == 0) {
        return Err(Error::InvalidSessionName {
            reason: "contains path separator or NUL",
        });
    }
    Ok(())
}

pub(crate) fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    // SAFETY: sysconf is always safe to call.
    *PAGE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Round `size` up to a whole number of pages, at least one.
pub(crate) fn round_to_page(size: usize) -> usize {
    let page = page_size();
    let size = size.max(1);
    size.div_ceil(page) * page
}

/// A single named, page-aligned shared-memory mapping.
pub struct SharedMemory {
    shmem: Shmem,
    name: String,
}

// SAFETY: the raw mapping pointer is valid for the lifetime of `shmem`, and
// all concurrent access to mapped bytes is governed by the wire protocol's
// atomics; the wrapper itself has no interior mutability.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create and map a new region, leaving `name` bound in the OS
    /// namespace. The mapping is rounded up to a whole number of pages.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let size = round_to_page(size);
        match ShmemConf::new().size(size).os_id(name).create() {
            Ok(shmem) => Ok(Self {
                shmem,
                name: name.to_owned(),
            }),
            Err(ShmemError::MappingIdExists | ShmemError::LinkExists) => Err(Error::NameExists {
                name: name.to_owned(),
            }),
            Err(ShmemError::MapCreateFailed(errno)) => Err(map_errno(errno, name, size)),
            Err(e) => Err(Error::Backing(e)),
        }
    }

    /// Map an existing region by name without taking ownership of it.
    pub fn open(name: &str) -> Result<Self> {
        match ShmemConf::new().os_id(name).open() {
            Ok(shmem) => Ok(Self {
                shmem,
                name: name.to_owned(),
            }),
            Err(ShmemError::LinkDoesNotExist) => Err(Error::NotFound {
                name: name.to_owned(),
            }),
            Err(ShmemError::MapOpenFailed(errno)) => Err(map_errno(errno, name, 0)),
            Err(e) => Err(Error::Backing(e)),
        }
    }

    /// Remove `name` from the OS namespace. Existing mappings survive until
    /// their last close.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| Error::InvalidSessionName {
            reason: "contains NUL",
        })?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if rc == 0 {
            return Ok(());
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ENOENT) => Err(Error::NotFound {
                name: name.to_owned(),
            }),
            Some(libc::EACCES) => Err(Error::PermissionDenied {
                name: name.to_owned(),
            }),
            _ => Err(Error::Backing(ShmemError::UnknownOsError(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32,
            ))),
        }
    }

    /// Base address of the mapping.
    #[inline]
    pub fn data(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shmem.len() == 0
    }

    /// The OS-visible name this mapping was created or opened under.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn map_errno(errno: u32, name: &str, requested: usize) -> Error {
    match errno as i32 {
        libc::ENOENT => Error::NotFound {
            name: name.to_owned(),
        },
        libc::EACCES | libc::EPERM => Error::PermissionDenied {
            name: name.to_owned(),
        },
        libc::ENOSPC | libc::ENOMEM | libc::EMFILE | libc::ENFILE => {
            Error::OutOfSpace { requested }
        }
        libc::EEXIST => Error::NameExists {
            name: name.to_owned(),
        },
        _ => Error::Backing(ShmemError::UnknownOsError(errno)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_ID: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "mg-test.{}.{}.{}",
            std::process::id(),
            tag,
            TEST_ID.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn create_open_roundtrip() {
        let name = unique_name("roundtrip");
        let created = SharedMemory::create(&name, 100).unwrap();
        assert!(created.len() >= page_size());
        assert_eq!(created.len() % page_size(), 0);

        // SAFETY: within the fresh mapping.
        unsafe { *created.data() = 0xAB };

        let opened = SharedMemory::open(&name).unwrap();
        assert_eq!(unsafe { *opened.data() }, 0xAB);
    }

    #[test]
    fn create_twice_is_name_exists() {
        let name = unique_name("dup");
        let _keep = SharedMemory::create(&name, 4096).unwrap();
        assert!(matches!(
            SharedMemory::create(&name, 4096),
            Err(Error::NameExists { .. })
        ));
    }

    #[test]
    fn open_missing_is_not_found() {
        let name = unique_name("missing");
        assert!(matches!(
            SharedMemory::open(&name),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn owner_drop_unbinds_name() {
        let name = unique_name("unlink");
        drop(SharedMemory::create(&name, 4096).unwrap());
        assert!(matches!(
            SharedMemory::open(&name),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn session_name_validation() {
        assert!(validate_session_name("fxcore").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("a/b").is_err());
        assert!(validate_session_name(&"x".repeat(65)).is_err());
    }
}
