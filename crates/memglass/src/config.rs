//! Session configuration.

/// Sizing knobs for a producer session.
///
/// The defaults suit short-lived diagnostic sessions: the header pools hold
/// the typical object population without ever spilling into overflow
/// regions, and data regions double from 1 MiB up to the cap.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the first data region's body, excluding its descriptor.
    pub initial_region_size: usize,
    /// Upper bound on any single data region.
    pub max_region_size: usize,
    /// Size of each metadata overflow region.
    pub overflow_region_size: usize,
    /// Object-entry slots reserved inside the header region.
    pub header_object_capacity: u32,
    /// Type-entry slots reserved inside the header region.
    pub header_type_capacity: u32,
    /// Field-entry slots reserved inside the header region.
    pub header_field_capacity: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_region_size: 1 << 20,
            max_region_size: 256 << 20,
            overflow_region_size: 1 << 20,
            header_object_capacity: 1024,
            header_type_capacity: 256,
            header_field_capacity: 4096,
        }
    }
}

impl Config {
    pub fn with_initial_region_size(mut self, bytes: usize) -> Self {
        self.initial_region_size = bytes;
        self
    }

    pub fn with_max_region_size(mut self, bytes: usize) -> Self {
        self.max_region_size = bytes;
        self
    }

    pub fn with_overflow_region_size(mut self, bytes: usize) -> Self {
        self.overflow_region_size = bytes;
        self
    }

    pub fn with_header_object_capacity(mut self, slots: u32) -> Self {
        self.header_object_capacity = slots;
        self
    }

    pub fn with_header_type_capacity(mut self, slots: u32) -> Self {
        self.header_type_capacity = slots;
        self
    }

    pub fn with_header_field_capacity(mut self, slots: u32) -> Self {
        self.header_field_capacity = slots;
        self
    }
}
