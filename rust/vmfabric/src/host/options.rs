use serde::{Deserialize, Serialize};
use vmfabric_common::{Result, verify_arg};
use vmfabric_page_alloc::mmap;

/// Configuration of a [`HostDriver`](super::HostDriver).
///
/// Deserializable from JSON; absent fields take their defaults:
///
/// ```json
/// { "device_count": 4, "granularity": 65536, "device_memory": 1073741824 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostDriverOptions {
    /// Number of emulated devices.
    pub device_count: usize,
    /// Allocation granularity reported for every device, in bytes. A power of two
    /// and a multiple of the OS page size.
    pub granularity: usize,
    /// Physical memory capacity of each device, in bytes.
    pub device_memory: u64,
}

impl Default for HostDriverOptions {
    fn default() -> Self {
        HostDriverOptions {
            device_count: 8,
            granularity: mmap::get_large_page_size(),
            device_memory: 16 * 1024 * 1024 * 1024,
        }
    }
}

impl HostDriverOptions {
    pub fn with_device_count(mut self, device_count: usize) -> Self {
        self.device_count = device_count;
        self
    }

    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_device_memory(mut self, device_memory: u64) -> Self {
        self.device_memory = device_memory;
        self
    }

    pub fn validate(&self) -> Result<()> {
        verify_arg!(device_count, self.device_count > 0);
        verify_arg!(device_count, self.device_count <= u32::MAX as usize);
        verify_arg!(granularity, self.granularity.is_power_of_two());
        verify_arg!(
            granularity,
            self.granularity.is_multiple_of(mmap::get_page_size())
        );
        Ok(())
    }
}
