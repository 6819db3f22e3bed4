//! The seam between the fabric and a device memory driver.

use vmfabric_common::Result;

use crate::{
    handles::{AllocationHandle, DeviceOrdinal, VirtualAddress},
    token::TransferableToken,
};

/// Free and total physical memory of one device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free: u64,
    pub total: u64,
}

/// Low-level virtual memory management calls, one per driver step.
///
/// Every method reports failures of the underlying driver or OS primitive as
/// `ErrorKind::Driver`. Implementations do not validate caller preconditions
/// beyond what is needed to keep their own state consistent; argument checks
/// belong to [`crate::VirtualMemoryFabric`].
///
/// Allocations are created pinned to one device and shareable through POSIX file
/// descriptors. A freshly mapped span is inaccessible until
/// [`mem_set_access`](Self::mem_set_access) grants read/write access to a device.
pub trait DeviceDriver: Send + Sync {
    fn device_count(&self) -> usize;

    /// Recommended allocation granularity of `device`. Reservation sizes,
    /// allocation sizes and mapping offsets are multiples of it.
    fn granularity(&self, device: DeviceOrdinal) -> Result<usize>;

    fn memory_info(&self, device: DeviceOrdinal) -> Result<MemoryInfo>;

    /// Reserves `size` bytes of virtual address space for `device`.
    fn address_reserve(&self, device: DeviceOrdinal, size: usize) -> Result<VirtualAddress>;

    /// Returns a reservation made by [`address_reserve`](Self::address_reserve).
    /// Fails while any span of it is still mapped.
    fn address_free(&self, address: VirtualAddress, size: usize) -> Result<()>;

    /// Creates a physical allocation of `size` bytes on `device`.
    fn mem_create(&self, device: DeviceOrdinal, size: usize) -> Result<AllocationHandle>;

    /// Maps the first `size` bytes of `handle` at `address`.
    fn mem_map(&self, address: VirtualAddress, size: usize, handle: AllocationHandle)
    -> Result<()>;

    /// Grants `device` read/write access to a mapped span.
    fn mem_set_access(
        &self,
        address: VirtualAddress,
        size: usize,
        device: DeviceOrdinal,
    ) -> Result<()>;

    /// Unmaps exactly the span established by one [`mem_map`](Self::mem_map) call.
    fn mem_unmap(&self, address: VirtualAddress, size: usize) -> Result<()>;

    /// Drops a handle. The physical memory outlives it while other handles or
    /// mappings still refer to it.
    fn mem_release(&self, handle: AllocationHandle) -> Result<()>;

    fn export_shareable(&self, handle: AllocationHandle) -> Result<TransferableToken>;

    fn import_shareable(&self, token: &TransferableToken) -> Result<AllocationHandle>;
}
