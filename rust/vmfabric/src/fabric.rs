//! The virtual memory fabric: reserve, back, share and tear down device
//! address ranges.

use std::sync::Arc;

use vmfabric_common::{Result, error::Error, verify_arg};

use crate::{
    driver::{DeviceDriver, MemoryInfo},
    handles::{AllocationHandle, DeviceOrdinal, VirtualAddress},
    host::{HostDriver, HostDriverOptions},
    scoped::{BackedRange, MappedAllocation, Reservation},
    token::TransferableToken,
};

/// Entry point for all virtual memory operations.
///
/// Reserving address space, creating physical memory and mapping one into the
/// other are separate steps, so that peers can agree on a virtual layout before
/// the memory behind it (possibly exported by another process) is bound.
///
/// Caller preconditions are checked here and reported as `InvalidArgument` before
/// the driver is called. Multi-step operations roll back completed steps when a
/// later one fails, then return the original error.
///
/// Cloning is cheap; all clones share the driver.
#[derive(Clone)]
pub struct VirtualMemoryFabric {
    driver: Arc<dyn DeviceDriver>,
}

impl VirtualMemoryFabric {
    pub fn new(driver: Arc<dyn DeviceDriver>) -> VirtualMemoryFabric {
        VirtualMemoryFabric { driver }
    }

    /// Creates a fabric over host-emulated devices.
    pub fn host(options: HostDriverOptions) -> Result<VirtualMemoryFabric> {
        Ok(VirtualMemoryFabric::new(Arc::new(HostDriver::new(options)?)))
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub fn device_count(&self) -> usize {
        self.driver.device_count()
    }

    /// Recommended allocation granularity of `device`.
    pub fn granularity(&self, device: DeviceOrdinal) -> Result<usize> {
        self.check_device(device)?;
        let granularity = self.driver.granularity(device)?;
        if granularity == 0 {
            return Err(Error::driver("granularity", "driver reported zero"));
        }
        Ok(granularity)
    }

    pub fn memory_info(&self, device: DeviceOrdinal) -> Result<MemoryInfo> {
        self.check_device(device)?;
        self.driver.memory_info(device)
    }

    /// Reserves `size` bytes of unmapped address space on `device`. `size` must be
    /// a positive multiple of the device granularity.
    pub fn reserve(&self, device: DeviceOrdinal, size: usize) -> Result<VirtualAddress> {
        let granularity = self.granularity(device)?;
        verify_arg!(size, size > 0);
        verify_arg!(size, size.is_multiple_of(granularity));
        self.driver.address_reserve(device, size)
    }

    /// Returns a reservation's address space. Everything mapped into it must have
    /// been unmapped first.
    pub fn release(&self, address: VirtualAddress, size: usize) -> Result<()> {
        verify_arg!(address, !address.is_null());
        verify_arg!(size, size > 0);
        self.driver.address_free(address, size)
    }

    /// Creates a shareable physical allocation of `size` bytes on `device` and maps
    /// it read/write at `address`, which must lie in a range reserved on `device`.
    ///
    /// Returns the allocation handle; pass it to [`deallocate`](Self::deallocate)
    /// together with the same address and size.
    pub fn allocate(
        &self,
        device: DeviceOrdinal,
        address: VirtualAddress,
        size: usize,
    ) -> Result<AllocationHandle> {
        self.check_span(device, address, size)?;
        let handle = self.driver.mem_create(device, size)?;
        if let Err(e) = self.map_and_grant(device, address, handle, size) {
            if let Err(cleanup) = self.driver.mem_release(handle) {
                log::warn!("allocate: failed to release {handle} after a failed map: {cleanup}");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Maps an existing allocation (typically one obtained from
    /// [`import_handle`](Self::import_handle)) at `address` and grants `device`
    /// read/write access. The handle stays owned by the caller.
    pub fn map(
        &self,
        device: DeviceOrdinal,
        address: VirtualAddress,
        handle: AllocationHandle,
        size: usize,
    ) -> Result<()> {
        self.check_span(device, address, size)?;
        self.map_and_grant(device, address, handle, size)
    }

    pub fn unmap(&self, address: VirtualAddress, size: usize) -> Result<()> {
        verify_arg!(address, !address.is_null());
        verify_arg!(size, size > 0);
        self.driver.mem_unmap(address, size)
    }

    pub fn release_handle(&self, handle: AllocationHandle) -> Result<()> {
        self.driver.mem_release(handle)
    }

    /// Unmaps `size` bytes at `address` and releases `handle`. The release is
    /// attempted even if the unmap fails; the first failure is returned. The
    /// reservation itself stays in place.
    pub fn deallocate(
        &self,
        address: VirtualAddress,
        handle: AllocationHandle,
        size: usize,
    ) -> Result<()> {
        verify_arg!(address, !address.is_null());
        verify_arg!(size, size > 0);
        let unmapped = self.driver.mem_unmap(address, size);
        let released = self.driver.mem_release(handle);
        match (unmapped, released) {
            (Err(e), Err(second)) => {
                log::warn!("deallocate: release of {handle} also failed: {second}");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Produces a token that lets another process or device context import the
    /// allocation. The handle remains valid and owned by the caller.
    pub fn export_handle(&self, handle: AllocationHandle) -> Result<TransferableToken> {
        self.driver.export_shareable(handle)
    }

    /// Redeems a token, returning a new local handle to the same physical memory.
    /// The handle must be released independently of the exporter's.
    pub fn import_handle(&self, token: &TransferableToken) -> Result<AllocationHandle> {
        self.driver.import_shareable(token)
    }

    /// [`reserve`](Self::reserve), returning a guard that releases the range.
    pub fn reserve_scoped(&self, device: DeviceOrdinal, size: usize) -> Result<Reservation> {
        let address = self.reserve(device, size)?;
        Ok(Reservation::new(self.clone(), device, address, size))
    }

    /// [`allocate`](Self::allocate), returning a guard that deallocates.
    pub fn allocate_scoped(
        &self,
        device: DeviceOrdinal,
        address: VirtualAddress,
        size: usize,
    ) -> Result<MappedAllocation> {
        let handle = self.allocate(device, address, size)?;
        Ok(MappedAllocation::new(self.clone(), address, handle, size))
    }

    /// [`map`](Self::map), returning a guard that unmaps and releases `handle`.
    /// The guard takes ownership of `handle` even when mapping fails: the handle
    /// is released before the error is returned.
    pub fn map_scoped(
        &self,
        device: DeviceOrdinal,
        address: VirtualAddress,
        handle: AllocationHandle,
        size: usize,
    ) -> Result<MappedAllocation> {
        if let Err(e) = self.map(device, address, handle, size) {
            if let Err(cleanup) = self.driver.mem_release(handle) {
                log::warn!("map_scoped: failed to release {handle}: {cleanup}");
            }
            return Err(e);
        }
        Ok(MappedAllocation::new(self.clone(), address, handle, size))
    }

    /// Reserves a range of `size` bytes on `device` and backs all of it with a new
    /// allocation.
    pub fn allocate_range(&self, device: DeviceOrdinal, size: usize) -> Result<BackedRange> {
        let reservation = self.reserve_scoped(device, size)?;
        let allocation = self.allocate_scoped(device, reservation.address(), size)?;
        Ok(BackedRange::new(allocation, reservation))
    }

    /// Imports `token` and maps the whole allocation into a new range on `device`.
    pub fn import_range(
        &self,
        device: DeviceOrdinal,
        token: &TransferableToken,
    ) -> Result<BackedRange> {
        let size = usize::try_from(token.size)
            .map_err(|_| Error::invalid_arg("token", "size does not fit the address space"))?;
        let reservation = self.reserve_scoped(device, size)?;
        let handle = self.import_handle(token)?;
        let allocation = self.map_scoped(device, reservation.address(), handle, size)?;
        Ok(BackedRange::new(allocation, reservation))
    }

    fn check_device(&self, device: DeviceOrdinal) -> Result<()> {
        let count = self.driver.device_count();
        if device.index() < count {
            Ok(())
        } else {
            Err(Error::invalid_arg(
                "device",
                format!("{device} is out of range, {count} device(s) present"),
            ))
        }
    }

    fn check_span(&self, device: DeviceOrdinal, address: VirtualAddress, size: usize) -> Result<()> {
        let granularity = self.granularity(device)?;
        verify_arg!(address, !address.is_null());
        verify_arg!(address, address.as_u64().is_multiple_of(granularity as u64));
        verify_arg!(size, size > 0);
        verify_arg!(size, size.is_multiple_of(granularity));
        Ok(())
    }

    fn map_and_grant(
        &self,
        device: DeviceOrdinal,
        address: VirtualAddress,
        handle: AllocationHandle,
        size: usize,
    ) -> Result<()> {
        self.driver.mem_map(address, size, handle)?;
        if let Err(e) = self.driver.mem_set_access(address, size, device) {
            if let Err(cleanup) = self.driver.mem_unmap(address, size) {
                log::warn!("failed to unmap {address}+{size} after a failed access grant: {cleanup}");
            }
            return Err(e);
        }
        Ok(())
    }
}

impl std::fmt::Debug for VirtualMemoryFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMemoryFabric")
            .field("device_count", &self.device_count())
            .finish_non_exhaustive()
    }
}
