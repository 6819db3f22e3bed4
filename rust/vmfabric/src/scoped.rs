//! Guards that give every acquired fabric resource exactly one release.
//!
//! Dropping a guard releases its resource; failures on that path are logged at
//! `warn` because `Drop` cannot report them. Call the explicit `close` methods to
//! observe release errors.

use vmfabric_common::Result;

use crate::{
    fabric::VirtualMemoryFabric,
    handles::{AllocationHandle, DeviceOrdinal, VirtualAddress},
    token::TransferableToken,
};

/// A reserved address range, released on drop.
#[derive(Debug)]
pub struct Reservation {
    fabric: VirtualMemoryFabric,
    device: DeviceOrdinal,
    address: VirtualAddress,
    size: usize,
    released: bool,
}

impl Reservation {
    pub(crate) fn new(
        fabric: VirtualMemoryFabric,
        device: DeviceOrdinal,
        address: VirtualAddress,
        size: usize,
    ) -> Reservation {
        Reservation {
            fabric,
            device,
            address,
            size,
            released: false,
        }
    }

    pub fn device(&self) -> DeviceOrdinal {
        self.device
    }

    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Releases the range now.
    pub fn close(mut self) -> Result<()> {
        self.released = true;
        self.fabric.release(self.address, self.size)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.fabric.release(self.address, self.size) {
                log::warn!("failed to release reservation {}: {e}", self.address);
            }
        }
    }
}

/// A mapped allocation handle, unmapped and released on drop.
#[derive(Debug)]
pub struct MappedAllocation {
    fabric: VirtualMemoryFabric,
    address: VirtualAddress,
    handle: AllocationHandle,
    size: usize,
    released: bool,
}

impl MappedAllocation {
    pub(crate) fn new(
        fabric: VirtualMemoryFabric,
        address: VirtualAddress,
        handle: AllocationHandle,
        size: usize,
    ) -> MappedAllocation {
        MappedAllocation {
            fabric,
            address,
            handle,
            size,
            released: false,
        }
    }

    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    pub fn handle(&self) -> AllocationHandle {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn export(&self) -> Result<TransferableToken> {
        self.fabric.export_handle(self.handle)
    }

    /// Deallocates now.
    pub fn close(mut self) -> Result<()> {
        self.released = true;
        self.fabric.deallocate(self.address, self.handle, self.size)
    }
}

impl Drop for MappedAllocation {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.fabric.deallocate(self.address, self.handle, self.size) {
                log::warn!(
                    "failed to deallocate {} at {}: {e}",
                    self.handle,
                    self.address
                );
            }
        }
    }
}

/// A reserved range entirely backed by one mapped allocation. The mapping is torn
/// down before the range is released.
#[derive(Debug)]
pub struct BackedRange {
    // Field order is drop order.
    allocation: MappedAllocation,
    reservation: Reservation,
}

impl BackedRange {
    pub(crate) fn new(allocation: MappedAllocation, reservation: Reservation) -> BackedRange {
        BackedRange {
            allocation,
            reservation,
        }
    }

    pub fn device(&self) -> DeviceOrdinal {
        self.reservation.device()
    }

    pub fn address(&self) -> VirtualAddress {
        self.allocation.address()
    }

    pub fn handle(&self) -> AllocationHandle {
        self.allocation.handle()
    }

    pub fn size(&self) -> usize {
        self.allocation.size()
    }

    pub fn export(&self) -> Result<TransferableToken> {
        self.allocation.export()
    }

    /// Host view of the range. Only valid for host-accessible devices.
    pub fn as_ptr<T>(&self) -> *mut T {
        self.address().as_ptr()
    }

    /// Deallocates and releases now, returning the first failure.
    pub fn close(self) -> Result<()> {
        let BackedRange {
            allocation,
            reservation,
        } = self;
        let deallocated = allocation.close();
        let released = reservation.close();
        deallocated.and(released)
    }
}
