//! Strongly typed stand-ins for the opaque integers that cross the binding
//! boundary. Conversion to and from `u64` happens only at that boundary.

use bincode::{Decode, Encode};

/// Index of a device as known to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct DeviceOrdinal(u32);

impl DeviceOrdinal {
    pub const fn new(ordinal: u32) -> DeviceOrdinal {
        DeviceOrdinal(ordinal)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for DeviceOrdinal {
    fn from(ordinal: u32) -> Self {
        DeviceOrdinal(ordinal)
    }
}

impl std::fmt::Display for DeviceOrdinal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// A device virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    pub const NULL: VirtualAddress = VirtualAddress(0);

    #[inline]
    pub const fn from_u64(address: u64) -> VirtualAddress {
        VirtualAddress(address)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address `bytes` past this one, or `None` if that overflows
    /// the 64-bit address space.
    #[inline]
    pub fn offset(self, bytes: u64) -> Option<VirtualAddress> {
        self.0.checked_add(bytes).map(VirtualAddress)
    }

    /// Reinterprets the address as a host pointer. Only meaningful for memory the
    /// host can access directly (host-emulated devices, unified memory).
    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl From<u64> for VirtualAddress {
    fn from(address: u64) -> Self {
        VirtualAddress(address)
    }
}

impl std::fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A driver handle to a physical allocation (not to a mapping of it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationHandle(u64);

impl AllocationHandle {
    #[inline]
    pub const fn from_u64(handle: u64) -> AllocationHandle {
        AllocationHandle(handle)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for AllocationHandle {
    fn from(handle: u64) -> Self {
        AllocationHandle(handle)
    }
}

impl std::fmt::Display for AllocationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "alloc:{}", self.0)
    }
}
