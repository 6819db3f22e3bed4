//! Device virtual memory fabric.
//!
//! Device contexts reserve address ranges, back them with physical device memory
//! and share that memory across devices and processes through transferable
//! tokens. See [`VirtualMemoryFabric`] for the operations and
//! [`DeviceDriver`] for the driver seam; [`host::HostDriver`] emulates devices on
//! host shared memory.

pub mod budget;
pub mod driver;
pub mod fabric;
pub mod handles;
pub mod host;
pub mod scoped;
pub mod token;
pub mod transport;

pub use driver::{DeviceDriver, MemoryInfo};
pub use fabric::VirtualMemoryFabric;
pub use handles::{AllocationHandle, DeviceOrdinal, VirtualAddress};
pub use scoped::{BackedRange, MappedAllocation, Reservation};
pub use token::{MemoryIdentity, TransferableToken};
