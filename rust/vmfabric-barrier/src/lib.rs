//! A barrier for up to [`MAX_RANKS`] ranks, each owning one device.
//!
//! Every rank allocates a small flag buffer through the
//! [`VirtualMemoryFabric`](vmfabric::VirtualMemoryFabric), exports it, and maps
//! the buffers of all its peers. An episode publishes the rank's generation to
//! its own flag and waits until every peer has published the same one.

pub mod barrier;
pub mod descriptor;
pub mod wait;

pub use barrier::{BarrierState, MultiDeviceBarrier};
pub use descriptor::BufferDescriptor;
pub use wait::WaitPolicy;

/// Capacity of the peer table.
pub const MAX_RANKS: usize = 8;
