#[cfg(not(unix))]
compile_error!("vmfabric-page-alloc requires a unix target");

pub mod region;
pub mod shared_memory;

#[cfg_attr(target_os = "linux", path = "mmap_linux.rs")]
#[cfg_attr(not(target_os = "linux"), path = "mmap_fallback.rs")]
pub mod mmap;

/// Access protection applied to a span of reserved address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults. Freshly reserved and freshly mapped spans start here.
    None,
    /// Readable and writable.
    ReadWrite,
}

/// Identity of an OS shared-memory object: two file descriptors with equal
/// identities refer to the same physical pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    pub dev: u64,
    pub ino: u64,
}
