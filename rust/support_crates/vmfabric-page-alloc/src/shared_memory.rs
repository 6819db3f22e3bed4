//! Fd-backed shared memory objects.

use std::{
    ffi::CStr,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
};

use crate::{ObjectIdentity, mmap};

/// An owned descriptor of a shared memory object.
///
/// Every `SharedMemory` owns its own descriptor; duplicates made with
/// [`SharedMemory::duplicate`] or fetched with [`SharedMemory::from_process`] keep
/// the pages alive independently. The kernel frees the pages once the last
/// descriptor is closed and the last mapping is gone.
#[derive(Debug)]
pub struct SharedMemory {
    fd: OwnedFd,
    identity: ObjectIdentity,
    len: u64,
}

impl SharedMemory {
    /// Creates a zero-filled object of `len` bytes. `name` only shows up in
    /// `/proc/<pid>/fd` listings.
    pub fn create(name: &CStr, len: usize) -> std::io::Result<SharedMemory> {
        let fd = mmap::create_shared(name, len)?;
        SharedMemory::from_fd(fd)
    }

    /// Wraps a descriptor that refers to a shared memory object.
    pub fn from_fd(fd: OwnedFd) -> std::io::Result<SharedMemory> {
        let (identity, len) = mmap::identify(fd.as_fd())?;
        Ok(SharedMemory { fd, identity, len })
    }

    /// Fetches descriptor `fd` from process `pid`. See [`mmap::fd_from_process`].
    pub fn from_process(pid: u32, fd: RawFd) -> std::io::Result<SharedMemory> {
        if fd < 0 {
            return Err(std::io::Error::from_raw_os_error(libc::EBADF));
        }
        let fd = if pid == std::process::id() {
            unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?
        } else {
            mmap::fd_from_process(pid, fd)?
        };
        SharedMemory::from_fd(fd)
    }

    /// Opens another descriptor for the same object.
    pub fn duplicate(&self) -> std::io::Result<SharedMemory> {
        Ok(SharedMemory {
            fd: self.fd.try_clone()?,
            identity: self.identity,
            len: self.len,
        })
    }

    #[inline]
    pub fn identity(&self) -> ObjectIdentity {
        self.identity
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for SharedMemory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
