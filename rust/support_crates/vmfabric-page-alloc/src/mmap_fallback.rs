//! Platforms without fd-backed shared memory and fixed remapping. Address-space
//! operations report `Unsupported`; page sizes are nominal.

use std::{
    ffi::CStr,
    os::fd::{BorrowedFd, OwnedFd, RawFd},
};

use crate::{ObjectIdentity, Protection};

fn unsupported<T>() -> std::io::Result<T> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "shareable virtual memory is not supported on this platform",
    ))
}

pub fn reserve(_size: usize) -> std::io::Result<*mut std::ffi::c_void> {
    unsupported()
}

pub unsafe fn release(_ptr: *mut std::ffi::c_void, _size: usize) -> std::io::Result<()> {
    unsupported()
}

pub fn create_shared(_name: &CStr, _size: usize) -> std::io::Result<OwnedFd> {
    unsupported()
}

pub unsafe fn map_shared_fixed(
    _ptr: *mut std::ffi::c_void,
    _size: usize,
    _fd: BorrowedFd<'_>,
) -> std::io::Result<()> {
    unsupported()
}

pub unsafe fn unmap_to_reserved(_ptr: *mut std::ffi::c_void, _size: usize) -> std::io::Result<()> {
    unsupported()
}

pub unsafe fn protect(
    _ptr: *mut std::ffi::c_void,
    _size: usize,
    _protection: Protection,
) -> std::io::Result<()> {
    unsupported()
}

pub fn identify(_fd: BorrowedFd<'_>) -> std::io::Result<(ObjectIdentity, u64)> {
    unsupported()
}

pub fn fd_from_process(_pid: u32, _fd: RawFd) -> std::io::Result<OwnedFd> {
    unsupported()
}

/// Returns the "large page" size in bytes.
pub fn get_large_page_size() -> usize {
    2 * 1024 * 1024
}

/// Returns the "standard page" size in bytes.
pub fn get_page_size() -> usize {
    4 * 1024
}
