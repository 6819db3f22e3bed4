use std::{
    ffi::CStr,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    sync::OnceLock,
};

use crate::{ObjectIdentity, Protection};

/// Reserves `size` bytes of virtual address space without committing any memory.
///
/// The span is mapped `PROT_NONE` with `MAP_NORESERVE`, so it consumes neither
/// physical memory nor swap accounting. Any access to it faults until a part of it
/// is replaced by a real mapping through [`map_shared_fixed`].
///
/// # Arguments
///
/// * `size` - The number of bytes to reserve. Must be a multiple of the page size.
///
/// # Returns
///
/// The base of the reserved span, aligned to at least the page size.
pub fn reserve(size: usize) -> std::io::Result<*mut std::ffi::c_void> {
    assert!(size.is_multiple_of(get_page_size()));
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr.is_null() || ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ptr)
}

/// Returns a reserved span (including anything still mapped inside it) to the OS.
///
/// # Safety
///
/// - `ptr` and `size` must describe a span obtained from [`reserve`]
/// - No references into the span may outlive this call
pub unsafe fn release(ptr: *mut std::ffi::c_void, size: usize) -> std::io::Result<()> {
    let res = unsafe { libc::munmap(ptr, size) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Creates an anonymous, fd-backed shared memory object of `size` bytes.
///
/// The object is a `memfd` sized with `ftruncate`; its pages are zero-filled and
/// committed lazily on first touch. The returned descriptor is close-on-exec. It
/// can be duplicated, passed to another process over a Unix socket, or fetched
/// by a peer with [`fd_from_process`], and every resulting descriptor refers to the
/// same pages.
pub fn create_shared(name: &CStr, size: usize) -> std::io::Result<OwnedFd> {
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let res = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

/// Maps `size` bytes of the shared object `fd` over `ptr`, replacing whatever was
/// mapped there. The new mapping starts with [`Protection::None`].
///
/// # Safety
///
/// - `ptr..ptr + size` must lie inside a span owned by the caller (typically
///   obtained from [`reserve`]); the previous contents of that span are discarded
/// - `ptr` and `size` must be page-aligned
pub unsafe fn map_shared_fixed(
    ptr: *mut std::ffi::c_void,
    size: usize,
    fd: BorrowedFd<'_>,
) -> std::io::Result<()> {
    let res = unsafe {
        libc::mmap(
            ptr,
            size,
            libc::PROT_NONE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd.as_raw_fd(),
            0,
        )
    };
    if res == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    debug_assert_eq!(res, ptr);
    Ok(())
}

/// Replaces `ptr..ptr + size` with a fresh inaccessible reservation, dropping any
/// shared mapping that was there.
///
/// # Safety
///
/// Same requirements as [`map_shared_fixed`].
pub unsafe fn unmap_to_reserved(ptr: *mut std::ffi::c_void, size: usize) -> std::io::Result<()> {
    let res = unsafe {
        libc::mmap(
            ptr,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if res == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Changes the access protection of a span.
///
/// # Safety
///
/// Revoking access to memory that is still referenced by live Rust references is
/// undefined behavior.
pub unsafe fn protect(
    ptr: *mut std::ffi::c_void,
    size: usize,
    protection: Protection,
) -> std::io::Result<()> {
    let prot = match protection {
        Protection::None => libc::PROT_NONE,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    let res = unsafe { libc::mprotect(ptr, size, prot) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Returns the identity and the current size of the object behind `fd`.
pub fn identify(fd: BorrowedFd<'_>) -> std::io::Result<(ObjectIdentity, u64)> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let res = unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };
    Ok((
        ObjectIdentity {
            dev: stat.st_dev as u64,
            ino: stat.st_ino as u64,
        },
        stat.st_size as u64,
    ))
}

/// Obtains a duplicate of descriptor `fd` that is open in process `pid`.
///
/// Uses `pidfd_open(2)` + `pidfd_getfd(2)` (Linux 5.6+). The caller needs
/// `PTRACE_MODE_ATTACH_REALCREDS` permission over `pid`; when that is not granted
/// (for example under a restrictive Yama policy), pass descriptors over a Unix
/// socket instead.
pub fn fd_from_process(pid: u32, fd: RawFd) -> std::io::Result<OwnedFd> {
    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    if pidfd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd as RawFd) };
    let res = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw_fd(), fd, 0) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(res as RawFd) })
}

/// Gets the system's large page (huge page) size in bytes.
///
/// The value is read once from `/proc/meminfo` and cached. Falls back to 2MB
/// when the size cannot be determined.
pub fn get_large_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| read_large_page_size().unwrap_or(2 * 1024 * 1024))
}

/// Gets the system's standard page size in bytes.
///
/// The value is obtained once with `sysconf(_SC_PAGESIZE)` and cached. Falls back
/// to 4KB when the call fails.
pub fn get_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| read_page_size().unwrap_or(4 * 1024))
}

/// Parses the "Hugepagesize:" entry of `/proc/meminfo`, which is given in kB:
///
/// ```text
/// Hugepagesize:    2048 kB
/// ```
fn read_large_page_size() -> std::io::Result<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")?;
    meminfo
        .lines()
        .find(|line| line.starts_with("Hugepagesize:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<usize>().ok())
        .map(|kb| kb * 1024)
        .ok_or_else(|| std::io::Error::other("Failed to read Hugepagesize"))
}

fn read_page_size() -> std::io::Result<usize> {
    let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    assert!(res < i32::MAX as _);
    Ok(res as usize)
}
