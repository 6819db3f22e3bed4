//! Reserved address-space regions.
//!
//! A [`ReservedRegion`] owns a span of virtual address space obtained with
//! [`mmap::reserve`](crate::mmap::reserve). The span starts out inaccessible;
//! sub-spans can be backed by a [`SharedMemory`] object, opened for read/write
//! access, and later returned to the inaccessible reserved state. The whole span
//! is released when the region is dropped.
//!
//! # Safety
//!
//! `ReservedRegion` implements `Send` and `Sync`. It hands out raw addresses only;
//! callers that dereference them must synchronize access to the mapped memory
//! themselves.

use std::{ops::Range, os::fd::AsFd};

use crate::{Protection, mmap, shared_memory::SharedMemory};

pub struct ReservedRegion {
    /// Base of the reserved span.
    ptr: *mut u8,
    /// Length of the reserved span in bytes.
    len: usize,
}

impl ReservedRegion {
    /// Reserves `len` bytes of address space.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidInput` error when `len` is zero or not a multiple of
    /// the page size, or the OS error when the reservation fails (for example when
    /// the address space is exhausted).
    pub fn reserve(len: usize) -> std::io::Result<ReservedRegion> {
        if len == 0 || !len.is_multiple_of(mmap::get_page_size()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "reservation length must be a positive multiple of the page size",
            ));
        }
        let ptr = mmap::reserve(len)?;
        Ok(ReservedRegion {
            ptr: ptr as _,
            len,
        })
    }

    /// Reserves `len` bytes of address space whose base is a multiple of
    /// `alignment` (a power of two, at least the page size).
    ///
    /// Over-reserves by `alignment` bytes and hands the unaligned head and tail
    /// back to the OS.
    pub fn reserve_aligned(len: usize, alignment: usize) -> std::io::Result<ReservedRegion> {
        let page_size = mmap::get_page_size();
        if !alignment.is_power_of_two() || alignment < page_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "alignment must be a power of two not below the page size",
            ));
        }
        if alignment == page_size {
            return ReservedRegion::reserve(len);
        }
        let padded = ReservedRegion::reserve(len.checked_add(alignment).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "reservation too large")
        })?)?;
        let raw = padded.base() as usize;
        let total = padded.len;
        std::mem::forget(padded);
        let aligned = trim_padding(raw, total, alignment, |ptr, len| unsafe {
            mmap::release(ptr as _, len)
        })?;
        Ok(ReservedRegion {
            ptr: aligned as _,
            len,
        })
    }

    /// Releases the region, reporting a failure to unmap it (dropping the region
    /// ignores such failures).
    pub fn release(mut self) -> std::io::Result<()> {
        let ptr = std::mem::replace(&mut self.ptr, std::ptr::null_mut());
        unsafe { mmap::release(ptr as _, self.len) }
    }

    /// Base address of the region.
    #[inline]
    pub fn base(&self) -> u64 {
        self.ptr as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Returns `true` if `address..address + len` lies entirely within the region.
    pub fn contains(&self, address: u64, len: usize) -> bool {
        let base = self.base();
        address >= base
            && (address - base)
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.len as u64)
    }

    /// Backs `offsets` of the region with the first `offsets.len()` bytes of `memory`.
    /// The mapping starts inaccessible; see [`ReservedRegion::protect`].
    pub fn map(&self, offsets: Range<usize>, memory: &SharedMemory) -> std::io::Result<()> {
        self.check_span(&offsets)?;
        if offsets.len() as u64 > memory.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "mapping exceeds the size of the shared memory object",
            ));
        }
        unsafe { mmap::map_shared_fixed(self.span_ptr(&offsets), offsets.len(), memory.as_fd()) }
    }

    /// Changes the access protection of `offsets`.
    pub fn protect(&self, offsets: Range<usize>, protection: Protection) -> std::io::Result<()> {
        self.check_span(&offsets)?;
        unsafe { mmap::protect(self.span_ptr(&offsets), offsets.len(), protection) }
    }

    /// Drops whatever is mapped at `offsets`, returning the span to the
    /// inaccessible reserved state.
    pub fn unmap(&self, offsets: Range<usize>) -> std::io::Result<()> {
        self.check_span(&offsets)?;
        unsafe { mmap::unmap_to_reserved(self.span_ptr(&offsets), offsets.len()) }
    }

    fn check_span(&self, offsets: &Range<usize>) -> std::io::Result<()> {
        let page_size = mmap::get_page_size();
        if offsets.start >= offsets.end
            || offsets.end > self.len
            || !offsets.start.is_multiple_of(page_size)
            || !offsets.end.is_multiple_of(page_size)
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "span {offsets:?} is not a page-aligned sub-span of a {} byte region",
                    self.len
                ),
            ));
        }
        Ok(())
    }

    #[inline]
    fn span_ptr(&self, offsets: &Range<usize>) -> *mut std::ffi::c_void {
        unsafe { self.ptr.add(offsets.start) as _ }
    }
}

/// Hands the unaligned head and tail of the padded span `raw..raw + total` back
/// through `release` and returns the aligned base. Both pieces are released even
/// if one fails; on failure the aligned body is released too and the first error
/// is returned.
pub(crate) fn trim_padding(
    raw: usize,
    total: usize,
    alignment: usize,
    mut release: impl FnMut(usize, usize) -> std::io::Result<()>,
) -> std::io::Result<usize> {
    let aligned = (raw + alignment - 1) & !(alignment - 1);
    let head = aligned - raw;
    let tail = alignment - head;
    let len = total - alignment;

    let head_result = if head != 0 { release(raw, head) } else { Ok(()) };
    let tail_result = if tail != 0 {
        release(aligned + len, tail)
    } else {
        Ok(())
    };
    match head_result.and(tail_result) {
        Ok(()) => Ok(aligned),
        Err(e) => {
            let _ = release(aligned, len);
            Err(e)
        }
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            let _ = unsafe { mmap::release(self.ptr as _, self.len) };
        }
    }
}

// SAFETY: the region exclusively owns its address span and releases it on drop.
unsafe impl Send for ReservedRegion {}

// SAFETY: all methods taking `&self` only issue mapping syscalls; memory behind the
// span is never dereferenced here.
unsafe impl Sync for ReservedRegion {}

impl std::fmt::Debug for ReservedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
