//! Marshalling between raw `(pointer, length)` pairs and Rust buffers.
//!
//! Response buffers are allocated with `libc::malloc` and released with `libc::free` by
//! whoever receives them. Both sides of the boundary run in one process and share the C
//! runtime, so this holds even when host and plugin use different Rust global allocators.

use std::alloc::{handle_alloc_error, Layout};
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::{fmt, slice};

use crate::envelope::{ErrorKind, ServiceError};
use crate::{Error, Result};

/// Borrow `len` bytes at `ptr` for the duration of a call.
///
/// A null pointer is only accepted together with `len == 0` and reads as an empty buffer.
///
/// # Errors
///
/// [`Error::NullBuffer`] if `ptr` is null and `len` is not zero.
///
/// # Safety
///
/// If `ptr` is not null it must be valid for reads of `len` bytes for `'a`.
pub unsafe fn borrow<'a>(ptr: *const u8, len: usize) -> Result<&'a [u8]> {
    if ptr.is_null() {
        return if len == 0 {
            Ok(&[])
        } else {
            Err(Error::NullBuffer(len))
        };
    }
    Ok(slice::from_raw_parts(ptr, len))
}

/// Borrow the method and request of a call, the method as UTF-8.
///
/// # Errors
///
/// [`ErrorKind::InvalidRequest`] for a null buffer with a length or a method that is not UTF-8.
///
/// # Safety
///
/// See [`borrow`].
pub unsafe fn read_call<'a>(
    method_ptr: *const u8,
    method_len: usize,
    request_ptr: *const u8,
    request_len: usize,
) -> std::result::Result<(&'a str, &'a [u8]), ServiceError> {
    let method = borrow(method_ptr, method_len)?;
    let method = std::str::from_utf8(method).map_err(|err| {
        ServiceError::new(ErrorKind::InvalidRequest, format!("method is not UTF-8: {err}"))
    })?;
    let request = borrow(request_ptr, request_len)?;
    Ok((method, request))
}

/// A byte buffer allocated with the C allocator, freed exactly once when dropped.
pub struct OwnedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The buffer is uniquely owned.
unsafe impl Send for OwnedBuffer {}
unsafe impl Sync for OwnedBuffer {}

impl OwnedBuffer {
    /// Copy `bytes` into a new C allocation.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        // malloc(0) may return null, always ask for at least one byte.
        let size = bytes.len().max(1);
        let raw = unsafe { libc::malloc(size) }.cast::<u8>();
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(Layout::array::<u8>(size).unwrap_or_else(|_| Layout::new::<u8>()));
        };
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        #[cfg(test)]
        tracking::allocated();
        Self {
            ptr,
            len: bytes.len(),
        }
    }

    /// Take ownership of a buffer received from the other side of the boundary.
    ///
    /// Returns `None` for a null pointer. A non-null pointer with `len == 0` is still taken
    /// over, so it gets freed.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must come from `libc::malloc`, be valid for `len` bytes and not be
    /// owned by anything else.
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| {
            #[cfg(test)]
            tracking::allocated();
            Self { ptr, len }
        })
    }

    /// Hand the buffer over to the other side: write its pointer into `out` and return its
    /// length. The receiver becomes responsible for freeing it.
    ///
    /// # Safety
    ///
    /// `out` must be valid for a pointer-sized write.
    pub unsafe fn into_raw(self, out: *mut *mut u8) -> usize {
        let this = std::mem::ManuallyDrop::new(self);
        #[cfg(test)]
        tracking::freed();
        out.write(this.ptr.as_ptr());
        this.len
    }

    /// The number of bytes in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for OwnedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        #[cfg(test)]
        tracking::freed();
        unsafe { libc::free(self.ptr.as_ptr().cast()) };
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer").field("len", &self.len).finish()
    }
}
