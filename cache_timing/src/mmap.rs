use core::ffi::c_void;
use core::mem::size_of;
use core::ops::{Deref, DerefMut};
use core::ptr::{null_mut, NonNull};
use core::slice::{from_raw_parts, from_raw_parts_mut};
use std::io;

use crate::SetupError;

/// An owned anonymous mapping of `size` elements of `T`.
///
/// The mapping is created zero-filled by the kernel, so `T` must be a type
/// for which the all-zero bit pattern is valid (it is only ever used with
/// plain integers here). The backing region never moves, which makes raw
/// pointers into it stable for the lifetime of the value.
#[derive(Debug)]
pub struct MMappedMemory<T> {
    pointer: NonNull<T>,
    size: usize,
}

impl<T> MMappedMemory<T> {
    pub fn try_new(size: usize, huge: bool) -> Result<MMappedMemory<T>, SetupError> {
        assert!(size > 0);
        assert!(size_of::<T>() > 0);
        let length = size * size_of::<T>();
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if huge {
            flags |= libc::MAP_HUGETLB;
        }
        let p = unsafe {
            libc::mmap(
                null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(SetupError::Mmap(io::Error::last_os_error()));
        }
        let pointer =
            NonNull::new(p as *mut T).ok_or_else(|| SetupError::Mmap(io::Error::last_os_error()))?;
        Ok(MMappedMemory { pointer, size })
    }

    pub fn ptr(&self) -> *const T {
        self.pointer.as_ptr()
    }

    pub fn slice(&self) -> &[T] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [T] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

impl<T> Deref for MMappedMemory<T> {
    type Target = [T];
    fn deref(&self) -> &Self::Target {
        self.slice()
    }
}

impl<T> DerefMut for MMappedMemory<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slice_mut()
    }
}

impl<T> Drop for MMappedMemory<T> {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.pointer.as_ptr() as *mut c_void, self.size * size_of::<T>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_write() {
        let mut m = MMappedMemory::<u8>::try_new(crate::PAGE_LEN, false).unwrap();
        assert_eq!(m.slice().len(), crate::PAGE_LEN);
        assert!(m.slice().iter().all(|&b| b == 0));
        m.slice_mut()[0] = 42;
        m.slice_mut()[crate::PAGE_LEN - 1] = 43;
        assert_eq!(m[0], 42);
        assert_eq!(m[crate::PAGE_LEN - 1], 43);
    }
}
