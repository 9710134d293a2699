use std::{io, mem::ManuallyDrop, ptr::NonNull};

use log::warn;

use crate::{config::DEFAULT_STACK_SIZE, error::Error};

/// An anonymous private mapping used as a thread stack.
///
/// With a guard page the lowest page of the mapping is left inaccessible so
/// that running off the end faults instead of scribbling over a neighbour.
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    len: usize,
}

impl Stack {
    /// Maps `size` bytes (rounded up to whole pages), plus one more page when
    /// `guard` is set. Sizes that do not fit the address space fail like any
    /// other mapping failure.
    pub fn map(size: usize, guard: bool) -> Result<Stack, Error> {
        let page = page_size();
        let len = round_up(size, page)
            .and_then(|len| len.checked_add(if guard { page } else { 0 }))
            .ok_or_else(|| Error::StackAlloc(io::Error::from(io::ErrorKind::OutOfMemory)))?;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::StackAlloc(io::Error::last_os_error()));
        }
        let Some(base) = NonNull::new(ptr.cast::<u8>()) else {
            return Err(Error::StackAlloc(io::Error::from(io::ErrorKind::OutOfMemory)));
        };
        let stack = Stack { base, len };

        if guard && unsafe { libc::mprotect(ptr, page, libc::PROT_NONE) } != 0 {
            // dropping `stack` unmaps the region again
            return Err(Error::StackAlloc(io::Error::last_os_error()));
        }
        Ok(stack)
    }

    /// Length of the whole mapping in bytes, guard page included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// One past the highest usable byte; stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Unmaps the region, reporting failure instead of swallowing it.
    pub fn release(self) -> Result<(), Error> {
        let stack = ManuallyDrop::new(self);
        unmap(stack.base, stack.len)
    }

    /// Gives up the mapping without unmapping it.
    pub fn leak(self) {
        std::mem::forget(self);
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Err(err) = unmap(self.base, self.len) {
            warn!("leaking stack at {:p}: {err}", self.base);
        }
    }
}

fn unmap(base: NonNull<u8>, len: usize) -> Result<(), Error> {
    if unsafe { libc::munmap(base.as_ptr().cast(), len) } != 0 {
        return Err(Error::StackRelease(io::Error::last_os_error()));
    }
    Ok(())
}

pub fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

/// The soft `RLIMIT_STACK`, or [`DEFAULT_STACK_SIZE`] when it is unlimited or
/// cannot be read.
pub fn default_stack_size() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) } != 0 {
        return DEFAULT_STACK_SIZE;
    }
    match limit.rlim_cur {
        0 | libc::RLIM_INFINITY => DEFAULT_STACK_SIZE,
        cur => usize::try_from(cur).unwrap_or(DEFAULT_STACK_SIZE),
    }
}

/// `None` when the rounded size does not fit in a `usize`.
pub fn round_up(size: usize, page: usize) -> Option<usize> {
    size.checked_next_multiple_of(page)
}
