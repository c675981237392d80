//! mmap-backed executable memory
//!
//! Pages start out read+write, become read+execute when a region is sealed,
//! and flip back to read+write only for the duration of a patch.

use super::{ExecutableMemory, Protection};
use crate::error::{Error, Result};
use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn to_prot(protection: Protection) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if protection.contains(Protection::READ) {
        prot |= libc::PROT_READ;
    }
    if protection.contains(Protection::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if protection.contains(Protection::EXEC) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Anonymous private mapping
pub struct NativeMemory {
    ptr: *mut u8,
    capacity: usize,
    mapped: usize,
    page: usize,
    // Protection of the first page; patches are page-local and restore RX
    protection: AtomicU8,
}

// SAFETY: the mapping is owned by this value and every access goes through
// bounds-checked methods; concurrent patches are serialized by the pool.
unsafe impl Send for NativeMemory {}
unsafe impl Sync for NativeMemory {}

impl NativeMemory {
    /// Map `capacity` bytes (rounded up to whole pages) as read+write
    pub fn map(capacity: usize) -> Result<Self> {
        let page = page_size();
        let mapped = capacity.max(1).div_ceil(page) * page;
        // SAFETY: anonymous private mapping with no address hint
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::IoError { source: std::io::Error::last_os_error() });
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            capacity,
            mapped,
            page,
            protection: AtomicU8::new(Protection::RW.bits()),
        })
    }

    fn page_range(&self, range: &Range<usize>) -> Range<usize> {
        let start = range.start / self.page * self.page;
        let end = range.end.max(range.start + 1).div_ceil(self.page) * self.page;
        start..end.min(self.mapped)
    }
}

impl ExecutableMemory for NativeMemory {
    fn base(&self) -> usize {
        self.ptr as usize
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn protect(&self, range: Range<usize>, protection: Protection) -> Result<()> {
        let pages = self.page_range(&range);
        // SAFETY: `pages` lies within our mapping and is page aligned
        let rc = unsafe {
            libc::mprotect(
                self.ptr.add(pages.start) as *mut libc::c_void,
                pages.len(),
                to_prot(protection),
            )
        };
        if rc != 0 {
            return Err(Error::MemoryProtection(std::io::Error::last_os_error().to_string()));
        }
        self.protection.store(protection.bits(), Ordering::Release);
        Ok(())
    }

    fn protection(&self, _offset: usize) -> Protection {
        Protection::from_bits_truncate(self.protection.load(Ordering::Acquire))
    }

    fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.capacity {
            return Err(Error::PatchOutOfBounds { address: self.base() + offset, len: bytes.len() });
        }
        if !self.protection(offset).contains(Protection::WRITE) {
            return Err(Error::MemoryProtection(format!(
                "write at +{:#x} while code is not writable",
                offset
            )));
        }
        // SAFETY: bounds checked above and the pages are writable
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let end = (offset + len).min(self.capacity);
        let start = offset.min(end);
        // SAFETY: the range is within the mapping, which is always readable
        unsafe { std::slice::from_raw_parts(self.ptr.add(start), end - start).to_vec() }
    }

    #[allow(unused_variables)]
    fn flush_icache(&self, range: Range<usize>) {
        #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
        {
            extern "C" {
                fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
            }
            // SAFETY: the range lies within our mapping
            unsafe {
                let start = self.ptr.add(range.start) as *mut libc::c_char;
                let end = self.ptr.add(range.end.min(self.capacity)) as *mut libc::c_char;
                __clear_cache(start, end);
            }
        }
    }
}

impl Drop for NativeMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/mapped come from a successful mmap
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.mapped);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_map_write_protect_cycle() {
        let memory = NativeMemory::map(64).unwrap();
        memory.write(0, &[1, 2, 3]).unwrap();
        assert_eq!(memory.read(0, 3), vec![1, 2, 3]);

        memory.protect(0..64, Protection::RX).unwrap();
        assert!(matches!(memory.write(0, &[9]), Err(Error::MemoryProtection(_))));

        memory.protect(0..1, Protection::RW).unwrap();
        memory.write(0, &[9]).unwrap();
        memory.protect(0..1, Protection::RX).unwrap();
        assert_eq!(memory.read(0, 3), vec![9, 2, 3]);
    }
}
