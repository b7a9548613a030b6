//! Executable memory for generated code.
//!
//! Generated code is assembled into an ordinary buffer first. Finalizing it
//! maps fresh anonymous pages read-write, copies the code in, flips the pages
//! to read-execute and synchronizes the instruction cache, in that order. The
//! pages are never writable and executable at the same time, and nothing can
//! reach the code before finalization has returned.

use crate::runtime::flush_icache_range;
use crate::{Error, Result};
use tracing::trace;

/// Fallback when the page size cannot be queried.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Finalized, immutable machine code.
pub struct ExecutableMemory {
    addr: *mut libc::c_void,
    /// Size of the mapping, a multiple of the page size.
    map_size: usize,
    /// Size of the code at the start of the mapping.
    code_size: usize,
}

// SAFETY: The mapping is never written after finalization, so sharing it
// between threads is safe.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    /// Copies `code` into fresh executable memory.
    pub fn finalize(code: &[u8]) -> Result<Self> {
        if code.is_empty() {
            return Err(Error::AllocationFailure("empty code buffer".to_string()));
        }
        let page_size = page_size();
        let map_size = code.len().div_ceil(page_size) * page_size;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::AllocationFailure(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // From here on the mapping is released on every path.
        let memory = Self {
            addr,
            map_size,
            code_size: code.len(),
        };
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), addr as *mut u8, code.len());
        }
        let ret = unsafe { libc::mprotect(addr, map_size, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            return Err(Error::AllocationFailure(format!(
                "mprotect(PROT_READ|PROT_EXEC) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        flush_icache_range(addr as *const u8, code.len());
        trace!("Finalized {} bytes of code at {:p}", code.len(), addr);
        Ok(memory)
    }

    /// Returns the address of the first instruction.
    pub fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }

    /// Returns the size of the code in bytes.
    pub fn len(&self) -> usize {
        self.code_size
    }

    /// Always false, since `finalize` rejects empty code.
    pub fn is_empty(&self) -> bool {
        self.code_size == 0
    }

    /// Returns the finalized code.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.code_size) }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.map_size);
        }
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}
