//! Instruction cache synchronization.
//!
//! After code is written through the data cache, the instruction fetch path
//! must be made to observe it before the code runs. PowerPC and AArch64 have
//! incoherent instruction caches and need an explicit data-cache writeback,
//! instruction-cache invalidate and context synchronization over the written
//! range; x86 only needs the stores ordered.

/// Flush the instruction cache for the given range.
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
pub fn flush_icache_range(start: *const u8, size: usize) {
    // dcbst/sync/icbi/isync over every cache line of the range, using the
    // line size the C runtime detected for this CPU.
    unsafe {
        __clear_cache(
            start as *mut libc::c_char,
            start.add(size) as *mut libc::c_char,
        );
    }
}

/// Flush the instruction cache for the given range using macOS system call
#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub fn flush_icache_range(start: *const u8, size: usize) {
    unsafe {
        sys_icache_invalidate(start as *mut libc::c_void, size);
        std::arch::asm!("dsb sy");
        std::arch::asm!("isb");
    }
}

/// Flush the instruction cache for the given range.
#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
pub fn flush_icache_range(start: *const u8, size: usize) {
    unsafe {
        __clear_cache(
            start as *mut libc::c_char,
            start.add(size) as *mut libc::c_char,
        );
        std::arch::asm!("dsb sy");
        std::arch::asm!("isb");
    }
}

/// Flush the instruction cache for the given range
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn flush_icache_range(_start: *const u8, _size: usize) {
    // x86 has coherent I-cache, no flush needed
    unsafe {
        std::arch::asm!("mfence");
    }
}

/// Flush the instruction cache for the given range
#[cfg(not(any(
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "aarch64",
    target_arch = "x86",
    target_arch = "x86_64"
)))]
pub fn flush_icache_range(_start: *const u8, _size: usize) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(any(
    target_arch = "powerpc",
    target_arch = "powerpc64",
    all(target_arch = "aarch64", not(target_os = "macos"))
))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, size: libc::size_t);
}
