//! C-ABI `malloc`/`calloc`/`realloc`/`free`/`posix_memalign`/
//! `aligned_alloc`/`memalign` and the Itanium-mangled C++ `operator new`/
//! `operator delete` family (including the sized-delete and `nothrow`
//! overloads), every one of them routed through the default arena.
//!
//! Linking a binary against this crate ahead of the platform's libc (via
//! `LD_PRELOAD` or a link-order override, same mechanism jemalloc's own
//! `--with-malloc-conf`-style replacement uses) makes unmodified C/C++
//! dependencies in the same process allocate on whichever tier
//! `SH_DEFAULT_DEVICE` names, without any source change on their part.
//!
//! `operator new`'s throwing overloads can't actually throw a C++
//! exception across this boundary; on allocation failure they abort the
//! process instead of returning null, matching `operator new`'s contract
//! that it never returns null — only the `nothrow` overloads, and the C
//! `malloc` family, return null on failure.

use std::os::raw::{c_int, c_void};

fn arena() -> u32 {
    crate::default_arena_id().unwrap_or_else(|e| {
        tracing::error!(error = %e, "sicm runtime failed to initialize for malloc override");
        std::process::abort()
    })
}

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    crate::arena_alloc(arena(), size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    let ptr = crate::arena_alloc(arena(), total);
    if !ptr.is_null() {
        std::ptr::write_bytes(ptr, 0, total);
    }
    ptr as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return malloc(size);
    }
    if size == 0 {
        free(ptr);
        return std::ptr::null_mut();
    }
    let Some(arena_id) = crate::lookup(ptr as *const u8) else {
        tracing::warn!("realloc on a pointer this runtime never allocated");
        return std::ptr::null_mut();
    };
    crate::arena_realloc(arena_id, ptr as *mut u8, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    crate::free(ptr as *mut u8);
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, alignment: usize, size: usize) -> c_int {
    if alignment == 0 || !alignment.is_power_of_two() || alignment % std::mem::size_of::<usize>() != 0 {
        return libc::EINVAL;
    }
    let ptr = crate::arena_alloc_aligned(arena(), size, alignment);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    *memptr = ptr as *mut c_void;
    0
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    crate::arena_alloc_aligned(arena(), size, alignment) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    crate::arena_alloc_aligned(arena(), size, alignment) as *mut c_void
}

fn new_or_abort(size: usize) -> *mut c_void {
    let ptr = crate::arena_alloc(arena(), size.max(1));
    if ptr.is_null() {
        tracing::error!(size, "operator new failed and cannot throw std::bad_alloc across FFI");
        std::process::abort();
    }
    ptr as *mut c_void
}

/// `void* operator new(std::size_t)`
#[no_mangle]
pub unsafe extern "C" fn _Znwm(size: usize) -> *mut c_void {
    new_or_abort(size)
}

/// `void* operator new[](std::size_t)`
#[no_mangle]
pub unsafe extern "C" fn _Znam(size: usize) -> *mut c_void {
    new_or_abort(size)
}

/// `void* operator new(std::size_t, const std::nothrow_t&)`
#[no_mangle]
pub unsafe extern "C" fn _ZnwmRKSt9nothrow_t(size: usize, _tag: *const c_void) -> *mut c_void {
    crate::arena_alloc(arena(), size) as *mut c_void
}

/// `void* operator new[](std::size_t, const std::nothrow_t&)`
#[no_mangle]
pub unsafe extern "C" fn _ZnamRKSt9nothrow_t(size: usize, _tag: *const c_void) -> *mut c_void {
    crate::arena_alloc(arena(), size) as *mut c_void
}

/// `void operator delete(void*)`
#[no_mangle]
pub unsafe extern "C" fn _ZdlPv(ptr: *mut c_void) {
    crate::free(ptr as *mut u8);
}

/// `void operator delete[](void*)`
#[no_mangle]
pub unsafe extern "C" fn _ZdaPv(ptr: *mut c_void) {
    crate::free(ptr as *mut u8);
}

/// `void operator delete(void*, std::size_t)` — sized delete, C++14.
#[no_mangle]
pub unsafe extern "C" fn _ZdlPvm(ptr: *mut c_void, size: usize) {
    crate::sized_free(ptr as *mut u8, size);
}

/// `void operator delete[](void*, std::size_t)` — sized delete, C++14.
#[no_mangle]
pub unsafe extern "C" fn _ZdaPvm(ptr: *mut c_void, size: usize) {
    crate::sized_free(ptr as *mut u8, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_then_free_round_trips() {
        let _ = crate::init();
        unsafe {
            let p = malloc(128);
            assert!(!p.is_null());
            free(p);
        }
    }

    #[test]
    fn calloc_zeroes_memory() {
        let _ = crate::init();
        unsafe {
            let p = calloc(16, 8) as *mut u8;
            assert!(!p.is_null());
            for i in 0..128 {
                assert_eq!(*p.add(i), 0);
            }
            free(p as *mut c_void);
        }
    }

    #[test]
    fn posix_memalign_honors_alignment() {
        let _ = crate::init();
        unsafe {
            let mut out: *mut c_void = std::ptr::null_mut();
            let rc = posix_memalign(&mut out, 4096, 256);
            assert_eq!(rc, 0);
            assert_eq!((out as usize) % 4096, 0);
            free(out);
        }
    }

    #[test]
    fn cpp_new_delete_round_trip() {
        let _ = crate::init();
        unsafe {
            let p = _Znwm(64);
            assert!(!p.is_null());
            _ZdlPv(p);
        }
    }
}
