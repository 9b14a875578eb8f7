//! Stack pointer capture and thread stack bounds.
//!
//! Every supported target grows its machine stack downwards, so a thread's
//! stack is the half-open range `[sp, stack_end)`.

use std::{mem::MaybeUninit, ptr::null_mut};

/// Address of a local in the caller's frame. Everything the caller and its
/// callers keep on the stack lives at or above this address.
#[inline(always)]
pub fn approximate_stack_pointer() -> *mut u8 {
    let mut result: *mut u8 = null_mut();
    result = &mut result as *mut *mut u8 as *mut u8;
    result
}

/// Current top of the register backing store.
///
/// Only architectures that spill registers to a second, upward growing stack
/// (IA-64) have one; none of the targets supported here do, so collection
/// never has to emit a second range.
#[inline(always)]
pub fn register_backing_store_pointer() -> Option<*mut u8> {
    None
}

/// Bounds of a thread's machine stack. `origin` is the highest address
/// (where the stack starts), `bound` the lowest usable one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StackBounds {
    pub origin: *mut u8,
    pub bound: *mut u8,
}

impl StackBounds {
    pub fn size(&self) -> usize {
        self.origin as usize - self.bound as usize
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        addr >= self.bound as usize && addr <= self.origin as usize
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn current_thread_stack_bounds() -> Option<Self> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_attr_t>::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
                return None;
            }
            let mut addr = null_mut();
            let mut size = 0;
            let rc = libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
            libc::pthread_attr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return None;
            }
            let bound = addr as *mut u8;
            Some(Self {
                origin: bound.add(size),
                bound,
            })
        }
    }

    #[cfg(target_os = "freebsd")]
    pub fn current_thread_stack_bounds() -> Option<Self> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
            if libc::pthread_attr_init(attr.as_mut_ptr()) != 0 {
                return None;
            }
            let mut rc = libc::pthread_attr_get_np(libc::pthread_self(), attr.as_mut_ptr());
            let mut addr = null_mut();
            let mut size = 0;
            if rc == 0 {
                rc = libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
            }
            libc::pthread_attr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return None;
            }
            let bound = addr as *mut u8;
            Some(Self {
                origin: bound.add(size),
                bound,
            })
        }
    }

    #[cfg(target_vendor = "apple")]
    pub fn current_thread_stack_bounds() -> Option<Self> {
        unsafe {
            let thread = libc::pthread_self();
            let origin = libc::pthread_get_stackaddr_np(thread) as *mut u8;
            let size = libc::pthread_get_stacksize_np(thread);
            Some(Self {
                origin,
                bound: origin.sub(size),
            })
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_vendor = "apple"
    )))]
    pub fn current_thread_stack_bounds() -> Option<Self> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_stack_contains_locals() {
        let bounds = StackBounds::current_thread_stack_bounds().unwrap();
        let local = 0u64;
        assert!(bounds.bound < bounds.origin);
        assert!(bounds.contains(&local as *const u64 as *const u8));
        assert!(bounds.contains(approximate_stack_pointer()));
    }

    #[test]
    fn deeper_frames_have_lower_stack_pointers() {
        #[inline(never)]
        fn inner() -> usize {
            approximate_stack_pointer() as usize
        }
        let outer = approximate_stack_pointer() as usize;
        assert!(inner() < outer);
    }
}
