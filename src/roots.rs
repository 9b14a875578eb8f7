//! Root collection: turns the stack pointers saved by parked threads into
//! ranges for the scanner.

use std::ptr::NonNull;

use atomic::Ordering;

use crate::{
    registry::{ThreadRecord, ThreadRegistry},
    safepoint::StopTheWorld,
    stack::{approximate_stack_pointer, register_backing_store_pointer},
    visitor::{StackRange, StackVisitor},
};

impl StopTheWorld {
    /// Emits the stack range of every live thread to `visitor` and returns
    /// how many threads were visited.
    ///
    /// The caller's own range starts at its current stack pointer, so values
    /// it keeps only in callee-saved registers must be spilled to its stack
    /// before calling.
    ///
    /// # Safety
    /// The caller must hold the allocation lock and the world must be
    /// stopped, unless the caller is the only registered thread.
    pub unsafe fn collect_roots(
        &self,
        registry: &dyn ThreadRegistry,
        visitor: &mut dyn StackVisitor,
    ) -> usize {
        let me = libc::pthread_self();
        if registry.lookup(me).is_none() && !registry.in_thread_creation() {
            fatal!("Collecting from unknown thread.");
        }
        logln_if!(
            self.config().verbose,
            "[gc] Pushing stacks from thread {:#x}",
            me as usize
        );

        let generation = self.stop_generation.load(Ordering::Acquire);
        let mut nthreads = 0;
        let mut total_bytes = 0;
        registry.for_each_thread(&mut |thread| {
            if thread.is_finished() {
                return;
            }
            nthreads += 1;
            let is_self = thread.id() == me;
            let (lo, bs_hi) = if is_self {
                if thread.is_blocked() {
                    fatal!("collect_roots: collecting thread {:#x} is blocked", me as usize);
                }
                let bs_hi = register_backing_store_pointer().unwrap_or(thread.backing_store_end());
                (approximate_stack_pointer(), bs_hi)
            } else {
                (
                    self.saved_stack_pointer(thread, generation),
                    thread.stop_info.backing_store_ptr.load(Ordering::Acquire),
                )
            };
            let hi = if thread.is_main_thread() {
                // The original stack.
                registry.stack_bottom()
            } else {
                thread.stack_end()
            };
            let range = StackRange::new(lo, hi);
            logln_if!(
                self.config().verbose,
                "[gc] Stack for thread {:#x} = [{:p},{:p})",
                thread.id() as usize,
                lo,
                hi
            );
            if range.low > range.high {
                fatal!(
                    "collect_roots: sp {:p} above stack end {:p} for thread {:#x}",
                    lo,
                    hi,
                    thread.id() as usize
                );
            }
            total_bytes += range.len();
            visitor.visit_stack(thread, range, NonNull::new(thread.activation_frame()));

            if self.register_stack {
                let bs_range = StackRange::new(thread.backing_store_end(), bs_hi);
                logln_if!(
                    self.config().verbose,
                    "[gc] Reg stack for thread {:#x} = [{:p},{:p})",
                    thread.id() as usize,
                    bs_range.low,
                    bs_range.high
                );
                total_bytes += bs_range.len();
                visitor.visit_register_stack(thread, bs_range, is_self);
            }
        });

        self.statistics.record_scan(nthreads, total_bytes);
        logln_if!(
            self.config().verbose,
            "[gc] Pushed {} thread stacks",
            nthreads
        );
        nthreads
    }

    /// Stack pointer a parked or blocked thread left behind. Anything else
    /// means the thread was never stopped and scanning it would race.
    fn saved_stack_pointer(&self, thread: &ThreadRecord, generation: usize) -> *mut u8 {
        let sp = thread.stop_info.stack_ptr.load(Ordering::Acquire);
        if sp.is_null() {
            fatal!(
                "collect_roots: sp not set for thread {:#x}!",
                thread.id() as usize
            );
        }
        let parked = thread.stop_info.last_stop_generation.load(Ordering::Acquire) == generation;
        if !parked && !thread.is_blocked() {
            fatal!(
                "collect_roots: thread {:#x} is not stopped in generation {}",
                thread.id() as usize,
                generation
            );
        }
        sp
    }
}
