//! Thread registry consulted by the stop-the-world protocol.
//!
//! The protocol only reads the status flags of a [`ThreadRecord`] and writes
//! the per-generation [`StopInfo`]. Creating and destroying records is the
//! registry's job; [`ThreadTable`] is a ready-made registry for embedders
//! that do not have their own.

use std::{
    cell::Cell,
    ptr::null_mut,
    sync::{
        atomic::{AtomicPtr, AtomicUsize},
        Arc,
    },
};

use atomic::{Atomic, Ordering};
use libc::{c_int, pthread_t};
use modular_bitfield::{bitfield, specifiers::B4};
use parking_lot::Mutex;

use crate::{
    signals::{self, SignalError},
    stack::{approximate_stack_pointer, register_backing_store_pointer, StackBounds},
};

#[bitfield]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadFlags {
    pub running: bool,
    pub finished: bool,
    pub main_thread: bool,
    /// The thread promised not to touch the heap and saved its stack pointer
    /// before blocking. It is never signaled.
    pub blocked: bool,
    #[skip]
    __: B4,
}

/// Per-generation suspend state. Written by the owning thread inside its
/// suspend handler, read by the coordinator after the acknowledgment.
pub struct StopInfo {
    pub last_stop_generation: AtomicUsize,
    pub last_resume_generation: AtomicUsize,
    pub stack_ptr: AtomicPtr<u8>,
    pub backing_store_ptr: AtomicPtr<u8>,
}

impl StopInfo {
    fn new() -> Self {
        Self {
            last_stop_generation: AtomicUsize::new(0),
            last_resume_generation: AtomicUsize::new(0),
            stack_ptr: AtomicPtr::new(null_mut()),
            backing_store_ptr: AtomicPtr::new(null_mut()),
        }
    }
}

pub struct ThreadRecord {
    id: pthread_t,
    flags: Atomic<ThreadFlags>,
    stack: StackBounds,
    backing_store_end: *mut u8,
    activation_frame: AtomicPtr<u8>,
    pub stop_info: StopInfo,
}

unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    pub fn new(id: pthread_t, stack: StackBounds, main_thread: bool) -> Self {
        Self {
            id,
            flags: Atomic::new(
                ThreadFlags::new()
                    .with_running(true)
                    .with_main_thread(main_thread),
            ),
            stack,
            backing_store_end: null_mut(),
            activation_frame: AtomicPtr::new(null_mut()),
            stop_info: StopInfo::new(),
        }
    }

    pub fn id(&self) -> pthread_t {
        self.id
    }

    pub fn is_current(&self) -> bool {
        self.id == unsafe { libc::pthread_self() }
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags.load(Ordering::Acquire)
    }

    fn update_flags(&self, f: impl Fn(ThreadFlags) -> ThreadFlags) {
        let mut current = self.flags.load(Ordering::Relaxed);
        loop {
            match self.flags.compare_exchange_weak(
                current,
                f(current),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.flags().finished()
    }

    pub fn is_blocked(&self) -> bool {
        self.flags().blocked()
    }

    pub fn is_main_thread(&self) -> bool {
        self.flags().main_thread()
    }

    pub fn set_finished(&self) {
        self.update_flags(|flags| flags.with_finished(true).with_running(false));
    }

    pub fn stack_end(&self) -> *mut u8 {
        self.stack.origin
    }

    pub fn stack_bounds(&self) -> StackBounds {
        self.stack
    }

    pub fn backing_store_end(&self) -> *mut u8 {
        self.backing_store_end
    }

    pub fn activation_frame(&self) -> *mut u8 {
        self.activation_frame.load(Ordering::Acquire)
    }

    pub fn set_activation_frame(&self, frame: *mut u8) {
        self.activation_frame.store(frame, Ordering::Release);
    }

    /// Saves the current stack pointer and flags the thread as blocked. The
    /// thread must not touch the heap until [`ThreadRecord::leave_blocking`].
    pub fn enter_blocking(&self) {
        debug_assert!(self.is_current());
        self.stop_info
            .stack_ptr
            .store(approximate_stack_pointer(), Ordering::Release);
        if let Some(bsp) = register_backing_store_pointer() {
            self.stop_info.backing_store_ptr.store(bsp, Ordering::Release);
        }
        self.update_flags(|flags| flags.with_blocked(true));
    }

    pub fn leave_blocking(&self) {
        debug_assert!(self.is_current());
        self.update_flags(|flags| flags.with_blocked(false));
    }

    /// Makes this record the one the suspend handler of the calling thread
    /// fills in. Every registry must bind a thread's record on that thread
    /// before the thread can be signaled; a signaled thread without a bound
    /// record aborts the process.
    ///
    /// # Safety
    /// The record must stay alive until [`ThreadRecord::unbind_current`] is
    /// called on the same thread, and its id must be the calling thread.
    pub unsafe fn bind_current(&self) {
        if !self.is_current() {
            fatal!(
                "record of thread {:#x} bound on thread {:#x}",
                self.id as usize,
                libc::pthread_self() as usize
            );
        }
        CURRENT_THREAD.with(|current| current.set(self));
    }

    /// Forgets the record bound to the calling thread, if any.
    pub fn unbind_current() {
        let _ = CURRENT_THREAD.try_with(|current| current.set(std::ptr::null()));
    }
}

thread_local! {
    static CURRENT_THREAD: Cell<*const ThreadRecord> = const { Cell::new(std::ptr::null()) };
}

/// Record of the calling thread. Only reads a thread-local pointer, so it is
/// safe to call from a signal handler.
#[inline]
pub(crate) fn current_thread_record() -> Option<&'static ThreadRecord> {
    let ptr = CURRENT_THREAD
        .try_with(|current| current.get())
        .unwrap_or(std::ptr::null());
    unsafe { ptr.as_ref() }
}

/// Everything the protocol needs from a thread registry. Implementations are
/// read while the caller holds the allocation lock, so they need no locking
/// of their own.
pub trait ThreadRegistry {
    fn for_each_thread(&self, f: &mut dyn FnMut(&ThreadRecord));
    fn lookup(&self, id: pthread_t) -> Option<&ThreadRecord>;
    /// Base of the process-original stack, used as the upper bound of the
    /// main thread.
    fn stack_bottom(&self) -> *mut u8;
    /// `true` while a thread is being created and may not have a record yet.
    fn in_thread_creation(&self) -> bool {
        false
    }
    fn send_signal(&self, thread: &ThreadRecord, sig: c_int) -> Result<(), SignalError> {
        signals::send_signal(thread.id(), sig)
    }
}

/// Table of registered threads. Meant to live inside the embedder's
/// allocation lock, e.g. `parking_lot::Mutex<ThreadTable>`.
pub struct ThreadTable {
    threads: Vec<Arc<ThreadRecord>>,
    stack_bottom: *mut u8,
    in_thread_creation: bool,
}

unsafe impl Send for ThreadTable {}
unsafe impl Sync for ThreadTable {}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            threads: Vec::new(),
            stack_bottom: null_mut(),
            in_thread_creation: false,
        }
    }

    fn register(&mut self, main_thread: bool) -> Arc<ThreadRecord> {
        if let Some(record) = current_thread_record() {
            if !record.is_finished() {
                fatal!("thread {:#x} registered twice", record.id() as usize);
            }
        }
        let bounds = match StackBounds::current_thread_stack_bounds() {
            Some(bounds) => bounds,
            None => fatal!("cannot determine stack bounds of the current thread"),
        };
        let record = Arc::new(ThreadRecord::new(
            unsafe { libc::pthread_self() },
            bounds,
            main_thread,
        ));
        if main_thread {
            self.stack_bottom = bounds.origin;
        }
        // The table keeps the record alive until `unregister_current`.
        unsafe { record.bind_current() };
        self.threads.push(record.clone());
        record
    }

    /// Registers the calling thread.
    pub fn register_current(&mut self) -> Arc<ThreadRecord> {
        self.register(false)
    }

    /// Registers the calling thread as the main thread. Its stack base
    /// becomes the process-original stack bottom.
    pub fn register_main(&mut self) -> Arc<ThreadRecord> {
        self.register(true)
    }

    /// Marks the calling thread finished and forgets it.
    pub fn unregister_current(&mut self) {
        let me = unsafe { libc::pthread_self() };
        let mut found = false;
        self.threads.retain(|record| {
            if record.id() == me {
                record.set_finished();
                found = true;
                false
            } else {
                true
            }
        });
        if !found {
            fatal!("unregistering unknown thread {:#x}", me as usize);
        }
        ThreadRecord::unbind_current();
    }

    pub fn current(&self) -> Option<&Arc<ThreadRecord>> {
        let me = unsafe { libc::pthread_self() };
        self.threads.iter().find(|record| record.id() == me)
    }

    pub fn set_in_thread_creation(&mut self, value: bool) {
        self.in_thread_creation = value;
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ThreadRecord>> {
        self.threads.iter()
    }

    /// Runs `f` with the calling thread flagged as blocked, so a collection
    /// can proceed without signaling it. `f` must not touch the heap.
    pub fn do_blocking<R>(table: &Mutex<ThreadTable>, f: impl FnOnce() -> R) -> R {
        let record = match table.lock().current() {
            Some(record) => record.clone(),
            None => fatal!("do_blocking from an unregistered thread"),
        };
        {
            let _guard = table.lock();
            record.enter_blocking();
        }
        let result = f();
        let _guard = table.lock();
        record.leave_blocking();
        result
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry for ThreadTable {
    fn for_each_thread(&self, f: &mut dyn FnMut(&ThreadRecord)) {
        for record in self.threads.iter() {
            f(record);
        }
    }

    fn lookup(&self, id: pthread_t) -> Option<&ThreadRecord> {
        self.threads
            .iter()
            .find(|record| record.id() == id)
            .map(|record| &**record)
    }

    fn stack_bottom(&self) -> *mut u8 {
        self.stack_bottom
    }

    fn in_thread_creation(&self) -> bool {
        self.in_thread_creation
    }
}
