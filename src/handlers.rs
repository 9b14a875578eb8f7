//! Signal handlers. Everything here runs in an asynchronous signal context:
//! no allocation, no locks, no formatting. Only atomics, `sem_post`,
//! `sigsuspend`, `write` and `pthread_setcancelstate`.

use atomic::Ordering;
use libc::{c_int, c_void, siginfo_t};

use crate::{
    registry::current_thread_record,
    safepoint::StopTheWorld,
    signals::{self, CancelStateGuard, ErrnoGuard},
    stack::{approximate_stack_pointer, register_backing_store_pointer},
};

#[inline(always)]
fn world() -> &'static StopTheWorld {
    match StopTheWorld::get() {
        Some(world) => world,
        None => signals::abort_from_handler(b"stop-the-world signal before initialization"),
    }
}

pub(crate) extern "C" fn suspend_handler(sig: c_int, _info: *mut siginfo_t, _context: *mut c_void) {
    let _errno = ErrnoGuard::save();
    let world = world();
    let my_generation = world.stop_generation.load(Ordering::Acquire);

    if sig != world.suspend_signal {
        signals::abort_from_handler(b"Bad signal in suspend_handler");
    }

    let _cancel = CancelStateGuard::disable();

    // Safe without locking: the coordinator holds the allocation lock, so
    // the registry cannot change under us. Only registered threads are
    // signaled, and registering binds the record to the thread.
    let me = match current_thread_record() {
        Some(me) => me,
        None => signals::abort_from_handler(b"Suspend signal to a thread without a bound record"),
    };

    if me.stop_info.last_stop_generation.load(Ordering::Acquire) == my_generation {
        // Duplicate signal. OK if we are retrying.
        if !world.retry_signals {
            let mut buf = [0u8; 18];
            signals::write_stderr(b"[gc] warning: Duplicate suspend signal in thread ");
            signals::write_stderr(signals::format_hex(me.id() as usize, &mut buf));
            signals::write_stderr(b"\n");
        }
        return;
    }

    // The interrupted register context was pushed by the kernel above this
    // frame, so scanning from here covers it.
    me.stop_info
        .stack_ptr
        .store(approximate_stack_pointer(), Ordering::Release);
    if world.register_stack {
        if let Some(bsp) = register_backing_store_pointer() {
            me.stop_info.backing_store_ptr.store(bsp, Ordering::Release);
        }
    }

    // Published before the acknowledgment, so the coordinator sees the new
    // generation as soon as it has consumed the post. The suspend signal is
    // blocked in here, so the duplicate check above cannot race with it.
    me.stop_info
        .last_stop_generation
        .store(my_generation, Ordering::Release);
    world.suspend_ack.post();

    // The restart signal is blocked until sigsuspend lets it through, so it
    // cannot slip in before we wait. Any other unblocked signal may wake us
    // too, hence the loop.
    loop {
        unsafe {
            libc::sigsuspend(world.suspend_wait_mask.as_raw());
        }
        if !(world.world_is_stopped.load(Ordering::Acquire)
            && world.stop_generation.load(Ordering::Acquire) == my_generation)
        {
            break;
        }
    }

    me.stop_info
        .last_resume_generation
        .store(my_generation, Ordering::Release);
}

/// Does nothing useful by itself, but without a handler the restart signal
/// would not interrupt `sigsuspend`.
pub(crate) extern "C" fn restart_handler(sig: c_int) {
    let _errno = ErrnoGuard::save();
    let world = world();
    if sig != world.restart_signal {
        signals::abort_from_handler(b"Bad signal in restart_handler");
    }
    if let Some(restart_ack) = world.restart_ack.as_ref() {
        restart_ack.post();
    }
}
