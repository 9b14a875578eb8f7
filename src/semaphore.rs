use std::cell::UnsafeCell;

use crate::signals::errno;

/// Counting acknowledgment built on an unnamed POSIX semaphore.
///
/// `post` is the only operation that may run inside a signal handler;
/// `sem_post` is async-signal-safe while condition variables and mutexes are
/// not. The semaphore must not move once created, so it is always boxed.
pub struct AckSemaphore {
    sem: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for AckSemaphore {}
unsafe impl Sync for AckSemaphore {}

impl AckSemaphore {
    /// Creates a semaphore with a zero count. Returns the OS error code on
    /// failure.
    pub fn new() -> Result<Box<Self>, i32> {
        let this = Box::new(Self {
            sem: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        });
        if unsafe { libc::sem_init(this.sem.get(), 0, 0) } != 0 {
            return Err(errno());
        }
        Ok(this)
    }

    /// Async-signal-safe.
    #[inline]
    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.sem.get());
        }
    }

    /// Blocks until the count is positive and decrements it. Interruptions by
    /// signals (EINTR) are retried and never counted as a post.
    pub fn wait(&self) -> Result<(), i32> {
        loop {
            if unsafe { libc::sem_wait(self.sem.get()) } == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                err => return Err(err),
            }
        }
    }

    /// Decrements the count if it is positive. Never blocks.
    pub fn try_wait(&self) -> bool {
        loop {
            if unsafe { libc::sem_trywait(self.sem.get()) } == 0 {
                return true;
            }
            if errno() != libc::EINTR {
                return false;
            }
        }
    }

    /// Consumes every pending post and returns how many there were.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while self.try_wait() {
            drained += 1;
        }
        drained
    }

    pub fn value(&self) -> usize {
        let mut value = 0;
        unsafe {
            libc::sem_getvalue(self.sem.get(), &mut value);
        }
        value.max(0) as usize
    }
}

impl Drop for AckSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.sem.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn counts_posts() {
        let sem = AckSemaphore::new().unwrap();
        assert_eq!(sem.value(), 0);
        sem.post();
        sem.post();
        assert_eq!(sem.value(), 2);
        sem.wait().unwrap();
        assert_eq!(sem.value(), 1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn drain_empties_the_count() {
        let sem = AckSemaphore::new().unwrap();
        for _ in 0..5 {
            sem.post();
        }
        assert_eq!(sem.drain(), 5);
        assert_eq!(sem.value(), 0);
        assert_eq!(sem.drain(), 0);
    }

    #[test]
    fn wait_blocks_until_posted() {
        let sem = AckSemaphore::new().unwrap();
        crossbeam_utils::thread::scope(|scope| {
            scope.spawn(|_| {
                thread::sleep(Duration::from_millis(20));
                sem.post();
            });
            sem.wait().unwrap();
        })
        .unwrap();
        assert_eq!(sem.value(), 0);
    }
}
