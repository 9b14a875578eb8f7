#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use comet_stw::{ThreadRecord, ThreadTable};
use parking_lot::Mutex;

/// Stop/start cycles of concurrently running tests would interleave, and the
/// protocol state is process-global.
pub static SERIAL: Mutex<()> = parking_lot::const_mutex(());

/// Spinning mutator threads registered in a private table together with the
/// calling thread.
pub struct Workers {
    pub table: Arc<Mutex<ThreadTable>>,
    done: Arc<AtomicBool>,
    counters: Vec<Arc<AtomicUsize>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn spawn(count: usize) -> Self {
        let table = Arc::new(Mutex::new(ThreadTable::new()));
        table.lock().register_current();
        let done = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(AtomicUsize::new(0));
        let mut counters = vec![];
        let mut handles = vec![];
        for _ in 0..count {
            let counter = Arc::new(AtomicUsize::new(0));
            counters.push(counter.clone());
            let table = table.clone();
            let done = done.clone();
            let ready = ready.clone();
            handles.push(std::thread::spawn(move || {
                table.lock().register_current();
                ready.fetch_add(1, Ordering::AcqRel);
                while !done.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
                table.lock().unregister_current();
            }));
        }
        wait_until(Duration::from_secs(10), || {
            ready.load(Ordering::Acquire) == count
        });
        Self {
            table,
            done,
            counters,
            handles,
        }
    }

    pub fn counts(&self) -> Vec<usize> {
        self.counters
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .collect()
    }

    /// Waits until every worker made progress past `before`.
    pub fn assert_progress(&self, before: &[usize]) {
        wait_until(Duration::from_secs(10), || {
            self.counts()
                .iter()
                .zip(before.iter())
                .all(|(now, then)| now > then)
        });
    }

    /// Records of the workers, excluding the calling thread.
    pub fn records(&self) -> Vec<Arc<ThreadRecord>> {
        self.table
            .lock()
            .iter()
            .filter(|record| !record.is_current())
            .cloned()
            .collect()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            handle.join().unwrap();
        }
        self.table.lock().unregister_current();
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < timeout, "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}
