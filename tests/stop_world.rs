mod common;

use std::{
    cell::Cell,
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use comet_stw::{
    initialize,
    signals::{self, SignalError},
    stack::StackBounds,
    Config, StackRange, StopTheWorld, ThreadRecord, ThreadRegistry, ThreadTable,
};
use common::{Workers, SERIAL};
use libc::{c_int, pthread_t};

fn world() -> &'static StopTheWorld {
    std::env::remove_var("COMET_RETRY_SIGNALS");
    initialize(Config::default())
}

#[test]
fn initialize_once() {
    let _serial = SERIAL.lock();
    let first = world();
    let second = initialize(Config {
        verbose: true,
        ..Config::default()
    });
    assert!(std::ptr::eq(first, second));
    assert!(!second.config().verbose);
    assert!(!first.retry_signals());
    assert!(!first.is_world_stopped());
}

#[test]
fn handler_masks() {
    let _serial = SERIAL.lock();
    let world = world();
    let mask = world.handler_mask();
    for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGABRT, libc::SIGTERM] {
        assert!(!mask.contains(sig));
    }
    assert!(mask.contains(world.suspend_signal()));
    assert!(mask.contains(world.restart_signal()));
    assert!(mask.contains(libc::SIGSEGV));

    let wait_mask = world.suspend_wait_mask();
    assert!(!wait_mask.contains(world.restart_signal()));
    assert!(wait_mask.contains(world.suspend_signal()));
}

#[test]
fn stops_and_scans_all_threads() {
    let _serial = SERIAL.lock();
    let world = world();
    let workers = Workers::spawn(4);
    let records = workers.records();

    let table = workers.table.lock();
    unsafe { world.stop_world(&*table) };
    let generation = world.stop_generation();
    assert!(world.is_world_stopped());
    assert_eq!(world.statistics().snapshot().last_acknowledgments, 4);

    let mut ranges: Vec<(pthread_t, StackRange)> = vec![];
    let visited = unsafe {
        world.collect_roots(&*table, &mut |thread: &ThreadRecord, range: StackRange| {
            ranges.push((thread.id(), range))
        })
    };
    assert_eq!(visited, 5);
    assert_eq!(ranges.len(), 5);

    for record in records.iter() {
        assert_eq!(
            record.stop_info.last_stop_generation.load(Ordering::Acquire),
            generation
        );
        assert!(!record.stop_info.stack_ptr.load(Ordering::Acquire).is_null());
    }
    for (id, range) in ranges.iter() {
        let record = table.lookup(*id).unwrap();
        assert!(!range.is_empty());
        assert_eq!(range.high, record.stack_end() as *const u8);
        assert!(range.low >= record.stack_bounds().bound as *const u8);
        assert!(range.low < range.high);
    }

    let frozen = workers.counts();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(frozen, workers.counts());

    unsafe { world.start_world(&*table) };
    assert!(!world.is_world_stopped());
    drop(table);

    workers.assert_progress(&frozen);
}

#[test]
fn generations_increase_without_leaking_acks() {
    let _serial = SERIAL.lock();
    let world = world();
    let workers = Workers::spawn(3);

    let mut last = world.stop_generation();
    for _ in 0..10 {
        let table = workers.table.lock();
        unsafe { world.stop_world(&*table) };
        assert!(world.stop_generation() > last);
        last = world.stop_generation();
        assert_eq!(world.pending_acknowledgments(), 0);
        assert_eq!(world.statistics().snapshot().last_acknowledgments, 3);
        unsafe {
            world.collect_roots(&*table, &mut |_: &ThreadRecord, _: StackRange| {});
            world.start_world(&*table);
        }
        drop(table);
        let before = workers.counts();
        workers.assert_progress(&before);
    }
    assert_eq!(world.pending_acknowledgments(), 0);
}

#[test]
fn generation_is_visible_when_stop_returns() {
    let _serial = SERIAL.lock();
    let world = world();
    let workers = Workers::spawn(8);
    let records = workers.records();

    let table = workers.table.lock();
    let mut last = world.stop_generation();
    for _ in 0..500 {
        unsafe { world.stop_world(&*table) };
        let generation = world.stop_generation();
        assert!(generation > last);
        last = generation;
        for record in records.iter() {
            assert_eq!(
                record.stop_info.last_stop_generation.load(Ordering::Acquire),
                generation
            );
        }
        assert_eq!(world.pending_acknowledgments(), 0);
        assert_eq!(world.statistics().snapshot().last_acknowledgments, 8);
        // Straight back into the next stop, no mutator progress in between.
        unsafe { world.start_world(&*table) };
    }
    drop(table);

    let before = workers.counts();
    workers.assert_progress(&before);
}

/// Registry owned by the embedder, binding records itself instead of going
/// through `ThreadTable`.
struct ExternalRegistry {
    threads: Vec<Arc<ThreadRecord>>,
}

impl ThreadRegistry for ExternalRegistry {
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
        null_mut()
    }
}

fn current_record() -> Arc<ThreadRecord> {
    Arc::new(ThreadRecord::new(
        unsafe { libc::pthread_self() },
        StackBounds::current_thread_stack_bounds().unwrap(),
        false,
    ))
}

#[test]
fn external_registry_binds_its_own_records() {
    let _serial = SERIAL.lock();
    let world = world();
    let done = Arc::new(AtomicBool::new(false));
    let (record_tx, record_rx) = mpsc::channel();
    let mutator = {
        let done = done.clone();
        std::thread::spawn(move || {
            let record = current_record();
            unsafe { record.bind_current() };
            record_tx.send(record.clone()).unwrap();
            while !done.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            ThreadRecord::unbind_current();
        })
    };
    let worker = record_rx.recv().unwrap();
    let registry = ExternalRegistry {
        threads: vec![current_record(), worker.clone()],
    };

    unsafe { world.stop_world(&registry) };
    assert_eq!(
        worker.stop_info.last_stop_generation.load(Ordering::Acquire),
        world.stop_generation()
    );
    assert_eq!(world.statistics().snapshot().last_acknowledgments, 1);
    let visited = unsafe { world.collect_roots(&registry, &mut |_: &ThreadRecord, _: StackRange| {}) };
    assert_eq!(visited, 2);
    unsafe { world.start_world(&registry) };

    done.store(true, Ordering::Relaxed);
    mutator.join().unwrap();
}

/// Reports a thread as gone the first time it is signaled, the way
/// `pthread_kill` does for a thread that exited without unregistering.
struct VanishingRegistry<'a> {
    inner: &'a ThreadTable,
    victim: pthread_t,
    attempts: Cell<usize>,
}

impl ThreadRegistry for VanishingRegistry<'_> {
    fn for_each_thread(&self, f: &mut dyn FnMut(&ThreadRecord)) {
        self.inner.for_each_thread(f)
    }

    fn lookup(&self, id: pthread_t) -> Option<&ThreadRecord> {
        self.inner.lookup(id)
    }

    fn stack_bottom(&self) -> *mut u8 {
        self.inner.stack_bottom()
    }

    fn send_signal(&self, thread: &ThreadRecord, sig: c_int) -> Result<(), SignalError> {
        if thread.id() == self.victim {
            self.attempts.set(self.attempts.get() + 1);
            thread.set_finished();
            return Err(SignalError::NoSuchThread);
        }
        signals::send_signal(thread.id(), sig)
    }
}

#[test]
fn vanished_thread_is_not_waited_for() {
    let _serial = SERIAL.lock();
    let world = world();
    let workers = Workers::spawn(4);
    let victim = workers.records()[0].clone();

    let table = workers.table.lock();
    let registry = VanishingRegistry {
        inner: &*table,
        victim: victim.id(),
        attempts: Cell::new(0),
    };
    let before = world.statistics().snapshot();
    unsafe { world.stop_world(&registry) };
    let after = world.statistics().snapshot();
    assert_eq!(after.last_acknowledgments, 3);
    assert_eq!(after.signals_sent - before.signals_sent, 3);
    assert_eq!(registry.attempts.get(), 1);
    assert_eq!(world.pending_acknowledgments(), 0);

    let visited = unsafe { world.collect_roots(&registry, &mut |_: &ThreadRecord, _: StackRange| {}) };
    assert_eq!(visited, 4);

    unsafe { world.start_world(&registry) };
    // A finished thread gets no restart signal either.
    assert_eq!(registry.attempts.get(), 1);
    assert_eq!(victim.stop_info.last_stop_generation.load(Ordering::Acquire), 0);
}

#[test]
fn duplicate_suspend_signal_is_ignored() {
    let _serial = SERIAL.lock();
    let world = world();
    let workers = Workers::spawn(2);
    let target = workers.records()[0].clone();

    {
        let table = workers.table.lock();
        unsafe { world.stop_world(&*table) };
        // Blocked while parked, delivered once the handler has returned.
        signals::send_signal(target.id(), world.suspend_signal()).unwrap();
        unsafe { world.start_world(&*table) };
    }
    let before = workers.counts();
    workers.assert_progress(&before);
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(world.pending_acknowledgments(), 0);

    let table = workers.table.lock();
    unsafe { world.stop_world(&*table) };
    assert_eq!(world.statistics().snapshot().last_acknowledgments, 2);
    unsafe { world.start_world(&*table) };
}

#[test]
fn blocked_thread_is_scanned_but_not_signaled() {
    let _serial = SERIAL.lock();
    let world = world();
    let workers = Workers::spawn(2);

    let (blocked_tx, blocked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let table = workers.table.clone();
    let sleeper = std::thread::spawn(move || {
        let record = table.lock().register_current();
        ThreadTable::do_blocking(&table, || {
            blocked_tx.send(record.clone()).unwrap();
            release_rx.recv().unwrap();
        });
        table.lock().unregister_current();
    });
    let sleeper_record = blocked_rx.recv().unwrap();
    assert!(sleeper_record.is_blocked());
    let saved_sp = sleeper_record.stop_info.stack_ptr.load(Ordering::Acquire);

    {
        let table = workers.table.lock();
        let before = world.statistics().snapshot();
        unsafe { world.stop_world(&*table) };
        let after = world.statistics().snapshot();
        assert_eq!(after.signals_sent - before.signals_sent, 2);
        assert_eq!(after.last_acknowledgments, 2);

        let mut sleeper_range = None;
        let visited = unsafe {
            world.collect_roots(&*table, &mut |thread: &ThreadRecord, range: StackRange| {
                if thread.id() == sleeper_record.id() {
                    sleeper_range = Some(range);
                }
            })
        };
        assert_eq!(visited, 4);
        let range = sleeper_range.unwrap();
        assert_eq!(range.low, saved_sp as *const u8);
        assert_eq!(range.high, sleeper_record.stack_end() as *const u8);
        unsafe { world.start_world(&*table) };
    }

    release_tx.send(()).unwrap();
    sleeper.join().unwrap();
    assert!(!sleeper_record.is_blocked());
}
