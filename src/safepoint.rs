//! Stop-the-world coordination.
//!
//! [`StopTheWorld`] owns the process-wide state shared between the
//! coordinating thread and the signal handlers. It is created once by
//! [`initialize`](crate::initialize) and lives until the process exits.
//!
//! None of the operations take a lock of their own. The caller must hold the
//! collector's allocation lock from [`StopTheWorld::stop_world`] until the
//! matching [`StopTheWorld::start_world`]; the same lock serializes every
//! mutation of the thread registry.

use std::{
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize},
    time::{Duration, Instant},
};

use atomic::Ordering;
use crossbeam_utils::{atomic::AtomicCell, CachePadded};
use libc::c_int;
use parking_lot::Once;

use crate::{
    globals::{FAULT_SIGNALS, NO_RETRY_SIGNALS_ENV, RESERVED_SIGNALS, RETRY_SIGNALS_ENV},
    handlers,
    registry::{ThreadRecord, ThreadRegistry},
    semaphore::AckSemaphore,
    signals::{self, SigSet, SignalError, SignalHandler},
    stack::register_backing_store_pointer,
    statistics::SafepointStatistics,
    Config,
};

static WORLD: AtomicPtr<StopTheWorld> = AtomicPtr::new(null_mut());
static INIT: Once = Once::new();

pub struct StopTheWorld {
    pub(crate) stop_generation: CachePadded<AtomicUsize>,
    pub(crate) world_is_stopped: CachePadded<AtomicBool>,
    pub(crate) suspend_ack: Box<AckSemaphore>,
    pub(crate) restart_ack: Option<Box<AckSemaphore>>,
    pub(crate) retry_signals: bool,
    pub(crate) register_stack: bool,
    pub(crate) suspend_signal: c_int,
    pub(crate) restart_signal: c_int,
    handler_mask: SigSet,
    pub(crate) suspend_wait_mask: SigSet,
    stopping_thread: AtomicUsize,
    pause_start: AtomicCell<Option<Instant>>,
    config: Config,
    pub(crate) statistics: SafepointStatistics,
}

/// Sets up the signal handlers and coordination state. Only the first call
/// does anything; later calls return the existing instance and ignore
/// `config`.
pub fn initialize(config: Config) -> &'static StopTheWorld {
    INIT.call_once(move || {
        let world: &'static StopTheWorld = Box::leak(Box::new(StopTheWorld::new(config)));
        WORLD.store(world as *const _ as *mut _, Ordering::Release);
        world.install_handlers();
        if world.config.verbose {
            signals::print_blocked_signals();
        }
        logln_if!(
            world.config.verbose && world.retry_signals,
            "[gc] Will retry suspend signal if necessary."
        );
    });
    match StopTheWorld::get() {
        Some(world) => world,
        None => fatal!("stop-the-world initialization failed"),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

fn check_signal(sig: c_int, what: &str, config: &Config) {
    if sig <= 0 || sig >= signals::signal_limit() {
        fatal!("{} signal {} is not a valid signal number", what, sig);
    }
    if RESERVED_SIGNALS.contains(&sig) {
        fatal!("{} signal {} is reserved for the embedding process", what, sig);
    }
    if config.protection_barrier && FAULT_SIGNALS.contains(&sig) {
        fatal!("{} signal {} is used by the write barrier", what, sig);
    }
}

impl StopTheWorld {
    fn new(config: Config) -> Self {
        check_signal(config.suspend_signal, "suspend", &config);
        check_signal(config.restart_signal, "restart", &config);
        if config.suspend_signal == config.restart_signal {
            fatal!("suspend and restart signals must differ");
        }

        let suspend_ack = match AckSemaphore::new() {
            Ok(sem) => sem,
            Err(code) => fatal!("sem_init failed: {}", SignalError::Os(code)),
        };
        let restart_ack = if config.resume_handshake {
            match AckSemaphore::new() {
                Ok(sem) => Some(sem),
                Err(code) => fatal!("sem_init failed: {}", SignalError::Os(code)),
            }
        } else {
            None
        };

        // The restart signal stays blocked in the handler mask and is only
        // let through while parked in sigsuspend.
        let mut handler_mask = match SigSet::filled() {
            Ok(set) => set,
            Err(_) => fatal!("sigfillset() failed"),
        };
        if handler_mask
            .remove_allowed_signals(config.protection_barrier)
            .is_err()
        {
            fatal!("sigdelset() failed");
        }
        let mut suspend_wait_mask = handler_mask;
        if suspend_wait_mask.remove(config.restart_signal).is_err() {
            fatal!("sigdelset() failed");
        }

        let mut retry_signals = config.retry_signals;
        if env_flag(RETRY_SIGNALS_ENV) {
            retry_signals = true;
        }
        if env_flag(NO_RETRY_SIGNALS_ENV) {
            retry_signals = false;
        }

        Self {
            stop_generation: CachePadded::new(AtomicUsize::new(0)),
            world_is_stopped: CachePadded::new(AtomicBool::new(false)),
            suspend_ack,
            restart_ack,
            retry_signals,
            register_stack: register_backing_store_pointer().is_some(),
            suspend_signal: config.suspend_signal,
            restart_signal: config.restart_signal,
            handler_mask,
            suspend_wait_mask,
            stopping_thread: AtomicUsize::new(0),
            pause_start: AtomicCell::new(None),
            config,
            statistics: SafepointStatistics::new(),
        }
    }

    fn install_handlers(&self) {
        if signals::install_handler(
            self.suspend_signal,
            SignalHandler::Siginfo(handlers::suspend_handler),
            &self.handler_mask,
        )
        .is_err()
        {
            fatal!("Cannot set suspend handler for signal {}", self.suspend_signal);
        }
        if signals::install_handler(
            self.restart_signal,
            SignalHandler::Plain(handlers::restart_handler),
            &self.handler_mask,
        )
        .is_err()
        {
            fatal!("Cannot set restart handler for signal {}", self.restart_signal);
        }
    }

    /// The instance created by [`initialize`], if any. Only an atomic load,
    /// so signal handlers may call it.
    #[inline]
    pub fn get() -> Option<&'static StopTheWorld> {
        unsafe { WORLD.load(Ordering::Acquire).as_ref() }
    }

    pub fn stop_generation(&self) -> usize {
        self.stop_generation.load(Ordering::Acquire)
    }

    pub fn is_world_stopped(&self) -> bool {
        self.world_is_stopped.load(Ordering::Acquire)
    }

    pub fn retry_signals(&self) -> bool {
        self.retry_signals
    }

    pub fn resume_handshake(&self) -> bool {
        self.restart_ack.is_some()
    }

    pub fn has_register_stack(&self) -> bool {
        self.register_stack
    }

    pub fn suspend_signal(&self) -> c_int {
        self.suspend_signal
    }

    pub fn restart_signal(&self) -> c_int {
        self.restart_signal
    }

    pub fn handler_mask(&self) -> &SigSet {
        &self.handler_mask
    }

    pub fn suspend_wait_mask(&self) -> &SigSet {
        &self.suspend_wait_mask
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn statistics(&self) -> &SafepointStatistics {
        &self.statistics
    }

    /// Suspend acknowledgments posted but not yet consumed by a coordinator.
    pub fn pending_acknowledgments(&self) -> usize {
        self.suspend_ack.value()
    }

    /// Thread currently stopping the world, or zero.
    pub fn stopping_thread(&self) -> usize {
        self.stopping_thread.load(Ordering::Relaxed)
    }

    fn send(&self, registry: &dyn ThreadRegistry, thread: &ThreadRecord, sig: c_int) -> bool {
        match registry.send_signal(thread, sig) {
            Ok(()) => true,
            // Not really there anymore.
            Err(SignalError::NoSuchThread) => false,
            Err(err) => fatal!(
                "pthread_kill({:#x}, {}) failed: {}",
                thread.id() as usize,
                sig,
                err
            ),
        }
    }

    /// Sends the suspend signal to every thread that might still be running
    /// and returns how many signals were delivered.
    fn suspend_all(&self, registry: &dyn ThreadRegistry) -> usize {
        let generation = self.stop_generation.load(Ordering::Relaxed);
        let mut n_live_threads = 0;
        registry.for_each_thread(&mut |thread| {
            if thread.is_current() || thread.is_finished() {
                return;
            }
            if thread.stop_info.last_stop_generation.load(Ordering::Acquire) == generation {
                return;
            }
            // Will wait.
            if thread.is_blocked() {
                return;
            }
            logln_if!(
                self.config.verbose,
                "[gc] Sending suspend signal to {:#x}",
                thread.id() as usize
            );
            if self.send(registry, thread, self.suspend_signal) {
                n_live_threads += 1;
            }
        });
        self.statistics.record_signals_sent(n_live_threads);
        n_live_threads
    }

    /// Brings every registered thread except the caller to a halt inside its
    /// suspend handler. On return each signaled thread has saved its stack
    /// pointer for the new generation.
    ///
    /// # Safety
    /// The caller must hold the allocation lock and the world must not be
    /// stopped already.
    pub unsafe fn stop_world(&self, registry: &dyn ThreadRegistry) {
        debug_assert!(!self.is_world_stopped(), "world is already stopped");
        let me = libc::pthread_self();
        self.stopping_thread.store(me as usize, Ordering::Relaxed);
        logln_if!(
            self.config.verbose,
            "[gc] Stopping the world from {:#x}",
            me as usize
        );
        self.pause_start.store(Some(Instant::now()));

        // A thread lost in an earlier cycle may have answered late.
        let stale = self.suspend_ack.drain();
        if stale != 0 {
            warn!("Discarding {} stale suspend acknowledgments", stale);
        }

        let generation = self.stop_generation.load(Ordering::Relaxed) + 1;
        self.stop_generation.store(generation, Ordering::Release);
        self.world_is_stopped.store(true, Ordering::Release);

        let mut n_live_threads = self.suspend_all(registry);
        if self.retry_signals {
            n_live_threads = self.wait_for_acks_with_retry(registry, n_live_threads);
        }
        for _ in 0..n_live_threads {
            if let Err(code) = self.suspend_ack.wait() {
                fatal!("sem_wait for handler failed: {}", SignalError::Os(code));
            }
        }
        self.statistics.record_stop(n_live_threads);

        logln_if!(
            self.config.verbose,
            "[gc] World stopped from {:#x} ({} threads, generation {})",
            me as usize,
            n_live_threads,
            generation
        );
        self.stopping_thread.store(0, Ordering::Relaxed);
    }

    /// Polls the acknowledgment count and resends the suspend signal to
    /// threads that did not answer in time. Returns the number of
    /// acknowledgments to consume.
    fn wait_for_acks_with_retry(&self, registry: &dyn ThreadRegistry, mut n_live_threads: usize) -> usize {
        let mut waited = Duration::from_secs(0);
        let mut retries = 0;
        loop {
            let ack_count = self.suspend_ack.value();
            if ack_count >= n_live_threads {
                return n_live_threads;
            }
            if waited > self.config.retry_interval {
                if retries == self.config.max_suspend_retries {
                    fatal!(
                        "only {} of {} threads stopped after {} resends",
                        ack_count,
                        n_live_threads,
                        retries
                    );
                }
                retries += 1;
                let newly_sent = self.suspend_all(registry);
                self.statistics.record_resent(newly_sent);
                logln_if!(
                    self.config.verbose,
                    "[gc] Resent {} signals after timeout",
                    newly_sent
                );
                let ack_count = self.suspend_ack.value();
                if newly_sent < n_live_threads.saturating_sub(ack_count) {
                    warn!("Lost some threads during stop_world?!");
                    self.statistics
                        .record_lost(n_live_threads - ack_count - newly_sent);
                    n_live_threads = ack_count + newly_sent;
                }
                waited = Duration::from_secs(0);
            }
            std::thread::sleep(self.config.wait_unit);
            waited += self.config.wait_unit;
        }
    }

    /// Lets every parked thread continue.
    ///
    /// # Safety
    /// The world must be stopped and the caller must have held the
    /// allocation lock continuously since the matching
    /// [`StopTheWorld::stop_world`].
    pub unsafe fn start_world(&self, registry: &dyn ThreadRegistry) {
        debug_assert!(self.is_world_stopped(), "world is not stopped");
        logln_if!(self.config.verbose, "[gc] World starting");
        let generation = self.stop_generation.load(Ordering::Relaxed);

        if let Some(restart_ack) = self.restart_ack.as_ref() {
            // Posts for resent restart signals of earlier cycles.
            restart_ack.drain();
        }

        // Anyone waking up from now on must see a running world.
        self.world_is_stopped.store(false, Ordering::Release);

        let mut n_live_threads = 0;
        registry.for_each_thread(&mut |thread| {
            if thread.is_current() || thread.is_finished() || thread.is_blocked() {
                return;
            }
            logln_if!(
                self.config.verbose,
                "[gc] Sending restart signal to {:#x}",
                thread.id() as usize
            );
            if self.send(registry, thread, self.restart_signal) {
                n_live_threads += 1;
            }
        });

        if self.retry_signals {
            self.wait_for_resume_with_retry(registry, generation);
            if let Some(restart_ack) = self.restart_ack.as_ref() {
                restart_ack.drain();
            }
        } else if let Some(restart_ack) = self.restart_ack.as_ref() {
            for _ in 0..n_live_threads {
                if let Err(code) = restart_ack.wait() {
                    fatal!("sem_wait() for restart handler failed: {}", SignalError::Os(code));
                }
            }
        }

        let pause = self.pause_start.take().map(|start| start.elapsed());
        if let Some(pause) = pause {
            self.statistics.record_pause(pause);
            logln_if!(
                self.config.verbose,
                "[gc] STW({}) pause {:.4}ms, {} threads",
                generation,
                pause.as_micros() as f64 / 1000.0,
                n_live_threads
            );
        }
        logln_if!(self.config.verbose, "[gc] World started");
    }

    /// Waits until every thread parked in `generation` has left its suspend
    /// handler, resending the restart signal to stragglers.
    fn wait_for_resume_with_retry(&self, registry: &dyn ThreadRegistry, generation: usize) {
        let mut waited = Duration::from_secs(0);
        let mut retries = 0;
        loop {
            let mut stragglers = 0;
            registry.for_each_thread(&mut |thread| {
                if Self::awaits_resume(thread, generation) {
                    stragglers += 1;
                }
            });
            if stragglers == 0 {
                return;
            }
            if waited > self.config.retry_interval {
                if retries == self.config.max_suspend_retries {
                    fatal!(
                        "{} threads did not resume after {} resends",
                        stragglers,
                        retries
                    );
                }
                retries += 1;
                let mut newly_sent = 0;
                registry.for_each_thread(&mut |thread| {
                    if Self::awaits_resume(thread, generation)
                        && self.send(registry, thread, self.restart_signal)
                    {
                        newly_sent += 1;
                    }
                });
                self.statistics.record_resent(newly_sent);
                logln_if!(
                    self.config.verbose,
                    "[gc] Resent {} restart signals after timeout",
                    newly_sent
                );
                waited = Duration::from_secs(0);
            }
            std::thread::sleep(self.config.wait_unit);
            waited += self.config.wait_unit;
        }
    }

    fn awaits_resume(thread: &ThreadRecord, generation: usize) -> bool {
        !thread.is_current()
            && !thread.is_finished()
            && !thread.is_blocked()
            && thread.stop_info.last_stop_generation.load(Ordering::Acquire) == generation
            && thread.stop_info.last_resume_generation.load(Ordering::Acquire) != generation
    }
}
