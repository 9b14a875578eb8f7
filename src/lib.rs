//! # Comet STW
//!
//! Signal-based stop-the-world for conservative garbage collectors running
//! over native threads. The collector thread signals every other registered
//! thread; each one saves its stack pointer from inside the signal handler,
//! acknowledges and parks until it is told to restart. While the world is
//! stopped the collector gets one stack range per thread to scan.
//!
//! ```no_run
//! use comet_stw::{initialize, registry::ThreadTable, visitor::StackRange, Config};
//! use comet_stw::registry::ThreadRecord;
//! use parking_lot::Mutex;
//!
//! let world = initialize(Config::default());
//! let threads = Mutex::new(ThreadTable::new());
//! threads.lock().register_main();
//!
//! let table = threads.lock();
//! unsafe {
//!     world.stop_world(&*table);
//!     world.collect_roots(&*table, &mut |thread: &ThreadRecord, range: StackRange| {
//!         println!("{:#x}: {} bytes", thread.id() as usize, range.len());
//!     });
//!     world.start_world(&*table);
//! }
//! ```
//!
//! The allocation lock (here the `Mutex` around the table) is the caller's
//! business: it has to be held from `stop_world` to `start_world` and around
//! every change to the registry.
//!
//! # Retry mode
//!
//! On platforms that may silently drop a signal aimed at a running thread the
//! coordinator polls for acknowledgments and resends to the threads that did
//! not answer in time. Set `COMET_RETRY_SIGNALS` to force it on and
//! `COMET_NO_RETRY_SIGNALS` to force it off.

#[cfg(not(unix))]
compile_error!("comet-stw suspends threads with POSIX signals and needs a Unix target");

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            eprintln!($($t)*);
        }
    };
}

macro_rules! warn {
    ($($t:tt)*) => {
        eprintln!("[gc] warning: {}", format_args!($($t)*))
    };
}

/// Prints a diagnostic with a backtrace and aborts. Not for signal handlers,
/// see [`signals::abort_from_handler`].
macro_rules! fatal {
    ($($t:tt)*) => {
        $crate::fatal_error(format_args!($($t)*))
    };
}

pub mod globals;
pub mod stack;
pub mod signals;
pub mod semaphore;
pub mod registry;
mod handlers;
pub mod safepoint;
pub mod roots;
pub mod visitor;
pub mod statistics;

use std::time::Duration;

use libc::c_int;

pub use registry::{ThreadRecord, ThreadRegistry, ThreadTable};
pub use safepoint::{initialize, StopTheWorld};
pub use visitor::{StackRange, StackVisitor};

#[cold]
#[doc(hidden)]
pub fn fatal_error(args: std::fmt::Arguments<'_>) -> ! {
    eprintln!("[gc] fatal: {}", args);
    eprintln!("{:?}", backtrace::Backtrace::new());
    std::process::abort();
}

/// Configuration for [`initialize`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Enables verbose printing
    pub verbose: bool,
    /// Poll for acknowledgments and resend lost suspend signals. Overridden
    /// by the `COMET_RETRY_SIGNALS` / `COMET_NO_RETRY_SIGNALS` environment
    /// variables.
    pub retry_signals: bool,
    /// Wait until every resumed thread has run its restart handler.
    pub resume_handshake: bool,
    /// An incremental collector uses memory protection as write barrier, so
    /// SIGSEGV and SIGBUS must stay deliverable inside the handlers.
    pub protection_barrier: bool,
    pub suspend_signal: c_int,
    pub restart_signal: c_int,
    /// Poll interval in retry mode
    pub wait_unit: Duration,
    /// How long to wait for acknowledgments before resending
    pub retry_interval: Duration,
    /// Resend rounds before giving up and aborting
    pub max_suspend_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            retry_signals: globals::DEFAULT_RETRY_SIGNALS,
            resume_handshake: globals::DEFAULT_RESUME_HANDSHAKE,
            protection_barrier: false,
            suspend_signal: globals::DEFAULT_SUSPEND_SIGNAL,
            restart_signal: globals::DEFAULT_RESTART_SIGNAL,
            wait_unit: globals::WAIT_UNIT,
            retry_interval: globals::RETRY_INTERVAL,
            max_suspend_retries: globals::MAX_SUSPEND_RETRIES,
        }
    }
}
