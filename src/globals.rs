use std::time::Duration;

use libc::c_int;

/// Signal used to ask a thread to park itself.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const DEFAULT_SUSPEND_SIGNAL: c_int = libc::SIGPWR;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const DEFAULT_SUSPEND_SIGNAL: c_int = libc::SIGUSR1;
/// Signal used to wake parked threads up.
pub const DEFAULT_RESTART_SIGNAL: c_int = libc::SIGXCPU;

/// Whether lost suspend signals are expected on this platform.
pub const DEFAULT_RETRY_SIGNALS: bool = false;
/// NetBSD needs to wait until threads have really restarted.
pub const DEFAULT_RESUME_HANDSHAKE: bool = cfg!(target_os = "netbsd");

pub const RETRY_SIGNALS_ENV: &str = "COMET_RETRY_SIGNALS";
pub const NO_RETRY_SIGNALS_ENV: &str = "COMET_NO_RETRY_SIGNALS";

/// Sleep between two polls of the acknowledgment count in retry mode.
pub const WAIT_UNIT: Duration = Duration::from_micros(3000);
/// Cumulative wait after which missing threads are signaled again.
pub const RETRY_INTERVAL: Duration = Duration::from_micros(100_000);
pub const MAX_SUSPEND_RETRIES: usize = 50;

/// Signals the embedding process keeps control over. They are never blocked
/// by the handlers.
pub const RESERVED_SIGNALS: [c_int; 4] = [libc::SIGINT, libc::SIGQUIT, libc::SIGABRT, libc::SIGTERM];
/// Synchronous fault signals used by a protection based write barrier.
pub const FAULT_SIGNALS: [c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];
