//! Thin layer over the POSIX signal API: masks, handler installation,
//! delivery to a single thread and the async-signal-safe helpers used by the
//! handlers.

use std::{fmt, mem::MaybeUninit, ptr::null_mut};

use libc::{c_int, c_void, pthread_t, siginfo_t};

use crate::globals::{FAULT_SIGNALS, RESERVED_SIGNALS};

#[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}
#[cfg(any(target_vendor = "apple", target_os = "freebsd", target_os = "dragonfly"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno()
}

/// Last OS error of the calling thread.
#[inline]
pub fn errno() -> c_int {
    unsafe { *errno_location() }
}

/// Restores `errno` when dropped, so a handler never clobbers the error code
/// of the code it interrupted.
pub struct ErrnoGuard(c_int);

impl ErrnoGuard {
    #[inline]
    pub fn save() -> Self {
        Self(errno())
    }
}

impl Drop for ErrnoGuard {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            *errno_location() = self.0;
        }
    }
}

extern "C" {
    fn pthread_setcancelstate(state: c_int, oldstate: *mut c_int) -> c_int;
}

#[cfg(target_vendor = "apple")]
const PTHREAD_CANCEL_DISABLE: c_int = 0x00;
#[cfg(not(target_vendor = "apple"))]
const PTHREAD_CANCEL_DISABLE: c_int = 1;

/// Disables pthread cancellation until dropped. `sigsuspend` is a
/// cancellation point and an asynchronous cancel in the middle of the
/// handshake would leave the coordinator waiting forever.
pub struct CancelStateGuard(c_int);

impl CancelStateGuard {
    #[inline]
    pub fn disable() -> Self {
        let mut old = 0;
        unsafe {
            pthread_setcancelstate(PTHREAD_CANCEL_DISABLE, &mut old);
        }
        Self(old)
    }
}

impl Drop for CancelStateGuard {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            pthread_setcancelstate(self.0, null_mut());
        }
    }
}

/// Highest signal number a mask can hold plus one.
pub fn signal_limit() -> c_int {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        libc::SIGRTMAX() + 1
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        32
    }
}

#[derive(Clone, Copy)]
pub struct SigSet {
    raw: libc::sigset_t,
}

impl SigSet {
    pub fn empty() -> Self {
        unsafe {
            let mut raw = MaybeUninit::<libc::sigset_t>::zeroed();
            libc::sigemptyset(raw.as_mut_ptr());
            Self {
                raw: raw.assume_init(),
            }
        }
    }

    pub fn filled() -> Result<Self, c_int> {
        unsafe {
            let mut raw = MaybeUninit::<libc::sigset_t>::zeroed();
            if libc::sigfillset(raw.as_mut_ptr()) != 0 {
                return Err(errno());
            }
            Ok(Self {
                raw: raw.assume_init(),
            })
        }
    }

    /// Mask of signals currently blocked in the calling thread.
    pub fn blocked() -> Result<Self, c_int> {
        let mut set = Self::empty();
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut set.raw) };
        if rc != 0 {
            return Err(rc);
        }
        Ok(set)
    }

    pub fn add(&mut self, sig: c_int) -> Result<(), c_int> {
        if unsafe { libc::sigaddset(&mut self.raw, sig) } != 0 {
            return Err(errno());
        }
        Ok(())
    }

    pub fn remove(&mut self, sig: c_int) -> Result<(), c_int> {
        if unsafe { libc::sigdelset(&mut self.raw, sig) } != 0 {
            return Err(errno());
        }
        Ok(())
    }

    pub fn contains(&self, sig: c_int) -> bool {
        unsafe { libc::sigismember(&self.raw, sig) == 1 }
    }

    pub fn members(&self) -> Vec<c_int> {
        (1..signal_limit()).filter(|sig| self.contains(*sig)).collect()
    }

    pub fn as_raw(&self) -> &libc::sigset_t {
        &self.raw
    }

    /// Takes out the signals the process keeps for itself and, with a
    /// protection based write barrier, the fault signals its handler needs.
    pub fn remove_allowed_signals(&mut self, protection_barrier: bool) -> Result<(), c_int> {
        for sig in RESERVED_SIGNALS.iter() {
            self.remove(*sig)?;
        }
        if protection_barrier {
            for sig in FAULT_SIGNALS.iter() {
                self.remove(*sig)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.members()).finish()
    }
}

/// Blocked signals of the calling thread as printed by debug builds.
pub fn print_blocked_signals() {
    match SigSet::blocked() {
        Ok(set) => eprintln!("Blocked: {:?}", set),
        Err(_) => fatal!("pthread_sigmask"),
    }
}

pub enum SignalHandler {
    Siginfo(extern "C" fn(c_int, *mut siginfo_t, *mut c_void)),
    Plain(extern "C" fn(c_int)),
}

pub fn install_handler(sig: c_int, handler: SignalHandler, mask: &SigSet) -> Result<(), c_int> {
    unsafe {
        let mut action: libc::sigaction = MaybeUninit::zeroed().assume_init();
        action.sa_mask = mask.raw;
        match handler {
            SignalHandler::Siginfo(f) => {
                action.sa_sigaction = f as usize;
                action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            }
            SignalHandler::Plain(f) => {
                action.sa_sigaction = f as usize;
                action.sa_flags = libc::SA_RESTART;
            }
        }
        if libc::sigaction(sig, &action, null_mut()) != 0 {
            return Err(errno());
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SignalError {
    /// The target thread has already exited.
    NoSuchThread,
    Os(c_int),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchThread => write!(f, "no such thread"),
            Self::Os(code) => write!(f, "{}", std::io::Error::from_raw_os_error(*code)),
        }
    }
}

impl std::error::Error for SignalError {}

pub fn send_signal(thread: pthread_t, sig: c_int) -> Result<(), SignalError> {
    match unsafe { libc::pthread_kill(thread, sig) } {
        0 => Ok(()),
        libc::ESRCH => Err(SignalError::NoSuchThread),
        code => Err(SignalError::Os(code)),
    }
}

/// Async-signal-safe write to stderr.
pub fn write_stderr(msg: &[u8]) {
    let mut rest = msg;
    while !rest.is_empty() {
        let written = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
        if written <= 0 {
            if written < 0 && errno() == libc::EINTR {
                continue;
            }
            return;
        }
        rest = &rest[written as usize..];
    }
}

/// Formats `value` as hex into `buf` without allocating.
pub fn format_hex(value: usize, buf: &mut [u8; 18]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut pos = buf.len();
    let mut value = value;
    loop {
        pos -= 1;
        buf[pos] = DIGITS[value & 0xf];
        value >>= 4;
        if value == 0 {
            break;
        }
    }
    pos -= 1;
    buf[pos] = b'x';
    pos -= 1;
    buf[pos] = b'0';
    &buf[pos..]
}

#[cold]
pub fn abort_from_handler(msg: &[u8]) -> ! {
    write_stderr(b"[gc] fatal: ");
    write_stderr(msg);
    write_stderr(b"\n");
    unsafe { libc::abort() }
}
