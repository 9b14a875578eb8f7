use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

/// Counters updated by the coordinator. Only the thread holding the
/// allocation lock writes them, any thread may read.
pub struct SafepointStatistics {
    cycles: AtomicUsize,
    signals_sent: AtomicUsize,
    signals_resent: AtomicUsize,
    acknowledgments: AtomicUsize,
    last_acknowledgments: AtomicUsize,
    lost_threads: AtomicUsize,
    stacks_scanned: AtomicUsize,
    stack_bytes_scanned: AtomicUsize,
    total_pause_nanos: AtomicU64,
    max_pause_nanos: AtomicU64,
}

impl SafepointStatistics {
    pub(crate) fn new() -> Self {
        Self {
            cycles: AtomicUsize::new(0),
            signals_sent: AtomicUsize::new(0),
            signals_resent: AtomicUsize::new(0),
            acknowledgments: AtomicUsize::new(0),
            last_acknowledgments: AtomicUsize::new(0),
            lost_threads: AtomicUsize::new(0),
            stacks_scanned: AtomicUsize::new(0),
            stack_bytes_scanned: AtomicUsize::new(0),
            total_pause_nanos: AtomicU64::new(0),
            max_pause_nanos: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_signals_sent(&self, count: usize) {
        self.signals_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_resent(&self, count: usize) {
        self.signals_resent.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_lost(&self, count: usize) {
        self.lost_threads.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_stop(&self, acknowledged: usize) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.acknowledgments.fetch_add(acknowledged, Ordering::Relaxed);
        self.last_acknowledgments.store(acknowledged, Ordering::Relaxed);
    }

    pub(crate) fn record_scan(&self, threads: usize, bytes: usize) {
        self.stacks_scanned.fetch_add(threads, Ordering::Relaxed);
        self.stack_bytes_scanned.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_pause(&self, pause: Duration) {
        let nanos = pause.as_nanos() as u64;
        self.total_pause_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_pause_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            signals_sent: self.signals_sent.load(Ordering::Relaxed),
            signals_resent: self.signals_resent.load(Ordering::Relaxed),
            acknowledgments: self.acknowledgments.load(Ordering::Relaxed),
            last_acknowledgments: self.last_acknowledgments.load(Ordering::Relaxed),
            lost_threads: self.lost_threads.load(Ordering::Relaxed),
            stacks_scanned: self.stacks_scanned.load(Ordering::Relaxed),
            stack_bytes_scanned: self.stack_bytes_scanned.load(Ordering::Relaxed),
            total_pause: Duration::from_nanos(self.total_pause_nanos.load(Ordering::Relaxed)),
            max_pause: Duration::from_nanos(self.max_pause_nanos.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StatisticsSnapshot {
    pub cycles: usize,
    /// Suspend signals delivered, first sends and resends alike.
    pub signals_sent: usize,
    pub signals_resent: usize,
    pub acknowledgments: usize,
    /// Acknowledgments consumed by the most recent stop.
    pub last_acknowledgments: usize,
    pub lost_threads: usize,
    pub stacks_scanned: usize,
    pub stack_bytes_scanned: usize,
    pub total_pause: Duration,
    pub max_pause: Duration,
}

struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

fn millis(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}

impl std::fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Safepoint statistics:")?;
        writeln!(f, "  Stop-the-world cycles: {}", self.cycles)?;
        writeln!(
            f,
            "  Suspend signals sent: {} ({} resent)",
            self.signals_sent, self.signals_resent
        )?;
        writeln!(f, "  Acknowledgments: {}", self.acknowledgments)?;
        writeln!(f, "  Threads lost: {}", self.lost_threads)?;
        writeln!(
            f,
            "  Stacks scanned: {} ({})",
            self.stacks_scanned,
            formatted_size(self.stack_bytes_scanned)
        )?;
        let average = if self.cycles == 0 {
            0.0
        } else {
            millis(self.total_pause) / self.cycles as f64
        };
        writeln!(
            f,
            "  Pause: {:.4}ms total, {:.4}ms average, {:.4}ms max",
            millis(self.total_pause),
            average,
            millis(self.max_pause)
        )?;
        Ok(())
    }
}
