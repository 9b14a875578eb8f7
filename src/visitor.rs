use std::ptr::NonNull;

use crate::registry::ThreadRecord;

/// Half-open byte range `[low, high)` of a stack.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StackRange {
    pub low: *const u8,
    pub high: *const u8,
}

impl StackRange {
    pub fn new(low: *const u8, high: *const u8) -> Self {
        Self { low, high }
    }

    pub fn len(&self) -> usize {
        (self.high as usize).saturating_sub(self.low as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The range as pointer-sized words, the unit a conservative scanner
    /// reads.
    pub fn words(&self) -> (*const *const u8, *const *const u8) {
        (self.low.cast(), self.high.cast())
    }
}

/// Receives the root ranges of every thread while the world is stopped.
pub trait StackVisitor {
    /// `activation_frame` is the innermost frame the owning thread declared
    /// as collector-active, if any.
    fn visit_stack(
        &mut self,
        thread: &ThreadRecord,
        range: StackRange,
        activation_frame: Option<NonNull<u8>>,
    );

    /// Register backing store of `thread`. `is_self` is set for the calling
    /// thread, whose store keeps growing while it is scanned.
    fn visit_register_stack(&mut self, thread: &ThreadRecord, range: StackRange, is_self: bool) {
        let _ = thread;
        let _ = range;
        let _ = is_self;
    }
}

impl<F> StackVisitor for F
where
    F: FnMut(&ThreadRecord, StackRange),
{
    fn visit_stack(
        &mut self,
        thread: &ThreadRecord,
        range: StackRange,
        _activation_frame: Option<NonNull<u8>>,
    ) {
        self(thread, range)
    }
}
