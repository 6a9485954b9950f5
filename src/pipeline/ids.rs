use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out monotonically increasing ids for one record type during one run.
///
/// Ids are unique but follow the order in which workers ask for them, so with
/// more than one worker the same input can number its records differently.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicI64,
}

impl IdAllocator {
    pub fn seeded(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`IdAllocator::next`] would return.
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::Relaxed)
    }
}
