use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::pipeline::{
    AccumulationMonitor, MonitorError, MonitorReport, UnitError, WorkPartitioner,
};

/// Count-down latch that opens once every worker has returned.
#[derive(Debug)]
pub struct CompletionLatch {
    remaining: Mutex<usize>,
    opened: Condvar,
}

impl CompletionLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            opened: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.opened.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        *self.remaining.lock().unwrap_or_else(PoisonError::into_inner) == 0
    }

    /// Blocks for at most `timeout`; returns whether the latch is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        while *remaining > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .opened
                .wait_timeout(remaining, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            remaining = guard;
        }
        true
    }
}

/// Counts the worker down even when it unwinds.
struct LatchGuard<'a>(&'a CompletionLatch);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub position: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolReport {
    pub units: usize,
    pub failures: Vec<UnitFailure>,
    pub monitor: MonitorReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `work` over every unit on `size` threads while `monitor` runs on the
    /// calling thread. A unit that fails or panics is logged and recorded; the
    /// pool moves on.
    pub fn run<U, F>(
        &self,
        partitioner: &WorkPartitioner<U>,
        monitor: &mut AccumulationMonitor<'_>,
        work: F,
    ) -> Result<PoolReport, MonitorError>
    where
        U: Sync,
        F: Fn(usize, &U) -> Result<(), UnitError> + Sync,
    {
        let latch = CompletionLatch::new(self.size);
        let failures = Mutex::new(Vec::new());

        let monitor_result = thread::scope(|scope| {
            for worker in 0..self.size {
                let latch = &latch;
                let failures = &failures;
                let work = &work;
                scope.spawn(move || {
                    let _guard = LatchGuard(latch);
                    while let Some((position, unit)) = partitioner.next() {
                        let message = match panic::catch_unwind(AssertUnwindSafe(|| {
                            work(position, unit)
                        })) {
                            Ok(Ok(())) => continue,
                            Ok(Err(err)) => {
                                warn!(worker, position, error = %err, "unit failed; skipping");
                                err.to_string()
                            }
                            Err(payload) => {
                                let message = panic_message(payload.as_ref());
                                warn!(worker, position, panic = %message, "unit panicked; skipping");
                                message
                            }
                        };
                        failures
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(UnitFailure { position, message });
                    }
                    debug!(worker, "worker finished");
                });
            }
            monitor.run(&latch)
        });

        let mut failures = failures.into_inner().unwrap_or_else(PoisonError::into_inner);
        failures.sort_by_key(|failure| failure.position);
        Ok(PoolReport {
            units: partitioner.len(),
            failures,
            monitor: monitor_result?,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
    match detail {
        Some(detail) => format!("unit panicked: {detail}"),
        None => "unit panicked".to_string(),
    }
}
