use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed, pre-enumerated sequence of units behind one shared counter.
#[derive(Debug)]
pub struct WorkPartitioner<U> {
    units: Vec<U>,
    cursor: AtomicUsize,
}

impl<U> WorkPartitioner<U> {
    pub fn new(units: Vec<U>) -> Self {
        Self {
            units,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Returns the next unclaimed unit with its position, or `None` once exhausted.
    pub fn next(&self) -> Option<(usize, &U)> {
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.units.get(position).map(|unit| (position, unit))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread;

    use super::WorkPartitioner;

    #[test]
    fn hands_out_units_in_order_then_nothing() {
        let partitioner = WorkPartitioner::new(vec!["r1", "r2"]);
        assert_eq!(partitioner.next(), Some((0, &"r1")));
        assert_eq!(partitioner.next(), Some((1, &"r2")));
        assert_eq!(partitioner.next(), None);
        assert_eq!(partitioner.next(), None);
        assert_eq!(partitioner.len(), 2);
    }

    #[test]
    fn concurrent_callers_claim_each_unit_exactly_once() {
        let partitioner = WorkPartitioner::new((0..1_000).collect::<Vec<u32>>());
        let claimed = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    while let Some((_, unit)) = partitioner.next() {
                        claimed.lock().expect("lock").push(*unit);
                    }
                });
            }
        });

        let claimed = claimed.into_inner().expect("lock");
        let unique = claimed.iter().copied().collect::<HashSet<_>>();
        assert_eq!(claimed.len(), 1_000);
        assert_eq!(unique.len(), 1_000);
    }
}
