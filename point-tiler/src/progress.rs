//! Lock-light progress counter registry.
//!
//! The core registers named counters at phase starts and bumps them with
//! atomic operations; an external UI polls `snapshot` at its own cadence.
//! Registration and removal take a short-lived mutex, updates never do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const PHASE_INDEXING: &str = "indexing";
pub const PHASE_SAMPLING: &str = "sampling";
pub const PHASE_FLUSHING: &str = "flushing";
pub const PHASE_FINISHING: &str = "finishing";
pub const COUNTER_THROUGHPUT: &str = "points per second";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterValue {
    Integer { current: u64, max: u64 },
    Float { current: f64, max: f64 },
}

impl CounterValue {
    /// Completion in `[0, 1]`, 0 when the max is unknown.
    pub fn fraction(&self) -> f64 {
        match *self {
            CounterValue::Integer { current, max } => {
                if max == 0 {
                    0.0
                } else {
                    current as f64 / max as f64
                }
            }
            CounterValue::Float { current, max } => {
                if max == 0.0 {
                    0.0
                } else {
                    current / max
                }
            }
        }
    }
}

#[derive(Debug)]
enum CounterKind {
    Integer,
    Float,
}

/// One counter. Float values are stored as bit patterns so updates stay
/// plain atomic stores.
#[derive(Debug)]
pub struct ProgressCounter {
    kind: CounterKind,
    current: AtomicU64,
    max: AtomicU64,
}

impl ProgressCounter {
    fn integer(max: u64) -> Self {
        Self {
            kind: CounterKind::Integer,
            current: AtomicU64::new(0),
            max: AtomicU64::new(max),
        }
    }

    fn float(max: f64) -> Self {
        Self {
            kind: CounterKind::Float,
            current: AtomicU64::new(0f64.to_bits()),
            max: AtomicU64::new(max.to_bits()),
        }
    }

    pub fn inc(&self, amount: u64) {
        debug_assert!(matches!(self.kind, CounterKind::Integer));
        self.current.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn set_current(&self, value: u64) {
        debug_assert!(matches!(self.kind, CounterKind::Integer));
        self.current.store(value, Ordering::Relaxed);
    }

    pub fn set_max(&self, value: u64) {
        debug_assert!(matches!(self.kind, CounterKind::Integer));
        self.max.store(value, Ordering::Relaxed);
    }

    pub fn add_to_max(&self, amount: u64) {
        debug_assert!(matches!(self.kind, CounterKind::Integer));
        self.max.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn set_current_float(&self, value: f64) {
        debug_assert!(matches!(self.kind, CounterKind::Float));
        self.current.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn set_max_float(&self, value: f64) {
        debug_assert!(matches!(self.kind, CounterKind::Float));
        self.max.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn value(&self) -> CounterValue {
        match self.kind {
            CounterKind::Integer => CounterValue::Integer {
                current: self.current.load(Ordering::Relaxed),
                max: self.max.load(Ordering::Relaxed),
            },
            CounterKind::Float => CounterValue::Float {
                current: f64::from_bits(self.current.load(Ordering::Relaxed)),
                max: f64::from_bits(self.max.load(Ordering::Relaxed)),
            },
        }
    }
}

/// Keyed registry of counters. Cloning shares the registry; the value is
/// passed through the call graph instead of living in a global.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    counters: Arc<Mutex<Vec<(String, Arc<ProgressCounter>)>>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or returns the existing) integer counter under a name.
    pub fn register_integer(&self, name: &str, max: u64) -> Arc<ProgressCounter> {
        let mut counters = self.counters.lock().expect("progress registry poisoned");
        if let Some((_, counter)) = counters.iter().find(|(n, _)| n == name) {
            return Arc::clone(counter);
        }
        let counter = Arc::new(ProgressCounter::integer(max));
        counters.push((name.to_string(), Arc::clone(&counter)));
        counter
    }

    pub fn register_float(&self, name: &str, max: f64) -> Arc<ProgressCounter> {
        let mut counters = self.counters.lock().expect("progress registry poisoned");
        if let Some((_, counter)) = counters.iter().find(|(n, _)| n == name) {
            return Arc::clone(counter);
        }
        let counter = Arc::new(ProgressCounter::float(max));
        counters.push((name.to_string(), Arc::clone(&counter)));
        counter
    }

    pub fn remove(&self, name: &str) {
        let mut counters = self.counters.lock().expect("progress registry poisoned");
        counters.retain(|(n, _)| n != name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProgressCounter>> {
        let counters = self.counters.lock().expect("progress registry poisoned");
        counters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, counter)| Arc::clone(counter))
    }

    /// Registration-ordered snapshot for the polling UI.
    pub fn snapshot(&self) -> Vec<(String, CounterValue)> {
        let counters = self.counters.lock().expect("progress registry poisoned");
        counters
            .iter()
            .map(|(name, counter)| (name.clone(), counter.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn increments_are_visible_in_snapshots() {
        let reporter = ProgressReporter::new();
        let counter = reporter.register_integer(PHASE_INDEXING, 100);
        counter.inc(30);
        counter.inc(12);
        match reporter.snapshot().as_slice() {
            [(name, CounterValue::Integer { current, max })] => {
                assert_eq!(name, PHASE_INDEXING);
                assert_eq!(*current, 42);
                assert_eq!(*max, 100);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
    }

    #[test]
    fn float_counters_round_trip_bits() {
        let reporter = ProgressReporter::new();
        let counter = reporter.register_float(COUNTER_THROUGHPUT, 0.0);
        counter.set_current_float(12345.5);
        match counter.value() {
            CounterValue::Float { current, .. } => assert_eq!(current, 12345.5),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn registration_is_idempotent() {
        let reporter = ProgressReporter::new();
        let a = reporter.register_integer("x", 10);
        let b = reporter.register_integer("x", 999);
        a.inc(1);
        assert_eq!(
            b.value(),
            CounterValue::Integer {
                current: 1,
                max: 10
            }
        );
        assert_eq!(reporter.snapshot().len(), 1);
    }

    #[test]
    fn concurrent_increments_do_not_lose_updates() {
        let reporter = ProgressReporter::new();
        let counter = reporter.register_integer(PHASE_SAMPLING, 0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.inc(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        match counter.value() {
            CounterValue::Integer { current, .. } => assert_eq!(current, 8000),
            other => panic!("unexpected value {:?}", other),
        }
    }
}
