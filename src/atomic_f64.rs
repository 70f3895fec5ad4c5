//! Atomic `f64` addition via compare-exchange on the bit pattern. Rust has
//! no native atomic float; this is the textbook CAS-loop workaround, used
//! for the gradient engine's per-feature `g` accumulation where multiple
//! worker threads add concurrently to the same feature.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomically add `delta` to the `f64` stored (as bits) in `cell`, returning
/// the previous value.
pub fn atomic_add_f64(cell: &AtomicU64, delta: f64) -> f64 {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let current_f = f64::from_bits(current);
        let new_f = current_f + delta;
        match cell.compare_exchange_weak(
            current,
            new_f.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return current_f,
            Err(observed) => current = observed,
        }
    }
}

pub fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

pub fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

pub fn new_atomic_f64(value: f64) -> AtomicU64 {
    AtomicU64::new(value.to_bits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_adds_sum_correctly() {
        let cell = Arc::new(new_atomic_f64(0.0));
        let mut handles = vec![];
        for _ in 0..8 {
            let cell = Arc::clone(&cell);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    atomic_add_f64(&cell, 1.0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(load_f64(&cell), 8000.0);
    }
}
