//! Producer-side seqlock cell.
//!
//! A field declared [`Atomicity::Seqlock`](crate::Atomicity::Seqlock) pairs
//! its value with a sequence word: the writer bumps the word to odd, writes
//! the value, then publishes an even word with release ordering. Observers
//! copy the value between two reads of the word and retry when it changed or
//! was odd, so a wider-than-word value is never decoded torn.
//!
//! By convention the sequence word is the `u64` immediately preceding the
//! field's registered offset; `Seqlock<T>` lays exactly that out, so
//! registering the field at `base + Seqlock::<T>::value_offset()` makes the
//! observer's protocol line up.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// A value writable without locks and readable out-of-process without
/// tearing. Single writer; any number of readers.
///
/// `T` must be `Copy` with alignment at most 8 so the value lands directly
/// after the sequence word.
#[repr(C)]
pub struct Seqlock<T> {
    seq: AtomicU64,
    value: UnsafeCell<T>,
}

// SAFETY: the write protocol tolerates concurrent readers by design; the
// only mutation path is `write`, which the producer must not call from two
// threads at once for the same cell (it is the single writer).
unsafe impl<T: Send> Send for Seqlock<T> {}
unsafe impl<T: Send> Sync for Seqlock<T> {}

impl<T: Copy> Seqlock<T> {
    pub fn new(value: T) -> Self {
        Self {
            seq: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Byte offset of the value within the cell, for field registration.
    pub fn value_offset() -> u32 {
        core::mem::offset_of!(Seqlock<u64>, value) as u32
    }

    /// Publish a new value.
    pub fn write(&self, value: T) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: single writer; readers only copy and validate.
        unsafe { std::ptr::write_volatile(self.value.get(), value) };
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read the current value, retrying across concurrent writes.
    pub fn read(&self) -> T {
        loop {
            let seq1 = self.seq.load(Ordering::Acquire);
            if seq1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: the copy may race a writer; the sequence check below
            // discards any torn result before it is returned.
            let value = unsafe { std::ptr::read_volatile(self.value.get()) };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == seq1 {
                return value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn value_sits_after_sequence_word() {
        assert_eq!(Seqlock::<u64>::value_offset(), 8);
        assert_eq!(core::mem::size_of::<Seqlock<f64>>(), 16);
    }

    #[test]
    fn write_then_read() {
        let cell = Seqlock::new(0.0f64);
        cell.write(1.25);
        assert_eq!(cell.read(), 1.25);
    }

    #[test]
    fn concurrent_reads_never_tear() {
        // The writer alternates between two bit patterns whose halves
        // differ; a torn read would mix them.
        let cell = Arc::new(Seqlock::new((0u64, 0u64)));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let cell = Arc::clone(&cell);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut i = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    cell.write((i, i));
                    i = i.wrapping_add(1);
                }
            })
        };

        for _ in 0..100_000 {
            let (a, b) = cell.read();
            assert_eq!(a, b);
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
