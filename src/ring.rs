//! Single-producer single-consumer byte ring.
//!
//! Each relay direction owns its rings exclusively: one writer thread, one
//! reader thread, no locks. Cursors are monotonic; the producer publishes
//! bytes with a release store and the consumer observes them with an acquire
//! load, so everything written before the cursor bump is visible after it.
//!
//! Reads are zero-copy: [`Consumer::peek`] hands out a [`ByteView`] directly
//! over the backing storage (two segments when the data wraps). The producer
//! may not overwrite a region until the consumer releases it with
//! [`Consumer::commit`].

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The ring has no free space at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull;

impl fmt::Display for BufferFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ring buffer full")
    }
}

impl std::error::Error for BufferFull {}

struct Shared {
    storage: Box<[UnsafeCell<u8>]>,
    write: AtomicUsize,
    read: AtomicUsize,
}

// Safety: the storage is only touched through the single Producer (writes into
// free space) and the single Consumer (reads of published space). The cursor
// protocol keeps those regions disjoint.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent) over u8.
        self.storage.as_ptr() as *mut u8
    }
}

/// Create a ring of `capacity` bytes and split it into its two endpoints.
///
/// A power-of-two capacity is recommended but not required.
pub fn ring(capacity: usize) -> (Producer, Consumer) {
    assert!(capacity > 0, "ring capacity must be non-zero");
    let storage: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
    let shared = Arc::new(Shared {
        storage,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer {
            shared,
            last_peek: Cell::new(0),
        },
    )
}

/// Write half of a ring. Not clonable; exactly one producer exists per ring.
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Append as many of `bytes` as fit, returning how many were written.
    ///
    /// Partial writes are normal under backpressure; `Err(BufferFull)` is
    /// only returned when there is no free space at all.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, BufferFull> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let cap = self.shared.capacity();
        let w = self.shared.write.load(Ordering::Relaxed);
        let r = self.shared.read.load(Ordering::Acquire);
        let free = cap - w.wrapping_sub(r);
        if free == 0 {
            return Err(BufferFull);
        }
        let n = bytes.len().min(free);
        let start = w % cap;
        let first = n.min(cap - start);
        // Safety: [w, w+n) is free space the consumer will not read until the
        // release store below publishes it.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.shared.base().add(start), first);
            if first < n {
                ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.shared.base(), n - first);
            }
        }
        self.shared.write.store(w.wrapping_add(n), Ordering::Release);
        Ok(n)
    }

    /// Bytes of free space.
    pub fn free(&self) -> usize {
        let w = self.shared.write.load(Ordering::Relaxed);
        let r = self.shared.read.load(Ordering::Acquire);
        self.shared.capacity() - w.wrapping_sub(r)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

/// Read half of a ring.
pub struct Consumer {
    shared: Arc<Shared>,
    last_peek: Cell<usize>,
}

impl Consumer {
    /// Borrow up to `max` readable bytes without consuming them.
    ///
    /// The view covers at most two contiguous segments (second is non-empty
    /// only when the readable region wraps the end of storage).
    pub fn peek(&self, max: usize) -> ByteView<'_> {
        let cap = self.shared.capacity();
        let r = self.shared.read.load(Ordering::Relaxed);
        let w = self.shared.write.load(Ordering::Acquire);
        let avail = w.wrapping_sub(r).min(max);
        let start = r % cap;
        let first_len = avail.min(cap - start);
        // Safety: [r, r+avail) was published by the producer's release store
        // and stays untouched until we commit past it.
        let (first, second) = unsafe {
            (
                slice::from_raw_parts(self.shared.base().add(start) as *const u8, first_len),
                slice::from_raw_parts(self.shared.base() as *const u8, avail - first_len),
            )
        };
        self.last_peek.set(avail);
        ByteView { first, second }
    }

    /// Release `n` bytes back to the producer.
    ///
    /// Committing more than the last peek observed is a programming error.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(
            n <= self.last_peek.get(),
            "commit({}) past outstanding peek of {}",
            n,
            self.last_peek.get()
        );
        let r = self.shared.read.load(Ordering::Relaxed);
        let w = self.shared.write.load(Ordering::Acquire);
        let n = n.min(w.wrapping_sub(r));
        self.last_peek.set(self.last_peek.get().saturating_sub(n));
        self.shared.read.store(r.wrapping_add(n), Ordering::Release);
    }

    /// Bytes currently readable.
    pub fn available(&self) -> usize {
        let r = self.shared.read.load(Ordering::Relaxed);
        let w = self.shared.write.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Discard everything currently readable.
    pub fn reset(&mut self) {
        let n = self.available();
        self.last_peek.set(n);
        self.commit(n);
    }
}

/// A borrowed window over ring storage: two contiguous byte segments.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    first: &'a [u8],
    second: &'a [u8],
}

impl<'a> ByteView<'a> {
    /// View over a plain slice (single segment). Used at the parsing seam
    /// where frames arrive already linear.
    pub fn of(bytes: &'a [u8]) -> Self {
        Self {
            first: bytes,
            second: &[],
        }
    }

    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// Byte at `i`, if in bounds.
    pub fn byte(&self, i: usize) -> Option<u8> {
        if i < self.first.len() {
            Some(self.first[i])
        } else {
            self.second.get(i - self.first.len()).copied()
        }
    }

    /// The underlying segments, in order.
    pub fn segments(&self) -> (&'a [u8], &'a [u8]) {
        (self.first, self.second)
    }

    /// Sub-view of `self[start..end]`.
    pub fn slice(&self, start: usize, end: usize) -> ByteView<'a> {
        assert!(start <= end && end <= self.len());
        let cut = |i: usize| -> (usize, usize) {
            if i <= self.first.len() {
                (i, 0)
            } else {
                (self.first.len(), i - self.first.len())
            }
        };
        let (fs, ss) = cut(start);
        let (fe, se) = cut(end);
        ByteView {
            first: &self.first[fs..fe],
            second: &self.second[ss..se],
        }
    }

    /// Linearize into `out`; returns how many bytes were copied.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let a = self.first.len().min(out.len());
        out[..a].copy_from_slice(&self.first[..a]);
        let b = self.second.len().min(out.len() - a);
        out[a..a + b].copy_from_slice(&self.second[..b]);
        a + b
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.len());
        v.extend_from_slice(self.first);
        v.extend_from_slice(self.second);
        v
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.first.iter().chain(self.second.iter()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let (mut tx, mut rx) = ring(16);
        assert_eq!(tx.write(b"hello").unwrap(), 5);
        let view = rx.peek(16);
        assert_eq!(view.to_vec(), b"hello");
        rx.commit(5);
        assert_eq!(rx.available(), 0);
    }

    #[test]
    fn test_write_full_returns_buffer_full() {
        let (mut tx, mut rx) = ring(4);
        assert_eq!(tx.write(b"abcd").unwrap(), 4);
        assert_eq!(tx.write(b"e"), Err(BufferFull));
        // One commit frees space for a same-sized write.
        rx.peek(1);
        rx.commit(1);
        assert_eq!(tx.write(b"e").unwrap(), 1);
    }

    #[test]
    fn test_partial_write() {
        let (mut tx, _rx) = ring(4);
        assert_eq!(tx.write(b"abcdef").unwrap(), 4);
        assert_eq!(tx.free(), 0);
    }

    #[test]
    fn test_commit_decreases_available_exactly() {
        let (mut tx, mut rx) = ring(32);
        tx.write(b"0123456789").unwrap();
        let before = rx.available();
        let n = rx.peek(4).len();
        rx.commit(n);
        assert_eq!(rx.available(), before - n);
    }

    #[test]
    fn test_wraparound_two_segments() {
        let (mut tx, mut rx) = ring(8);
        tx.write(b"abcdef").unwrap();
        rx.peek(6);
        rx.commit(6);
        // Next write straddles the end of storage.
        tx.write(b"ghijkl").unwrap();
        let view = rx.peek(8);
        let (first, second) = view.segments();
        assert_eq!(first, b"gh");
        assert_eq!(second, b"ijkl");
        assert_eq!(view.to_vec(), b"ghijkl");
        assert_eq!(view.byte(0), Some(b'g'));
        assert_eq!(view.byte(5), Some(b'l'));
        assert_eq!(view.byte(6), None);
    }

    #[test]
    fn test_view_slice_across_segments() {
        let (mut tx, mut rx) = ring(8);
        tx.write(b"abcdef").unwrap();
        rx.peek(6);
        rx.commit(6);
        tx.write(b"ghijkl").unwrap();
        let view = rx.peek(8);
        assert_eq!(view.slice(1, 5).to_vec(), b"hijk");
        assert_eq!(view.slice(2, 2).len(), 0);
    }

    #[test]
    fn test_reset_discards_everything() {
        let (mut tx, mut rx) = ring(16);
        tx.write(b"abc").unwrap();
        rx.reset();
        assert_eq!(rx.available(), 0);
        assert_eq!(tx.free(), 16);
    }

    #[test]
    fn test_copy_to_scratch() {
        let (mut tx, mut rx) = ring(8);
        tx.write(b"abcdef").unwrap();
        rx.peek(6);
        rx.commit(6);
        tx.write(b"ghijkl").unwrap();
        let mut scratch = [0u8; 16];
        let n = rx.peek(8).copy_to(&mut scratch);
        assert_eq!(&scratch[..n], b"ghijkl");
    }

    #[test]
    fn test_spsc_cross_thread_order() {
        let (mut tx, mut rx) = ring(64);
        let total: usize = 10_000;
        let producer = std::thread::spawn(move || {
            let mut sent = 0usize;
            while sent < total {
                let b = [(sent % 251) as u8];
                match tx.write(&b) {
                    Ok(1) => sent += 1,
                    Ok(_) | Err(BufferFull) => std::thread::yield_now(),
                }
            }
        });
        let mut got = 0usize;
        while got < total {
            let view = rx.peek(64);
            let n = view.len();
            for (i, b) in view.iter().enumerate() {
                assert_eq!(b, ((got + i) % 251) as u8, "byte {} out of order", got + i);
            }
            rx.commit(n);
            got += n;
        }
        producer.join().unwrap();
        assert_eq!(rx.available(), 0);
    }
}
