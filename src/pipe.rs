//! # Byte Pipe
//!
//! Power-of-two-sized byte ring for streaming data between tasks.
//! Blocking reads and writes move one byte per critical section,
//! parking in [`crate::kernel::wfi`] while the ring is empty or full,
//! so a fast producer and a slow consumer exert natural backpressure
//! on each other. Non-blocking variants transfer what fits and report
//! the count.

use alloc::boxed::Box;
use alloc::vec;

use crate::kernel::wfi;
use crate::sync::{critical, shared, Shared};

struct PipeInner {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    used: usize,
    mask: usize,
}

impl PipeInner {
    #[inline]
    fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.used == self.mask + 1
    }

    #[inline]
    fn get_byte(&mut self) -> u8 {
        let val = self.buf[self.head];
        self.head = (self.head + 1) & self.mask;
        self.used -= 1;
        val
    }

    #[inline]
    fn put_byte(&mut self, byte: u8) {
        self.buf[self.tail] = byte;
        self.tail = (self.tail + 1) & self.mask;
        self.used += 1;
    }
}

/// A byte ring with blocking and non-blocking I/O.
pub struct Pipe {
    inner: Shared<PipeInner>,
}

impl Pipe {
    /// Create a pipe. The capacity is rounded up to the next power of
    /// two, minimum 2.
    pub fn new(capacity: usize) -> Pipe {
        let size = capacity.max(2).next_power_of_two();
        Pipe {
            inner: shared(PipeInner {
                buf: vec![0u8; size].into_boxed_slice(),
                head: 0,
                tail: 0,
                used: 0,
                mask: size - 1,
            }),
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        critical(|cs| self.inner.borrow_ref(cs).used)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total ring capacity.
    pub fn capacity(&self) -> usize {
        critical(|cs| self.inner.borrow_ref(cs).mask + 1)
    }

    /// Discard all buffered bytes.
    pub fn flush(&self) {
        critical(|cs| {
            let mut p = self.inner.borrow_ref_mut(cs);
            p.head = 0;
            p.tail = 0;
            p.used = 0;
        });
    }

    /// Fill `dst` completely, blocking while the ring is empty.
    /// Returns `dst.len()`.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        for slot in dst.iter_mut() {
            loop {
                let got = critical(|cs| {
                    let mut p = self.inner.borrow_ref_mut(cs);
                    if p.is_empty() {
                        None
                    } else {
                        Some(p.get_byte())
                    }
                });
                if let Some(byte) = got {
                    *slot = byte;
                    break;
                }
                wfi();
            }
        }
        dst.len()
    }

    /// Write all of `src`, blocking while the ring is full. Returns
    /// `src.len()`.
    pub fn write(&self, src: &[u8]) -> usize {
        for &byte in src {
            loop {
                let put = critical(|cs| {
                    let mut p = self.inner.borrow_ref_mut(cs);
                    if p.is_full() {
                        false
                    } else {
                        p.put_byte(byte);
                        true
                    }
                });
                if put {
                    break;
                }
                wfi();
            }
        }
        src.len()
    }

    /// Read whatever is available into `dst`; returns the byte count
    /// (possibly zero).
    pub fn read_nb(&self, dst: &mut [u8]) -> usize {
        critical(|cs| {
            let mut p = self.inner.borrow_ref_mut(cs);
            Self::drain(&mut p, dst)
        })
    }

    /// Write as much of `src` as fits; returns the byte count
    /// (possibly zero).
    pub fn write_nb(&self, src: &[u8]) -> usize {
        critical(|cs| {
            let mut p = self.inner.borrow_ref_mut(cs);
            let mut n = 0;
            while n < src.len() && !p.is_full() {
                p.put_byte(src[n]);
                n += 1;
            }
            n
        })
    }

    fn drain(p: &mut PipeInner, dst: &mut [u8]) -> usize {
        let mut n = 0;
        while n < dst.len() && !p.is_empty() {
            dst[n] = p.get_byte();
            n += 1;
        }
        n
    }

    #[cfg(test)]
    fn raw(&self, cs: crate::sync::CriticalSection<'_>) -> (usize, usize, usize) {
        let p = self.inner.borrow_ref(cs);
        (p.head, p.tail, p.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        assert_eq!(Pipe::new(0).capacity(), 2);
        assert_eq!(Pipe::new(2).capacity(), 2);
        assert_eq!(Pipe::new(5).capacity(), 8);
        assert_eq!(Pipe::new(16).capacity(), 16);
        assert_eq!(Pipe::new(17).capacity(), 32);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let p = Pipe::new(16);
        let msg = b"hello, ring";
        assert_eq!(p.write_nb(msg), msg.len());
        assert_eq!(p.len(), msg.len());

        let mut out = [0u8; 11];
        assert_eq!(p.read_nb(&mut out), msg.len());
        assert_eq!(&out, msg);
        assert!(p.is_empty());
    }

    #[test]
    fn test_nonblocking_write_stops_at_capacity() {
        let p = Pipe::new(4);
        let data = [1u8, 2, 3, 4, 5, 6];
        assert_eq!(p.write_nb(&data), 4);
        assert_eq!(p.len(), 4);
        // Full ring: zero bytes transferred.
        assert_eq!(p.write_nb(&data), 0);

        let mut out = [0u8; 2];
        assert_eq!(p.read_nb(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(p.write_nb(&data), 2);
    }

    #[test]
    fn test_read_from_empty_returns_zero() {
        let p = Pipe::new(8);
        let mut out = [0u8; 4];
        assert_eq!(p.read_nb(&mut out), 0);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let p = Pipe::new(4);
        let mut out = [0u8; 3];
        // Push the ring indices around the mask a few times.
        for round in 0u8..10 {
            let data = [round, round.wrapping_add(1), round.wrapping_add(2)];
            assert_eq!(p.write_nb(&data), 3);
            assert_eq!(p.read_nb(&mut out), 3);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_flush_resets_indices() {
        let p = Pipe::new(8);
        p.write_nb(b"abcdef");
        p.flush();
        assert!(p.is_empty());
        assert_eq!(critical(|cs| p.raw(cs)), (0, 0, 0));
    }

    #[test]
    fn test_backpressure_chunked_drain_loses_nothing() {
        // A 16-byte pipe carrying a 64-byte message to a consumer that
        // drains 16 bytes at a time: the writer can only complete after
        // 48 bytes have been consumed, and every byte arrives in order.
        let p = Pipe::new(16);
        let src: std::vec::Vec<u8> = (0u8..64).collect();
        let mut received = std::vec::Vec::new();

        let mut written = 0;
        while written < src.len() {
            written += p.write_nb(&src[written..]);
            if written < src.len() {
                // Ring is full; only a consumer drain can unblock the
                // writer, 16 bytes per step.
                assert!(p.write_nb(&src[written..]) == 0 || p.len() < 16);
                let mut chunk = [0u8; 16];
                let n = p.read_nb(&mut chunk);
                received.extend_from_slice(&chunk[..n]);
            }
        }
        assert_eq!(written, 64);
        // Writer finished exactly when 48 bytes had been drained.
        assert_eq!(received.len(), 48);

        let mut chunk = [0u8; 16];
        let n = p.read_nb(&mut chunk);
        received.extend_from_slice(&chunk[..n]);
        assert_eq!(received, src);
    }
}
