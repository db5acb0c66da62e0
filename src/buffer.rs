//! Bounded ring buffer for detached process output

use std::sync::Mutex;

use crate::tty::TtyChunk;

/// Point-in-time view of buffered output
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferSnapshot {
    pub stdout: String,
    pub stderr: String,
}

struct Inner {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    overflow: bool,
}

/// Bounded accumulator for stdout/stderr bytes.
///
/// Each stream gets half the configured capacity. When a stream's buffer
/// would exceed its half, the oldest bytes are evicted and a sticky
/// overflow bit is set. The reader task writes while callers read, so
/// access is serialized by a mutex.
pub(crate) struct RingBuffer {
    half: usize,
    inner: Mutex<Inner>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            half: std::cmp::max(capacity / 2, 1),
            inner: Mutex::new(Inner {
                stdout: Vec::new(),
                stderr: Vec::new(),
                overflow: false,
            }),
        }
    }

    pub fn write(
        &self,
        chunk: &TtyChunk,
    ) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let half = self.half;
        let buf = if chunk.is_stdout() {
            &mut inner.stdout
        } else {
            &mut inner.stderr
        };
        buf.extend_from_slice(chunk);
        if buf.len() > half {
            let excess = buf.len() - half;
            buf.drain(..excess);
            inner.overflow = true;
        }
    }

    /// Drain and return all buffered output
    pub fn read(&self) -> BufferSnapshot {
        let mut inner = self.inner.lock().unwrap();
        let snapshot = BufferSnapshot {
            stdout: String::from_utf8_lossy(&inner.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&inner.stderr).into_owned(),
        };
        inner.stdout.clear();
        inner.stderr.clear();
        snapshot
    }

    /// Return buffered output without draining
    pub fn peek(&self) -> BufferSnapshot {
        let inner = self.inner.lock().unwrap();
        BufferSnapshot {
            stdout: String::from_utf8_lossy(&inner.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&inner.stderr).into_owned(),
        }
    }

    /// Current bytes held, both streams combined
    pub fn size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.stdout.len() + inner.stderr.len()
    }

    /// True if any bytes were ever evicted
    pub fn overflow(&self) -> bool {
        self.inner.lock().unwrap().overflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(data: &[u8]) -> TtyChunk {
        TtyChunk::StdOut(data.to_vec())
    }

    fn stderr(data: &[u8]) -> TtyChunk {
        TtyChunk::StdErr(data.to_vec())
    }

    #[test]
    fn accumulates_per_stream() {
        let buf = RingBuffer::new(1024);
        buf.write(&stdout(b"hello "));
        buf.write(&stderr(b"oops"));
        buf.write(&stdout(b"world"));

        let snap = buf.peek();
        assert_eq!(snap.stdout, "hello world");
        assert_eq!(snap.stderr, "oops");
        assert_eq!(buf.size(), 15);
        assert!(!buf.overflow());
    }

    #[test]
    fn read_drains_peek_does_not() {
        let buf = RingBuffer::new(1024);
        buf.write(&stdout(b"data"));
        assert_eq!(buf.peek().stdout, "data");
        assert_eq!(buf.peek().stdout, "data");
        assert_eq!(buf.read().stdout, "data");
        assert_eq!(buf.read().stdout, "");
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn evicts_oldest_bytes_past_half_capacity() {
        // capacity 8 -> 4 bytes per stream
        let buf = RingBuffer::new(8);
        buf.write(&stdout(b"abcd"));
        assert!(!buf.overflow());
        buf.write(&stdout(b"ef"));
        let snap = buf.peek();
        assert_eq!(snap.stdout, "cdef");
        assert!(buf.overflow());
    }

    #[test]
    fn overflow_bit_is_sticky() {
        let buf = RingBuffer::new(4);
        buf.write(&stdout(b"abcdef"));
        assert!(buf.overflow());
        let _ = buf.read();
        buf.write(&stdout(b"x"));
        assert!(buf.overflow());
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let buf = RingBuffer::new(64);
        for _ in 0..100 {
            buf.write(&stdout(b"0123456789"));
            buf.write(&stderr(b"0123456789"));
            assert!(buf.size() <= 64);
        }
    }

    #[test]
    fn streams_overflow_independently() {
        let buf = RingBuffer::new(8);
        buf.write(&stdout(b"abcdefgh"));
        buf.write(&stderr(b"xy"));
        let snap = buf.peek();
        assert_eq!(snap.stdout, "efgh");
        assert_eq!(snap.stderr, "xy");
    }

    #[test]
    fn tiny_capacity_keeps_at_least_one_byte_per_stream() {
        let buf = RingBuffer::new(0);
        buf.write(&stdout(b"abc"));
        assert_eq!(buf.peek().stdout, "c");
    }
}
