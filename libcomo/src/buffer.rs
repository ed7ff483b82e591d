//! Byte FIFO backing the IPC channels.
//!
//! Data is appended at the tail and consumed from the head; the backing
//! `SliceDeque` keeps both regions contiguous so framing code can operate on
//! plain slices. Unlike a fixed ring, the buffer grows on demand: a flush
//! message carrying a whole flow table can dwarf the steady-state traffic.

use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Capacity is reserved in page-multiple steps.
const GROW_INCREMENT: usize = 16384;

pub struct Buffer {
    data: ByteDeque,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(round_up(size));
        Buffer { data }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    /// Grows the buffer until at least `extra` more bytes fit.
    #[inline]
    pub fn ensure_capacity(&mut self, extra: usize) {
        if self.free_capacity() < extra {
            let needed = round_up(extra - self.free_capacity());
            self.data.reserve(self.data.len() + self.free_capacity() + needed);
        }
    }

    /// Discard `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.data.len());
        unsafe { self.data.move_head(count as isize) }
    }

    /// Declare `count` bytes written into the tail slice.
    #[inline]
    pub fn produce(&mut self, count: usize) {
        assert!(count <= self.free_capacity());
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn data_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Mutable slice over the free capacity, to be filled and `produce`d.
    #[inline]
    pub fn space_slice(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.consume(len);
    }

    /// Append a whole byte slice, growing if needed.
    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        self.space_slice()[..bytes.len()].copy_from_slice(bytes);
        self.produce(bytes.len());
    }

    /// Drain buffered data into the supplied writer until it would block.
    /// Returns the number of bytes written.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            let count = writer.write(&self.data)?;

            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.consume(count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Fill the buffer from the supplied reader until it would block or the
    /// free capacity is exhausted. Returns the number of bytes read; zero
    /// bytes read with free capacity available means the reader hit EOF.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, bool)> {
        let mut total = 0;

        while self.free_capacity() > 0 {
            let count = unsafe {
                let count = reader.read(self.data.tail_head_slice())?;
                self.data.move_tail(count as isize);
                count
            };

            if count == 0 {
                return Ok((total, true));
            }

            total += count;
        }

        Ok((total, false))
    }
}

#[inline]
fn round_up(size: usize) -> usize {
    ((size + GROW_INCREMENT - 1) / GROW_INCREMENT) * GROW_INCREMENT
}
