//! Byte region primitives used by the framing engine.
//!
//! A [`ByteRegion`] is a fixed-size allocation plus a fill cursor. The
//! region never resizes itself: callers decide when to compact, grow, or
//! replace it.

use crate::error::Error;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use tracing::trace;

/// Fixed-capacity byte buffer with a fill cursor.
#[derive(Debug)]
pub struct ByteRegion {
    buf: Box<[u8]>,
    filled: usize,
}

impl ByteRegion {
    /// Allocates an empty region of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of valid bytes, starting at offset 0.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Free space after the valid bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// The valid bytes.
    pub fn filled_slice(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Forgets all valid bytes.
    pub fn clear(&mut self) {
        self.filled = 0;
    }

    /// Appends `bytes`. The caller must have checked [`Self::remaining`].
    pub fn put(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.remaining(),
            "put of {} bytes into region with {} bytes free",
            bytes.len(),
            self.remaining()
        );
        self.buf[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        self.filled += bytes.len();
    }

    /// Reallocates to at least `min_capacity` bytes, keeping the valid bytes.
    pub fn grow_to(&mut self, min_capacity: usize) {
        if min_capacity > self.capacity() {
            self.grow_from(0, min_capacity);
        }
    }

    /// Reallocates to at least `min_capacity` bytes, keeping only the valid
    /// bytes from `offset` on, which move to the start of the new region.
    pub fn grow_from(&mut self, offset: usize, min_capacity: usize) {
        assert!(offset <= self.filled, "grow offset past filled bytes");
        let kept = self.filled - offset;
        let mut buf = vec![0; min_capacity.max(kept)].into_boxed_slice();
        buf[..kept].copy_from_slice(&self.buf[offset..self.filled]);
        trace!(from = self.capacity(), to = buf.len(), kept, "Growing byte region");
        self.buf = buf;
        self.filled = kept;
    }

    /// Drops the bytes before `offset` and moves the rest to the start.
    pub fn compact_from(&mut self, offset: usize) {
        assert!(offset <= self.filled, "compact offset past filled bytes");
        if offset == 0 {
            return;
        }
        self.buf.copy_within(offset..self.filled, 0);
        self.filled -= offset;
    }

    /// Replaces the region with an empty one of exactly `capacity` bytes.
    pub fn replace(&mut self, capacity: usize) {
        *self = Self::with_capacity(capacity);
    }

    /// Issues a single non-blocking read into the free space.
    ///
    /// Returns the number of bytes read, `0` if the read would block.
    /// Orderly closure by the peer fails with [`Error::ConnectionClosed`].
    pub fn read_available<R: Read>(&mut self, src: &mut R) -> Result<usize, Error> {
        if self.remaining() == 0 {
            return Ok(0);
        }
        loop {
            match src.read(&mut self.buf[self.filled..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(len) => {
                    self.filled += len;
                    return Ok(len);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(0),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Reads until at least `target` bytes are valid.
    ///
    /// Reads that would block are retried after yielding the thread, so this
    /// only returns once the bytes arrived, the peer closed the connection
    /// ([`Error::ConnectionClosed`]) or an I/O error occurred.
    pub fn fill_at_least<R: Read>(&mut self, src: &mut R, target: usize) -> Result<(), Error> {
        if target > self.capacity() {
            return Err(Error::FrameTooLarge { len: target });
        }
        while self.filled < target {
            match src.read(&mut self.buf[self.filled..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(len) => self.filled += len,
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::yield_now(),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Writes all valid bytes to `dst` and clears the region.
    pub fn flush_all<W: Write>(&mut self, dst: &mut W) -> Result<(), Error> {
        write_all_spinning(dst, &self.buf[..self.filled])?;
        self.filled = 0;
        Ok(())
    }
}

/// Writes all of `bytes` to a non-blocking sink, retrying partial writes and
/// writes that would block.
pub fn write_all_spinning<W: Write>(dst: &mut W, bytes: &[u8]) -> Result<(), Error> {
    let mut pos = 0;
    while pos < bytes.len() {
        match dst.write(&bytes[pos..]) {
            Ok(0) => return Err(Error::Io(ErrorKind::WriteZero.into())),
            Ok(len) => pos += len,
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::yield_now(),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
