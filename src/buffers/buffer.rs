use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{Buf, Bytes};
use crate::buffers::composite_buffer::CompositeBuffer;

/// A payload with a declared total length, backed by a [CompositeBuffer] region that may hold
///  only part of the data yet. This is how a streaming message's byte buffer grows while it is
///  received (or handed to the encoder piecewise while it is sent).
///
/// Invariants:
/// * `0 <= already_read <= length`
/// * the backing buffer never holds more than `length` bytes of this payload
#[derive(Clone)]
pub struct Buffer {
    backing: CompositeBuffer,
    /// backing reader index corresponding to the payload's first byte
    start: usize,
    length: usize,
    already_read: usize,
}

impl Buffer {
    /// precondition: the backing buffer's readable region must not exceed `length`
    pub fn new(backing: CompositeBuffer, length: usize) -> anyhow::Result<Buffer> {
        if backing.readable_bytes() > length {
            bail!("backing buffer holds {} bytes, exceeding the declared length of {}", backing.readable_bytes(), length);
        }
        Ok(Buffer {
            start: backing.reader_index(),
            backing,
            length,
            already_read: 0,
        })
    }

    /// a complete buffer with the given data
    pub fn from_bytes(data: Bytes) -> Buffer {
        let length = data.len();
        Buffer {
            backing: CompositeBuffer::from_bytes(data),
            start: 0,
            length,
            already_read: 0,
        }
    }

    /// a buffer that declares its total length, but has no data yet
    pub fn with_length(length: usize) -> Buffer {
        Buffer {
            backing: CompositeBuffer::new(),
            start: 0,
            length,
            already_read: 0,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn already_read(&self) -> usize {
        self.already_read
    }

    /// number of bytes that are present in the backing buffer
    pub fn available(&self) -> usize {
        self.backing.writer_index() - self.start
    }

    /// number of bytes that are declared but have not arrived yet
    pub fn missing(&self) -> usize {
        self.length - self.available()
    }

    /// number of bytes that can be read right now
    pub fn readable(&self) -> usize {
        (self.length - self.already_read).min(self.backing.readable_bytes())
    }

    /// all declared bytes are present
    pub fn is_complete(&self) -> bool {
        self.available() == self.length
    }

    /// all declared bytes were read
    pub fn is_done(&self) -> bool {
        self.already_read == self.length
    }

    pub fn inc_read(&mut self, num_bytes: usize) -> anyhow::Result<()> {
        if num_bytes > self.readable() {
            bail!("marking {} bytes as read with only {} readable", num_bytes, self.readable());
        }
        self.backing.advance(num_bytes);
        self.already_read += num_bytes;
        Ok(())
    }

    /// start reading from the beginning again
    pub fn reset(&mut self) {
        self.already_read = 0;
        self.backing.set_reader_index(self.start)
            .expect("start index is below the writer index by construction");
    }

    /// append data that arrived later, without copying
    pub fn add_component(&mut self, data: Bytes) -> anyhow::Result<()> {
        if data.len() > self.missing() {
            bail!("adding {} bytes to a buffer that misses only {}", data.len(), self.missing());
        }
        self.backing.add_component(data);
        Ok(())
    }

    /// Move as many bytes from `src` as are still missing (or are available). This is zero-copy
    ///  if `src` is a [CompositeBuffer] and the bytes are inside one of its components.
    ///
    /// Returns the number of bytes transferred.
    pub fn transfer_from(&mut self, src: &mut impl Buf) -> usize {
        let num_bytes = self.missing().min(src.remaining());
        if num_bytes > 0 {
            self.backing.add_component(src.copy_to_bytes(num_bytes));
        }
        num_bytes
    }

    /// Read everything that is readable right now, marking it as read
    pub fn read_chunk(&mut self) -> Bytes {
        let num_bytes = self.readable();
        self.already_read += num_bytes;
        self.backing.copy_to_bytes(num_bytes)
    }

    /// all data that is present, regardless of read progress
    pub fn to_bytes(&self) -> Bytes {
        let mut all = self.backing.clone();
        all.set_reader_index(self.start)
            .expect("start index is below the writer index by construction");
        all.to_bytes()
    }

    pub fn backing(&self) -> &CompositeBuffer {
        &self.backing
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.length == other.length && self.to_bytes() == other.to_bytes()
    }
}
impl Eq for Buffer {}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer{{length:{}, available:{}, read:{}}}", self.length, self.available(), self.already_read)
    }
}
