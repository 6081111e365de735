//! A logical byte buffer assembled from independently allocated component buffers. Its purpose
//!  is to accumulate received chunks and hand out ranges of them without copying.
//!
//! Salient points:
//!
//! * components are `Bytes`, i.e. reference counted - slicing and decomposing duplicate only
//!   metadata, never data
//! * components are addressed through one continuous virtual offset space; each component knows
//!   its start offset, and components are contiguous and non-overlapping
//! * reader and writer index are global and validated against the aggregate capacity. Each
//!   component additionally tracks how much of it counts as written; changing the global writer
//!   index walks the spanned components and updates their local index
//! * implements `bytes::Buf` to fit into the `bytes` ecosystem, reading seamlessly across
//!   component boundaries

use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Clone)]
struct Component {
    buf: Bytes,
    /// start of this component in the virtual offset space
    offset: usize,
    end_offset: usize,
    /// local writer index, `0..=buf.len()`
    written: usize,
}
impl Component {
    fn len(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Clone, Default)]
pub struct CompositeBuffer {
    components: Vec<Component>,
    reader_index: usize,
    writer_index: usize,
}

impl CompositeBuffer {
    pub fn new() -> CompositeBuffer {
        Default::default()
    }

    pub fn from_bytes(buf: Bytes) -> CompositeBuffer {
        let mut result = CompositeBuffer::new();
        result.add_component(buf);
        result
    }

    pub fn capacity(&self) -> usize {
        self.components.last()
            .map(|c| c.end_offset)
            .unwrap_or(0)
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Append a component at the end of the virtual offset space, advancing the writer index by
    ///  its length. The data is not copied.
    pub fn add_component(&mut self, buf: Bytes) {
        if buf.is_empty() {
            return;
        }

        let offset = self.capacity();
        let len = buf.len();
        self.components.push(Component {
            buf,
            offset,
            end_offset: offset + len,
            written: 0,
        });

        self.walk_writer_index(self.writer_index + len);
    }

    /// Find the index of the component that contains a given offset.
    ///
    /// NB: `offset == capacity` is valid and refers to the end of the last component - this is
    ///      where the writer index of a fully written buffer points
    pub fn find_index(&self, offset: usize) -> Option<usize> {
        if self.components.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        if offset > capacity {
            return None;
        }
        if offset == capacity {
            return Some(self.components.len() - 1);
        }

        // NB: components are never empty, so the first component ending after the offset
        //      contains it
        Some(self.components.partition_point(|c| c.end_offset <= offset))
    }

    pub fn set_reader_index(&mut self, reader_index: usize) -> anyhow::Result<()> {
        if reader_index > self.writer_index {
            bail!("reader index {} exceeds writer index {}", reader_index, self.writer_index);
        }
        self.reader_index = reader_index;
        Ok(())
    }

    pub fn set_writer_index(&mut self, writer_index: usize) -> anyhow::Result<()> {
        if writer_index < self.reader_index {
            bail!("writer index {} is below reader index {}", writer_index, self.reader_index);
        }
        if writer_index > self.capacity() {
            bail!("writer index {} exceeds capacity {}", writer_index, self.capacity());
        }
        self.walk_writer_index(writer_index);
        Ok(())
    }

    /// precondition: `new_writer_index` was validated against capacity and reader index
    fn walk_writer_index(&mut self, new_writer_index: usize) {
        let old_writer_index = self.writer_index;

        if new_writer_index > old_writer_index {
            let Some(mut idx) = self.find_index(old_writer_index) else { return; };
            if self.components[idx].end_offset == old_writer_index {
                idx += 1;
            }
            while idx < self.components.len() && self.components[idx].offset < new_writer_index {
                let c = &mut self.components[idx];
                c.written = new_writer_index.min(c.end_offset) - c.offset;
                idx += 1;
            }
        }
        else if new_writer_index < old_writer_index {
            let Some(mut idx) = self.find_index(old_writer_index) else { return; };
            loop {
                let c = &mut self.components[idx];
                c.written = new_writer_index.saturating_sub(c.offset).min(c.len());
                if c.offset <= new_writer_index || idx == 0 {
                    break;
                }
                idx -= 1;
            }
        }

        self.writer_index = new_writer_index;
        debug_assert_eq!(self.components.iter().map(|c| c.written).sum::<usize>(), self.writer_index);
    }

    /// random access to a single byte in the readable region, based on the *virtual* offset
    pub fn get_u8_at(&self, index: usize) -> Option<u8> {
        if index < self.reader_index || index >= self.writer_index {
            return None;
        }
        let c = &self.components[self.find_index(index)?];
        Some(c.buf[index - c.offset])
    }

    /// Return the pieces making up the range `[offset, offset+length)`, one per spanned component.
    ///  Each piece shares its data with this buffer. Concatenating them yields the bytes of the
    ///  requested range.
    pub fn decompose(&self, offset: usize, length: usize) -> anyhow::Result<Vec<Bytes>> {
        if offset + length > self.capacity() {
            bail!("range {}+{} exceeds capacity {}", offset, length, self.capacity());
        }
        if length == 0 {
            return Ok(Vec::new());
        }

        let mut idx = self.find_index(offset)
            .ok_or_else(|| anyhow!("no component for offset {}", offset))?;

        let mut result = Vec::new();
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let c = &self.components[idx];
            let local_start = pos - c.offset;
            let local_end = end.min(c.end_offset) - c.offset;
            result.push(c.buf.slice(local_start..local_end));
            pos = c.offset + local_end;
            idx += 1;
        }
        Ok(result)
    }

    /// A zero-copy view of the range `[offset, offset+length)` with its own indices: the reader
    ///  index is 0 and the range is fully written
    pub fn slice(&self, offset: usize, length: usize) -> anyhow::Result<CompositeBuffer> {
        let mut result = CompositeBuffer::new();
        for piece in self.decompose(offset, length)? {
            result.add_component(piece);
        }
        Ok(result)
    }

    /// Drop all components that were read completely, rebasing the virtual offset space so that
    ///  the first remaining component starts at 0
    pub fn discard_read_components(&mut self) {
        let num_read = self.components.partition_point(|c| c.end_offset <= self.reader_index);
        if num_read == 0 {
            return;
        }

        let shift = self.components[num_read - 1].end_offset;
        self.components.drain(..num_read);
        for c in &mut self.components {
            c.offset -= shift;
            c.end_offset -= shift;
        }
        self.reader_index -= shift;
        self.writer_index -= shift;
    }

    pub fn clear(&mut self) {
        self.components.clear();
        self.reader_index = 0;
        self.writer_index = 0;
    }

    /// the readable region as a single `Bytes` - zero-copy if it is backed by a single component
    pub fn to_bytes(&self) -> Bytes {
        self.clone().copy_to_bytes(self.readable_bytes())
    }
}

impl Debug for CompositeBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompositeBuffer{{r:{}, w:{}, cap:{}, components:{}}}",
               self.reader_index, self.writer_index, self.capacity(), self.components.len())
    }
}

impl Buf for CompositeBuffer {
    fn remaining(&self) -> usize {
        self.readable_bytes()
    }

    fn chunk(&self) -> &[u8] {
        if self.reader_index >= self.writer_index {
            return &[];
        }
        match self.find_index(self.reader_index) {
            Some(idx) => {
                let c = &self.components[idx];
                let end = self.writer_index.min(c.end_offset);
                &c.buf[self.reader_index - c.offset .. end - c.offset]
            }
            None => &[],
        }
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining(), "advancing {} bytes with only {} remaining", cnt, self.remaining());
        self.reader_index += cnt;
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        assert!(len <= self.remaining(), "copying {} bytes with only {} remaining", len, self.remaining());

        let result = match self.decompose(self.reader_index, len) {
            Ok(mut pieces) if pieces.len() == 1 => pieces.remove(0),
            Ok(pieces) => {
                let mut buf = BytesMut::with_capacity(len);
                for piece in pieces {
                    buf.put_slice(&piece);
                }
                buf.freeze()
            }
            Err(_) => unreachable!("range was checked against the writer index"),
        };
        self.reader_index += len;
        result
    }
}
