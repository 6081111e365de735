use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::{Buf, BytesMut};
use tracing::{debug, trace};
use crate::buffers::buffer::Buffer;
use crate::buffers::composite_buffer::CompositeBuffer;
use crate::codec::message_header::MessageHeader;
use crate::message::content_type::{ContentReference, ContentType};
use crate::message::message::Message;
use crate::message::peer_address::{socket_addr_len_for_family, try_deser_socket_addr, PeerAddress, PeerId};
use crate::message::signature::SignatureFactory;
use crate::util::safe_converter::SafeCast;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecoderState {
    AwaitingHeader,
    DecodingBody,
    Finished,
}

/// Decodes a single message from a [CompositeBuffer], consuming bytes as they become decodable.
///  Decoding can be resumed when more bytes arrive: `decode()` returns `Ok(false)` if it needs
///  more data, which is not an error.
///
/// A message's byte buffers are filled as their bytes arrive, so a partially decoded message is
///  available through [MessageDecoder::message] - this is what streaming builds on.
pub struct MessageDecoder {
    state: DecoderState,
    message: Option<Message>,
    /// the declared length of the byte buffer currently being decoded was read
    buffer_started: bool,
    /// all bytes of a signed message that precede the signature
    signed_bytes: Option<BytesMut>,

    max_message_size: u32,
    signature_factory: Option<Arc<dyn SignatureFactory>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    udp: bool,
}

impl MessageDecoder {
    pub fn new(max_message_size: u32, signature_factory: Option<Arc<dyn SignatureFactory>>, local_addr: SocketAddr, remote_addr: SocketAddr, udp: bool) -> MessageDecoder {
        MessageDecoder {
            state: DecoderState::AwaitingHeader,
            message: None,
            buffer_started: false,
            signed_bytes: None,
            max_message_size,
            signature_factory,
            local_addr,
            remote_addr,
            udp,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// the message being decoded, which exists once its header was decoded
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Take the message out of the decoder, resetting it for the next message
    pub fn take_message(&mut self) -> Option<Message> {
        let result = self.message.take();
        self.reset();
        result
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::AwaitingHeader;
        self.message = None;
        self.buffer_started = false;
        self.signed_bytes = None;
    }

    /// Returns `Ok(true)` when the message is complete.
    pub fn decode(&mut self, buf: &mut CompositeBuffer) -> anyhow::Result<bool> {
        if self.state == DecoderState::AwaitingHeader && !self.decode_header(buf)? {
            return Ok(false);
        }
        if self.state == DecoderState::DecodingBody && !self.decode_body(buf)? {
            return Ok(false);
        }
        Ok(self.state == DecoderState::Finished)
    }

    fn decode_header(&mut self, buf: &mut CompositeBuffer) -> anyhow::Result<bool> {
        let Some(header_len) = MessageHeader::peek_len(buf)? else {
            return Ok(false);
        };
        if buf.remaining() < header_len {
            return Ok(false);
        }

        let raw = buf.copy_to_bytes(header_len);
        let header = MessageHeader::try_deser(&raw)?;

        let mut message = Message::new();
        header.apply_to(&mut message);
        message
            .set_udp(self.udp)
            .set_addresses(self.local_addr, self.remote_addr);
        trace!("decoded header of {:?}", message);

        if message.is_signed() {
            self.signed_bytes = Some(BytesMut::from(raw.as_ref()));
        }
        self.message = Some(message);
        self.state = DecoderState::DecodingBody;
        Ok(true)
    }

    fn decode_body(&mut self, buf: &mut CompositeBuffer) -> anyhow::Result<bool> {
        let Some(message) = self.message.as_mut() else {
            bail!("decoding a message body without a header - this is a bug");
        };

        while let Some(reference) = message.peek_content_reference().copied() {
            let start = buf.reader_index();
            let complete = decode_content(message, reference, buf, &mut self.buffer_started, self.max_message_size)?;

            if let Some(signed_bytes) = &mut self.signed_bytes {
                for piece in buf.decompose(start, buf.reader_index() - start)? {
                    signed_bytes.extend_from_slice(&piece);
                }
            }

            if !complete {
                return Ok(false);
            }
            message.pop_content_reference();
        }

        if message.is_signed() {
            let Some(signature_len) = peek_u16(buf, 0) else {
                return Ok(false);
            };
            let signature_len = signature_len.safe_cast();
            if buf.remaining() < 2 + signature_len {
                return Ok(false);
            }
            buf.advance(2);
            let signature = buf.copy_to_bytes(signature_len);

            let verified = match (&self.signature_factory, message.public_key(0), &self.signed_bytes) {
                (Some(factory), Some(public_key), Some(signed_bytes)) => {
                    if !factory.verify(public_key, signed_bytes, &signature) {
                        bail!("invalid signature for message {} from {:?}", message.message_id(), message.sender());
                    }
                    true
                }
                _ => {
                    debug!("no signature factory configured - passing on message {} without verifying its signature", message.message_id());
                    false
                }
            };
            message.set_signature(signature, verified);
        }

        message.restore_content_references();
        message.set_done(true);
        self.state = DecoderState::Finished;
        Ok(true)
    }
}

/// Decode a single content block if all of its bytes are present. Byte buffers are the
///  exception: they are filled with whatever is available, and are complete when their declared
///  length arrived.
fn decode_content(message: &mut Message, reference: ContentReference, buf: &mut CompositeBuffer, buffer_started: &mut bool, max_message_size: u32) -> anyhow::Result<bool> {
    match reference.content_type {
        ContentType::Key => {
            if buf.remaining() < PeerId::LEN {
                return Ok(false);
            }
            message.push_key(PeerId::try_deser(buf)?);
        }
        ContentType::Integer => {
            if buf.remaining() < size_of::<i32>() {
                return Ok(false);
            }
            message.push_integer(buf.get_i32());
        }
        ContentType::Long => {
            if buf.remaining() < size_of::<i64>() {
                return Ok(false);
            }
            message.push_long(buf.get_i64());
        }
        ContentType::PublicKey | ContentType::PublicKeySignature => {
            let Some(len) = peek_u16(buf, 0) else {
                return Ok(false);
            };
            let len = len.safe_cast();
            if buf.remaining() < 2 + len {
                return Ok(false);
            }
            buf.advance(2);
            message.push_public_key(buf.copy_to_bytes(len));
        }
        ContentType::SetNeighbors => {
            let Some(block_len) = block_len(buf, PeerAddress::FAMILY_OFFSET, PeerAddress::serialized_len_for_family)? else {
                return Ok(false);
            };
            let mut block = buf.copy_to_bytes(block_len);
            let count = block.get_u8();
            let mut neighbors = Vec::with_capacity(count.safe_cast());
            for _ in 0..count {
                neighbors.push(PeerAddress::try_deser(&mut block)?);
            }
            message.push_neighbors(neighbors);
        }
        ContentType::SetPeerSocket => {
            let Some(block_len) = block_len(buf, 0, socket_addr_len_for_family)? else {
                return Ok(false);
            };
            let mut block = buf.copy_to_bytes(block_len);
            let count = block.get_u8();
            let mut sockets = Vec::with_capacity(count.safe_cast());
            for _ in 0..count {
                sockets.push(try_deser_socket_addr(&mut block)?);
            }
            message.push_peer_sockets(sockets);
        }
        ContentType::ByteBuffer => {
            if !*buffer_started {
                if buf.remaining() < size_of::<u32>() {
                    return Ok(false);
                }
                let length = buf.get_u32();
                if length > max_message_size {
                    bail!("declared buffer length {} exceeds the maximum message size of {}", length, max_message_size);
                }
                message.push_buffer(Buffer::with_length(length.safe_cast()));
                *buffer_started = true;
            }

            let Some(buffer) = message.buffer_mut(reference.index) else {
                bail!("no buffer for content reference {:?} - this is a bug", reference);
            };
            buffer.transfer_from(buf);
            if !buffer.is_complete() {
                return Ok(false);
            }
            *buffer_started = false;
        }
        ContentType::Empty => {
            bail!("content reference to an empty slot - this is a bug");
        }
    }
    Ok(true)
}

/// big-endian u16 at `offset` relative to the reader index, if present
fn peek_u16(buf: &CompositeBuffer, offset: usize) -> Option<u16> {
    let idx = buf.reader_index() + offset;
    Some(u16::from_be_bytes([buf.get_u8_at(idx)?, buf.get_u8_at(idx + 1)?]))
}

/// The length of a block with a u8 count followed by entries whose length depends on an address
///  family byte, if the block is completely present
fn block_len(buf: &CompositeBuffer, family_offset: usize, entry_len: fn(u8) -> anyhow::Result<usize>) -> anyhow::Result<Option<usize>> {
    let start = buf.reader_index();
    let Some(count) = buf.get_u8_at(start) else {
        return Ok(None);
    };

    let mut len = 1;
    for _ in 0..count {
        let Some(family) = buf.get_u8_at(start + len + family_offset) else {
            return Ok(None);
        };
        len += entry_len(family)?;
    }

    if buf.remaining() < len {
        return Ok(None);
    }
    Ok(Some(len))
}
