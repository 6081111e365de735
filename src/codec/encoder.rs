use std::collections::VecDeque;
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use tracing::trace;
use crate::codec::message_header::MessageHeader;
use crate::message::content_type::{ContentReference, ContentType};
use crate::message::message::Message;
use crate::buffers::buffer::Buffer;
use crate::message::peer_address::{socket_addr_len, ser_socket_addr, PeerAddress, PeerId};
use crate::message::signature::SignatureFactory;

/// what was written of a streaming message whose byte buffer is not complete yet
struct StreamingProgress {
    message_id: u32,
    references: VecDeque<ContentReference>,
    /// bytes of the current byte buffer written so far, `None` if its length was not written yet
    buffer_written: Option<usize>,
    signed_bytes: Option<BytesMut>,
}

/// Encodes messages to their wire representation.
///
/// A streaming message may be encoded before its byte buffers are complete: the encoder writes
///  what is available and returns `Ok(false)`. Encoding a message with the same id again
///  resumes after the bytes that were already written, and nothing else can be encoded in
///  between.
pub struct MessageEncoder {
    signature_factory: Option<Arc<dyn SignatureFactory>>,
    in_progress: Option<StreamingProgress>,
}

impl MessageEncoder {
    pub fn new(signature_factory: Option<Arc<dyn SignatureFactory>>) -> MessageEncoder {
        MessageEncoder {
            signature_factory,
            in_progress: None,
        }
    }

    /// the id of a streaming message that was partially written
    pub fn in_progress(&self) -> Option<u32> {
        self.in_progress.as_ref().map(|p| p.message_id)
    }

    /// Append the message's bytes to `out`, returning `Ok(true)` when the message was written
    ///  completely
    pub fn encode(&mut self, message: &Message, out: &mut BytesMut) -> anyhow::Result<bool> {
        let start = out.len();

        let mut progress = match self.in_progress.take() {
            Some(progress) if progress.message_id == message.message_id() => {
                trace!("resuming streaming message {}", message.message_id());
                progress
            }
            Some(progress) => {
                let unfinished = progress.message_id;
                self.in_progress = Some(progress);
                bail!("message {} can not be encoded while streaming message {} is unfinished", message.message_id(), unfinished);
            }
            None => {
                MessageHeader::for_message(message).ser(out);
                StreamingProgress {
                    message_id: message.message_id(),
                    references: message.references_from_content_types(),
                    buffer_written: None,
                    signed_bytes: message.is_signed().then(BytesMut::new),
                }
            }
        };

        while let Some(reference) = progress.references.front().copied() {
            if !encode_content(message, reference, &mut progress.buffer_written, out)? {
                if !message.is_streaming() {
                    bail!("byte buffer {} of message {} is incomplete, but the message is not streaming", reference.index, message.message_id());
                }
                if let Some(signed_bytes) = &mut progress.signed_bytes {
                    signed_bytes.extend_from_slice(&out[start..]);
                }
                self.in_progress = Some(progress);
                return Ok(false);
            }
            progress.references.pop_front();
        }

        if let Some(mut signed_bytes) = progress.signed_bytes {
            signed_bytes.extend_from_slice(&out[start..]);

            let Some(factory) = &self.signature_factory else {
                bail!("message {} requires a signature, but there is no signature factory", message.message_id());
            };
            let public_key = message.public_key(0)
                .ok_or_else(|| anyhow!("signed message {} has no public key", message.message_id()))?;
            let signature = factory.sign(public_key, &signed_bytes)?;
            out.put_u16(u16::try_from(signature.len())?);
            out.put_slice(&signature);
        }
        Ok(true)
    }
}

/// The number of bytes `message` occupies on the wire without its signature, with byte buffers
///  counted at their declared length
pub fn unsigned_encoded_len(message: &Message) -> usize {
    let content_len: usize = message.references_from_content_types().iter()
        .map(|reference| match reference.content_type {
            ContentType::Key => PeerId::LEN,
            ContentType::Integer => size_of::<i32>(),
            ContentType::Long => size_of::<i64>(),
            ContentType::PublicKey | ContentType::PublicKeySignature => {
                size_of::<u16>() + message.public_key(reference.index).map_or(0, |key| key.len())
            }
            ContentType::SetNeighbors => {
                1 + message.neighbors(reference.index)
                    .map_or(0, |neighbors| neighbors.iter().map(PeerAddress::serialized_len).sum())
            }
            ContentType::SetPeerSocket => {
                1 + message.peer_sockets(reference.index)
                    .map_or(0, |sockets| sockets.iter().map(socket_addr_len).sum())
            }
            ContentType::ByteBuffer => size_of::<u32>() + message.buffer(reference.index).map_or(0, Buffer::length),
            ContentType::Empty => 0,
        })
        .sum();
    MessageHeader::for_message(message).serialized_len() + content_len
}

fn encode_content(message: &Message, reference: ContentReference, buffer_written: &mut Option<usize>, out: &mut BytesMut) -> anyhow::Result<bool> {
    let missing = || anyhow!("no content for {:?} in message {}", reference, message.message_id());

    match reference.content_type {
        ContentType::Key => {
            message.key(reference.index).ok_or_else(missing)?
                .ser(out);
        }
        ContentType::Integer => {
            out.put_i32(message.integer(reference.index).ok_or_else(missing)?);
        }
        ContentType::Long => {
            out.put_i64(message.long(reference.index).ok_or_else(missing)?);
        }
        ContentType::PublicKey | ContentType::PublicKeySignature => {
            let public_key = message.public_key(reference.index).ok_or_else(missing)?;
            out.put_u16(u16::try_from(public_key.len())?);
            out.put_slice(public_key);
        }
        ContentType::SetNeighbors => {
            let neighbors = message.neighbors(reference.index).ok_or_else(missing)?;
            out.put_u8(u8::try_from(neighbors.len())
                .map_err(|_| anyhow!("at most 255 neighbors per set"))?);
            for neighbor in neighbors {
                neighbor.ser(out);
            }
        }
        ContentType::SetPeerSocket => {
            let sockets = message.peer_sockets(reference.index).ok_or_else(missing)?;
            out.put_u8(u8::try_from(sockets.len())
                .map_err(|_| anyhow!("at most 255 peer sockets per set"))?);
            for socket in sockets {
                ser_socket_addr(socket, out);
            }
        }
        ContentType::ByteBuffer => {
            let buffer = message.buffer(reference.index).ok_or_else(missing)?;

            let written = match *buffer_written {
                Some(written) => written,
                None => {
                    out.put_u32(u32::try_from(buffer.length())?);
                    0
                }
            };

            let available = buffer.to_bytes();
            if available.len() > written {
                out.put_slice(&available[written..]);
            }

            if buffer.is_complete() {
                *buffer_written = None;
            }
            else {
                *buffer_written = Some(available.len().max(written));
                return Ok(false);
            }
        }
        ContentType::Empty => {
            bail!("content reference to an empty slot - this is a bug");
        }
    }
    Ok(true)
}
