use std::net::{IpAddr, Ipv4Addr};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;
use crate::buffers::composite_buffer::CompositeBuffer;
use crate::message::content_type::ContentType;
use crate::message::message::{Message, MessageOptions};
use crate::message::message_type::MessageType;
use crate::message::peer_address::{PeerAddress, PeerId};

pub const PROTOCOL_VERSION: u8 = 1;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// The fixed part of every encoded message. It is protected by a checksum so that garbage on a
///  stream is detected before any declared length is trusted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub command: u8,
    pub options: MessageOptions,
    pub message_id: u32,
    pub version: u32,
    pub content_types: [ContentType; Message::CONTENT_TYPE_LENGTH],
    pub sender: PeerAddress,
    pub recipient_id: PeerId,
}

impl MessageHeader {
    /// protocol version, type, command, options, message id, version, content types
    const PREFIX_LEN: usize = 4 + 4 + 4 + 4;
    const FAMILY_OFFSET: usize = Self::PREFIX_LEN + PeerAddress::FAMILY_OFFSET;
    const CHECKSUM_LEN: usize = size_of::<u32>();

    pub fn for_message(message: &Message) -> MessageHeader {
        MessageHeader {
            message_type: message.message_type(),
            command: message.command(),
            options: message.options(),
            message_id: message.message_id(),
            version: message.version(),
            content_types: *message.content_types(),
            sender: *message.sender(),
            recipient_id: message.recipient().peer_id,
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::PREFIX_LEN + self.sender.serialized_len() + PeerId::LEN + Self::CHECKSUM_LEN
    }

    /// Determine the length of a header starting at `buf`'s reader index, or `None` if too few
    ///  bytes arrived to tell
    pub fn peek_len(buf: &CompositeBuffer) -> anyhow::Result<Option<usize>> {
        if let Some(protocol_version) = buf.get_u8_at(buf.reader_index()) {
            if protocol_version != PROTOCOL_VERSION {
                bail!("unsupported protocol version {}", protocol_version);
            }
        }

        let Some(family) = buf.get_u8_at(buf.reader_index() + Self::FAMILY_OFFSET) else {
            return Ok(None);
        };
        Ok(Some(Self::PREFIX_LEN + PeerAddress::serialized_len_for_family(family)? + PeerId::LEN + Self::CHECKSUM_LEN))
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.message_type.into());
        buf.put_u8(self.command);
        buf.put_u8(self.options.bits());
        buf.put_u32(self.message_id);
        buf.put_u32(self.version);
        buf.put_u32(encode_content_types(&self.content_types));
        self.sender.ser(buf);
        self.recipient_id.ser(buf);

        let checksum = CHECKSUM.checksum(&buf[start..]);
        buf.put_u32(checksum);
    }

    /// `raw` must contain exactly the header, as determined by [MessageHeader::peek_len]
    pub fn try_deser(raw: &[u8]) -> anyhow::Result<MessageHeader> {
        if raw.len() < Self::CHECKSUM_LEN {
            bail!("header too short");
        }
        let (mut buf, mut checksum_buf) = raw.split_at(raw.len() - Self::CHECKSUM_LEN);
        let expected_checksum = checksum_buf.try_get_u32()?;
        let actual_checksum = CHECKSUM.checksum(buf);
        if expected_checksum != actual_checksum {
            bail!("header checksum mismatch: expected {:08x}, was {:08x}", expected_checksum, actual_checksum);
        }

        let protocol_version = buf.try_get_u8()?;
        if protocol_version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", protocol_version);
        }
        let message_type = MessageType::try_from(buf.try_get_u8()?)?;
        let command = buf.try_get_u8()?;
        let raw_options = buf.try_get_u8()?;
        let options = MessageOptions::from_bits(raw_options)
            .ok_or_else(|| anyhow!("invalid message options {:02x}", raw_options))?;
        let message_id = buf.try_get_u32()?;
        let version = buf.try_get_u32()?;
        let content_types = decode_content_types(buf.try_get_u32()?)?;
        let sender = PeerAddress::try_deser(&mut buf)?;
        let recipient_id = PeerId::try_deser(&mut buf)?;

        if buf.has_remaining() {
            bail!("{} unexpected trailing bytes in header", buf.remaining());
        }

        Ok(MessageHeader {
            message_type,
            command,
            options,
            message_id,
            version,
            content_types,
            sender,
            recipient_id,
        })
    }

    /// Copy the header fields to a message, restoring its content references
    pub fn apply_to(&self, message: &mut Message) {
        message
            .set_message_type(self.message_type)
            .set_command(self.command)
            .set_options(self.options)
            .set_message_id(self.message_id)
            .set_version(self.version)
            .set_sender(self.sender)
            .set_recipient(PeerAddress::new(self.recipient_id, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0));
        message.set_content_types(self.content_types);
    }
}

/// 4 bits per slot, slot 0 in the most significant nibble
pub fn encode_content_types(content_types: &[ContentType; Message::CONTENT_TYPE_LENGTH]) -> u32 {
    content_types.iter()
        .fold(0u32, |acc, &t| (acc << 4) | u8::from(t) as u32)
}

pub fn decode_content_types(raw: u32) -> anyhow::Result<[ContentType; Message::CONTENT_TYPE_LENGTH]> {
    let mut result = [ContentType::Empty; Message::CONTENT_TYPE_LENGTH];
    let mut seen_empty = false;
    for (slot, content_type) in result.iter_mut().enumerate() {
        let nibble = ((raw >> (28 - 4*slot)) & 0xf) as u8;
        let t = ContentType::try_from(nibble)
            .map_err(|_| anyhow!("invalid content type {} in slot {}", nibble, slot))?;

        match t {
            ContentType::Empty => seen_empty = true,
            _ if seen_empty => bail!("content type {:?} in slot {} follows an empty slot", t, slot),
            ContentType::PublicKeySignature if slot != 0 => bail!("public key signature in slot {}", slot),
            _ => {}
        }
        *content_type = t;
    }
    Ok(result)
}
