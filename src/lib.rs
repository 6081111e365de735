//! Transport core for a peer-to-peer node: a binary message model, framing codecs for TCP and
//!  UDP, a handler pipeline that servers and outbound connections share, and admission control
//!  for outbound channels.
//!
//! ## Layers
//!
//! * [buffers] - a composite buffer that stitches independently allocated chunks into one
//!   virtual offset space without copying, and a length-tracked payload [buffers::buffer::Buffer]
//!   that supports partial delivery
//! * [message] - the in-memory message: header fields plus up to eight typed content slots
//! * [codec] - the versioned wire format, a single-datagram UDP decoder and a cumulative TCP
//!   decoder that reassembles messages across arbitrary chunk boundaries
//! * [pipeline] - an ordered chain of named inbound / outbound handlers. The chain is a shared
//!   template; all traversal state lives in a per-connection [pipeline::session::PipelineSession]
//! * [channel] - [channel::reservation::Reservation] owns the process-wide permit pools and hands
//!   out [channel::channel_creator::ChannelCreator]s with a fixed budget of UDP / TCP channels.
//!   [channel::channel_server::ChannelServer] is the listening side and is independent of
//!   reservations.
//!
//! ## Permits
//!
//! Every outbound channel holds exactly one permit of its creator's local semaphore, and every
//!  creator holds its share of the reservation's global semaphores. Permits are owned values
//!  (`OwnedSemaphorePermit`) that move into the task that is released last, so they are given
//!  back on every exit path without explicit bookkeeping. Shutdown of a
//!  creator or a reservation completes only after *all* permits were re-acquired, which proves
//!  that nothing is outstanding.
//!
//! ## Wire format
//!
//! All numbers are big-endian. The header looks like this:
//!
//! ```ascii
//!  0: protocol version (u8)
//!  1: message type (u8)
//!  2: command (u8)
//!  3: options (u8) - bit 0 keep-alive, bit 1 streaming
//!  4: message id (u32)
//!  8: version (u32)
//! 12: content types (u32) - 8 x 4 bits, slot 0 in the most significant nibble
//! 16: sender peer address (20 byte id, u8 address family, 4 or 16 byte ip, u16 tcp port,
//!      u16 udp port)
//!  *: recipient peer id (20 bytes)
//!  *: header checksum (u32) - CRC-32/ISCSI of all preceding header bytes
//! ```
//!
//! Content blocks follow in slot order. Byte buffers are prefixed with their declared length
//!  (u32) and are the only blocks that may arrive in pieces. If slot 0 holds a
//!  `PublicKeySignature`, a signature (u16 length + bytes) over all preceding bytes of the
//!  message follows the last block.
//!
//! TCP frames are self-delimiting through header and content lengths. A UDP datagram carries
//!  exactly one message.

pub mod buffers;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod util;

#[cfg(test)]
pub mod test_util;
