//! The wire format and the pipeline handlers that translate between bytes and [crate::message::message::Message]s.
//!
//! [decoder::MessageDecoder] and [encoder::MessageEncoder] are transport agnostic. The handlers
//!  add the framing rules: a UDP datagram holds exactly one message, while a TCP stream is
//!  cumulated and may carry many messages per chunk or one message across many chunks.

pub mod decoder;
pub mod encoder;
pub mod encoder_handler;
pub mod message_header;
pub mod tcp_decoder;
pub mod udp_decoder;
