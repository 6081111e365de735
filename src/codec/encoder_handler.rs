use std::sync::Arc;
use anyhow::bail;
use bytes::BytesMut;
use tracing::trace;
use crate::codec::encoder::MessageEncoder;
use crate::error::TransportError;
use crate::message::signature::SignatureFactory;
use crate::pipeline::handler::{ChannelHandler, HandlerContext, HandlerDirection, Payload, SharableHandler};

/// Encodes messages for a TCP stream. It keeps the progress of a streaming message between
///  writes and must be instantiated per channel.
pub struct TcpEncoderHandler {
    encoder: MessageEncoder,
}

impl TcpEncoderHandler {
    pub fn new(signature_factory: Option<Arc<dyn SignatureFactory>>) -> TcpEncoderHandler {
        TcpEncoderHandler {
            encoder: MessageEncoder::new(signature_factory),
        }
    }
}

impl ChannelHandler for TcpEncoderHandler {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Outbound
    }

    fn write(&mut self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        let Payload::Message(message) = payload else {
            ctx.fire_write(payload);
            return Ok(());
        };

        let mut buf = BytesMut::new();
        let finished = self.encoder.encode(&message, &mut buf)?;
        trace!("encoded {} bytes of {:?}, finished: {}", buf.len(), message, finished);
        if !buf.is_empty() {
            ctx.fire_write(Payload::Bytes { data: buf.freeze(), remote: None });
        }
        Ok(())
    }
}

/// Encodes one message per datagram. Messages exceeding the UDP size ceiling are rejected
///  unless they are streaming, and streaming messages must be complete.
pub struct UdpEncoderHandler {
    udp_size_ceiling: usize,
    signature_factory: Option<Arc<dyn SignatureFactory>>,
}

impl UdpEncoderHandler {
    pub fn new(udp_size_ceiling: usize, signature_factory: Option<Arc<dyn SignatureFactory>>) -> UdpEncoderHandler {
        UdpEncoderHandler {
            udp_size_ceiling,
            signature_factory,
        }
    }
}

impl SharableHandler for UdpEncoderHandler {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Outbound
    }

    fn write(&self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        let Payload::Message(message) = payload else {
            ctx.fire_write(payload);
            return Ok(());
        };

        let mut buf = BytesMut::new();
        if !MessageEncoder::new(self.signature_factory.clone()).encode(&message, &mut buf)? {
            bail!("streaming message {} is incomplete - a datagram can only hold a complete message", message.message_id());
        }
        if buf.len() > self.udp_size_ceiling && !message.is_streaming() {
            return Err(TransportError::MessageTooLargeForUdp {
                size: buf.len(),
                ceiling: self.udp_size_ceiling,
            }.into());
        }

        let to = message.remote_addr()
            .or(ctx.channel_info().remote_addr)
            .unwrap_or_else(|| message.recipient().udp_socket());
        trace!("encoded {:?} to {} bytes for {}", message, buf.len(), to);
        ctx.fire_write(Payload::Bytes { data: buf.freeze(), remote: Some(to) });
        Ok(())
    }
}
