use std::sync::Arc;
use bytes::Buf;
use tracing::{trace, warn};
use crate::buffers::composite_buffer::CompositeBuffer;
use crate::codec::decoder::MessageDecoder;
use crate::message::signature::SignatureFactory;
use crate::pipeline::handler::{HandlerContext, HandlerDirection, Payload, SharableHandler};

/// Decodes exactly one message per datagram. A datagram that does not hold a complete message
///  is dropped - there is nothing to wait for, since UDP delivers datagrams atomically or not
///  at all.
///
/// This handler has no state and is shared by all channels.
pub struct UdpDecoderHandler {
    max_message_size: u32,
    signature_factory: Option<Arc<dyn SignatureFactory>>,
}

impl UdpDecoderHandler {
    pub fn new(max_message_size: u32, signature_factory: Option<Arc<dyn SignatureFactory>>) -> UdpDecoderHandler {
        UdpDecoderHandler {
            max_message_size,
            signature_factory,
        }
    }
}

impl SharableHandler for UdpDecoderHandler {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Inbound
    }

    fn read(&self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        let (data, remote) = match payload {
            Payload::Bytes { data, remote } => (data, remote),
            other => {
                ctx.fire_read(other);
                return Ok(());
            }
        };

        let info = ctx.channel_info();
        let Some(remote_addr) = remote.or(info.remote_addr) else {
            warn!("datagram without sender address - dropping");
            return Ok(());
        };

        let mut decoder = MessageDecoder::new(self.max_message_size, self.signature_factory.clone(), info.local_addr, remote_addr, true);
        let mut buf = CompositeBuffer::from_bytes(data);
        match decoder.decode(&mut buf) {
            Ok(true) => {
                if buf.has_remaining() {
                    warn!("ignoring {} trailing bytes in datagram from {}", buf.remaining(), remote_addr);
                }
                if let Some(message) = decoder.take_message() {
                    trace!("decoded {:?}", message);
                    ctx.fire_read(Payload::Message(Box::new(message)));
                }
            }
            Ok(false) => {
                warn!("incomplete message in datagram from {} - dropping", remote_addr);
            }
            Err(e) => {
                warn!("undecodable datagram from {} - dropping: {}", remote_addr, e);
            }
        }
        Ok(())
    }
}
