use std::sync::Arc;
use anyhow::Context;
use bytes::Buf;
use tracing::{debug, trace, warn};
use crate::buffers::composite_buffer::CompositeBuffer;
use crate::codec::decoder::MessageDecoder;
use crate::message::signature::SignatureFactory;
use crate::pipeline::handler::{ChannelHandler, HandlerContext, HandlerDirection, Payload};

/// Reassembles messages from a TCP stream. Chunks are cumulated without copying, and a chunk may
///  complete any number of messages.
///
/// Streaming messages are forwarded while they are incomplete, each time more of their data
///  arrived, as a snapshot with `is_done() == false`.
///
/// This handler has per-connection state and must be instantiated per channel.
pub struct TcpDecoderHandler {
    cumulation: CompositeBuffer,
    decoder: Option<MessageDecoder>,
    last_id: Option<u32>,
    max_message_size: u32,
    signature_factory: Option<Arc<dyn SignatureFactory>>,
}

impl TcpDecoderHandler {
    pub fn new(max_message_size: u32, signature_factory: Option<Arc<dyn SignatureFactory>>) -> TcpDecoderHandler {
        TcpDecoderHandler {
            cumulation: CompositeBuffer::new(),
            decoder: None,
            last_id: None,
            max_message_size,
            signature_factory,
        }
    }

    fn decode_cumulation(&mut self, ctx: &mut HandlerContext) -> anyhow::Result<()> {
        let info = ctx.channel_info();
        let (local_addr, remote_addr) = (info.local_addr, info.remote_addr.unwrap_or(info.local_addr));
        let max_message_size = self.max_message_size;
        let signature_factory = &self.signature_factory;
        let decoder = self.decoder.get_or_insert_with(|| MessageDecoder::new(max_message_size, signature_factory.clone(), local_addr, remote_addr, false));

        loop {
            let finished = match decoder.decode(&mut self.cumulation) {
                Ok(finished) => finished,
                Err(e) => {
                    return match decoder.message() {
                        None => Err(e).context("failed to decode a message header"),
                        Some(partial) => {
                            let message_id = partial.message_id();
                            Err(e).with_context(|| format!("failed to decode message {}", message_id))
                        }
                    }
                }
            };

            if finished {
                let Some(message) = decoder.take_message() else {
                    break;
                };
                trace!("decoded {:?}", message);
                self.last_id = Some(message.message_id());
                ctx.fire_read(Payload::Message(Box::new(message)));

                if self.cumulation.has_remaining() {
                    continue;
                }
                break;
            }

            match decoder.message() {
                None => {
                    // not even a complete header yet
                }
                Some(partial) if Some(partial.message_id()) == self.last_id => {
                    debug!("more data for message {}, which was already forwarded", partial.message_id());
                    ctx.fire_read(Payload::Message(Box::new(partial.clone())));
                }
                Some(partial) if partial.is_streaming() => {
                    trace!("forwarding partial streaming message {}", partial.message_id());
                    ctx.fire_read(Payload::Message(Box::new(partial.clone())));
                }
                Some(_) => {}
            }
            break;
        }

        self.cumulation.discard_read_components();
        Ok(())
    }
}

impl ChannelHandler for TcpDecoderHandler {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Inbound
    }

    fn channel_inactive(&mut self, ctx: &mut HandlerContext) -> anyhow::Result<()> {
        if self.cumulation.has_remaining() {
            if let Err(e) = self.decode_cumulation(ctx) {
                warn!("error decoding remaining data of closed connection: {:#}", e);
            }
            if self.cumulation.has_remaining() {
                debug!("discarding {} bytes of incomplete data", self.cumulation.remaining());
            }
        }
        self.cumulation.clear();
        self.decoder = None;
        Ok(())
    }

    fn read(&mut self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        match payload {
            Payload::Bytes { data, .. } => {
                self.cumulation.add_component(data);
                self.decode_cumulation(ctx)
            }
            other => {
                ctx.fire_read(other);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::buffer::Buffer;
    use crate::codec::encoder::MessageEncoder;
    use crate::message::message::Message;
    use crate::pipeline::pipeline::{HandlerEntry, Pipeline};
    use crate::pipeline::session::PipelineSession;
    use crate::test_util::{channel_info, sample_message, Collector};
    use bytes::{Bytes, BytesMut};
    use rand::Rng;
    use rstest::rstest;

    fn session() -> (PipelineSession, Collector) {
        let collector = Collector::default();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("decoder", HandlerEntry::per_channel(|| TcpDecoderHandler::new(1024*1024, None))).unwrap();
        pipeline.add_last("collector", HandlerEntry::shared(collector.clone())).unwrap();
        (pipeline.session(channel_info()), collector)
    }

    fn encode(message: &Message) -> Bytes {
        let mut buf = BytesMut::new();
        assert!(MessageEncoder::new(None).encode(message, &mut buf).unwrap());
        buf.freeze()
    }

    fn read(session: &mut PipelineSession, data: Bytes) {
        session.fire_read(Payload::Bytes { data, remote: None });
    }

    fn split_at(data: &Bytes, boundaries: &[usize]) -> Vec<Bytes> {
        let mut result = Vec::new();
        let mut prev = 0;
        for &b in boundaries {
            result.push(data.slice(prev..b));
            prev = b;
        }
        result.push(data.slice(prev..));
        result
    }

    #[rstest]
    #[case::single(vec![])]
    #[case::two_in_header(vec![10])]
    #[case::two_at_header_end(vec![69])]
    #[case::two_in_body(vec![100])]
    #[case::three(vec![5, 80])]
    #[case::three_adjacent(vec![68, 69])]
    #[case::many(vec![1, 2, 3, 20, 36, 37, 60, 70, 71, 90, 110])]
    fn test_split_chunks(#[case] boundaries: Vec<usize>) {
        let original = sample_message();
        let encoded = encode(&original);
        assert!(encoded.len() > 120);

        let (mut session, collector) = session();
        for chunk in split_at(&encoded, &boundaries) {
            read(&mut session, chunk);
        }

        let messages = collector.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], original);
        assert!(messages[0].is_done());
    }

    #[test]
    fn test_random_splits() {
        let original = sample_message();
        let encoded = encode(&original);

        for _ in 0..100 {
            let num_splits = rand::thread_rng().gen_range(1..20);
            let mut boundaries: Vec<usize> = (0..num_splits)
                .map(|_| rand::thread_rng().gen_range(0..=encoded.len()))
                .collect();
            boundaries.sort();

            let (mut session, collector) = session();
            for chunk in split_at(&encoded, &boundaries) {
                read(&mut session, chunk);
            }
            assert_eq!(collector.messages(), vec![original.clone()]);
        }
    }

    #[test]
    fn test_several_messages_in_one_chunk() {
        let mut m1 = sample_message();
        m1.set_message_id(1);
        let mut m2 = Message::new();
        m2.set_message_id(2);
        m2.add_integer(7).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&m1));
        buf.extend_from_slice(&encode(&m2));
        buf.extend_from_slice(&encode(&m1)[..30]);

        let (mut session, collector) = session();
        read(&mut session, buf.freeze());
        assert_eq!(collector.messages(), vec![m1, m2]);
    }

    #[test]
    fn test_streaming_forwards_partial_messages() {
        let mut original = Message::new();
        original.set_message_id(5).set_streaming(true);
        original.add_buffer(Buffer::from_bytes(Bytes::from_static(b"abcdefghij"))).unwrap();
        let encoded = encode(&original);
        let header_and_length = encoded.len() - 10;

        let (mut session, collector) = session();
        read(&mut session, encoded.slice(..header_and_length + 3));
        read(&mut session, encoded.slice(header_and_length + 3..header_and_length + 7));
        read(&mut session, encoded.slice(header_and_length + 7..));

        let messages = collector.messages();
        assert_eq!(messages.len(), 3);
        assert!(!messages[0].is_done());
        assert_eq!(messages[0].buffer(0).unwrap().to_bytes().as_ref(), b"abc");
        assert!(!messages[1].is_done());
        assert_eq!(messages[1].buffer(0).unwrap().to_bytes().as_ref(), b"abcdefg");
        assert!(messages[2].is_done());
        assert_eq!(messages[2], original);
    }

    #[test]
    fn test_non_streaming_waits() {
        let mut original = Message::new();
        original.add_buffer(Buffer::from_bytes(Bytes::from_static(b"abcdefghij"))).unwrap();
        let encoded = encode(&original);

        let (mut session, collector) = session();
        read(&mut session, encoded.slice(..encoded.len() - 1));
        assert!(collector.messages().is_empty());
        read(&mut session, encoded.slice(encoded.len() - 1..));
        assert_eq!(collector.messages(), vec![original]);
    }

    #[test]
    fn test_same_id_as_last_message_is_forwarded() {
        let mut original = Message::new();
        original.set_message_id(9);
        original.add_buffer(Buffer::from_bytes(Bytes::from_static(b"abcdefghij"))).unwrap();
        let encoded = encode(&original);

        let (mut session, collector) = session();
        read(&mut session, encoded.clone());
        read(&mut session, encoded.slice(..encoded.len() - 5));

        let messages = collector.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_done());
        assert!(!messages[1].is_done());
        assert_eq!(messages[1].message_id(), 9);
    }

    #[test]
    fn test_flush_on_inactive() {
        let (mut session, collector) = session();
        read(&mut session, encode(&sample_message()).slice(..50));
        session.channel_inactive();
        assert!(collector.messages().is_empty());
        assert!(session.exception().is_none());
    }

    #[test]
    fn test_garbage_closes_connection() {
        let (mut session, collector) = session();
        read(&mut session, Bytes::from(vec![1u8; 100]));
        assert!(collector.messages().is_empty());
        assert!(session.exception().is_some());
        assert!(session.is_close_requested());
    }
}
