use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use crate::codec::encoder_handler::{TcpEncoderHandler, UdpEncoderHandler};
use crate::codec::tcp_decoder::TcpDecoderHandler;
use crate::codec::udp_decoder::UdpDecoderHandler;
use crate::channel::handlers::IdleHandler;
use crate::error::TransportResult;
use crate::message::signature::SignatureFactory;
use crate::pipeline::handler::ChannelKind;
use crate::pipeline::pipeline::{HandlerEntry, Pipeline};

pub const HANDLER_IDLE: &str = "idle";
pub const HANDLER_DECODER: &str = "decoder";
pub const HANDLER_ENCODER: &str = "encoder";

/// A hook for completing a channel's pipeline before the channel is created. The pipeline
///  passed in is a copy of the caller's, so changes affect only the new channel.
#[cfg_attr(test, automock)]
pub trait ChannelFilter: Send + Sync + 'static {
    fn filter(&self, pipeline: &mut Pipeline, kind: ChannelKind, is_client: bool) -> TransportResult<()>;
}

/// Prepends the idle handler and the codec for the channel's transport, leaving the
///  application's handlers at the tail:
///
/// ```ascii
/// idle -> decoder -> encoder -> (application handlers)
/// ```
pub struct CodecFilter {
    max_message_size: u32,
    udp_size_ceiling: usize,
    signature_factory: Option<Arc<dyn SignatureFactory>>,
}

impl CodecFilter {
    pub fn new(max_message_size: u32, udp_size_ceiling: usize, signature_factory: Option<Arc<dyn SignatureFactory>>) -> CodecFilter {
        CodecFilter {
            max_message_size,
            udp_size_ceiling,
            signature_factory,
        }
    }
}

impl ChannelFilter for CodecFilter {
    fn filter(&self, pipeline: &mut Pipeline, kind: ChannelKind, _is_client: bool) -> TransportResult<()> {
        let signature_factory = self.signature_factory.clone();
        match kind {
            ChannelKind::Tcp => {
                let max_message_size = self.max_message_size;
                let decoder_signature_factory = signature_factory.clone();
                pipeline.add_first(HANDLER_ENCODER, HandlerEntry::per_channel(move || TcpEncoderHandler::new(signature_factory.clone())))?;
                pipeline.add_first(HANDLER_DECODER, HandlerEntry::per_channel(move || TcpDecoderHandler::new(max_message_size, decoder_signature_factory.clone())))?;
            }
            ChannelKind::Udp => {
                pipeline.add_first(HANDLER_ENCODER, HandlerEntry::shared(UdpEncoderHandler::new(self.udp_size_ceiling, signature_factory.clone())))?;
                pipeline.add_first(HANDLER_DECODER, HandlerEntry::shared(UdpDecoderHandler::new(self.max_message_size, signature_factory)))?;
            }
        }
        pipeline.add_first(HANDLER_IDLE, HandlerEntry::shared(IdleHandler))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::pipeline::handler::HandlerDirection;
    use crate::test_util::PassThrough;
    use rstest::rstest;

    #[rstest]
    #[case::tcp(ChannelKind::Tcp, false)]
    #[case::udp(ChannelKind::Udp, true)]
    fn test_codec_filter(#[case] kind: ChannelKind, #[case] expected_shared_codec: bool) {
        let mut pipeline = Pipeline::new();
        pipeline.add_last("app", HandlerEntry::shared(PassThrough(HandlerDirection::Both))).unwrap();

        CodecFilter::new(1000, 1400, None).filter(&mut pipeline, kind, true).unwrap();
        assert_eq!(pipeline.names(), vec!["idle", "decoder", "encoder", "app"]);
        assert_eq!(pipeline.get("decoder").unwrap().is_shared(), expected_shared_codec);
        assert_eq!(pipeline.get("encoder").unwrap().is_shared(), expected_shared_codec);
    }

    #[test]
    fn test_codec_filter_name_clash() {
        let mut pipeline = Pipeline::new();
        pipeline.add_last("decoder", HandlerEntry::shared(PassThrough(HandlerDirection::Both))).unwrap();
        let result = CodecFilter::new(1000, 1400, None).filter(&mut pipeline, ChannelKind::Tcp, true);
        assert!(matches!(result, Err(TransportError::DuplicateHandlerName(_))));
    }
}
