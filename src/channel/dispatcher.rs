use std::sync::{Arc, RwLock};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn, Instrument, Span};
use crate::message::message::Message;
use crate::message::message_type::MessageType;
use crate::message::peer_address::PeerAddress;
use crate::pipeline::handler::{ChannelKind, HandlerContext, HandlerDirection, Payload, SharableHandler};

/// Application code serving one command. `reply` is prepared as an `Ok` reply to `request`;
///  the handler fills it in (or replaces it) and returns what should be sent back.
///
/// Replies to fire-and-forget requests are discarded.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, request: Message, reply: Message) -> anyhow::Result<Message>;
}

/// The tail of a server pipeline: routes incoming requests to the [RequestHandler] registered
///  for their command, and writes replies back through the channel they arrived on.
///
/// * replies (i.e. non-requests) are passed on to subsequent handlers
/// * a request for an unregistered command, or for a different peer id, is answered with
///   [MessageType::UnknownId]
/// * a failing request handler is answered with [MessageType::Exception]
/// * a TCP connection is closed after the reply unless the request asked for keep-alive
pub struct Dispatcher {
    self_address: RwLock<PeerAddress>,
    handlers: RwLock<FxHashMap<u8, Arc<dyn RequestHandler>>>,
}

impl Dispatcher {
    pub fn new(self_address: PeerAddress) -> Dispatcher {
        Dispatcher {
            self_address: RwLock::new(self_address),
            handlers: Default::default(),
        }
    }

    pub fn self_address(&self) -> PeerAddress {
        *self.self_address.read().unwrap()
    }

    /// The server updates this once it knows its actual ports
    pub fn set_self_address(&self, self_address: PeerAddress) {
        *self.self_address.write().unwrap() = self_address;
    }

    pub fn register(&self, command: u8, handler: Arc<dyn RequestHandler>) -> anyhow::Result<()> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&command) {
            bail!("there is already a handler for command {}", command);
        }
        debug!("registering request handler for command {}", command);
        handlers.insert(command, handler);
        Ok(())
    }

    pub fn deregister(&self, command: u8) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.write().unwrap().remove(&command)
    }

    fn handler_for(&self, command: u8) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.read().unwrap().get(&command).cloned()
    }
}

/// replies go back the way the request came
fn with_addresses_of(mut reply: Message, request: &Message) -> Message {
    if let (Some(local), Some(remote)) = (request.local_addr(), request.remote_addr()) {
        reply.set_addresses(local, remote);
    }
    reply
}

impl SharableHandler for Dispatcher {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Inbound
    }

    fn read(&self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        let request = match payload {
            Payload::Message(message) if message.is_request() => message,
            other => {
                ctx.fire_read(other);
                return Ok(());
            }
        };
        if !request.is_done() {
            trace!("request {} is not complete yet", request.message_id());
            return Ok(());
        }

        let self_address = self.self_address();
        let close_after_reply = ctx.channel_info().kind == ChannelKind::Tcp && !request.is_keep_alive();

        let recipient_id = request.recipient().peer_id;
        let handler = if recipient_id.is_zero() || recipient_id == self_address.peer_id {
            self.handler_for(request.command())
        }
        else {
            debug!("request {} is addressed to {:?}, not to this peer", request.message_id(), recipient_id);
            None
        };

        let Some(handler) = handler else {
            debug!("no handler for command {} of request {}", request.command(), request.message_id());
            if !request.is_fire_and_forget() {
                let reply = with_addresses_of(request.reply(self_address, MessageType::UnknownId), &request);
                ctx.write(Payload::Message(Box::new(reply)));
            }
            if close_after_reply {
                ctx.close();
            }
            return Ok(());
        };

        let channel = ctx.channel()
            .ok_or_else(|| anyhow!("dispatching a request requires a channel"))?
            .clone();

        let ok_reply = with_addresses_of(request.reply(self_address, MessageType::Ok), &request);
        let error_reply = with_addresses_of(request.reply(self_address, MessageType::Exception), &request);
        let (local_addr, remote_addr) = (request.local_addr(), request.remote_addr());
        tokio::spawn(async move {
            let message_id = request.message_id();
            let fire_and_forget = request.is_fire_and_forget();

            let reply = match handler.handle_request(*request, ok_reply).await {
                Ok(mut reply) => {
                    if let (None, Some(local), Some(remote)) = (reply.remote_addr(), local_addr, remote_addr) {
                        reply.set_addresses(local, remote);
                    }
                    reply
                }
                Err(e) => {
                    warn!("request handler failed for message {}: {}", message_id, e);
                    error_reply
                }
            };

            if !fire_and_forget {
                if let Err(e) = channel.send(reply) {
                    debug!("could not reply to message {}: {}", message_id, e);
                }
            }
            if close_after_reply {
                channel.close();
            }
        }.instrument(Span::current()));
        Ok(())
    }
}
