use std::any::Any;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use uuid::Uuid;
use crate::channel::channel::Channel;
use crate::message::message::Message;

/// What travels through a pipeline: raw bytes between the socket and the codec handlers, and
///  messages between the codec handlers and the application
pub enum Payload {
    Bytes {
        data: Bytes,
        /// the sender of received data, or the destination of outbound data if the channel is
        ///  not connected
        remote: Option<SocketAddr>,
    },
    Message(Box<Message>),
}

impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Bytes { data, remote } => write!(f, "Bytes{{len:{}, remote:{:?}}}", data.len(), remote),
            Payload::Message(message) => write!(f, "{:?}", message),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdleState {
    /// neither reads nor writes happened for the configured idle time
    AllIdle,
}

/// Out-of-band notifications for inbound handlers
#[derive(Clone)]
pub enum UserEvent {
    Idle(IdleState),
    Custom(Arc<dyn Any + Send + Sync>),
}

impl Debug for UserEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UserEvent::Idle(state) => write!(f, "Idle({:?})", state),
            UserEvent::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// The directions a handler takes part in. Inbound handlers see reads and user events,
///  outbound handlers see writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerDirection {
    Inbound,
    Outbound,
    Both,
}

impl HandlerDirection {
    pub fn is_inbound(&self) -> bool {
        matches!(self, HandlerDirection::Inbound | HandlerDirection::Both)
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, HandlerDirection::Outbound | HandlerDirection::Both)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChannelKind {
    Tcp,
    Udp,
}

/// Static information about the channel a pipeline session belongs to
#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub id: Uuid,
    pub kind: ChannelKind,
    pub local_addr: SocketAddr,
    /// `None` for unconnected UDP sockets
    pub remote_addr: Option<SocketAddr>,
    /// the channel was opened by this node rather than accepted by a server
    pub is_client: bool,
}

/// Encoded bytes that reached the head of the pipeline and are ready to go to the socket
#[derive(Clone, Debug)]
pub struct Outbound {
    pub data: Bytes,
    pub to: Option<SocketAddr>,
}

pub(crate) enum Event {
    Read { from: usize, payload: Payload },
    /// delivered to the next outbound handler *before* `before`, i.e. closer to the head
    Write { before: usize, payload: Payload },
    UserEvent { from: usize, event: UserEvent },
}

/// Mutable per-session state that handlers may touch through their [HandlerContext]
pub(crate) struct SessionState {
    pub info: ChannelInfo,
    pub channel: Option<Channel>,
    pub exception: Option<anyhow::Error>,
    pub timed_out: bool,
    pub close_requested: bool,
    pub outbox: VecDeque<Outbound>,
}

/// A handler's view of the session while it is invoked
pub struct HandlerContext<'a> {
    pub(crate) position: usize,
    pub(crate) name: &'a str,
    pub(crate) events: &'a mut VecDeque<Event>,
    pub(crate) state: &'a mut SessionState,
}

impl HandlerContext<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn channel_info(&self) -> &ChannelInfo {
        &self.state.info
    }

    /// a handle to the channel, for work that completes asynchronously. This is `None` for
    ///  sessions that are not attached to a channel.
    pub fn channel(&self) -> Option<&Channel> {
        self.state.channel.as_ref()
    }

    /// pass inbound data on to the next inbound handler
    pub fn fire_read(&mut self, payload: Payload) {
        self.events.push_back(Event::Read { from: self.position + 1, payload });
    }

    /// pass outbound data on to the next outbound handler towards the head
    pub fn fire_write(&mut self, payload: Payload) {
        self.events.push_back(Event::Write { before: self.position, payload });
    }

    /// write from the tail of the pipeline, i.e. through all outbound handlers
    pub fn write(&mut self, payload: Payload) {
        self.events.push_back(Event::Write { before: usize::MAX, payload });
    }

    pub fn fire_user_event(&mut self, event: UserEvent) {
        self.events.push_back(Event::UserEvent { from: self.position + 1, event });
    }

    /// Ask for the channel to be closed once all pending outbound data is flushed
    pub fn close(&mut self) {
        self.state.close_requested = true;
    }

    /// Mark the channel as timed out. Reads and writes are not processed after this, and the
    ///  channel is closed.
    pub fn set_timed_out(&mut self) {
        self.state.timed_out = true;
        self.state.close_requested = true;
    }

    pub fn is_timed_out(&self) -> bool {
        self.state.timed_out
    }
}

/// A handler that is instantiated per channel and can therefore hold mutable per-channel state.
///
/// All hooks have forwarding / no-op defaults, so a handler implements only what it cares
///  about. Errors returned from a hook are captured by the session: the remaining handlers in
///  the same direction get `exception_caught()`, and the channel is closed.
pub trait ChannelHandler: Send {
    fn direction(&self) -> HandlerDirection;

    fn channel_active(&mut self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn channel_inactive(&mut self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn read(&mut self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        ctx.fire_read(payload);
        Ok(())
    }

    fn write(&mut self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        ctx.fire_write(payload);
        Ok(())
    }

    fn user_event(&mut self, ctx: &mut HandlerContext, event: UserEvent) -> anyhow::Result<()> {
        ctx.fire_user_event(event);
        Ok(())
    }

    fn exception_caught(&mut self, _ctx: &mut HandlerContext, _error: &anyhow::Error) {}
}

/// A handler without mutable per-channel state, which is shared by all channels using a
///  pipeline. The hooks are the same as [ChannelHandler]'s.
pub trait SharableHandler: Send + Sync + 'static {
    fn direction(&self) -> HandlerDirection;

    fn channel_active(&self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn read(&self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        ctx.fire_read(payload);
        Ok(())
    }

    fn write(&self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        ctx.fire_write(payload);
        Ok(())
    }

    fn user_event(&self, ctx: &mut HandlerContext, event: UserEvent) -> anyhow::Result<()> {
        ctx.fire_user_event(event);
        Ok(())
    }

    fn exception_caught(&self, _ctx: &mut HandlerContext, _error: &anyhow::Error) {}
}

/// plugs a shared handler into a session's per-channel handler list
pub(crate) struct SharedHandler(pub Arc<dyn SharableHandler>);

impl ChannelHandler for SharedHandler {
    fn direction(&self) -> HandlerDirection {
        self.0.direction()
    }
    fn channel_active(&mut self, ctx: &mut HandlerContext) -> anyhow::Result<()> {
        self.0.channel_active(ctx)
    }
    fn channel_inactive(&mut self, ctx: &mut HandlerContext) -> anyhow::Result<()> {
        self.0.channel_inactive(ctx)
    }
    fn read(&mut self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        self.0.read(ctx, payload)
    }
    fn write(&mut self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        self.0.write(ctx, payload)
    }
    fn user_event(&mut self, ctx: &mut HandlerContext, event: UserEvent) -> anyhow::Result<()> {
        self.0.user_event(ctx, event)
    }
    fn exception_caught(&mut self, ctx: &mut HandlerContext, error: &anyhow::Error) {
        self.0.exception_caught(ctx, error)
    }
}
