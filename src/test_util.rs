use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use anyhow::bail;
use bytes::Bytes;
use uuid::Uuid;
use crate::buffers::buffer::Buffer;
use crate::message::message::Message;
use crate::message::message_type::MessageType;
use crate::message::peer_address::{PeerAddress, PeerId};
use crate::pipeline::handler::{ChannelHandler, ChannelInfo, ChannelKind, HandlerContext, HandlerDirection, Payload, SharableHandler, UserEvent};

pub fn local_addr() -> SocketAddr {
    "127.0.0.1:7700".parse().unwrap()
}

pub fn remote_addr() -> SocketAddr {
    "127.0.0.1:7701".parse().unwrap()
}

/// a message with every kind of content except public keys, sent from an IPv4 peer
pub fn sample_message() -> Message {
    let sender = PeerAddress::new(PeerId::from_number(1), "10.0.0.1".parse().unwrap(), 4000, 4001);
    let recipient = PeerAddress::new(PeerId::from_number(2), "10.0.0.2".parse().unwrap(), 4000, 4001);

    let mut message = Message::new();
    message
        .set_message_id(1234)
        .set_message_type(MessageType::Request1)
        .set_command(3)
        .set_sender(sender)
        .set_recipient(recipient);

    message.add_key(PeerId::from_number(99)).unwrap()
        .add_integer(-17).unwrap()
        .add_long(1 << 40).unwrap()
        .add_buffer(Buffer::from_bytes(Bytes::from_static(b"zero copy is the way"))).unwrap()
        .add_neighbors(vec![
            PeerAddress::new(PeerId::from_number(3), "10.0.0.3".parse().unwrap(), 5000, 5001),
            PeerAddress::new(PeerId::from_number(4), "::1".parse().unwrap(), 6000, 6001),
        ]).unwrap()
        .add_peer_sockets(vec![
            "192.168.1.1:80".parse().unwrap(),
            "[fe80::1]:443".parse().unwrap(),
        ]).unwrap();
    message
}

pub fn channel_info() -> ChannelInfo {
    ChannelInfo {
        id: Uuid::new_v4(),
        kind: ChannelKind::Tcp,
        local_addr: local_addr(),
        remote_addr: Some(remote_addr()),
        is_client: false,
    }
}

pub fn udp_channel_info() -> ChannelInfo {
    ChannelInfo {
        kind: ChannelKind::Udp,
        ..channel_info()
    }
}

/// forwards everything
pub struct PassThrough(pub HandlerDirection);

impl SharableHandler for PassThrough {
    fn direction(&self) -> HandlerDirection {
        self.0
    }
}

/// a shared log of handler invocations, as `"<handler>:<hook>"`
#[derive(Clone, Default)]
pub struct Recording {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recording {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn add(&self, name: &str, hook: &str) {
        self.entries.lock().unwrap().push(format!("{}:{}", name, hook));
    }
}

/// records every invocation and forwards
pub struct Recorder {
    name: &'static str,
    direction: HandlerDirection,
    log: Recording,
}

impl Recorder {
    pub fn new(name: &'static str, direction: HandlerDirection, log: Recording) -> Recorder {
        Recorder { name, direction, log }
    }
}

impl ChannelHandler for Recorder {
    fn direction(&self) -> HandlerDirection {
        self.direction
    }

    fn channel_active(&mut self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        self.log.add(self.name, "active");
        Ok(())
    }

    fn channel_inactive(&mut self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        self.log.add(self.name, "inactive");
        Ok(())
    }

    fn read(&mut self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        self.log.add(self.name, "read");
        ctx.fire_read(payload);
        Ok(())
    }

    fn write(&mut self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        self.log.add(self.name, "write");
        ctx.fire_write(payload);
        Ok(())
    }

    fn user_event(&mut self, ctx: &mut HandlerContext, event: UserEvent) -> anyhow::Result<()> {
        self.log.add(self.name, "event");
        ctx.fire_user_event(event);
        Ok(())
    }

    fn exception_caught(&mut self, _ctx: &mut HandlerContext, _error: &anyhow::Error) {
        self.log.add(self.name, "exception");
    }
}

/// fails on every read and write
pub struct Failing;

impl SharableHandler for Failing {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Both
    }

    fn read(&self, _ctx: &mut HandlerContext, _payload: Payload) -> anyhow::Result<()> {
        bail!("read failed")
    }

    fn write(&self, _ctx: &mut HandlerContext, _payload: Payload) -> anyhow::Result<()> {
        bail!("write failed")
    }
}

/// writes everything it reads back through the whole outbound chain
pub struct Echo;

impl SharableHandler for Echo {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Inbound
    }

    fn read(&self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        ctx.write(payload);
        Ok(())
    }
}

/// collects the messages that reach it; other payloads are dropped
#[derive(Clone, Default)]
pub struct Collector {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl Collector {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }
}

impl SharableHandler for Collector {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Inbound
    }

    fn read(&self, _ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        if let Payload::Message(message) = payload {
            self.messages.lock().unwrap().push(*message);
        }
        Ok(())
    }
}
