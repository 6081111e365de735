use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::codec::encoder::unsigned_encoded_len;
use crate::error::{TransportError, TransportResult};
use crate::message::message::Message;
use crate::pipeline::handler::{ChannelInfo, ChannelKind, IdleState, Payload, UserEvent};
use crate::pipeline::pipeline::Pipeline;
use crate::pipeline::session::PipelineSession;
use crate::util::completion::{completion, Completion, CompletionSignal};

/// a deadline that never fires in practice, for channels without idle timeout
const NO_IDLE_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 3600);

pub(crate) enum ChannelCommand {
    Send(Box<Message>),
    Close,
}

/// Called exactly once when a channel's driver terminates, with the channel's id
pub(crate) type OnClose = Box<dyn FnOnce(Uuid) + Send>;

struct CloseGuard {
    id: Uuid,
    on_close: Option<OnClose>,
    signal: CompletionSignal,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close(self.id);
        }
        debug!("channel {} closed", self.id);
        self.signal.complete();
    }
}

/// A handle to an open TCP connection or UDP socket. Handles are cheap to clone; the channel
///  itself is owned by a background task that drives its socket and pipeline.
///
/// A channel closes when it is asked to, when the peer closes the connection, when it was idle
///  for too long, or after an error in its pipeline.
#[derive(Clone)]
pub struct Channel {
    info: Arc<ChannelInfo>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    closed: Completion,
    udp_size_ceiling: Option<usize>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel{{id:{}, kind:{:?}, local:{}, remote:{:?}}}", self.info.id, self.info.kind, self.info.local_addr, self.info.remote_addr)
    }
}

impl Channel {
    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn kind(&self) -> ChannelKind {
        self.info.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.info.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.info.remote_addr
    }

    /// Queue a message to be written through the channel's pipeline. A UDP channel rejects a
    ///  message that does not fit into a datagram right here, unless the message is streaming.
    pub fn send(&self, message: Message) -> TransportResult<()> {
        if let Some(ceiling) = self.udp_size_ceiling {
            let size = unsigned_encoded_len(&message);
            if size > ceiling && !message.is_streaming() {
                debug!("message {} with {} bytes does not fit into a datagram", message.message_id(), size);
                return Err(TransportError::MessageTooLargeForUdp { size, ceiling });
            }
        }
        self.commands.send(ChannelCommand::Send(Box::new(message)))
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Ask the channel to close after flushing what was sent before. This returns immediately;
    ///  use [Channel::closed] to wait for the close to complete.
    pub fn close(&self) {
        let _ = self.commands.send(ChannelCommand::Close);
    }

    pub async fn closed(&self) {
        self.closed.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_complete()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct DriverConfig {
    pub idle_timeout: Option<Duration>,
    pub receive_buffer_size: usize,
    /// checked by [Channel::send] on UDP channels
    pub udp_size_ceiling: usize,
}

impl DriverConfig {
    fn idle_deadline(&self, last_activity: Instant) -> Instant {
        last_activity + self.idle_timeout.unwrap_or(NO_IDLE_TIMEOUT)
    }
}

fn new_channel(info: ChannelInfo, config: &DriverConfig, on_close: Option<OnClose>) -> (Channel, mpsc::UnboundedReceiver<ChannelCommand>, CloseGuard) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (signal, closed) = completion();
    let guard = CloseGuard {
        id: info.id,
        on_close,
        signal,
    };
    let udp_size_ceiling = (info.kind == ChannelKind::Udp).then_some(config.udp_size_ceiling);
    let channel = Channel {
        info: Arc::new(info),
        commands: tx,
        closed,
        udp_size_ceiling,
    };
    (channel, rx, guard)
}

/// Owns a TCP connection and its pipeline session. Creating the driver does not start it, so
///  the channel can be registered before it can possibly close.
pub(crate) struct TcpDriver {
    stream: TcpStream,
    session: PipelineSession,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    config: DriverConfig,
    guard: CloseGuard,
}

pub(crate) fn tcp_channel(stream: TcpStream, pipeline: &Pipeline, is_client: bool, config: DriverConfig, on_close: Option<OnClose>) -> std::io::Result<(Channel, TcpDriver)> {
    let info = ChannelInfo {
        id: Uuid::new_v4(),
        kind: ChannelKind::Tcp,
        local_addr: stream.local_addr()?,
        remote_addr: Some(stream.peer_addr()?),
        is_client,
    };
    let mut session = pipeline.session(info.clone());
    let (channel, commands, guard) = new_channel(info, &config, on_close);
    session.attach(channel.clone());

    Ok((channel, TcpDriver {
        stream,
        session,
        commands,
        config,
        guard,
    }))
}

impl TcpDriver {
    pub fn spawn(self) -> JoinHandle<()> {
        let info = self.session.info();
        let span = span!(Level::TRACE, "tcp_channel", id = %info.id, remote = ?info.remote_addr);
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        let TcpDriver { stream, mut session, mut commands, config, guard } = self;
        let remote_addr = session.info().remote_addr;
        let (mut reader, mut writer) = stream.into_split();

        debug!("channel active");
        session.channel_active();

        let mut buf = BytesMut::new();
        let mut last_activity = Instant::now();
        loop {
            if !flush_tcp(&mut session, &mut writer).await || session.is_close_requested() {
                break;
            }

            buf.reserve(config.receive_buffer_size);
            select! {
                result = reader.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        debug!("connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        trace!("received {} bytes", n);
                        last_activity = Instant::now();
                        session.fire_read(Payload::Bytes { data: buf.split().freeze(), remote: remote_addr });
                    }
                    Err(e) => {
                        session.fire_exception(e.into());
                    }
                },
                command = commands.recv() => match command {
                    Some(ChannelCommand::Send(message)) => {
                        last_activity = Instant::now();
                        session.write(Payload::Message(message));
                    }
                    Some(ChannelCommand::Close) | None => {
                        debug!("closing channel");
                        break;
                    }
                },
                _ = sleep_until(config.idle_deadline(last_activity)) => {
                    session.fire_user_event(UserEvent::Idle(IdleState::AllIdle));
                    last_activity = Instant::now();
                }
            }
        }

        session.channel_inactive();
        flush_tcp(&mut session, &mut writer).await;
        if let Err(e) = writer.shutdown().await {
            trace!("error shutting down connection: {}", e);
        }
        drop(commands);
        drop(guard);
    }
}

/// Returns `false` if writing failed, which closes the channel
async fn flush_tcp(session: &mut PipelineSession, writer: &mut OwnedWriteHalf) -> bool {
    let outbound: Vec<Bytes> = session.drain_outbox()
        .map(|o| o.data)
        .collect();
    for data in outbound {
        if let Err(e) = writer.write_all(&data).await {
            warn!("error writing to connection: {}", e);
            session.fire_exception(e.into());
            return false;
        }
    }
    true
}

/// Owns a UDP socket. Client channels have a single pipeline session for their lifetime;
///  server sockets process every datagram (and every reply) with a fresh session, so no state
///  and no failure carries over between datagrams.
pub(crate) struct UdpDriver {
    socket: UdpSocket,
    pipeline: Pipeline,
    channel: Channel,
    session: Option<PipelineSession>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    config: DriverConfig,
    guard: CloseGuard,
}

pub(crate) fn udp_channel(socket: UdpSocket, pipeline: &Pipeline, is_client: bool, config: DriverConfig, on_close: Option<OnClose>) -> std::io::Result<(Channel, UdpDriver)> {
    let info = ChannelInfo {
        id: Uuid::new_v4(),
        kind: ChannelKind::Udp,
        local_addr: socket.local_addr()?,
        remote_addr: socket.peer_addr().ok(),
        is_client,
    };
    let (channel, commands, guard) = new_channel(info, &config, on_close);
    let session = is_client.then(|| new_session(pipeline, &channel));

    Ok((channel.clone(), UdpDriver {
        socket,
        pipeline: pipeline.clone(),
        channel,
        session,
        commands,
        config,
        guard,
    }))
}

fn new_session(pipeline: &Pipeline, channel: &Channel) -> PipelineSession {
    let mut session = pipeline.session(channel.info().clone());
    session.attach(channel.clone());
    session
}

impl UdpDriver {
    pub fn spawn(self) -> JoinHandle<()> {
        let span = span!(Level::TRACE, "udp_channel", id = %self.channel.id(), local = %self.channel.local_addr());
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        let UdpDriver { socket, pipeline, channel, mut session, mut commands, config, guard } = self;
        let is_client = channel.info().is_client;

        if let Some(session) = &mut session {
            session.channel_active();
        }

        let mut buf = vec![0u8; config.receive_buffer_size];
        let mut last_activity = Instant::now();
        loop {
            let mut transient;
            select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((n, from)) => {
                        last_activity = Instant::now();
                        let s = match &mut session {
                            Some(s) => s,
                            None => {
                                transient = new_session(&pipeline, &channel);
                                &mut transient
                            }
                        };

                        let correlation_id = Uuid::new_v4();
                        let datagram_span = span!(Level::TRACE, "datagram_received", ?correlation_id, %from);
                        {
                            let _entered = datagram_span.enter();
                            trace!("received {} bytes", n);
                            s.fire_read(Payload::Bytes { data: Bytes::copy_from_slice(&buf[..n]), remote: Some(from) });
                        }
                        flush_udp(&socket, s, channel.remote_addr())
                            .instrument(datagram_span)
                            .await;
                    }
                    Err(e) => {
                        if is_client {
                            if let Some(s) = &mut session {
                                s.fire_exception(e.into());
                            }
                        }
                        else {
                            error!("socket error: {}", e);
                        }
                    }
                },
                command = commands.recv() => match command {
                    Some(ChannelCommand::Send(message)) => {
                        last_activity = Instant::now();
                        let s = match &mut session {
                            Some(s) => s,
                            None => {
                                transient = new_session(&pipeline, &channel);
                                &mut transient
                            }
                        };
                        s.write(Payload::Message(message));
                        flush_udp(&socket, s, channel.remote_addr()).await;
                    }
                    Some(ChannelCommand::Close) | None => {
                        debug!("closing channel");
                        break;
                    }
                },
                _ = sleep_until(config.idle_deadline(last_activity)) => {
                    if let Some(s) = &mut session {
                        s.fire_user_event(UserEvent::Idle(IdleState::AllIdle));
                    }
                    last_activity = Instant::now();
                }
            }

            if session.as_ref().map(|s| s.is_close_requested()).unwrap_or(false) {
                break;
            }
        }

        if let Some(session) = &mut session {
            session.channel_inactive();
            flush_udp(&socket, session, channel.remote_addr()).await;
        }
        drop(commands);
        drop(guard);
    }
}

async fn flush_udp(socket: &UdpSocket, session: &mut PipelineSession, default_to: Option<SocketAddr>) {
    let outbound: Vec<_> = session.drain_outbox().collect();
    for o in outbound {
        let Some(to) = o.to.or(default_to) else {
            warn!("datagram without destination - dropping");
            continue;
        };
        match socket.send_to(&o.data, to).await {
            Ok(_) => trace!("sent {} bytes to {}", o.data.len(), to),
            Err(e) => warn!("error sending datagram to {}: {}", to, e),
        }
    }
}
