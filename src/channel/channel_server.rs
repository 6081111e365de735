use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::Context;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tracing::{debug, error, info, instrument, span, Instrument, Level};
use uuid::Uuid;
use crate::channel::channel::{tcp_channel, udp_channel, Channel, DriverConfig};
use crate::channel::dispatcher::Dispatcher;
use crate::channel::filter::{ChannelFilter, CodecFilter};
use crate::channel::handlers::ConnectionLimiter;
use crate::config::ChannelServerConfig;
use crate::pipeline::handler::ChannelKind;
use crate::pipeline::pipeline::{HandlerEntry, Pipeline};
use crate::util::completion::{completion, Completion, CompletionSignal};

pub const HANDLER_LIMITER: &str = "limiter";
pub const HANDLER_DISPATCHER: &str = "dispatcher";

type Connections = Arc<Mutex<FxHashMap<Uuid, Channel>>>;

/// The listening side of a node: a TCP listener and a UDP socket, both feeding requests to a
///  [Dispatcher]. Pipelines look like this:
///
/// ```ascii
/// TCP: limiter -> idle -> decoder -> encoder -> dispatcher
/// UDP:            idle -> decoder -> encoder -> dispatcher
/// ```
///
/// Every UDP datagram is processed by a fresh pipeline session. Servers do not take part in
///  reservations: incoming connections are bounded by the connection limiter only.
pub struct ChannelServer {
    tcp_local_addr: SocketAddr,
    udp_local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<ConnectionLimiter>,
    udp_channel: Channel,
    connections: Connections,
    stop_accepting: CompletionSignal,
    accept_loop_done: Completion,
    shutdown_started: AtomicBool,
    shutdown_signal: CompletionSignal,
    shutdown_completion: Completion,
}

impl ChannelServer {
    /// Bind the sockets and start serving. The dispatcher's self address is updated with the
    ///  actual ports. Without a filter, the codec is configured from `config` without signatures.
    pub async fn start(config: ChannelServerConfig, dispatcher: Arc<Dispatcher>, filter: Option<Arc<dyn ChannelFilter>>) -> anyhow::Result<ChannelServer> {
        config.validate()?;
        let filter = filter.unwrap_or_else(|| Arc::new(CodecFilter::new(config.max_message_size, config.udp_size_ceiling, None)));

        let limiter = Arc::new(ConnectionLimiter::new(config.max_incoming_tcp));

        let mut tcp_pipeline = Pipeline::new();
        tcp_pipeline.add_last(HANDLER_DISPATCHER, HandlerEntry::Shared(dispatcher.clone()))?;
        filter.filter(&mut tcp_pipeline, ChannelKind::Tcp, false)?;
        tcp_pipeline.add_first(HANDLER_LIMITER, HandlerEntry::Shared(limiter.clone()))?;

        let mut udp_pipeline = Pipeline::new();
        udp_pipeline.add_last(HANDLER_DISPATCHER, HandlerEntry::Shared(dispatcher.clone()))?;
        filter.filter(&mut udp_pipeline, ChannelKind::Udp, false)?;

        let listener = TcpListener::bind(config.tcp_bind_addr()).await
            .with_context(|| format!("failed to bind TCP listener to {}", config.tcp_bind_addr()))?;
        let udp_socket = UdpSocket::bind(config.udp_bind_addr()).await
            .with_context(|| format!("failed to bind UDP socket to {}", config.udp_bind_addr()))?;
        let tcp_local_addr = listener.local_addr()?;
        let udp_local_addr = udp_socket.local_addr()?;

        let mut self_address = dispatcher.self_address();
        self_address.tcp_port = tcp_local_addr.port();
        self_address.udp_port = udp_local_addr.port();
        if self_address.ip.is_unspecified() && !config.bind_ip.is_unspecified() {
            self_address.ip = config.bind_ip;
        }
        dispatcher.set_self_address(self_address);

        let udp_config = DriverConfig {
            idle_timeout: None,
            receive_buffer_size: config.receive_buffer_size,
            udp_size_ceiling: config.udp_size_ceiling,
        };
        let (udp_channel, udp_driver) = udp_channel(udp_socket, &udp_pipeline, false, udp_config, None)?;
        udp_driver.spawn();

        let connections: Connections = Default::default();
        let (stop_accepting, stop) = completion();
        let (accept_loop_signal, accept_loop_done) = completion();
        let tcp_config = DriverConfig {
            idle_timeout: Some(config.idle_tcp),
            receive_buffer_size: config.receive_buffer_size,
            udp_size_ceiling: config.udp_size_ceiling,
        };
        let span = span!(Level::INFO, "channel_server", tcp = %tcp_local_addr);
        tokio::spawn(accept_loop(listener, tcp_pipeline, tcp_config, connections.clone(), stop, accept_loop_signal).instrument(span));

        info!("channel server listening on {} (TCP) and {} (UDP)", tcp_local_addr, udp_local_addr);

        let (shutdown_signal, shutdown_completion) = completion();
        Ok(ChannelServer {
            tcp_local_addr,
            udp_local_addr,
            dispatcher,
            limiter,
            udp_channel,
            connections,
            stop_accepting,
            accept_loop_done,
            shutdown_started: AtomicBool::new(false),
            shutdown_signal,
            shutdown_completion,
        })
    }

    pub fn tcp_local_addr(&self) -> SocketAddr {
        self.tcp_local_addr
    }

    pub fn udp_local_addr(&self) -> SocketAddr {
        self.udp_local_addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// open incoming TCP connections, including those about to be closed by the limiter
    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn num_active_connections(&self) -> usize {
        self.limiter.num_connections()
    }

    /// Stop accepting connections and datagrams and close all open connections. The returned
    ///  completion fires when all sockets are closed.
    pub fn shutdown(&self) -> Completion {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return self.shutdown_completion.clone();
        }
        info!("shutting down channel server on {}", self.tcp_local_addr);

        self.stop_accepting.complete();
        let accept_loop_done = self.accept_loop_done.clone();
        let connections = self.connections.clone();
        let udp_channel = self.udp_channel.clone();
        let shutdown_signal = self.shutdown_signal.clone();
        tokio::spawn(async move {
            accept_loop_done.wait().await;

            let open: Vec<Channel> = connections.lock().unwrap()
                .values()
                .cloned()
                .collect();
            debug!("closing {} incoming connections", open.len());
            for channel in &open {
                channel.close();
            }
            udp_channel.close();

            for channel in &open {
                channel.closed().await;
            }
            udp_channel.closed().await;
            shutdown_signal.complete();
        });

        self.shutdown_completion.clone()
    }
}

async fn accept_loop(listener: TcpListener, pipeline: Pipeline, config: DriverConfig, connections: Connections, stop: Completion, done: CompletionSignal) {
    loop {
        select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = handle_connection_request(addr, stream, &pipeline, &config, &connections) {
                        error!("failed to set up connection from {}: {}", addr, e);
                    }
                }
                Err(e) => {
                    error!("error accepting connection: {}", e);
                }
            },
            _ = stop.wait() => {
                debug!("no longer accepting connections");
                break;
            }
        }
    }
    drop(listener);
    done.complete();
}

#[instrument(name="accepted_connection", skip_all, fields(addr = format!("{:?}", addr)))]
fn handle_connection_request(addr: SocketAddr, stream: TcpStream, pipeline: &Pipeline, config: &DriverConfig, connections: &Connections) -> anyhow::Result<()> {
    debug!("received connection request");
    stream.set_nodelay(true)?;

    let connections_on_close = connections.clone();
    let (channel, driver) = tcp_channel(stream, pipeline, false, config.clone(), Some(Box::new(move |id| {
        connections_on_close.lock().unwrap().remove(&id);
    })))?;
    connections.lock().unwrap().insert(channel.id(), channel);
    driver.spawn();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::dispatcher::MockRequestHandler;
    use crate::channel::handlers::MessageSink;
    use crate::channel::reservation::Reservation;
    use crate::config::ChannelClientConfig;
    use crate::message::message::Message;
    use crate::message::message_type::MessageType;
    use crate::message::peer_address::{PeerAddress, PeerId};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    const COMMAND: u8 = 5;

    fn server_address() -> PeerAddress {
        PeerAddress::new(PeerId::from_number(1), "127.0.0.1".parse().unwrap(), 0, 0)
    }

    fn client_address() -> PeerAddress {
        PeerAddress::new(PeerId::from_number(2), "127.0.0.1".parse().unwrap(), 0, 0)
    }

    async fn server() -> ChannelServer {
        let mut handler = MockRequestHandler::new();
        handler.expect_handle_request()
            .returning(|request, mut reply| {
                reply.add_integer(request.integer(0).unwrap_or_default() + 1)?;
                Ok(reply)
            });

        let dispatcher = Arc::new(Dispatcher::new(server_address()));
        dispatcher.register(COMMAND, Arc::new(handler)).unwrap();
        ChannelServer::start(ChannelServerConfig::localhost(), dispatcher, None).await.unwrap()
    }

    fn client_reservation() -> Reservation {
        let config = ChannelClientConfig::localhost(2, 2, 2);
        let filter = Arc::new(CodecFilter::new(config.max_message_size, config.udp_size_ceiling, None));
        Reservation::new(config, filter).unwrap()
    }

    fn request(recipient: PeerAddress, command: u8, keep_alive: bool) -> Message {
        let mut message = Message::request(MessageType::Request1, command, client_address(), recipient);
        message.set_keep_alive(keep_alive);
        message.add_integer(41).unwrap();
        message
    }

    #[tokio::test]
    async fn test_tcp_request_reply() {
        let server = server().await;
        assert_eq!(server.dispatcher().self_address().tcp_port, server.tcp_local_addr().port());

        let reservation = client_reservation();
        let creator = reservation.create(0, 1).unwrap().await.unwrap();

        let (sink, mut replies) = MessageSink::new();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("sink", HandlerEntry::shared(sink)).unwrap();
        let channel = creator.create_tcp(server.tcp_local_addr(), Some(Duration::from_secs(1)), &pipeline).await.unwrap();

        let request = request(server.dispatcher().self_address(), COMMAND, false);
        channel.send(request.clone()).unwrap();

        let reply = timeout(Duration::from_secs(5), replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::Ok);
        assert_eq!(reply.message_id(), request.message_id());
        assert_eq!(reply.integer(0), Some(42));
        assert_eq!(reply.sender().peer_id, server_address().peer_id);

        // no keep-alive: the server closes the connection after replying
        timeout(Duration::from_secs(5), channel.closed()).await.unwrap();

        assert!(creator.shutdown().wait().await);
        assert!(reservation.shutdown().wait().await);
        assert!(server.shutdown().wait().await);
    }

    #[tokio::test]
    async fn test_tcp_unknown_command_with_keep_alive() {
        let server = server().await;
        let reservation = client_reservation();
        let creator = reservation.create(0, 1).unwrap().await.unwrap();

        let (sink, mut replies) = MessageSink::new();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("sink", HandlerEntry::shared(sink)).unwrap();
        let channel = creator.create_tcp(server.tcp_local_addr(), Some(Duration::from_secs(1)), &pipeline).await.unwrap();

        channel.send(request(server.dispatcher().self_address(), 99, true)).unwrap();
        let reply = timeout(Duration::from_secs(5), replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::UnknownId);

        channel.send(request(server.dispatcher().self_address(), COMMAND, true)).unwrap();
        let reply = timeout(Duration::from_secs(5), replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::Ok);
        assert!(!channel.is_closed());
        assert_eq!(server.num_connections(), 1);

        assert!(server.shutdown().wait().await);
        timeout(Duration::from_secs(5), channel.closed()).await.unwrap();
        assert_eq!(server.num_connections(), 0);
        reservation.shutdown().wait().await;
    }

    #[tokio::test]
    async fn test_udp_request_reply() {
        let server = server().await;
        let reservation = client_reservation();
        let creator = reservation.create(1, 0).unwrap().await.unwrap();

        let (sink, mut replies) = MessageSink::new();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("sink", HandlerEntry::shared(sink)).unwrap();
        let channel = creator.create_udp(false, &pipeline).await.unwrap();

        let self_address = server.dispatcher().self_address();
        assert_eq!(self_address.udp_socket(), server.udp_local_addr());

        let mut request = request(self_address, COMMAND, false);
        request.set_udp(true);
        channel.send(request.clone()).unwrap();

        let reply = timeout(Duration::from_secs(5), replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::Ok);
        assert_eq!(reply.message_id(), request.message_id());
        assert_eq!(reply.integer(0), Some(42));
        assert!(reply.is_udp());

        assert!(reservation.shutdown().wait().await);
        timeout(Duration::from_secs(5), channel.closed()).await.unwrap();
        assert!(server.shutdown().wait().await);
    }

    #[tokio::test]
    async fn test_udp_server_survives_garbage() {
        let server = server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(b"definitely not a message", server.udp_local_addr()).await.unwrap();

        let reservation = client_reservation();
        let creator = reservation.create(1, 0).unwrap().await.unwrap();
        let (sink, mut replies) = MessageSink::new();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("sink", HandlerEntry::shared(sink)).unwrap();
        let channel = creator.create_udp(false, &pipeline).await.unwrap();

        channel.send(request(server.dispatcher().self_address(), COMMAND, false)).unwrap();
        let reply = timeout(Duration::from_secs(5), replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.integer(0), Some(42));

        reservation.shutdown().wait().await;
        server.shutdown().wait().await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let dispatcher = Arc::new(Dispatcher::new(server_address()));
        let config = ChannelServerConfig {
            max_incoming_tcp: 1,
            ..ChannelServerConfig::localhost()
        };
        let server = ChannelServer::start(config, dispatcher, None).await.unwrap();

        let _first = TcpStream::connect(server.tcp_local_addr()).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while server.num_active_connections() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();

        let mut second = TcpStream::connect(server.tcp_local_addr()).await.unwrap();
        let mut buf = Vec::new();
        let n = timeout(Duration::from_secs(5), second.read_to_end(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        assert_eq!(server.num_active_connections(), 1);

        server.shutdown().wait().await;
    }
}
