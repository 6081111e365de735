use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, span, trace, Instrument, Level};
use uuid::Uuid;
use crate::channel::channel::{tcp_channel, udp_channel, Channel, DriverConfig, OnClose};
use crate::channel::filter::ChannelFilter;
use crate::config::ChannelClientConfig;
use crate::error::{PermitKind, TransportError, TransportResult};
use crate::pipeline::handler::ChannelKind;
use crate::pipeline::pipeline::Pipeline;
use crate::util::completion::{completion, Completion, CompletionSignal};
use crate::util::safe_converter::PrecheckedCast;

/// Creates outbound channels within a fixed budget of UDP and TCP channels that exist at the same
///  time. The budget was reserved from a [crate::channel::reservation::Reservation], so exceeding
///  it is a bug in the calling code rather than contention, and it is reported as
///  [TransportError::ReservationExceeded].
///
/// Every channel holds one permit of the creator's local semaphores, which the channel gives back
///  when it closes. Creating channels is concurrent; [ChannelCreator::shutdown] waits for ongoing
///  creations, closes all channels and completes once all permits are back.
pub struct ChannelCreator {
    id: Uuid,
    permanent: bool,
    max_permits_udp: usize,
    max_permits_tcp: usize,
    semaphore_udp: Arc<Semaphore>,
    semaphore_tcp: Arc<Semaphore>,

    /// read: creating a channel, write: starting shutdown
    lifecycle_lock: RwLock<()>,
    shutdown_udp: AtomicBool,
    shutdown_tcp: AtomicBool,
    shutdown_started: AtomicBool,
    shutdown_signal: CompletionSignal,
    shutdown_completion: Completion,

    channels: Arc<Mutex<FxHashMap<Uuid, Channel>>>,
    filter: Arc<dyn ChannelFilter>,
    config: Arc<ChannelClientConfig>,
}

impl ChannelCreator {
    pub(crate) fn new(max_permits_udp: usize, max_permits_tcp: usize, permanent: bool, config: Arc<ChannelClientConfig>, filter: Arc<dyn ChannelFilter>) -> Arc<ChannelCreator> {
        let (shutdown_signal, shutdown_completion) = completion();
        Arc::new(ChannelCreator {
            id: Uuid::new_v4(),
            permanent,
            max_permits_udp,
            max_permits_tcp,
            semaphore_udp: Arc::new(Semaphore::new(max_permits_udp)),
            semaphore_tcp: Arc::new(Semaphore::new(max_permits_tcp)),
            lifecycle_lock: RwLock::new(()),
            shutdown_udp: AtomicBool::new(false),
            shutdown_tcp: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            shutdown_signal,
            shutdown_completion,
            channels: Default::default(),
            filter,
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// creators for permanent connections do not close their channels when they are idle
    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn max_permits_udp(&self) -> usize {
        self.max_permits_udp
    }

    pub fn max_permits_tcp(&self) -> usize {
        self.max_permits_tcp
    }

    pub fn available_permits_udp(&self) -> usize {
        self.semaphore_udp.available_permits()
    }

    pub fn available_permits_tcp(&self) -> usize {
        self.semaphore_tcp.available_permits()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_udp.load(Ordering::Acquire) && self.shutdown_tcp.load(Ordering::Acquire)
    }

    /// completes when a shutdown that was started before (or later) has finished
    pub fn shutdown_completion(&self) -> Completion {
        self.shutdown_completion.clone()
    }

    fn try_acquire(&self, kind: PermitKind, semaphore: &Arc<Semaphore>, shutdown_flag: &AtomicBool, max_permits: usize) -> TransportResult<OwnedSemaphorePermit> {
        if shutdown_flag.load(Ordering::Acquire) {
            debug!("channel creator {} is shut down - not creating a {} channel", self.id, kind);
            return Err(TransportError::ShuttingDown("channel creator"));
        }
        semaphore.clone().try_acquire_owned()
            .map_err(|_| {
                error!("channel creator {} has no {} permits left: the caller created more channels than it reserved", self.id, kind);
                TransportError::ReservationExceeded { kind, permits: max_permits }
            })
    }

    fn on_close(&self, permit: OwnedSemaphorePermit) -> OnClose {
        let channels = self.channels.clone();
        Box::new(move |channel_id| {
            channels.lock().unwrap().remove(&channel_id);
            drop(permit);
        })
    }

    fn driver_config(&self, idle_timeout: Duration) -> DriverConfig {
        DriverConfig {
            idle_timeout: (!self.permanent).then_some(idle_timeout),
            receive_buffer_size: self.config.receive_buffer_size,
            udp_size_ceiling: self.config.udp_size_ceiling,
        }
    }

    fn connect_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.config.connect_timeout)
    }

    fn register(&self, channel: &Channel) {
        self.channels.lock().unwrap().insert(channel.id(), channel.clone());
    }

    /// Create a UDP channel bound to an ephemeral port. Its pipeline is `pipeline` as completed
    ///  by the creator's [ChannelFilter].
    pub async fn create_udp(&self, broadcast: bool, pipeline: &Pipeline) -> TransportResult<Channel> {
        let _lifecycle = self.lifecycle_lock.read().await;
        let permit = self.try_acquire(PermitKind::Udp, &self.semaphore_udp, &self.shutdown_udp, self.max_permits_udp)?;

        let socket = UdpSocket::bind(SocketAddr::new(self.config.bind_ip, 0)).await
            .map_err(|e| TransportError::creation_failed(None, e))?;
        socket.set_broadcast(broadcast)
            .map_err(|e| TransportError::creation_failed(None, e))?;

        let mut pipeline = pipeline.clone();
        self.filter.filter(&mut pipeline, ChannelKind::Udp, true)?;

        let (channel, driver) = udp_channel(socket, &pipeline, true, self.driver_config(self.config.idle_udp), Some(self.on_close(permit)))
            .map_err(|e| TransportError::creation_failed(None, e))?;
        self.register(&channel);
        driver.spawn();

        trace!("created UDP channel {} on {}", channel.id(), channel.local_addr());
        Ok(channel)
    }

    /// Connect a TCP channel to `remote`, failing if the connection is not established within
    ///  `connect_timeout`, or within the configured connect timeout if that is `None`
    pub async fn create_tcp(&self, remote: SocketAddr, connect_timeout: Option<Duration>, pipeline: &Pipeline) -> TransportResult<Channel> {
        let _lifecycle = self.lifecycle_lock.read().await;
        let permit = self.try_acquire(PermitKind::Tcp, &self.semaphore_tcp, &self.shutdown_tcp, self.max_permits_tcp)?;

        let connect_timeout = self.connect_timeout(connect_timeout);
        let stream = match tokio::time::timeout(connect_timeout, connect(self.config.bind_ip, remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("failed to connect to {}: {}", remote, e);
                return Err(TransportError::creation_failed(Some(remote), e));
            }
            Err(_) => {
                debug!("timeout connecting to {}", remote);
                return Err(TransportError::creation_failed(Some(remote), std::io::Error::new(ErrorKind::TimedOut, format!("no connection after {:?}", connect_timeout))));
            }
        };
        stream.set_nodelay(true)
            .map_err(|e| TransportError::creation_failed(Some(remote), e))?;

        let mut pipeline = pipeline.clone();
        self.filter.filter(&mut pipeline, ChannelKind::Tcp, true)?;

        let (channel, driver) = tcp_channel(stream, &pipeline, true, self.driver_config(self.config.idle_tcp), Some(self.on_close(permit)))
            .map_err(|e| TransportError::creation_failed(Some(remote), e))?;
        self.register(&channel);
        driver.spawn();

        trace!("created TCP channel {} to {}", channel.id(), remote);
        Ok(channel)
    }

    /// Start shutting down: no more channels are created, open channels are closed. The returned
    ///  completion fires after all channels released their permits. Calling this repeatedly
    ///  returns the same completion.
    pub fn shutdown(self: &Arc<Self>) -> Completion {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return self.shutdown_completion.clone();
        }

        let creator = self.clone();
        let span = span!(Level::DEBUG, "channel_creator_shutdown", id = %self.id);
        tokio::spawn(async move {
            {
                let _lifecycle = creator.lifecycle_lock.write().await;
                creator.shutdown_udp.store(true, Ordering::Release);
                creator.shutdown_tcp.store(true, Ordering::Release);
            }

            let channels: Vec<Channel> = creator.channels.lock().unwrap()
                .values()
                .cloned()
                .collect();
            debug!("closing {} channels", channels.len());
            for channel in &channels {
                channel.close();
            }

            // all permits back means all channels are gone
            let udp = creator.semaphore_udp.acquire_many(creator.max_permits_udp.prechecked_cast()).await;
            let tcp = creator.semaphore_tcp.acquire_many(creator.max_permits_tcp.prechecked_cast()).await;
            if udp.is_err() || tcp.is_err() {
                error!("semaphore closed during shutdown - this is a bug");
            }

            debug!("channel creator is shut down");
            creator.shutdown_signal.complete();
        }.instrument(span));

        self.shutdown_completion.clone()
    }
}

async fn connect(bind_ip: IpAddr, remote: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    }
    else {
        TcpSocket::new_v6()?
    };
    if !bind_ip.is_unspecified() && bind_ip.is_ipv4() == remote.is_ipv4() {
        socket.bind(SocketAddr::new(bind_ip, 0))?;
    }
    socket.connect(remote).await
}
