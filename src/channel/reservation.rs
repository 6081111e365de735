use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use anyhow::Context as _;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;
use crate::channel::channel_creator::ChannelCreator;
use crate::channel::filter::ChannelFilter;
use crate::config::ChannelClientConfig;
use crate::error::{PermitKind, TransportError, TransportResult};
use crate::util::completion::{completion, Completion, CompletionSignal};
use crate::util::safe_converter::PrecheckedCast;

/// The eventual result of a request for a [ChannelCreator]. This is always resolved eventually:
///  with the creator once its permits are acquired, or with an error if the reservation shuts
///  down first.
pub struct FutureChannelCreator {
    rx: oneshot::Receiver<TransportResult<Arc<ChannelCreator>>>,
}

impl FutureChannelCreator {
    fn failed(error: TransportError) -> FutureChannelCreator {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        FutureChannelCreator { rx }
    }
}

impl Future for FutureChannelCreator {
    type Output = TransportResult<Arc<ChannelCreator>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx)
            .map(|result| result.unwrap_or(Err(TransportError::ShuttingDown("reservation"))))
    }
}

struct CreatorRequest {
    permits_udp: usize,
    permits_tcp: usize,
    permanent: bool,
    reply: oneshot::Sender<TransportResult<Arc<ChannelCreator>>>,
}

struct ReservationInner {
    config: Arc<ChannelClientConfig>,
    filter: Arc<dyn ChannelFilter>,

    semaphore_udp: Arc<Semaphore>,
    semaphore_tcp: Arc<Semaphore>,
    semaphore_permanent_tcp: Arc<Semaphore>,

    /// the flag is checked and set under this lock, so no creator is registered after shutdown
    ///  took its snapshot
    live_creators: Mutex<FxHashMap<Uuid, Arc<ChannelCreator>>>,
    is_shutdown: AtomicBool,
    /// wakes up a request that is waiting for permits
    shutdown_notification: watch::Sender<bool>,

    shutdown_started: AtomicBool,
    shutdown_signal: CompletionSignal,
    shutdown_completion: Completion,
}

/// The admission control for outbound channels. A reservation owns the process-wide permit pools
///  for short-lived UDP, short-lived TCP and permanent TCP channels, and hands out
///  [ChannelCreator]s with a share of them. A creator's permits return to the pools when the
///  creator shuts down, whichever way its channels ended.
///
/// Requests are admitted strictly one after the other by a dedicated task, each acquiring its UDP
///  permits before its TCP permits. Two requests can therefore never each hold part of what the
///  other one waits for, at the price of a request waiting for permits holding up the requests
///  behind it.
pub struct Reservation {
    inner: Arc<ReservationInner>,
    requests: mpsc::UnboundedSender<CreatorRequest>,
}

impl Reservation {
    /// Validates the configuration and spawns the request worker on the current tokio runtime.
    ///  Fails outside a runtime.
    pub fn new(config: ChannelClientConfig, filter: Arc<dyn ChannelFilter>) -> anyhow::Result<Reservation> {
        config.validate()?;
        let runtime = Handle::try_current()
            .context("a reservation must be created inside a tokio runtime")?;

        let (shutdown_signal, shutdown_completion) = completion();
        let inner = Arc::new(ReservationInner {
            semaphore_udp: Arc::new(Semaphore::new(config.max_permits_udp)),
            semaphore_tcp: Arc::new(Semaphore::new(config.max_permits_tcp)),
            semaphore_permanent_tcp: Arc::new(Semaphore::new(config.max_permits_permanent_tcp)),
            config: Arc::new(config),
            filter,
            live_creators: Default::default(),
            is_shutdown: AtomicBool::new(false),
            shutdown_notification: watch::channel(false).0,
            shutdown_started: AtomicBool::new(false),
            shutdown_signal,
            shutdown_completion,
        });

        let (requests, rx) = mpsc::unbounded_channel();
        let span = span!(Level::DEBUG, "reservation");
        runtime.spawn(inner.clone().run_worker(rx).instrument(span));

        Ok(Reservation {
            inner,
            requests,
        })
    }

    pub fn config(&self) -> &ChannelClientConfig {
        &self.inner.config
    }

    /// Request a creator for up to `permits_udp` concurrent UDP channels and up to `permits_tcp`
    ///  concurrent short-lived TCP channels.
    ///
    /// Asking for more than the configured maximum can never succeed and fails right away with
    ///  [TransportError::ResourceExhausted]. Otherwise the returned future resolves once the
    ///  permits are available.
    pub fn create(&self, permits_udp: usize, permits_tcp: usize) -> TransportResult<FutureChannelCreator> {
        check_max(PermitKind::Udp, permits_udp, self.inner.config.max_permits_udp)?;
        check_max(PermitKind::Tcp, permits_tcp, self.inner.config.max_permits_tcp)?;
        Ok(self.submit(permits_udp, permits_tcp, false))
    }

    /// Request a creator for up to `permits` permanent TCP connections. Permanent connections are
    ///  not closed when idle, and they draw from a pool of their own.
    pub fn create_permanent(&self, permits: usize) -> TransportResult<FutureChannelCreator> {
        check_max(PermitKind::PermanentTcp, permits, self.inner.config.max_permits_permanent_tcp)?;
        Ok(self.submit(0, permits, true))
    }

    fn submit(&self, permits_udp: usize, permits_tcp: usize, permanent: bool) -> FutureChannelCreator {
        if self.inner.is_shutdown.load(Ordering::Acquire) {
            debug!("reservation is shut down - rejecting request");
            return FutureChannelCreator::failed(TransportError::ShuttingDown("reservation"));
        }

        let (tx, rx) = oneshot::channel();
        let request = CreatorRequest {
            permits_udp,
            permits_tcp,
            permanent,
            reply: tx,
        };
        if self.requests.send(request).is_err() {
            return FutureChannelCreator::failed(TransportError::ShuttingDown("reservation"));
        }
        FutureChannelCreator { rx }
    }

    pub fn available_permits_udp(&self) -> usize {
        self.inner.semaphore_udp.available_permits()
    }

    pub fn available_permits_tcp(&self) -> usize {
        self.inner.semaphore_tcp.available_permits()
    }

    pub fn available_permits_permanent_tcp(&self) -> usize {
        self.inner.semaphore_permanent_tcp.available_permits()
    }

    pub fn live_creators(&self) -> usize {
        self.inner.live_creators.lock().unwrap().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Acquire)
    }

    /// Shut down all live creators and reject new requests. The returned completion fires when
    ///  all creators are shut down and every permit is back in its pool. Repeated calls return
    ///  the same completion.
    pub fn shutdown(&self) -> Completion {
        if self.inner.shutdown_started.swap(true, Ordering::AcqRel) {
            return self.inner.shutdown_completion.clone();
        }

        let span = span!(Level::DEBUG, "reservation_shutdown");
        tokio::spawn(self.inner.clone().do_shutdown().instrument(span));
        self.inner.shutdown_completion.clone()
    }
}

fn check_max(kind: PermitKind, requested: usize, max: usize) -> TransportResult<()> {
    if requested > max {
        debug!("requested {} {} permits, but the maximum is {}", requested, kind, max);
        return Err(TransportError::ResourceExhausted { kind, requested, max });
    }
    Ok(())
}

impl ReservationInner {
    async fn run_worker(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<CreatorRequest>) {
        let mut shutdown_rx = self.shutdown_notification.subscribe();

        while let Some(request) = requests.recv().await {
            let correlation_id = Uuid::new_v4();
            let result = self.admit(&request, &mut shutdown_rx)
                .instrument(span!(Level::TRACE, "admit", ?correlation_id))
                .await;

            if let Err(Ok(creator)) = request.reply.send(result) {
                debug!("requester of channel creator {} went away - shutting it down", creator.id());
                creator.shutdown();
            }
        }
        trace!("reservation dropped - request worker terminates");
    }

    async fn admit(self: &Arc<Self>, request: &CreatorRequest, shutdown_rx: &mut watch::Receiver<bool>) -> TransportResult<Arc<ChannelCreator>> {
        let semaphore_tcp = if request.permanent {
            &self.semaphore_permanent_tcp
        }
        else {
            &self.semaphore_tcp
        };

        trace!("acquiring {} UDP and {} TCP permits", request.permits_udp, request.permits_tcp);
        let udp = acquire(&self.semaphore_udp, request.permits_udp, shutdown_rx).await?;
        // on failure, the UDP permits are rolled back by dropping them
        let tcp = acquire(semaphore_tcp, request.permits_tcp, shutdown_rx).await?;

        let creator = ChannelCreator::new(request.permits_udp, request.permits_tcp, request.permanent, self.config.clone(), self.filter.clone());
        {
            let mut live_creators = self.live_creators.lock().unwrap();
            if self.is_shutdown.load(Ordering::Acquire) {
                return Err(TransportError::ShuttingDown("reservation"));
            }
            live_creators.insert(creator.id(), creator.clone());
        }
        debug!("created channel creator {} with {} UDP and {} TCP permits", creator.id(), request.permits_udp, request.permits_tcp);

        tokio::spawn(self.clone().release_after_shutdown(creator.clone(), udp, tcp));
        Ok(creator)
    }

    /// Return a creator's permits once it is shut down, regardless of how its channels ended
    async fn release_after_shutdown(self: Arc<Self>, creator: Arc<ChannelCreator>, udp: OwnedSemaphorePermit, tcp: OwnedSemaphorePermit) {
        creator.shutdown_completion().wait().await;
        self.live_creators.lock().unwrap().remove(&creator.id());
        trace!("channel creator {} is shut down - releasing {} UDP and {} TCP permits", creator.id(), udp.num_permits(), tcp.num_permits());
        drop(udp);
        drop(tcp);
    }

    async fn do_shutdown(self: Arc<Self>) {
        let creators: Vec<Arc<ChannelCreator>> = {
            let live_creators = self.live_creators.lock().unwrap();
            self.is_shutdown.store(true, Ordering::Release);
            live_creators.values().cloned().collect()
        };
        self.shutdown_notification.send_replace(true);
        info!("shutting down reservation with {} live channel creators", creators.len());

        let (all_shut_down_signal, all_shut_down) = completion();
        let remaining = Arc::new(AtomicUsize::new(creators.len()));
        if creators.is_empty() {
            all_shut_down_signal.complete();
        }
        for creator in creators {
            let creator_completion = creator.shutdown();
            let remaining = remaining.clone();
            let all_shut_down_signal = all_shut_down_signal.clone();
            tokio::spawn(async move {
                creator_completion.wait().await;
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    all_shut_down_signal.complete();
                }
            });
        }
        drop(all_shut_down_signal);
        all_shut_down.wait().await;

        // all permits back in the pools proves that nothing is outstanding
        let config = &self.config;
        let udp = self.semaphore_udp.acquire_many(config.max_permits_udp.prechecked_cast()).await;
        let tcp = self.semaphore_tcp.acquire_many(config.max_permits_tcp.prechecked_cast()).await;
        let permanent_tcp = self.semaphore_permanent_tcp.acquire_many(config.max_permits_permanent_tcp.prechecked_cast()).await;
        if udp.is_err() || tcp.is_err() || permanent_tcp.is_err() {
            error!("semaphore closed during shutdown - this is a bug");
        }
        drop((udp, tcp, permanent_tcp));

        info!("reservation is shut down");
        self.shutdown_signal.complete();
    }
}

async fn acquire(semaphore: &Arc<Semaphore>, permits: usize, shutdown_rx: &mut watch::Receiver<bool>) -> TransportResult<OwnedSemaphorePermit> {
    select! {
        biased;
        _ = shutdown_rx.wait_for(|is_shutdown| *is_shutdown) => {
            debug!("reservation shut down while waiting for permits");
            Err(TransportError::ShuttingDown("reservation"))
        }
        permit = semaphore.clone().acquire_many_owned(permits.prechecked_cast()) => {
            permit.map_err(|_| TransportError::ShuttingDown("reservation"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::filter::MockChannelFilter;
    use crate::pipeline::pipeline::Pipeline;
    use rand::Rng;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    fn filter() -> Arc<dyn ChannelFilter> {
        let mut filter = MockChannelFilter::new();
        filter.expect_filter().returning(|_, _, _| Ok(()));
        Arc::new(filter)
    }

    fn reservation(max_udp: usize, max_tcp: usize, max_permanent_tcp: usize) -> Reservation {
        Reservation::new(ChannelClientConfig::localhost(max_udp, max_tcp, max_permanent_tcp), filter()).unwrap()
    }

    #[test]
    fn test_new_outside_runtime() {
        assert!(Reservation::new(ChannelClientConfig::localhost(1, 1, 1), filter()).is_err());
    }

    #[tokio::test]
    async fn test_new_rejects_permits_beyond_u32() {
        assert!(Reservation::new(ChannelClientConfig::localhost(u32::MAX as usize + 1, 1, 1), filter()).is_err());
        assert!(Reservation::new(ChannelClientConfig::localhost(1, 1, u32::MAX as usize + 1), filter()).is_err());
    }

    /// permits are released by a background task after the creator's shutdown
    async fn assert_permits_eventually(reservation: &Reservation, udp: usize, tcp: usize, permanent_tcp: usize) {
        timeout(Duration::from_secs(5), async {
            while reservation.available_permits_udp() != udp
                || reservation.available_permits_tcp() != tcp
                || reservation.available_permits_permanent_tcp() != permanent_tcp
            {
                sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_permits_are_released_after_creator_shutdown() {
        let reservation = reservation(3, 3, 1);
        let creator = reservation.create(2, 1).unwrap().await.unwrap();
        assert_eq!(reservation.available_permits_udp(), 1);
        assert_eq!(reservation.available_permits_tcp(), 2);
        assert_eq!(reservation.live_creators(), 1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _channel = creator.create_tcp(listener.local_addr().unwrap(), Some(Duration::from_secs(1)), &Pipeline::new()).await.unwrap();

        assert!(creator.shutdown().wait().await);
        assert_permits_eventually(&reservation, 3, 3, 1).await;
        assert_eq!(reservation.live_creators(), 0);
    }

    #[tokio::test]
    async fn test_permits_are_released_after_failed_connect() {
        let reservation = reservation(3, 3, 1);
        let creator = reservation.create(1, 1).unwrap().await.unwrap();

        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        assert!(creator.create_tcp(closed_port, Some(Duration::from_secs(1)), &Pipeline::new()).await.is_err());

        assert!(creator.shutdown().wait().await);
        assert_permits_eventually(&reservation, 3, 3, 1).await;
    }

    #[tokio::test]
    async fn test_permanent_creator() {
        let reservation = reservation(1, 1, 2);
        let creator = reservation.create_permanent(2).unwrap().await.unwrap();
        assert!(creator.is_permanent());
        assert_eq!(creator.max_permits_udp(), 0);
        assert_eq!(reservation.available_permits_permanent_tcp(), 0);
        assert_eq!(reservation.available_permits_tcp(), 1);

        creator.shutdown().wait().await;
        assert_permits_eventually(&reservation, 1, 1, 2).await;
    }

    #[rstest::rstest]
    #[case::udp(3, 0, PermitKind::Udp)]
    #[case::tcp(0, 3, PermitKind::Tcp)]
    #[tokio::test]
    async fn test_exceeding_the_maximum_fails_synchronously(#[case] udp: usize, #[case] tcp: usize, #[case] expected_kind: PermitKind) {
        let mut filter = MockChannelFilter::new();
        filter.expect_filter().never();
        let reservation = Reservation::new(ChannelClientConfig::localhost(2, 2, 2), Arc::new(filter)).unwrap();

        match reservation.create(udp, tcp) {
            Err(TransportError::ResourceExhausted { kind, requested: 3, max: 2 }) => assert_eq!(kind, expected_kind),
            _ => panic!("expected ResourceExhausted"),
        }
        assert!(matches!(reservation.create_permanent(3), Err(TransportError::ResourceExhausted { kind: PermitKind::PermanentTcp, .. })));

        assert_eq!(reservation.live_creators(), 0);
        assert_eq!(reservation.available_permits_udp(), 2);
        assert_eq!(reservation.available_permits_tcp(), 2);
    }

    #[tokio::test]
    async fn test_third_request_waits_for_a_shutdown() {
        let reservation = reservation(2, 2, 0);

        let (first, second) = tokio::join!(
            reservation.create(1, 1).unwrap(),
            reservation.create(1, 1).unwrap(),
        );
        let first = first.unwrap();
        let _second = second.unwrap();

        let mut third = reservation.create(1, 1).unwrap();
        assert!(timeout(Duration::from_millis(100), &mut third).await.is_err());

        first.shutdown().wait().await;
        let third = timeout(Duration::from_secs(5), third).await.unwrap().unwrap();
        assert_eq!(third.max_permits_udp(), 1);
        assert_eq!(reservation.live_creators(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_live_creator() {
        let reservation = reservation(2, 2, 1);
        let creator = reservation.create(1, 2).unwrap().await.unwrap();

        let completion = reservation.shutdown();
        assert!(timeout(Duration::from_secs(5), completion.wait()).await.unwrap());
        assert!(creator.shutdown_completion().is_complete());
        assert_eq!(reservation.available_permits_udp(), 2);
        assert_eq!(reservation.available_permits_tcp(), 2);
        assert_eq!(reservation.available_permits_permanent_tcp(), 1);
        assert!(reservation.shutdown().is_complete());
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiting_and_new_requests() {
        let reservation = reservation(1, 1, 0);
        let _creator = reservation.create(1, 1).unwrap().await.unwrap();

        let waiting = reservation.create(1, 1).unwrap();
        let completion = reservation.shutdown();
        assert!(matches!(waiting.await, Err(TransportError::ShuttingDown(_))));

        assert!(completion.wait().await);
        assert!(reservation.is_shutdown());
        assert!(matches!(reservation.create(1, 0).unwrap().await, Err(TransportError::ShuttingDown(_))));
        assert_eq!(reservation.available_permits_udp(), 1);
        assert_eq!(reservation.available_permits_tcp(), 1);
    }

    #[tokio::test]
    async fn test_dropped_request_does_not_leak_permits() {
        let reservation = reservation(1, 1, 0);
        drop(reservation.create(1, 1).unwrap());
        assert_permits_eventually(&reservation, 1, 1, 0).await;
        assert_eq!(reservation.live_creators(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_do_not_deadlock() {
        let reservation = Arc::new(reservation(3, 3, 0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let reservation = reservation.clone();
                tokio::spawn(async move {
                    let (udp, tcp, hold_millis) = {
                        let mut rng = rand::thread_rng();
                        (rng.gen_range(0..=3), rng.gen_range(0..=3), rng.gen_range(0..5))
                    };
                    let creator = reservation.create(udp, tcp).unwrap().await.unwrap();
                    sleep(Duration::from_millis(hold_millis)).await;
                    creator.shutdown().wait().await;
                })
            })
            .collect();

        timeout(Duration::from_secs(30), async {
            for task in tasks {
                task.await.unwrap();
            }
        }).await.unwrap();

        assert_permits_eventually(&reservation, 3, 3, 0).await;
        assert_eq!(reservation.live_creators(), 0);
    }
}
