use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use crate::message::message::Message;
use crate::pipeline::handler::{HandlerContext, HandlerDirection, Payload, SharableHandler, UserEvent};

/// Closes a channel once it was idle for too long. The channel driver measures idle time and
///  fires [UserEvent::Idle]; this handler turns that into a timeout, which stops all further
///  processing.
pub struct IdleHandler;

impl SharableHandler for IdleHandler {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Inbound
    }

    fn user_event(&self, ctx: &mut HandlerContext, event: UserEvent) -> anyhow::Result<()> {
        match event {
            UserEvent::Idle(state) => {
                debug!("channel {} is idle ({:?}) - closing", ctx.channel_info().id, state);
                ctx.set_timed_out();
            }
            other => ctx.fire_user_event(other),
        }
        Ok(())
    }
}

/// Limits the number of concurrently open incoming connections: a connection exceeding the
///  limit is closed as soon as it becomes active
pub struct ConnectionLimiter {
    max_connections: usize,
    num_connections: AtomicUsize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> ConnectionLimiter {
        ConnectionLimiter {
            max_connections,
            num_connections: AtomicUsize::new(0),
        }
    }

    pub fn num_connections(&self) -> usize {
        self.num_connections.load(Ordering::Acquire)
    }
}

impl SharableHandler for ConnectionLimiter {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Inbound
    }

    fn channel_active(&self, ctx: &mut HandlerContext) -> anyhow::Result<()> {
        let num_connections = self.num_connections.fetch_add(1, Ordering::AcqRel) + 1;
        if num_connections > self.max_connections {
            warn!("{} incoming connections exceed the limit of {} - closing connection from {:?}", num_connections, self.max_connections, ctx.channel_info().remote_addr);
            ctx.close();
        }
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        self.num_connections.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Hands received messages to application code through a channel, typically at the tail of a
///  client pipeline to receive replies
pub struct MessageSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageSink {
    pub fn new() -> (MessageSink, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MessageSink { tx }, rx)
    }
}

impl SharableHandler for MessageSink {
    fn direction(&self) -> HandlerDirection {
        HandlerDirection::Inbound
    }

    fn read(&self, ctx: &mut HandlerContext, payload: Payload) -> anyhow::Result<()> {
        match payload {
            Payload::Message(message) => {
                if self.tx.send(*message).is_err() {
                    debug!("message receiver was dropped - discarding message");
                }
            }
            other => ctx.fire_read(other),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handler::IdleState;
    use crate::pipeline::pipeline::{HandlerEntry, Pipeline};
    use crate::test_util::channel_info;
    use std::sync::Arc;

    #[test]
    fn test_connection_limiter() {
        let limiter = Arc::new(ConnectionLimiter::new(2));
        let mut pipeline = Pipeline::new();
        pipeline.add_last("limiter", HandlerEntry::Shared(limiter.clone())).unwrap();

        let mut sessions: Vec<_> = (0..3).map(|_| pipeline.session(channel_info())).collect();
        for s in &mut sessions {
            s.channel_active();
        }
        assert_eq!(limiter.num_connections(), 3);
        assert!(!sessions[0].is_close_requested());
        assert!(!sessions[1].is_close_requested());
        assert!(sessions[2].is_close_requested());

        sessions[2].channel_inactive();
        sessions[0].channel_inactive();
        assert_eq!(limiter.num_connections(), 1);

        let mut s = pipeline.session(channel_info());
        s.channel_active();
        assert!(!s.is_close_requested());
    }

    #[test]
    fn test_idle_handler_passes_other_events() {
        let mut pipeline = Pipeline::new();
        pipeline.add_last("idle", HandlerEntry::shared(IdleHandler)).unwrap();
        let mut session = pipeline.session(channel_info());

        session.fire_user_event(UserEvent::Custom(Arc::new(1u32)));
        assert!(!session.is_timed_out());

        session.fire_user_event(UserEvent::Idle(IdleState::AllIdle));
        assert!(session.is_timed_out());
        assert!(session.is_close_requested());
    }

    #[test]
    fn test_message_sink() {
        let (sink, mut rx) = MessageSink::new();
        let mut pipeline = Pipeline::new();
        pipeline.add_last("sink", HandlerEntry::shared(sink)).unwrap();
        let mut session = pipeline.session(channel_info());

        let mut message = Message::new();
        message.set_message_id(3);
        session.fire_read(Payload::Message(Box::new(message)));
        assert_eq!(rx.try_recv().unwrap().message_id(), 3);
    }
}
