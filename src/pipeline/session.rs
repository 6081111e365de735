use std::collections::VecDeque;
use anyhow::anyhow;
use tracing::{debug, trace, warn};
use crate::channel::channel::Channel;
use crate::pipeline::handler::{ChannelHandler, ChannelInfo, Event, HandlerContext, Outbound, Payload, SessionState, UserEvent};

/// One channel's instance of a [crate::pipeline::pipeline::Pipeline]: the handler instances plus
///  all traversal state. A session is owned by exactly one channel and never shared.
///
/// Events are processed to completion before an entry point returns: forwarding from a handler
///  enqueues the follow-up event, and the session keeps delivering until the queue is empty.
///  Encoded data that reaches the head is collected in an outbox for the channel to flush.
///
/// Once a handler fails, the error is kept, the remaining handlers in that direction are
///  notified through `exception_caught()`, close is requested and no further reads or writes
///  are processed. The same happens for reads and writes after a timeout.
pub struct PipelineSession {
    names: Vec<String>,
    handlers: Vec<Box<dyn ChannelHandler>>,
    events: VecDeque<Event>,
    state: SessionState,
    /// the inbound handler invoked last
    inbound_cursor: Option<usize>,
    /// the outbound handler invoked last
    outbound_cursor: Option<usize>,
}

impl PipelineSession {
    pub(crate) fn new(handlers: Vec<(String, Box<dyn ChannelHandler>)>, info: ChannelInfo) -> PipelineSession {
        let (names, handlers) = handlers.into_iter().unzip();
        PipelineSession {
            names,
            handlers,
            events: VecDeque::new(),
            state: SessionState {
                info,
                channel: None,
                exception: None,
                timed_out: false,
                close_requested: false,
                outbox: VecDeque::new(),
            },
            inbound_cursor: None,
            outbound_cursor: None,
        }
    }

    pub(crate) fn attach(&mut self, channel: Channel) {
        self.state.channel = Some(channel);
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.state.info
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn inbound_cursor(&self) -> Option<usize> {
        self.inbound_cursor
    }

    pub fn outbound_cursor(&self) -> Option<usize> {
        self.outbound_cursor
    }

    pub fn exception(&self) -> Option<&anyhow::Error> {
        self.state.exception.as_ref()
    }

    pub fn is_timed_out(&self) -> bool {
        self.state.timed_out
    }

    pub fn is_close_requested(&self) -> bool {
        self.state.close_requested
    }

    pub fn request_close(&mut self) {
        self.state.close_requested = true;
    }

    /// take encoded data that is ready to be written to the socket
    pub fn drain_outbox(&mut self) -> impl Iterator<Item = Outbound> + '_ {
        self.state.outbox.drain(..)
    }

    pub fn has_outbound(&self) -> bool {
        !self.state.outbox.is_empty()
    }

    pub fn channel_active(&mut self) {
        self.lifecycle("channel_active", |handler, ctx| handler.channel_active(ctx));
    }

    pub fn channel_inactive(&mut self) {
        self.lifecycle("channel_inactive", |handler, ctx| handler.channel_inactive(ctx));
    }

    /// data arrived from the socket
    pub fn fire_read(&mut self, payload: Payload) {
        self.inbound_cursor = None;
        self.events.push_back(Event::Read { from: 0, payload });
        self.run();
    }

    /// write through all outbound handlers, starting at the tail
    pub fn write(&mut self, payload: Payload) {
        self.outbound_cursor = None;
        self.events.push_back(Event::Write { before: usize::MAX, payload });
        self.run();
    }

    pub fn fire_user_event(&mut self, event: UserEvent) {
        self.events.push_back(Event::UserEvent { from: 0, event });
        self.run();
    }

    /// an error outside of the handlers, e.g. from the socket. All inbound handlers are notified.
    pub fn fire_exception(&mut self, error: anyhow::Error) {
        self.handle_exception(None, true, error);
    }

    fn lifecycle(&mut self, hook: &str, f: impl Fn(&mut Box<dyn ChannelHandler>, &mut HandlerContext) -> anyhow::Result<()>) {
        for idx in 0..self.handlers.len() {
            let mut ctx = HandlerContext {
                position: idx,
                name: &self.names[idx],
                events: &mut self.events,
                state: &mut self.state,
            };
            if let Err(e) = f(&mut self.handlers[idx], &mut ctx) {
                debug!("{} failed in handler {}: {}", hook, self.names[idx], e);
                self.handle_exception(Some(idx), true, e);
            }
        }
        self.run();
    }

    fn is_blocked(&self) -> bool {
        self.state.timed_out || self.state.exception.is_some()
    }

    fn next_inbound(&self, from: usize) -> Option<usize> {
        (from..self.handlers.len())
            .find(|&idx| self.handlers[idx].direction().is_inbound())
    }

    fn next_outbound(&self, before: usize) -> Option<usize> {
        (0..before.min(self.handlers.len()))
            .rev()
            .find(|&idx| self.handlers[idx].direction().is_outbound())
    }

    fn run(&mut self) {
        while let Some(event) = self.events.pop_front() {
            match event {
                Event::Read { from, payload } => {
                    if self.is_blocked() {
                        trace!("dropping {:?} on channel {}", payload, self.state.info.id);
                        continue;
                    }
                    let Some(idx) = self.next_inbound(from) else {
                        trace!("{:?} reached the tail of the pipeline unhandled", payload);
                        continue;
                    };
                    self.inbound_cursor = Some(idx);
                    let result = self.invoke(idx, |handler, ctx| handler.read(ctx, payload));
                    if let Err(e) = result {
                        self.handle_exception(Some(idx), true, e);
                    }
                }
                Event::Write { before, payload } => {
                    if self.is_blocked() {
                        trace!("dropping {:?} on channel {}", payload, self.state.info.id);
                        continue;
                    }
                    let Some(idx) = self.next_outbound(before) else {
                        self.reached_head(payload);
                        continue;
                    };
                    self.outbound_cursor = Some(idx);
                    let result = self.invoke(idx, |handler, ctx| handler.write(ctx, payload));
                    if let Err(e) = result {
                        self.handle_exception(Some(idx), false, e);
                    }
                }
                Event::UserEvent { from, event } => {
                    let Some(idx) = self.next_inbound(from) else {
                        continue;
                    };
                    let result = self.invoke(idx, |handler, ctx| handler.user_event(ctx, event));
                    if let Err(e) = result {
                        self.handle_exception(Some(idx), true, e);
                    }
                }
            }
        }
    }

    fn invoke<R>(&mut self, idx: usize, f: impl FnOnce(&mut Box<dyn ChannelHandler>, &mut HandlerContext) -> R) -> R {
        let mut ctx = HandlerContext {
            position: idx,
            name: &self.names[idx],
            events: &mut self.events,
            state: &mut self.state,
        };
        f(&mut self.handlers[idx], &mut ctx)
    }

    fn reached_head(&mut self, payload: Payload) {
        match payload {
            Payload::Bytes { data, remote } => {
                self.state.outbox.push_back(Outbound { data, to: remote });
            }
            Payload::Message(message) => {
                let error = anyhow!("message {} reached the head of the pipeline without being encoded", message.message_id());
                self.handle_exception(None, false, error);
            }
        }
    }

    /// Keep the (first) error and notify the handlers after `failed` in the given direction -
    ///  all handlers in that direction if the error did not originate in a handler.
    fn handle_exception(&mut self, failed: Option<usize>, inbound: bool, error: anyhow::Error) {
        warn!("exception in pipeline of channel {}{}: {}",
            self.state.info.id,
            failed.map(|idx| format!(" (handler {})", self.names[idx])).unwrap_or_default(),
            error);

        let remaining: Vec<usize> = if inbound {
            let start = failed.map(|idx| idx + 1).unwrap_or(0);
            (start..self.handlers.len())
                .filter(|&idx| self.handlers[idx].direction().is_inbound())
                .collect()
        }
        else {
            let end = failed.unwrap_or(self.handlers.len());
            (0..end).rev()
                .filter(|&idx| self.handlers[idx].direction().is_outbound())
                .collect()
        };

        for idx in remaining {
            self.invoke(idx, |handler, ctx| handler.exception_caught(ctx, &error));
        }

        self.state.close_requested = true;
        if self.state.exception.is_none() {
            self.state.exception = Some(error);
        }
    }
}
