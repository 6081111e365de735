//! A chain of named handlers that inbound data travels through from head to tail, and
//!  outbound data from tail to head.
//!
//! The chain itself ([pipeline::Pipeline]) is a template that can be shared between any number
//!  of channels. Each channel instantiates it as a [session::PipelineSession], which owns the
//!  handler instances and all traversal state. Handlers never call each other directly:
//!  forwarding enqueues an event on the session, and the session delivers events one at a time.

pub mod handler;
pub mod pipeline;
pub mod session;
