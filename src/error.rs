use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

/// The kind of permit pool a request refers to
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PermitKind {
    Udp,
    Tcp,
    PermanentTcp,
}
impl Display for PermitKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PermitKind::Udp => write!(f, "UDP"),
            PermitKind::Tcp => write!(f, "TCP"),
            PermitKind::PermanentTcp => write!(f, "permanent TCP"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A request asked for more permits than are configured in total. This is raised
    ///  synchronously, before any background work is scheduled.
    #[error("requested {requested} {kind} permits, but only {max} are configured")]
    ResourceExhausted {
        kind: PermitKind,
        requested: usize,
        max: usize,
    },

    #[error("{0} is shut down or shutting down")]
    ShuttingDown(&'static str),

    #[error("failed to create channel to {remote:?}: {source}")]
    ChannelCreationFailed {
        remote: Option<SocketAddr>,
        #[source]
        source: std::io::Error,
    },

    /// A caller created more channels than it reserved. This is a bug in the calling code rather
    ///  than contention for resources.
    #[error("channel creator exceeded its reserved budget of {permits} {kind} permits")]
    ReservationExceeded {
        kind: PermitKind,
        permits: usize,
    },

    #[error("a message can hold at most {0} content types")]
    TooManyContentTypes(usize),

    #[error("a public key with signature must occupy the first content slot")]
    PublicKeySignatureNotFirst,

    #[error("there is already a handler named '{0}'")]
    DuplicateHandlerName(String),

    #[error("there is no handler named '{0}'")]
    HandlerNotFound(String),

    #[error("message with {size} bytes exceeds the UDP size ceiling of {ceiling} bytes - use TCP or streaming")]
    MessageTooLargeForUdp {
        size: usize,
        ceiling: usize,
    },

    #[error("channel is closed")]
    ChannelClosed,
}

impl TransportError {
    pub(crate) fn creation_failed(remote: Option<SocketAddr>, source: std::io::Error) -> TransportError {
        TransportError::ChannelCreationFailed { remote, source }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
