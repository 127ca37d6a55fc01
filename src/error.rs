use std::{io, result::Result as StdResult};

use thiserror::Error;

pub type Result<T> = StdResult<T, Error>;

/// Errors returned by channels, loops, timers and the framework.
///
/// Transient I/O outcomes (a partial send, a spurious wake with nothing to read)
/// are not errors; they are reported through [`SendStatus`](crate::channel::SendStatus)
/// and [`RecvStatus`](crate::channel::RecvStatus). Everything here is either a hard
/// condition the dispatch layer answers by closing the channel, or misuse.
#[derive(Debug, Error)]
pub enum Error {
    #[error("socket creation failed: {0}")]
    ResourceExhausted(#[source] io::Error),

    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    #[error("bind failed: {0}")]
    BindFailed(#[source] io::Error),

    #[error("listen failed: {0}")]
    ListenFailed(#[source] io::Error),

    #[error("channel is not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(#[source] io::Error),

    /// The send queue already held more than `limit` buffers; the payload was dropped.
    #[error("send queue exceeds its limit of {limit} buffers, payload dropped")]
    SendQueueOverflow { limit: usize },

    #[error("receive failed: {0}")]
    RecvFailed(#[source] io::Error),

    #[error("receive buffer full")]
    RecvBufferFull,

    #[error("ring buffer already has an outstanding write lock")]
    RingBufferLocked,

    #[error("ring buffer has no outstanding write lock")]
    RingBufferNotLocked,

    #[error("insufficient capacity: requested {requested}, available {available}")]
    InsufficientCapacity { requested: usize, available: usize },

    #[error("timer already started")]
    TimerAlreadyStarted,

    #[error("timer does not exist")]
    InvalidTimer,

    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),

    #[error("channel does not exist in this loop")]
    InvalidChannel,

    #[error("channel already closed")]
    AlreadyClosed,

    #[error("operation not valid in channel state {0:?}")]
    InvalidState(crate::channel::ChannelState),

    #[error("framework already started")]
    AlreadyStarted,

    #[error("framework not started")]
    NotStarted,

    #[error("caller is not a worker thread of this framework")]
    NotWorkerThread,

    #[error("loop {0} already attached")]
    LoopAttached(usize),

    #[error("loop not found")]
    LoopNotFound,

    #[error("loop is no longer running")]
    LoopGone,

    #[error("failed to spawn thread: {0}")]
    ThreadStart(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors after which the channel can no longer be used and the
    /// dispatch layer should close it.
    pub fn is_fatal_for_channel(&self) -> bool {
        matches!(
            self,
            Error::SendFailed(_)
                | Error::SendQueueOverflow { .. }
                | Error::RecvFailed(_)
                | Error::RecvBufferFull
                | Error::ConnectFailed(_)
                | Error::AlreadyClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::RecvBufferFull.is_fatal_for_channel());
        assert!(Error::SendQueueOverflow { limit: 4 }.is_fatal_for_channel());
        assert!(!Error::RingBufferLocked.is_fatal_for_channel());
        assert!(!Error::InvalidParameters("x").is_fatal_for_channel());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
