use std::fmt;

bitflags::bitflags! {
    /// Events delivered to a channel's handler.
    ///
    /// Several flags may be set in one invocation, e.g. `ACCEPT | RECV` when an
    /// accepted connection already has data waiting, or `RECV | SEND` when both
    /// readiness edges arrived in the same poll.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChannelEvents: u32 {
        /// Outbound connect completed.
        const CONNECT = 1 << 0;
        /// Channel was accepted from a listener.
        const ACCEPT = 1 << 1;
        /// New bytes are in the receive ring buffer.
        const RECV = 1 << 2;
        /// The send queue drained completely.
        const SEND = 1 << 3;
        /// Channel closed; it is removed from the loop right after this call.
        const CLOSE = 1 << 4;
        /// No bytes received within the channel's idle timeout.
        const TIMEOUT = 1 << 5;
        /// Outbound connect did not complete within its timeout.
        const CONNECT_TIMEOUT = 1 << 6;
    }
}

impl fmt::Debug for ChannelEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, &mut *f)
    }
}

/// Readiness reported by the poller for one token, detached from `mio::event::Event`
/// so it can be stored and replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub closed: bool,
}

impl Readiness {
    pub const READ: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
        closed: false,
    };

    pub fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.error |= other.error;
        self.closed |= other.closed;
    }
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
            closed: event.is_read_closed() && event.is_write_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert_eq!(ChannelEvents::CONNECT.bits(), 1);
        assert_eq!(ChannelEvents::CLOSE.bits(), 16);
        assert_eq!(ChannelEvents::CONNECT_TIMEOUT.bits(), 64);
    }

    #[test]
    fn test_combined_events() {
        let events = ChannelEvents::ACCEPT | ChannelEvents::RECV;
        assert!(events.contains(ChannelEvents::RECV));
        assert!(!events.contains(ChannelEvents::CLOSE));
        assert_eq!(format!("{:?}", events), "ACCEPT | RECV");
    }

    #[test]
    fn test_readiness_merge() {
        let mut readiness = Readiness::READ;
        readiness.merge(Readiness {
            writable: true,
            ..Default::default()
        });
        assert!(readiness.readable && readiness.writable);
        assert!(!readiness.error);
    }
}
