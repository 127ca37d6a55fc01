use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token, Waker};

use crate::error::Result;
use crate::event::Readiness;

/// Token reserved for the loop's waker. Channel tokens are arena keys and never
/// reach this value.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// One loop's multiplexing context: the poller, its event buffer and a waker
/// other threads use to interrupt a blocking poll.
pub struct PollHandle {
    poller: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new(events_capacity: usize) -> Result<Self> {
        let poller = Poll::new()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        Ok(PollHandle {
            poller,
            events: Events::with_capacity(events_capacity.max(1)),
            waker: Arc::new(waker),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poller.registry()
    }

    /// Polls once and appends the readiness of every channel token to `ready`,
    /// merging duplicates. Wake-ups are swallowed. Returns the number of entries added.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(Token, Readiness)>,
    ) -> Result<usize> {
        match self.poller.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let start = ready.len();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let readiness = Readiness::from(event);
            match ready[start..].iter_mut().find(|(t, _)| *t == event.token()) {
                Some((_, existing)) => existing.merge(readiness),
                None => ready.push((event.token(), readiness)),
            }
        }
        Ok(ready.len() - start)
    }

    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Interest;
    use std::thread;

    #[test]
    fn test_poll_times_out_empty() {
        let mut poller = PollHandle::new(64).unwrap();
        let mut ready = Vec::new();
        let n = poller
            .poll(Some(Duration::from_millis(10)), &mut ready)
            .unwrap();
        assert_eq!(n, 0);
        assert!(ready.is_empty());
    }

    #[test]
    fn test_wake_interrupts_poll() {
        let mut poller = PollHandle::new(64).unwrap();
        let waker = poller.waker();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let started = std::time::Instant::now();
        let mut ready = Vec::new();
        poller
            .poll(Some(Duration::from_secs(5)), &mut ready)
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(ready.is_empty(), "waker token is not reported");
        t.join().unwrap();
    }

    #[test]
    fn test_readable_listener_reported() {
        let mut poller = PollHandle::new(64).unwrap();
        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        poller
            .registry()
            .register(&mut listener, Token(3), Interest::READABLE)
            .unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let mut ready = Vec::new();
        for _ in 0..50 {
            poller
                .poll(Some(Duration::from_millis(100)), &mut ready)
                .unwrap();
            if !ready.is_empty() {
                break;
            }
        }
        assert_eq!(ready[0].0, Token(3));
        assert!(ready[0].1.readable);
    }
}
