//! One non-blocking TCP endpoint and its buffering state.
//!
//! A [`Channel`] owns its socket, a receive [`RingBuffer`] and a [`SendQueue`].
//! It performs the raw non-blocking operations and reports what happened; it
//! never closes itself. Deciding to close on a hard error is the loop's job, so
//! the handler gets to observe the failure first.
//!
//! ```text
//!   Init ──connect()──> Connecting ──finish_connect()──┐
//!     │                                                ├──> Active ──close()──> Closed
//!     └───listen()────> Listening ──accept()──> (new) ─┘
//! ```

use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockAddr, SockRef, Type};

use crate::error::{Error, Result};
use crate::object_pool::BufferPool;
use crate::ring_buffer::RingBuffer;
use crate::send_queue::SendQueue;

pub const DEFAULT_BACKLOG: u32 = 50;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for channels.
///
/// Assigned once from a process-wide counter when the channel is created and
/// never reused, even after the channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Connecting,
    Listening,
    Active,
    Closed,
}

/// Non-owning handle to a channel inside a loop.
///
/// Carries the arena slot and the channel id; the loop checks both before every
/// use, so a handle kept past close (or used on the wrong loop) yields
/// [`Error::InvalidChannel`] instead of touching another channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    pub(crate) key: usize,
    id: ChannelId,
}

impl ChannelRef {
    pub(crate) fn new(key: usize, id: ChannelId) -> Self {
        Self { key, id }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }
}

/// Outcome of a write attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Everything was handed to the kernel.
    Complete,
    /// Some bytes wait in the send queue; write readiness must be armed.
    Partial,
}

/// Outcome of a receive attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// `n` new bytes were committed to the ring buffer.
    Received(usize),
    /// Spurious wake, nothing to read.
    Nothing,
}

enum Socket {
    Unbound(socket2::Socket, Domain),
    Connecting(TcpStream),
    Listening(TcpListener),
    Active(TcpStream),
    Closed,
}

pub struct Channel {
    id: ChannelId,
    socket: Socket,
    recv: RingBuffer,
    send_queue: SendQueue,
    max_send_queue_len: usize,
    peer_addr: Option<SocketAddr>,
    peer_closed: bool,
}

impl Channel {
    /// Creates a channel around a fresh non-blocking IPv4 socket.
    ///
    /// Nagle, linger and keep-alive are switched off.
    pub fn create(max_send_queue_len: usize, recv_capacity: usize, pool: BufferPool) -> Result<Self> {
        let socket = new_socket(Domain::IPV4)?;
        Self::with_socket(
            Socket::Unbound(socket, Domain::IPV4),
            None,
            max_send_queue_len,
            recv_capacity,
            pool,
        )
    }

    /// Wraps an already connected stream, e.g. one returned by `accept`.
    pub fn from_stream(
        stream: TcpStream,
        peer_addr: SocketAddr,
        max_send_queue_len: usize,
        recv_capacity: usize,
        pool: BufferPool,
    ) -> Result<Self> {
        apply_socket_options(SockRef::from(&stream))?;
        Self::with_socket(
            Socket::Active(stream),
            Some(peer_addr),
            max_send_queue_len,
            recv_capacity,
            pool,
        )
    }

    fn with_socket(
        socket: Socket,
        peer_addr: Option<SocketAddr>,
        max_send_queue_len: usize,
        recv_capacity: usize,
        pool: BufferPool,
    ) -> Result<Self> {
        Ok(Self {
            id: ChannelId::next(),
            socket,
            recv: RingBuffer::new(recv_capacity)?,
            send_queue: SendQueue::new(pool),
            max_send_queue_len,
            peer_addr,
            peer_closed: false,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        match self.socket {
            Socket::Unbound(..) => ChannelState::Init,
            Socket::Connecting(_) => ChannelState::Connecting,
            Socket::Listening(_) => ChannelState::Listening,
            Socket::Active(_) => ChannelState::Active,
            Socket::Closed => ChannelState::Closed,
        }
    }

    /// Starts a non-blocking connect. Completion shows up as write readiness and
    /// is confirmed with [`finish_connect`](Self::finish_connect).
    pub fn connect(&mut self, address: SocketAddr) -> Result<()> {
        let socket = self.take_unbound(address)?;
        match socket.connect(&SockAddr::from(address)) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(Error::ConnectFailed(e)),
        }
        self.socket = Socket::Connecting(TcpStream::from_std(socket.into()));
        self.peer_addr = Some(address);
        Ok(())
    }

    /// Checks whether a pending connect completed.
    ///
    /// Returns `Ok(true)` once connected (the channel is then `Active`),
    /// `Ok(false)` while the handshake is still in flight.
    pub fn finish_connect(&mut self) -> Result<bool> {
        let stream = match &self.socket {
            Socket::Connecting(stream) => stream,
            Socket::Active(_) => return Ok(true),
            _ => return Err(Error::InvalidState(self.state())),
        };
        if let Some(e) = stream.take_error().map_err(Error::ConnectFailed)? {
            return Err(Error::ConnectFailed(e));
        }
        match stream.peer_addr() {
            Ok(addr) => {
                self.peer_addr = Some(addr);
                if let Socket::Connecting(stream) = mem::replace(&mut self.socket, Socket::Closed) {
                    self.socket = Socket::Active(stream);
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::WouldBlock => {
                Ok(false)
            }
            Err(e) => Err(Error::ConnectFailed(e)),
        }
    }

    /// Binds and listens. A `backlog` of 0 means [`DEFAULT_BACKLOG`]; bind to
    /// `0.0.0.0:port` to accept on every interface.
    pub fn listen(&mut self, address: SocketAddr, backlog: u32) -> Result<()> {
        let backlog = if backlog == 0 { DEFAULT_BACKLOG } else { backlog };
        let socket = self.take_unbound(address)?;
        socket.set_reuse_address(true)?;
        if let Err(e) = socket.bind(&SockAddr::from(address)) {
            let domain = domain_of(address);
            self.socket = Socket::Unbound(socket, domain);
            return Err(Error::BindFailed(e));
        }
        socket
            .listen(backlog.min(i32::MAX as u32) as i32)
            .map_err(Error::ListenFailed)?;
        self.socket = Socket::Listening(TcpListener::from_std(socket.into()));
        Ok(())
    }

    /// Accepts one pending connection into a new `Active` channel with the same
    /// buffer limits. `Ok(None)` when no connection is waiting.
    pub fn accept(&mut self) -> Result<Option<Channel>> {
        let listener = match &self.socket {
            Socket::Listening(listener) => listener,
            Socket::Closed => return Err(Error::AlreadyClosed),
            _ => return Err(Error::InvalidState(self.state())),
        };
        loop {
            return match listener.accept() {
                Ok((stream, addr)) => Channel::from_stream(
                    stream,
                    addr,
                    self.max_send_queue_len,
                    self.recv.capacity(),
                    self.send_queue.pool().clone(),
                )
                .map(Some),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(Error::Io(e)),
            };
        }
    }

    /// Writes `data`, queueing whatever the socket does not take right away.
    ///
    /// When the send queue is non-empty nothing is written directly, so output
    /// order is preserved.
    ///
    /// If the queue already holds more than its configured maximum, the call
    /// fails with [`Error::SendQueueOverflow`] and **`data` is dropped**. The
    /// channel is not closed and no record of the lost payload is kept; the
    /// caller is expected to treat the channel as unwritable and close it.
    pub fn send(&mut self, data: &[u8]) -> Result<SendStatus> {
        if data.is_empty() {
            return Err(Error::InvalidParameters("send of an empty buffer"));
        }
        let stream = match &mut self.socket {
            Socket::Active(stream) => stream,
            Socket::Closed => return Err(Error::AlreadyClosed),
            _ => return Err(Error::NotConnected),
        };
        if self.send_queue.exceeds(self.max_send_queue_len) {
            return Err(Error::SendQueueOverflow {
                limit: self.max_send_queue_len,
            });
        }
        let mut written = 0;
        if self.send_queue.is_empty() {
            written = write_some(stream, data).map_err(Error::SendFailed)?;
        }
        if written < data.len() {
            self.send_queue.push(&data[written..]);
            return Ok(SendStatus::Partial);
        }
        Ok(SendStatus::Complete)
    }

    /// Drains the send queue in FIFO order after write readiness.
    pub fn flush_send_queue(&mut self) -> Result<SendStatus> {
        let stream = match &mut self.socket {
            Socket::Active(stream) => stream,
            Socket::Closed => return Err(Error::AlreadyClosed),
            _ => return Err(Error::NotConnected),
        };
        while let Some(front) = self.send_queue.front() {
            let len = front.len();
            let written = write_some(stream, front).map_err(Error::SendFailed)?;
            self.send_queue.advance_front(written);
            if written < len {
                return Ok(SendStatus::Partial);
            }
        }
        Ok(SendStatus::Complete)
    }

    /// Reads from the socket straight into the ring buffer until the socket would
    /// block, the ring fills up, or the peer closes.
    ///
    /// Fails with [`Error::RecvBufferFull`] if the ring was already full before
    /// reading, which protects the loop from a consumer that never drains.
    pub fn fill_recv_buffer(&mut self) -> Result<RecvStatus> {
        let stream = match &mut self.socket {
            Socket::Active(stream) => stream,
            Socket::Closed => return Err(Error::AlreadyClosed),
            _ => return Err(Error::NotConnected),
        };
        if self.recv.full() {
            return Err(Error::RecvBufferFull);
        }

        let mut received = 0;
        loop {
            if self.recv.lock_size() == 0 {
                break;
            }
            let region = self.recv.lock_ptr()?;
            match stream.read(region) {
                Ok(0) => {
                    self.recv.commit(0)?;
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    self.recv.commit(n)?;
                    received += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.recv.commit(0)?;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.recv.commit(0)?;
                }
                Err(e) => {
                    self.recv.commit(0)?;
                    return Err(Error::RecvFailed(e));
                }
            }
        }

        match received {
            0 if self.peer_closed => Err(Error::RecvFailed(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ))),
            0 => Ok(RecvStatus::Nothing),
            n => Ok(RecvStatus::Received(n)),
        }
    }

    /// Closes the socket and drops queued output. Closing twice is an error.
    pub fn close(&mut self) -> Result<()> {
        match mem::replace(&mut self.socket, Socket::Closed) {
            Socket::Closed => Err(Error::AlreadyClosed),
            _ => {
                self.send_queue.clear();
                Ok(())
            }
        }
    }

    pub fn recv_buffer(&self) -> &RingBuffer {
        &self.recv
    }

    pub fn recv_buffer_mut(&mut self) -> &mut RingBuffer {
        &mut self.recv
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    pub fn pending_send_bytes(&self) -> usize {
        self.send_queue.pending_bytes()
    }

    pub fn max_send_queue_len(&self) -> usize {
        self.max_send_queue_len
    }

    pub fn recv_capacity(&self) -> usize {
        self.recv.capacity()
    }

    /// True once a read returned end-of-stream.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.socket {
            Socket::Unbound(socket, _) => socket.local_addr()?.as_socket(),
            Socket::Connecting(stream) | Socket::Active(stream) => Some(stream.local_addr()?),
            Socket::Listening(listener) => Some(listener.local_addr()?),
            Socket::Closed => return Err(Error::AlreadyClosed),
        };
        addr.ok_or(Error::InvalidState(self.state()))
    }

    /// The registrable socket, if the channel has one in the poller's sense.
    pub(crate) fn source(&mut self) -> Option<&mut dyn Source> {
        match &mut self.socket {
            Socket::Connecting(stream) | Socket::Active(stream) => Some(stream),
            Socket::Listening(listener) => Some(listener),
            Socket::Unbound(..) | Socket::Closed => None,
        }
    }

    fn take_unbound(&mut self, address: SocketAddr) -> Result<socket2::Socket> {
        let domain = match &self.socket {
            Socket::Unbound(_, domain) => *domain,
            Socket::Closed => return Err(Error::AlreadyClosed),
            _ => return Err(Error::InvalidState(self.state())),
        };
        let wanted = domain_of(address);
        if wanted != domain {
            let replacement = new_socket(wanted)?;
            self.socket = Socket::Unbound(replacement, wanted);
        }
        match mem::replace(&mut self.socket, Socket::Closed) {
            Socket::Unbound(socket, _) => Ok(socket),
            other => {
                self.socket = other;
                Err(Error::InvalidState(self.state()))
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr)
            .field("recv", &self.recv)
            .field("send_queue", &self.send_queue)
            .finish()
    }
}

fn domain_of(address: SocketAddr) -> Domain {
    match address {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

fn new_socket(domain: Domain) -> Result<socket2::Socket> {
    let socket = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::ResourceExhausted)?;
    socket.set_nonblocking(true)?;
    apply_socket_options(SockRef::from(&socket))?;
    Ok(socket)
}

fn apply_socket_options(socket: SockRef<'_>) -> io::Result<()> {
    socket.set_nodelay(true)?;
    socket.set_linger(None)?;
    socket.set_keepalive(false)
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}

/// Writes as much of `data` as the socket takes without blocking.
fn write_some(stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::net::TcpListener as StdListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn connected_pair(max_queue: usize, recv_capacity: usize) -> (Channel, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut channel = Channel::create(max_queue, recv_capacity, BufferPool::default()).unwrap();
        assert_eq!(channel.state(), ChannelState::Init);
        channel.connect(addr).unwrap();

        let (peer, _) = listener.accept().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !channel.finish_connect().unwrap() {
            assert!(Instant::now() < deadline, "connect did not complete");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(channel.state(), ChannelState::Active);
        (channel, peer)
    }

    fn wait_for_recv(channel: &mut Channel) -> Result<RecvStatus> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match channel.fill_recv_buffer() {
                Ok(RecvStatus::Nothing) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5))
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Channel::create(4, 64, BufferPool::default()).unwrap();
        let b = Channel::create(4, 64, BufferPool::default()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_small_send_never_queues() {
        let (mut channel, mut peer) = connected_pair(4, 64);
        assert_eq!(channel.send(b"hello").unwrap(), SendStatus::Complete);
        assert_eq!(channel.send_queue_len(), 0);

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_send_over_limit_drops_payload() {
        let (mut channel, _peer) = connected_pair(0, 64);
        // far more than loopback socket buffers hold while the peer is not reading
        let big = vec![7u8; 32 * 1024 * 1024];
        assert_eq!(channel.send(&big).unwrap(), SendStatus::Partial);
        assert_eq!(channel.send_queue_len(), 1);
        let pending = channel.pending_send_bytes();

        assert!(matches!(
            channel.send(b"lost"),
            Err(Error::SendQueueOverflow { limit: 0 })
        ));
        assert_eq!(channel.send_queue_len(), 1);
        assert_eq!(channel.pending_send_bytes(), pending);
    }

    #[test]
    fn test_queued_output_flushes_in_order() {
        let (mut channel, mut peer) = connected_pair(8, 64);
        let big = vec![1u8; 16 * 1024 * 1024];
        assert_eq!(channel.send(&big).unwrap(), SendStatus::Partial);
        // queue non-empty, so this goes straight to the back of the queue
        assert_eq!(channel.send(b"tail").unwrap(), SendStatus::Partial);
        assert_eq!(channel.send_queue_len(), 2);

        let reader = thread::spawn(move || {
            let mut all = Vec::new();
            peer.read_to_end(&mut all).unwrap();
            all
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        while channel.flush_send_queue().unwrap() == SendStatus::Partial {
            assert!(Instant::now() < deadline, "flush did not drain");
            thread::sleep(Duration::from_millis(1));
        }
        channel.close().unwrap();

        let all = reader.join().unwrap();
        assert_eq!(all.len(), big.len() + 4);
        assert_eq!(&all[big.len()..], b"tail");
    }

    #[test]
    fn test_flush_to_reset_peer_fails() {
        let (mut channel, peer) = connected_pair(8, 64);
        let big = vec![3u8; 32 * 1024 * 1024];
        assert_eq!(channel.send(&big).unwrap(), SendStatus::Partial);

        // zero linger turns the close into a reset
        socket2::SockRef::from(&peer)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match channel.flush_send_queue() {
                Err(Error::SendFailed(_)) => break,
                Err(e) => panic!("unexpected error: {e}"),
                Ok(_) => {
                    assert!(Instant::now() < deadline, "flush kept succeeding");
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }
        assert!(channel.send_queue_len() > 0);
    }

    #[test]
    fn test_fill_recv_buffer() {
        let (mut channel, mut peer) = connected_pair(4, 64);
        assert_eq!(channel.fill_recv_buffer().unwrap(), RecvStatus::Nothing);

        peer.write_all(b"ping").unwrap();
        assert_eq!(wait_for_recv(&mut channel).unwrap(), RecvStatus::Received(4));
        assert_eq!(channel.recv_buffer().read_ptr(), b"ping");
    }

    #[test]
    fn test_recv_buffer_full() {
        let (mut channel, mut peer) = connected_pair(4, 4);
        peer.write_all(b"12345678").unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(wait_for_recv(&mut channel).unwrap(), RecvStatus::Received(4));
        assert!(channel.recv_buffer().full());
        assert!(matches!(channel.fill_recv_buffer(), Err(Error::RecvBufferFull)));

        channel.recv_buffer_mut().consume(4).unwrap();
        assert_eq!(wait_for_recv(&mut channel).unwrap(), RecvStatus::Received(4));
        assert_eq!(channel.recv_buffer().read_ptr(), b"5678");
    }

    #[test]
    fn test_peer_close_is_recv_failure() {
        let (mut channel, peer) = connected_pair(4, 64);
        drop(peer);
        assert!(matches!(wait_for_recv(&mut channel), Err(Error::RecvFailed(_))));
        assert!(channel.peer_closed());
    }

    #[test]
    fn test_listen_and_accept() {
        let mut listener = Channel::create(4, 64, BufferPool::default()).unwrap();
        listener.listen("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        assert_eq!(listener.state(), ChannelState::Listening);
        let addr = listener.local_addr().unwrap();

        assert!(listener.accept().unwrap().is_none());
        let _client = std::net::TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let accepted = loop {
            if let Some(channel) = listener.accept().unwrap() {
                break channel;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(accepted.state(), ChannelState::Active);
        assert_eq!(accepted.recv_capacity(), 64);
        assert!(accepted.peer_addr().is_some());
    }

    #[test]
    fn test_bind_conflict() {
        let taken = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let mut channel = Channel::create(4, 64, BufferPool::default()).unwrap();
        assert!(matches!(channel.listen(addr, 0), Err(Error::BindFailed(_))));
        assert_eq!(channel.state(), ChannelState::Init);
    }

    #[test]
    fn test_double_close() {
        let mut channel = Channel::create(4, 64, BufferPool::default()).unwrap();
        channel.close().unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(channel.close(), Err(Error::AlreadyClosed)));
        assert!(matches!(channel.send(b"x"), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn test_send_before_connect() {
        let mut channel = Channel::create(4, 64, BufferPool::default()).unwrap();
        assert!(matches!(channel.send(b"x"), Err(Error::NotConnected)));
    }
}
