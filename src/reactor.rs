//! The event loop.
//!
//! A [`Loop`] owns one poller, the channels registered with it and one timer
//! wheel, and is driven by exactly one thread. Each call to
//! [`run_once`](Loop::run_once) does, in order:
//!
//! ```text
//!   1. drain the hand-off queue      (channels, endpoints and timers sent by other threads)
//!   2. poll                          (bounded by the timeout)
//!   3. dispatch channel readiness    connect completion, accept, read, write
//!                                    one handler call per channel with all flags
//!   4. close channels that failed    (handler sees CLOSE, then the channel is removed)
//!   5. advance the timer wheel once  (user timers, connect deadlines, idle timeouts)
//! ```
//!
//! Connect deadlines and idle timeouts are one-shot wheel timers per channel, so a
//! cycle never walks the whole channel set.
//!
//! Other threads talk to a loop only through its [`LoopHandle`]: commands go into a
//! channel and the loop's waker interrupts the poll. Handlers and timer
//! callbacks run on the loop's thread and get a [`LoopContext`] to act on the loop.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use mio::{Interest, Registry, Token, Waker};
use slab::Slab;

use crate::balancer::{Direction, LoadBalancer};
use crate::channel::{Channel, ChannelRef, ChannelState, RecvStatus, SendStatus};
use crate::config::{AcceptorConfig, ConnectorConfig, LoopConfig, DEFAULT_SEND_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::event::{ChannelEvents, Readiness};
use crate::handler::ChannelHandler;
use crate::logger::{LogLevel, Logger};
use crate::object_pool::BufferPool;
use crate::poll::PollHandle;
use crate::ring_buffer::RingBuffer;
use crate::timer::{TimerId, TimerKind, TimerWheel};

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_LOOP: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Id of the loop running on the calling thread, if any.
pub fn current_loop_id() -> Option<usize> {
    CURRENT_LOOP.with(Cell::get)
}

/// Callback of a loop timer.
pub struct LoopTimer(Box<dyn FnMut(&mut LoopContext<'_>, TimerId) + Send>);

impl LoopTimer {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(&mut LoopContext<'_>, TimerId) + Send + 'static,
    {
        LoopTimer(Box::new(f))
    }
}

pub(crate) struct TimerRequest {
    kind: TimerKind,
    interval_ms: u64,
    max_fires: u32,
    callback: LoopTimer,
}

impl TimerRequest {
    pub(crate) fn new(kind: TimerKind, interval_ms: u64, max_fires: u32, callback: LoopTimer) -> Result<Self> {
        if interval_ms == 0 {
            return Err(Error::InvalidParameters("timer delay must be non-zero"));
        }
        if kind == TimerKind::Counted && max_fires == 0 {
            return Err(Error::InvalidParameters("counted timer needs at least one fire"));
        }
        Ok(Self {
            kind,
            interval_ms,
            max_fires,
            callback,
        })
    }

    fn start(self, timers: &mut TimerWheel<LoopTimer>) -> Result<TimerId> {
        let id = timers.create_timer();
        let started = match self.kind {
            TimerKind::Once => timers.start_once(id, self.interval_ms, self.callback),
            TimerKind::Periodic => timers.start_periodic(id, self.interval_ms, self.callback),
            TimerKind::Counted => {
                timers.start_counted(id, self.interval_ms, self.max_fires, self.callback)
            }
        };
        if let Err(e) = started {
            let _ = timers.stop(id);
            return Err(e);
        }
        Ok(id)
    }
}

pub(crate) enum Command {
    Adopt {
        channel: Channel,
        handler: Arc<dyn ChannelHandler>,
        events: ChannelEvents,
        idle_timeout: Option<Duration>,
    },
    Listen(AcceptorConfig),
    Connect(ConnectorConfig),
    Timer(TimerRequest),
}

struct LoopShared {
    id: usize,
    inbox: Sender<Command>,
    waker: Arc<Waker>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    alive: AtomicBool,
    channel_count: AtomicUsize,
}

/// Thread-safe handle to a loop, used to feed it work from other threads.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Asks the loop to leave [`Loop::run`] after the current cycle.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channel_count.load(Ordering::Relaxed)
    }

    /// Hands a channel to the loop. `events` (e.g. `ACCEPT`) are delivered to the
    /// handler once the loop has registered it.
    pub fn adopt(
        &self,
        channel: Channel,
        handler: Arc<dyn ChannelHandler>,
        events: ChannelEvents,
    ) -> Result<()> {
        self.push(Command::Adopt {
            channel,
            handler,
            events,
            idle_timeout: None,
        })
    }

    /// Like [`adopt`](Self::adopt), but a loop that is gone hands the command
    /// back so the caller can still close the channel properly.
    pub(crate) fn hand_over(
        &self,
        channel: Channel,
        handler: Arc<dyn ChannelHandler>,
        events: ChannelEvents,
        idle_timeout: Option<Duration>,
    ) -> std::result::Result<(), Command> {
        self.send(Command::Adopt {
            channel,
            handler,
            events,
            idle_timeout,
        })?;
        let _ = self.shared.waker.wake();
        Ok(())
    }

    /// Opens a listening endpoint on the loop. Bind errors are logged by the loop.
    pub fn listen(&self, acceptor: AcceptorConfig) -> Result<()> {
        self.push(Command::Listen(acceptor))
    }

    pub fn connect(&self, connector: ConnectorConfig) -> Result<()> {
        self.push(Command::Connect(connector))
    }

    pub fn schedule_once<F>(&self, delay_ms: u64, f: F) -> Result<()>
    where
        F: FnMut(&mut LoopContext<'_>, TimerId) + Send + 'static,
    {
        self.schedule(TimerKind::Once, delay_ms, 1, f)
    }

    pub fn schedule_periodic<F>(&self, interval_ms: u64, f: F) -> Result<()>
    where
        F: FnMut(&mut LoopContext<'_>, TimerId) + Send + 'static,
    {
        self.schedule(TimerKind::Periodic, interval_ms, 0, f)
    }

    pub fn schedule_counted<F>(&self, interval_ms: u64, max_fires: u32, f: F) -> Result<()>
    where
        F: FnMut(&mut LoopContext<'_>, TimerId) + Send + 'static,
    {
        self.schedule(TimerKind::Counted, interval_ms, max_fires, f)
    }

    /// Routes a timer to the loop's own thread, where it is created and started
    /// at the beginning of the next cycle. `max_fires` only matters for
    /// [`TimerKind::Counted`].
    pub fn schedule<F>(&self, kind: TimerKind, interval_ms: u64, max_fires: u32, f: F) -> Result<()>
    where
        F: FnMut(&mut LoopContext<'_>, TimerId) + Send + 'static,
    {
        let request = TimerRequest::new(kind, interval_ms, max_fires, LoopTimer::new(f))?;
        self.push(Command::Timer(request))
    }

    fn push(&self, command: Command) -> Result<()> {
        self.send(command).map_err(|_| Error::LoopGone)?;
        self.shared.waker.wake()?;
        Ok(())
    }

    fn send(&self, command: Command) -> std::result::Result<(), Command> {
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(command);
        }
        self.shared.inbox.send(command).map_err(|e| e.0)
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("id", &self.id())
            .field("running", &self.is_running())
            .field("channels", &self.channel_count())
            .finish()
    }
}

struct ChannelEntry {
    channel: Channel,
    handler: Arc<dyn ChannelHandler>,
    interest: Interest,
    idle_timeout: Option<Duration>,
    /// Wheel clock reading of the last receive (or of arming the idle timeout).
    last_recv: u64,
    idle_timer: Option<TimerId>,
    connect_timer: Option<TimerId>,
}

struct LoopState {
    shared: Arc<LoopShared>,
    channels: Slab<ChannelEntry>,
    pool: BufferPool,
    max_send_queue_len: usize,
    recv_capacity: usize,
    logger: Arc<dyn Logger>,
    balancer: Option<Arc<LoadBalancer>>,
    /// Events to deliver on the next dispatch, e.g. `ACCEPT` for adopted channels.
    pending_events: Vec<(ChannelRef, ChannelEvents)>,
    /// Channels whose last read stopped on a full ring; edge-triggered polling
    /// will not report them again, so they are read once more next cycle.
    rereads: Vec<ChannelRef>,
    closing: VecDeque<ChannelRef>,
}

impl LoopState {
    fn has_pending_work(&self) -> bool {
        !self.pending_events.is_empty() || !self.rereads.is_empty()
    }
}

struct Work {
    channel: ChannelRef,
    events: ChannelEvents,
    readiness: Readiness,
}

fn lookup(channels: &Slab<ChannelEntry>, channel: ChannelRef) -> Option<&ChannelEntry> {
    channels
        .get(channel.key)
        .filter(|entry| entry.channel.id() == channel.id())
}

fn lookup_mut(channels: &mut Slab<ChannelEntry>, channel: ChannelRef) -> Option<&mut ChannelEntry> {
    channels
        .get_mut(channel.key)
        .filter(|entry| entry.channel.id() == channel.id())
}

fn set_interest(
    registry: &Registry,
    key: usize,
    entry: &mut ChannelEntry,
    interest: Interest,
) -> Result<()> {
    if entry.interest == interest {
        return Ok(());
    }
    if let Some(source) = entry.channel.source() {
        registry.reregister(source, Token(key), interest)?;
    }
    entry.interest = interest;
    Ok(())
}

const READ_WRITE: Interest = Interest::READABLE.add(Interest::WRITABLE);

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// A single-threaded reactor over many channels.
pub struct Loop {
    poll: PollHandle,
    inbox: Receiver<Command>,
    state: LoopState,
    timers: TimerWheel<LoopTimer>,
    ready: Vec<(Token, Readiness)>,
    poll_timeout: Duration,
}

impl Loop {
    pub fn new(config: LoopConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// A loop that places accepted channels and completed outbound connects on
    /// the loops of `balancer` instead of keeping them.
    pub fn with_balancer(config: LoopConfig, balancer: Arc<LoadBalancer>) -> Result<Self> {
        Self::build(config, Some(balancer))
    }

    fn build(config: LoopConfig, balancer: Option<Arc<LoadBalancer>>) -> Result<Self> {
        if config.recv_buffer_capacity == 0 {
            return Err(Error::InvalidParameters("receive buffer capacity must be non-zero"));
        }
        let poll = PollHandle::new(config.events_capacity)?;
        let timers = TimerWheel::with_clock(config.timer_tick_ms, config.timer_slots, config.clock)?;
        let (sender, inbox) = mpsc::channel();
        let shared = Arc::new(LoopShared {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            inbox: sender,
            waker: poll.waker(),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            channel_count: AtomicUsize::new(0),
        });

        Ok(Self {
            poll,
            inbox,
            state: LoopState {
                shared,
                channels: Slab::new(),
                pool: BufferPool::new(config.pooled_send_buffers, DEFAULT_SEND_BUFFER_SIZE),
                max_send_queue_len: config.max_send_queue_len,
                recv_capacity: config.recv_buffer_capacity,
                logger: config.logger,
                balancer,
                pending_events: Vec::new(),
                rereads: Vec::new(),
                closing: VecDeque::new(),
            },
            timers,
            ready: Vec::with_capacity(config.events_capacity),
            poll_timeout: config.poll_timeout,
        })
    }

    pub fn id(&self) -> usize {
        self.state.shared.id
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.state.shared),
        }
    }

    pub fn context(&mut self) -> LoopContext<'_> {
        LoopContext {
            state: &mut self.state,
            registry: self.poll.registry(),
            timers: &mut self.timers,
        }
    }

    /// Runs cycles until [`LoopHandle::stop`]. Channels still open when the loop
    /// stops are closed, and their handlers see `CLOSE`.
    pub fn run(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.state.shared);
        shared.running.store(true, Ordering::SeqCst);
        CURRENT_LOOP.with(|current| current.set(Some(shared.id)));
        self.log(LogLevel::Info, format!("loop {} running", shared.id));

        let mut result = Ok(());
        while !shared.stop_requested.load(Ordering::SeqCst) {
            if let Err(e) = self.run_once(Some(self.poll_timeout)) {
                self.log(LogLevel::Error, format!("loop {} failed: {e}", shared.id));
                result = Err(e);
                break;
            }
        }

        self.context().close_all();
        CURRENT_LOOP.with(|current| current.set(None));
        shared.stop_requested.store(false, Ordering::SeqCst);
        shared.running.store(false, Ordering::SeqCst);
        self.log(LogLevel::Info, format!("loop {} stopped", shared.id));
        result
    }

    /// One cycle. Returns the number of handler invocations.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.drain_inbox();

        let timeout = if self.state.has_pending_work() {
            Some(Duration::ZERO)
        } else {
            timeout
        };
        let mut ready = mem::take(&mut self.ready);
        ready.clear();
        self.poll.poll(timeout, &mut ready)?;
        let work = self.collect_work(&ready);
        self.ready = ready;

        let mut invoked = 0;
        let mut ctx = self.context();
        for item in work {
            invoked += ctx.process(item);
        }
        invoked += ctx.process_closing();
        invoked += self.run_timers();
        Ok(invoked)
    }

    pub fn listen(&mut self, acceptor: AcceptorConfig) -> Result<ChannelRef> {
        self.context().listen(acceptor)
    }

    pub fn connect(&mut self, connector: ConnectorConfig) -> Result<ChannelRef> {
        self.context().connect(connector)
    }

    pub fn adopt(
        &mut self,
        channel: Channel,
        handler: Arc<dyn ChannelHandler>,
        events: ChannelEvents,
    ) -> Result<ChannelRef> {
        self.context().insert(channel, handler, None, events)
    }

    /// Closes a channel now; its handler sees `CLOSE` before this returns.
    pub fn close(&mut self, channel: ChannelRef) -> Result<()> {
        let mut ctx = self.context();
        ctx.close(channel)?;
        ctx.process_closing();
        Ok(())
    }

    pub fn send(&mut self, channel: ChannelRef, data: &[u8]) -> Result<SendStatus> {
        self.context().send(channel, data)
    }

    pub fn channel(&self, channel: ChannelRef) -> Result<&Channel> {
        lookup(&self.state.channels, channel)
            .map(|entry| &entry.channel)
            .ok_or(Error::InvalidChannel)
    }

    pub fn local_addr(&self, channel: ChannelRef) -> Result<SocketAddr> {
        self.channel(channel)?.local_addr()
    }

    pub fn channel_count(&self) -> usize {
        self.state.channels.len()
    }

    pub fn timers(&mut self) -> &mut TimerWheel<LoopTimer> {
        &mut self.timers
    }

    fn drain_inbox(&mut self) {
        while let Ok(command) = self.inbox.try_recv() {
            self.context().apply(command);
        }
    }

    fn collect_work(&mut self, ready: &[(Token, Readiness)]) -> Vec<Work> {
        let mut work: Vec<Work> = Vec::with_capacity(ready.len() + self.state.pending_events.len());
        let mut index: HashMap<usize, usize> = HashMap::new();

        for (channel, events) in self.state.pending_events.drain(..) {
            match index.get(&channel.key) {
                Some(&i) => work[i].events |= events,
                None => {
                    index.insert(channel.key, work.len());
                    work.push(Work {
                        channel,
                        events,
                        readiness: Readiness::default(),
                    });
                }
            }
        }

        let rereads = self.state.rereads.drain(..).map(|ch| (ch, Readiness::READ));
        let polled = ready.iter().filter_map(|(token, readiness)| {
            self.state
                .channels
                .get(token.0)
                .map(|entry| (ChannelRef::new(token.0, entry.channel.id()), *readiness))
        });
        for (channel, readiness) in rereads.collect::<Vec<_>>().into_iter().chain(polled) {
            match index.get(&channel.key) {
                Some(&i) => work[i].readiness.merge(readiness),
                None => {
                    index.insert(channel.key, work.len());
                    work.push(Work {
                        channel,
                        events: ChannelEvents::empty(),
                        readiness,
                    });
                }
            }
        }
        work
    }

    fn run_timers(&mut self) -> usize {
        let state = &mut self.state;
        let registry = self.poll.registry();
        let fired = self.timers.run_once_with(|timers, id, callback| {
            let mut ctx = LoopContext {
                state: &mut *state,
                registry,
                timers,
            };
            (callback.0)(&mut ctx, id);
        });
        fired + self.context().process_closing()
    }

    fn log(&self, level: LogLevel, message: String) {
        self.state.logger.log(level, &message);
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        self.state.shared.alive.store(false, Ordering::SeqCst);
        while self.inbox.try_recv().is_ok() {}
    }
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("id", &self.id())
            .field("channels", &self.state.channels.len())
            .field("timers", &self.timers)
            .finish()
    }
}

/// The loop as seen from a handler or timer callback.
///
/// Only exists on the loop's own thread, for the duration of one callback.
/// Closing through the context is deferred until the callback returns, so the
/// channel a handler is looking at never disappears under it.
pub struct LoopContext<'a> {
    state: &'a mut LoopState,
    registry: &'a Registry,
    timers: &'a mut TimerWheel<LoopTimer>,
}

impl<'a> LoopContext<'a> {
    pub fn loop_id(&self) -> usize {
        self.state.shared.id
    }

    pub fn channel_count(&self) -> usize {
        self.state.channels.len()
    }

    pub fn channel(&self, channel: ChannelRef) -> Result<&Channel> {
        lookup(&self.state.channels, channel)
            .map(|entry| &entry.channel)
            .ok_or(Error::InvalidChannel)
    }

    pub fn recv_buffer(&mut self, channel: ChannelRef) -> Result<&mut RingBuffer> {
        lookup_mut(&mut self.state.channels, channel)
            .map(|entry| entry.channel.recv_buffer_mut())
            .ok_or(Error::InvalidChannel)
    }

    /// Sends on a channel, arming write readiness when output had to be queued.
    ///
    /// Hard failures (including [`Error::SendQueueOverflow`], whose payload is
    /// dropped) schedule the channel for closing and are returned as well.
    pub fn send(&mut self, channel: ChannelRef, data: &[u8]) -> Result<SendStatus> {
        let entry = lookup_mut(&mut self.state.channels, channel).ok_or(Error::InvalidChannel)?;
        let outcome = entry.channel.send(data).and_then(|status| {
            if status == SendStatus::Partial {
                set_interest(self.registry, channel.key, entry, READ_WRITE)?;
            }
            Ok(status)
        });
        if let Err(e) = &outcome {
            if e.is_fatal_for_channel() {
                self.log(
                    LogLevel::Warn,
                    format!("send on channel {} failed: {e}", channel.id()),
                );
                self.state.closing.push_back(channel);
            }
        }
        outcome
    }

    /// Schedules the channel for closing once the current callback returns.
    pub fn close(&mut self, channel: ChannelRef) -> Result<()> {
        lookup(&self.state.channels, channel).ok_or(Error::InvalidChannel)?;
        self.state.closing.push_back(channel);
        Ok(())
    }

    /// Replaces the channel's idle timeout; the idle period restarts now.
    pub fn set_idle_timeout(&mut self, channel: ChannelRef, timeout: Option<Duration>) -> Result<()> {
        let now = self.timers.now_ms();
        let entry = lookup_mut(&mut self.state.channels, channel).ok_or(Error::InvalidChannel)?;
        entry.idle_timeout = timeout;
        entry.last_recv = now;
        if let Some(old) = entry.idle_timer.take() {
            let _ = self.timers.stop(old);
        }
        self.arm_idle(channel);
        Ok(())
    }

    pub fn listen(&mut self, acceptor: AcceptorConfig) -> Result<ChannelRef> {
        let mut channel = self.new_channel()?;
        channel.listen(acceptor.address, acceptor.backlog)?;
        let local = channel.local_addr()?;
        let listener = self.insert(
            channel,
            acceptor.handler,
            acceptor.idle_timeout,
            ChannelEvents::empty(),
        )?;
        self.log(
            LogLevel::Info,
            format!("loop {} listening on {local}", self.loop_id()),
        );
        Ok(listener)
    }

    pub fn connect(&mut self, connector: ConnectorConfig) -> Result<ChannelRef> {
        let mut channel = self.new_channel()?;
        channel.connect(connector.address)?;
        let ch = self.insert(
            channel,
            connector.handler,
            connector.idle_timeout,
            ChannelEvents::empty(),
        )?;
        if let Some(timeout) = connector.timeout {
            let id = self.start_channel_timer(timeout_ms(timeout), move |ctx| {
                ctx.connect_expired(ch)
            });
            if let Some(entry) = lookup_mut(&mut self.state.channels, ch) {
                entry.connect_timer = id;
            }
        }
        self.log(
            LogLevel::Debug,
            format!("channel {} connecting to {}", ch.id(), connector.address),
        );
        Ok(ch)
    }

    pub fn timers(&mut self) -> &mut TimerWheel<LoopTimer> {
        &mut *self.timers
    }

    pub fn start_timer_once<F>(&mut self, delay_ms: u64, f: F) -> Result<TimerId>
    where
        F: FnMut(&mut LoopContext<'_>, TimerId) + Send + 'static,
    {
        TimerRequest::new(TimerKind::Once, delay_ms, 1, LoopTimer::new(f))?.start(self.timers)
    }

    pub fn start_timer_periodic<F>(&mut self, interval_ms: u64, f: F) -> Result<TimerId>
    where
        F: FnMut(&mut LoopContext<'_>, TimerId) + Send + 'static,
    {
        TimerRequest::new(TimerKind::Periodic, interval_ms, 0, LoopTimer::new(f))?
            .start(self.timers)
    }

    pub fn start_timer_counted<F>(&mut self, interval_ms: u64, max_fires: u32, f: F) -> Result<TimerId>
    where
        F: FnMut(&mut LoopContext<'_>, TimerId) + Send + 'static,
    {
        TimerRequest::new(TimerKind::Counted, interval_ms, max_fires, LoopTimer::new(f))?
            .start(self.timers)
    }

    pub fn stop_timer(&mut self, id: TimerId) -> Result<()> {
        self.timers.stop(id)
    }

    fn log(&self, level: LogLevel, message: String) {
        self.state.logger.log(level, &message);
    }

    fn new_channel(&self) -> Result<Channel> {
        Channel::create(
            self.state.max_send_queue_len,
            self.state.recv_capacity,
            self.state.pool.clone(),
        )
    }

    /// Registers `channel` and queues `events` for its first dispatch. Active
    /// channels are read once right away in case data arrived before registration.
    pub(crate) fn insert(
        &mut self,
        mut channel: Channel,
        handler: Arc<dyn ChannelHandler>,
        idle_timeout: Option<Duration>,
        events: ChannelEvents,
    ) -> Result<ChannelRef> {
        let interest = match channel.state() {
            ChannelState::Connecting => READ_WRITE,
            ChannelState::Listening => Interest::READABLE,
            ChannelState::Active if channel.send_queue_len() > 0 => READ_WRITE,
            ChannelState::Active => Interest::READABLE,
            state => return Err(Error::InvalidState(state)),
        };
        let active = channel.state() == ChannelState::Active;

        let vacant = self.state.channels.vacant_entry();
        let key = vacant.key();
        let source = channel
            .source()
            .ok_or(Error::InvalidState(ChannelState::Init))?;
        self.registry.register(source, Token(key), interest)?;

        let ch = ChannelRef::new(key, channel.id());
        vacant.insert(ChannelEntry {
            channel,
            handler,
            interest,
            idle_timeout,
            last_recv: self.timers.now_ms(),
            idle_timer: None,
            connect_timer: None,
        });
        self.state.shared.channel_count.fetch_add(1, Ordering::Relaxed);

        if !events.is_empty() {
            self.state.pending_events.push((ch, events));
        }
        if active {
            self.state.rereads.push(ch);
            self.arm_idle(ch);
        }
        Ok(ch)
    }

    fn apply(&mut self, command: Command) {
        let result = match command {
            Command::Adopt {
                channel,
                handler,
                events,
                idle_timeout,
            } => self.insert(channel, handler, idle_timeout, events).map(drop),
            Command::Listen(acceptor) => self.listen(acceptor).map(drop),
            Command::Connect(connector) => self.connect(connector).map(drop),
            Command::Timer(request) => request.start(self.timers).map(drop),
        };
        if let Err(e) = result {
            self.log(
                LogLevel::Warn,
                format!("loop {} rejected a command: {e}", self.loop_id()),
            );
        }
    }

    fn invoke(&mut self, channel: ChannelRef, events: ChannelEvents) {
        let Some(entry) = lookup(&self.state.channels, channel) else {
            return;
        };
        let handler = Arc::clone(&entry.handler);
        if let Err(e) = handler.on_event(self, channel, events) {
            self.log(
                LogLevel::Warn,
                format!("handler for channel {} failed on {events:?}: {e}", channel.id()),
            );
            if !events.contains(ChannelEvents::CLOSE) {
                self.state.closing.push_back(channel);
            }
        }
    }

    /// Runs the I/O a readiness report calls for, then the handler once.
    fn process(&mut self, work: Work) -> usize {
        let Work {
            channel: ch,
            mut events,
            readiness,
        } = work;
        let registry = self.registry;
        let now = self.timers.now_ms();
        let mut failure = None;
        let mut hand_off = false;
        let mut peer_closed = false;
        let mut connected = false;

        {
            let Some(entry) = lookup_mut(&mut self.state.channels, ch) else {
                return 0;
            };

            match entry.channel.state() {
                ChannelState::Listening => {
                    if readiness.readable {
                        self.accept_all(ch);
                    }
                    return 0;
                }
                ChannelState::Connecting
                    if readiness.writable || readiness.error || readiness.closed =>
                {
                    match entry.channel.finish_connect() {
                        Ok(true) => {
                            events |= ChannelEvents::CONNECT;
                            connected = true;
                            entry.last_recv = now;
                            if let Some(id) = entry.connect_timer.take() {
                                let _ = self.timers.stop(id);
                            }
                            if self.state.balancer.is_some() {
                                hand_off = true;
                            } else if let Err(e) =
                                set_interest(registry, ch.key, entry, Interest::READABLE)
                            {
                                failure = Some(e);
                            }
                        }
                        Ok(false) => {}
                        Err(e) => failure = Some(e),
                    }
                }
                _ => {}
            }

            if !hand_off && failure.is_none() && entry.channel.state() == ChannelState::Active {
                if readiness.readable || readiness.error || readiness.closed {
                    match entry.channel.fill_recv_buffer() {
                        Ok(RecvStatus::Received(_)) => {
                            events |= ChannelEvents::RECV;
                            entry.last_recv = now;
                            peer_closed = entry.channel.peer_closed();
                            if entry.channel.recv_buffer().full() {
                                self.state.rereads.push(ch);
                            }
                        }
                        Ok(RecvStatus::Nothing) => {}
                        Err(e) => failure = Some(e),
                    }
                }
                if failure.is_none() && readiness.writable && entry.channel.send_queue_len() > 0 {
                    match entry.channel.flush_send_queue() {
                        Ok(SendStatus::Complete) => {
                            events |= ChannelEvents::SEND;
                            if let Err(e) = set_interest(registry, ch.key, entry, Interest::READABLE)
                            {
                                failure = Some(e);
                            }
                        }
                        Ok(SendStatus::Partial) => {}
                        Err(e) => failure = Some(e),
                    }
                }
            }
        }

        if hand_off && self.hand_off(ch, Direction::Outbound, events) {
            return 0;
        }
        if connected {
            self.arm_idle(ch);
        }

        let mut invoked = 0;
        if !events.is_empty() {
            self.invoke(ch, events);
            invoked += 1;
        }
        if let Some(e) = failure {
            self.log(
                LogLevel::Debug,
                format!("closing channel {}: {e}", ch.id()),
            );
            self.state.closing.push_back(ch);
        } else if peer_closed {
            self.state.closing.push_back(ch);
        }
        invoked
    }

    fn accept_all(&mut self, listener: ChannelRef) {
        let mut accepted = Vec::new();
        let (handler, idle_timeout) = {
            let Some(entry) = lookup_mut(&mut self.state.channels, listener) else {
                return;
            };
            loop {
                match entry.channel.accept() {
                    Ok(Some(channel)) => accepted.push(channel),
                    Ok(None) => break,
                    Err(e) => {
                        self.state.logger.log(
                            LogLevel::Warn,
                            &format!("accept on channel {} failed: {e}", listener.id()),
                        );
                        break;
                    }
                }
            }
            (Arc::clone(&entry.handler), entry.idle_timeout)
        };

        for channel in accepted {
            let peer = channel.peer_addr();
            let worker = self
                .state
                .balancer
                .as_ref()
                .and_then(|balancer| balancer.select(Direction::Inbound).ok());
            if let Some(worker) = worker {
                let id = channel.id();
                match worker.hand_over(
                    channel,
                    Arc::clone(&handler),
                    ChannelEvents::ACCEPT,
                    idle_timeout,
                ) {
                    Ok(()) => self.log(
                        LogLevel::Debug,
                        format!("channel {id} from {peer:?} placed on loop {}", worker.id()),
                    ),
                    Err(command) => self.reclaim(command, worker.id()),
                }
                continue;
            }
            match self.insert(channel, Arc::clone(&handler), idle_timeout, ChannelEvents::ACCEPT) {
                Ok(ch) => self.log(
                    LogLevel::Debug,
                    format!("channel {} accepted from {peer:?}", ch.id()),
                ),
                Err(e) => self.log(LogLevel::Warn, format!("could not register accepted channel: {e}")),
            }
        }
    }

    /// Moves a channel to a worker picked by the balancer. Returns false (and keeps
    /// the channel) when there is nowhere to move it.
    fn hand_off(&mut self, ch: ChannelRef, direction: Direction, events: ChannelEvents) -> bool {
        let Some(worker) = self
            .state
            .balancer
            .as_ref()
            .and_then(|balancer| balancer.select(direction).ok())
        else {
            return false;
        };
        if lookup(&self.state.channels, ch).is_none() {
            return false;
        }
        let mut entry = self.state.channels.remove(ch.key);
        if let Some(source) = entry.channel.source() {
            let _ = self.registry.deregister(source);
        }
        self.state.shared.channel_count.fetch_sub(1, Ordering::Relaxed);
        for id in [entry.idle_timer, entry.connect_timer].into_iter().flatten() {
            let _ = self.timers.stop(id);
        }

        if let Err(command) = worker.hand_over(entry.channel, entry.handler, events, entry.idle_timeout) {
            self.reclaim(command, worker.id());
        }
        true
    }

    /// Takes back a channel whose target loop is gone and closes it here, so its
    /// handler still sees `CLOSE`.
    fn reclaim(&mut self, command: Command, loop_id: usize) {
        let Command::Adopt {
            channel, handler, ..
        } = command
        else {
            return;
        };
        let id = channel.id();
        self.log(
            LogLevel::Warn,
            format!("loop {loop_id} is gone, closing channel {id}"),
        );
        match self.insert(channel, handler, None, ChannelEvents::empty()) {
            Ok(ch) => self.state.closing.push_back(ch),
            Err(e) => self.log(
                LogLevel::Warn,
                format!("could not take back channel {id}: {e}"),
            ),
        }
    }

    /// Closes every channel queued for closing, delivering `CLOSE` to each.
    fn process_closing(&mut self) -> usize {
        let mut invoked = 0;
        while let Some(ch) = self.state.closing.pop_front() {
            let Some(entry) = lookup_mut(&mut self.state.channels, ch) else {
                continue;
            };
            if let Some(source) = entry.channel.source() {
                let _ = self.registry.deregister(source);
            }
            let _ = entry.channel.close();
            for id in [entry.idle_timer.take(), entry.connect_timer.take()]
                .into_iter()
                .flatten()
            {
                let _ = self.timers.stop(id);
            }

            self.invoke(ch, ChannelEvents::CLOSE);
            invoked += 1;

            if lookup(&self.state.channels, ch).is_some() {
                self.state.channels.remove(ch.key);
                self.state.shared.channel_count.fetch_sub(1, Ordering::Relaxed);
            }
            self.log(LogLevel::Debug, format!("channel {} closed", ch.id()));
        }
        invoked
    }

    /// Starts a one-shot wheel timer owned by a channel.
    fn start_channel_timer<F>(&mut self, delay_ms: u64, mut f: F) -> Option<TimerId>
    where
        F: FnMut(&mut LoopContext<'_>) + Send + 'static,
    {
        let id = self.timers.create_timer();
        let callback = LoopTimer::new(move |ctx, _| f(ctx));
        match self.timers.start_once(id, delay_ms.max(1), callback) {
            Ok(()) => Some(id),
            Err(e) => {
                let _ = self.timers.stop(id);
                self.log(LogLevel::Warn, format!("could not start channel timer: {e}"));
                None
            }
        }
    }

    /// Arms the idle timer for the rest of the current idle period, if the channel
    /// is active and has an idle timeout.
    fn arm_idle(&mut self, ch: ChannelRef) {
        let now = self.timers.now_ms();
        let Some(entry) = lookup(&self.state.channels, ch) else {
            return;
        };
        let Some(timeout) = entry.idle_timeout else {
            return;
        };
        if entry.channel.state() != ChannelState::Active || entry.idle_timer.is_some() {
            return;
        }
        let idle_for = now.saturating_sub(entry.last_recv);
        let delay = timeout_ms(timeout).saturating_sub(idle_for);
        let id = self.start_channel_timer(delay, move |ctx| ctx.idle_expired(ch));
        if let Some(entry) = lookup_mut(&mut self.state.channels, ch) {
            entry.idle_timer = id;
        }
    }

    /// Fires `TIMEOUT` if nothing was received for a whole idle period, then
    /// re-arms for the next one.
    fn idle_expired(&mut self, ch: ChannelRef) {
        let now = self.timers.now_ms();
        let deviation = self.timers.deviation();
        let Some(entry) = lookup_mut(&mut self.state.channels, ch) else {
            return;
        };
        entry.idle_timer = None;
        let Some(timeout) = entry.idle_timeout else {
            return;
        };
        if now.saturating_sub(entry.last_recv) + deviation >= timeout_ms(timeout) {
            entry.last_recv = now;
            self.invoke(ch, ChannelEvents::TIMEOUT);
        }
        self.arm_idle(ch);
    }

    /// Fires `CONNECT_TIMEOUT` and closes the channel if it is still connecting.
    fn connect_expired(&mut self, ch: ChannelRef) {
        let Some(entry) = lookup_mut(&mut self.state.channels, ch) else {
            return;
        };
        entry.connect_timer = None;
        if entry.channel.state() != ChannelState::Connecting {
            return;
        }
        self.invoke(ch, ChannelEvents::CONNECT_TIMEOUT);
        self.state.closing.push_back(ch);
    }

    fn close_all(&mut self) {
        let all: Vec<ChannelRef> = self
            .state
            .channels
            .iter()
            .map(|(key, entry)| ChannelRef::new(key, entry.channel.id()))
            .collect();
        self.state.closing.extend(all);
        self.process_closing();
    }
}
