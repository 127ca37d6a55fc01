use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::DEFAULT_BACKLOG;
use crate::handler::ChannelHandler;
use crate::logger::{Logger, TracingLogger};
use crate::timer::{Clock, MonotonicClock};
use crate::utils::default_worker_count;

pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10;
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_TIMER_TICK_MS: u64 = 10;
pub const DEFAULT_TIMER_SLOTS: usize = 512;
pub const DEFAULT_MAX_SEND_QUEUE_LEN: usize = 64;
pub const DEFAULT_RECV_BUFFER_CAPACITY: usize = 16 * 1024;
pub const DEFAULT_POOLED_SEND_BUFFERS: usize = 64;
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 4096;

/// Settings of a single loop.
///
/// Every loop of a [`Framework`](crate::framework::Framework) gets a clone of the
/// same `LoopConfig`. Use [`LoopConfig::builder()`] to override individual values.
#[derive(Clone)]
pub struct LoopConfig {
    /// Upper bound on one blocking poll
    pub poll_timeout: Duration,
    /// Readiness events fetched per poll
    pub events_capacity: usize,
    /// Timer wheel tick in milliseconds
    pub timer_tick_ms: u64,
    /// Number of timer wheel slots
    pub timer_slots: usize,
    /// Send queue buffers a channel may hold before `send` fails
    pub max_send_queue_len: usize,
    /// Capacity of each channel's receive ring buffer
    pub recv_buffer_capacity: usize,
    /// Send buffers kept warm in the loop's pool
    pub pooled_send_buffers: usize,
    pub logger: Arc<dyn Logger>,
    /// Time source of the loop's timer wheel, which also drives connect and idle timeouts
    pub clock: Arc<dyn Clock>,
}

impl LoopConfig {
    pub fn builder() -> LoopConfigBuilder {
        LoopConfigBuilder::new()
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            timer_tick_ms: DEFAULT_TIMER_TICK_MS,
            timer_slots: DEFAULT_TIMER_SLOTS,
            max_send_queue_len: DEFAULT_MAX_SEND_QUEUE_LEN,
            recv_buffer_capacity: DEFAULT_RECV_BUFFER_CAPACITY,
            pooled_send_buffers: DEFAULT_POOLED_SEND_BUFFERS,
            logger: Arc::new(TracingLogger),
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl fmt::Debug for LoopConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopConfig")
            .field("poll_timeout", &self.poll_timeout)
            .field("events_capacity", &self.events_capacity)
            .field("timer_tick_ms", &self.timer_tick_ms)
            .field("timer_slots", &self.timer_slots)
            .field("max_send_queue_len", &self.max_send_queue_len)
            .field("recv_buffer_capacity", &self.recv_buffer_capacity)
            .field("pooled_send_buffers", &self.pooled_send_buffers)
            .finish_non_exhaustive()
    }
}

/// Builder for [`LoopConfig`]. Unset fields fall back to `LoopConfig::default()`.
#[derive(Default)]
pub struct LoopConfigBuilder {
    poll_timeout: Option<Duration>,
    events_capacity: Option<usize>,
    timer_tick_ms: Option<u64>,
    timer_slots: Option<usize>,
    max_send_queue_len: Option<usize>,
    recv_buffer_capacity: Option<usize>,
    pooled_send_buffers: Option<usize>,
    logger: Option<Arc<dyn Logger>>,
    clock: Option<Arc<dyn Clock>>,
}

impl LoopConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn timer_tick_ms(mut self, tick: u64) -> Self {
        self.timer_tick_ms = Some(tick);
        self
    }

    pub fn timer_slots(mut self, slots: usize) -> Self {
        self.timer_slots = Some(slots);
        self
    }

    pub fn max_send_queue_len(mut self, len: usize) -> Self {
        self.max_send_queue_len = Some(len);
        self
    }

    pub fn recv_buffer_capacity(mut self, capacity: usize) -> Self {
        self.recv_buffer_capacity = Some(capacity);
        self
    }

    pub fn pooled_send_buffers(mut self, count: usize) -> Self {
        self.pooled_send_buffers = Some(count);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> LoopConfig {
        let default = LoopConfig::default();
        LoopConfig {
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            timer_tick_ms: self.timer_tick_ms.unwrap_or(default.timer_tick_ms),
            timer_slots: self.timer_slots.unwrap_or(default.timer_slots),
            max_send_queue_len: self.max_send_queue_len.unwrap_or(default.max_send_queue_len),
            recv_buffer_capacity: self
                .recv_buffer_capacity
                .unwrap_or(default.recv_buffer_capacity),
            pooled_send_buffers: self
                .pooled_send_buffers
                .unwrap_or(default.pooled_send_buffers),
            logger: self.logger.unwrap_or(default.logger),
            clock: self.clock.unwrap_or(default.clock),
        }
    }
}

/// A listening endpoint. Accepted channels inherit `handler` and `idle_timeout`.
#[derive(Clone)]
pub struct AcceptorConfig {
    pub address: SocketAddr,
    /// Pending-connection queue length; 0 means the default of 50
    pub backlog: u32,
    pub handler: Arc<dyn ChannelHandler>,
    pub idle_timeout: Option<Duration>,
}

impl AcceptorConfig {
    pub fn new<H: ChannelHandler>(address: SocketAddr, handler: H) -> Self {
        Self::with_shared_handler(address, Arc::new(handler))
    }

    /// Listens on every IPv4 interface.
    pub fn any<H: ChannelHandler>(port: u16, handler: H) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), handler)
    }

    pub fn with_shared_handler(address: SocketAddr, handler: Arc<dyn ChannelHandler>) -> Self {
        Self {
            address,
            backlog: DEFAULT_BACKLOG,
            handler,
            idle_timeout: None,
        }
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for AcceptorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorConfig")
            .field("address", &self.address)
            .field("backlog", &self.backlog)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// An outbound connection to establish.
#[derive(Clone)]
pub struct ConnectorConfig {
    pub address: SocketAddr,
    /// Give up with `CONNECT_TIMEOUT` if the handshake takes longer
    pub timeout: Option<Duration>,
    pub handler: Arc<dyn ChannelHandler>,
    pub idle_timeout: Option<Duration>,
}

impl ConnectorConfig {
    pub fn new<H: ChannelHandler>(address: SocketAddr, handler: H) -> Self {
        Self::with_shared_handler(address, Arc::new(handler))
    }

    pub fn with_shared_handler(address: SocketAddr, handler: Arc<dyn ChannelHandler>) -> Self {
        Self {
            address,
            timeout: None,
            handler,
            idle_timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Settings of a [`Framework`](crate::framework::Framework): how many worker loops
/// to run, the loop settings they share, and the endpoints opened at start.
#[derive(Clone, Debug)]
pub struct FrameworkConfig {
    pub workers: usize,
    pub loop_config: LoopConfig,
    pub acceptors: Vec<AcceptorConfig>,
    pub connectors: Vec<ConnectorConfig>,
}

impl FrameworkConfig {
    pub fn builder() -> FrameworkConfigBuilder {
        FrameworkConfigBuilder::new()
    }
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            loop_config: LoopConfig::default(),
            acceptors: Vec::new(),
            connectors: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct FrameworkConfigBuilder {
    workers: Option<usize>,
    loop_config: Option<LoopConfig>,
    acceptors: Vec<AcceptorConfig>,
    connectors: Vec<ConnectorConfig>,
}

impl FrameworkConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker loops; 0 keeps the default.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = Some(config);
        self
    }

    pub fn acceptor(mut self, acceptor: AcceptorConfig) -> Self {
        self.acceptors.push(acceptor);
        self
    }

    pub fn connector(mut self, connector: ConnectorConfig) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn build(self) -> FrameworkConfig {
        let default = FrameworkConfig::default();
        FrameworkConfig {
            workers: self
                .workers
                .filter(|&n| n > 0)
                .unwrap_or(default.workers),
            loop_config: self.loop_config.unwrap_or(default.loop_config),
            acceptors: self.acceptors,
            connectors: self.connectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRef;
    use crate::event::ChannelEvents;
    use crate::logger::NoOpLogger;
    use crate::reactor::LoopContext;

    fn noop(_: &mut LoopContext<'_>, _: ChannelRef, _: ChannelEvents) -> crate::Result<()> {
        Ok(())
    }

    #[test]
    fn test_loop_config_defaults() {
        let config = LoopConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_millis(10));
        assert_eq!(config.events_capacity, 1024);
        assert_eq!(config.timer_slots, 512);
        assert_eq!(config.max_send_queue_len, 64);
        assert_eq!(config.recv_buffer_capacity, 16 * 1024);
    }

    #[test]
    fn test_loop_config_builder() {
        let config = LoopConfig::builder()
            .timer_tick_ms(5)
            .recv_buffer_capacity(512)
            .logger(Arc::new(NoOpLogger))
            .build();
        assert_eq!(config.timer_tick_ms, 5);
        assert_eq!(config.recv_buffer_capacity, 512);
        assert_eq!(config.events_capacity, DEFAULT_EVENTS_CAPACITY);
    }

    #[test]
    fn test_acceptor_defaults() {
        let acceptor = AcceptorConfig::any(9000, noop);
        assert_eq!(acceptor.address, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(acceptor.backlog, 50);
        assert!(acceptor.idle_timeout.is_none());
    }

    #[test]
    fn test_framework_builder_keeps_default_workers_for_zero() {
        let config = FrameworkConfig::builder()
            .workers(0)
            .connector(ConnectorConfig::new("127.0.0.1:1".parse().unwrap(), noop))
            .build();
        assert_eq!(config.workers, default_worker_count());
        assert_eq!(config.connectors.len(), 1);

        let config = FrameworkConfig::builder().workers(3).build();
        assert_eq!(config.workers, 3);
    }
}
