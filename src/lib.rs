//! # millrace
//!
//! A multi-loop TCP reactor built directly on [`mio`], without an async runtime.
//!
//! Each [`Loop`](reactor::Loop) owns a poller, a set of non-blocking channels and a
//! slotted timer wheel, and is driven by a single thread. A
//! [`Framework`](framework::Framework) runs one *raiser* loop that accepts and
//! connects, plus N *worker* loops that own the established channels; a round-robin
//! [`LoadBalancer`](balancer::LoadBalancer) decides where each channel goes.
//!
//! ```text
//! ┌───────────┐  accept/connect  ┌──────────────┐   hand-off queue   ┌──────────────┐
//! │ Framework │ ───────────────> │ raiser Loop  │ ─────────────────> │ worker Loops │
//! └───────────┘                  └──────────────┘   + mio::Waker     └──────┬───────┘
//!                                                                           │
//!                                   ChannelHandler::on_event(ctx, ch, ev) <─┘
//! ```
//!
//! Every channel has a fixed-capacity receive [`RingBuffer`](ring_buffer::RingBuffer)
//! that the socket is read into directly, and a bounded send queue of pooled
//! buffers. Handlers see a bitmask of [`ChannelEvents`](event::ChannelEvents) and act
//! on the loop through a [`LoopContext`](reactor::LoopContext).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use millrace::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let echo = |ctx: &mut LoopContext<'_>, ch: ChannelRef, events: ChannelEvents| -> Result<()> {
//!         if events.contains(ChannelEvents::RECV) {
//!             let ring = ctx.recv_buffer(ch)?;
//!             let mut data = vec![0u8; ring.used()];
//!             ring.read(&mut data);
//!             ctx.send(ch, &data)?;
//!         }
//!         Ok(())
//!     };
//!
//!     let config = FrameworkConfig::builder()
//!         .workers(4)
//!         .acceptor(AcceptorConfig::any(7000, echo))
//!         .build();
//!
//!     Framework::new(config).start_wait()
//! }
//! ```
//!
//! A single loop can also be driven by hand:
//!
//! ```rust,no_run
//! use millrace::prelude::*;
//! use std::time::Duration;
//!
//! # fn main() -> Result<()> {
//! let mut event_loop = Loop::new(LoopConfig::default())?;
//! event_loop.context().start_timer_periodic(1000, |ctx, _| {
//!     println!("loop {} has {} channels", ctx.loop_id(), ctx.channel_count());
//! })?;
//! loop {
//!     event_loop.run_once(Some(Duration::from_millis(10)))?;
//! }
//! # }
//! ```

pub mod balancer;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod framework;
pub mod handler;
pub mod logger;
pub mod object_pool;
pub mod poll;
pub mod reactor;
pub mod ring_buffer;
pub mod send_queue;
pub mod timer;
pub mod utils;

pub use error::{Error, Result};

/// Commonly used types.
///
/// ```rust
/// use millrace::prelude::*;
/// ```
pub mod prelude {
    pub use crate::balancer::{Direction, LoadBalancer};
    pub use crate::channel::{Channel, ChannelId, ChannelRef, ChannelState, RecvStatus, SendStatus};
    pub use crate::config::{AcceptorConfig, ConnectorConfig, FrameworkConfig, LoopConfig};
    pub use crate::error::{Error, Result};
    pub use crate::event::ChannelEvents;
    pub use crate::framework::Framework;
    pub use crate::handler::ChannelHandler;
    pub use crate::logger::{LogLevel, Logger, NoOpLogger, TracingLogger};
    pub use crate::reactor::{Loop, LoopContext, LoopHandle};
    pub use crate::ring_buffer::RingBuffer;
    pub use crate::timer::{TimerId, TimerKind, TimerWheel};
}
