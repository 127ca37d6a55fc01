use crate::channel::ChannelRef;
use crate::error::Result;
use crate::event::ChannelEvents;
use crate::reactor::LoopContext;

/// Reacts to events on channels registered with a loop.
///
/// Always invoked on the thread of the loop that owns the channel, once per
/// dispatch with every flag collected for that channel in the current cycle. The
/// default [`on_event`](Self::on_event) fans out to the per-event methods in a
/// fixed order: connect, accept, recv, send, timeout, connect timeout, close.
///
/// Returning `Err` from any method makes the loop log the error and close the
/// channel; `on_close` then runs for it.
///
/// Closures with the `on_event` signature are handlers too:
///
/// ```rust,no_run
/// use millrace::prelude::*;
///
/// let echo = |ctx: &mut LoopContext<'_>, ch: ChannelRef, events: ChannelEvents| -> Result<()> {
///     if events.contains(ChannelEvents::RECV) {
///         let data = ctx.recv_buffer(ch)?.read_ptr().to_vec();
///         ctx.recv_buffer(ch)?.consume(data.len())?;
///         ctx.send(ch, &data)?;
///     }
///     Ok(())
/// };
/// # let _ = echo;
/// ```
pub trait ChannelHandler: Send + Sync + 'static {
    fn on_event(
        &self,
        ctx: &mut LoopContext<'_>,
        channel: ChannelRef,
        events: ChannelEvents,
    ) -> Result<()> {
        if events.contains(ChannelEvents::CONNECT) {
            self.on_connect(ctx, channel)?;
        }
        if events.contains(ChannelEvents::ACCEPT) {
            self.on_accept(ctx, channel)?;
        }
        if events.contains(ChannelEvents::RECV) {
            self.on_recv(ctx, channel)?;
        }
        if events.contains(ChannelEvents::SEND) {
            self.on_send(ctx, channel)?;
        }
        if events.contains(ChannelEvents::TIMEOUT) {
            self.on_timeout(ctx, channel)?;
        }
        if events.contains(ChannelEvents::CONNECT_TIMEOUT) {
            self.on_connect_timeout(ctx, channel)?;
        }
        if events.contains(ChannelEvents::CLOSE) {
            self.on_close(ctx, channel)?;
        }
        Ok(())
    }

    /// Outbound connect completed.
    fn on_connect(&self, _ctx: &mut LoopContext<'_>, _channel: ChannelRef) -> Result<()> {
        Ok(())
    }

    /// Channel was accepted and placed on this loop.
    fn on_accept(&self, _ctx: &mut LoopContext<'_>, _channel: ChannelRef) -> Result<()> {
        Ok(())
    }

    /// New bytes are in the receive buffer. Consume what you handled.
    fn on_recv(&self, _ctx: &mut LoopContext<'_>, _channel: ChannelRef) -> Result<()> {
        Ok(())
    }

    /// The send queue drained.
    fn on_send(&self, _ctx: &mut LoopContext<'_>, _channel: ChannelRef) -> Result<()> {
        Ok(())
    }

    /// Idle timeout expired without receiving anything.
    fn on_timeout(&self, _ctx: &mut LoopContext<'_>, _channel: ChannelRef) -> Result<()> {
        Ok(())
    }

    fn on_connect_timeout(&self, _ctx: &mut LoopContext<'_>, _channel: ChannelRef) -> Result<()> {
        Ok(())
    }

    /// Last call for this channel; it is removed from the loop afterwards.
    fn on_close(&self, _ctx: &mut LoopContext<'_>, _channel: ChannelRef) -> Result<()> {
        Ok(())
    }
}

impl<F> ChannelHandler for F
where
    F: Fn(&mut LoopContext<'_>, ChannelRef, ChannelEvents) -> Result<()> + Send + Sync + 'static,
{
    fn on_event(
        &self,
        ctx: &mut LoopContext<'_>,
        channel: ChannelRef,
        events: ChannelEvents,
    ) -> Result<()> {
        self(ctx, channel, events)
    }
}
