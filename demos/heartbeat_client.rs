//! Connects to a server and sends a heartbeat every second from a loop timer.
//!
//! ```sh
//! cargo run --example echo_server &
//! cargo run --example heartbeat_client -- 127.0.0.1:7000
//! ```

use millrace::prelude::*;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Heartbeat {
    sent: AtomicU64,
}

impl ChannelHandler for Heartbeat {
    fn on_connect(&self, ctx: &mut LoopContext<'_>, ch: ChannelRef) -> Result<()> {
        tracing::info!("connected as channel {}", ch.id());
        ctx.start_timer_periodic(1000, move |ctx, timer| {
            let beat = format!("beat {}\n", ch.id());
            if ctx.send(ch, beat.as_bytes()).is_err() {
                let _ = ctx.stop_timer(timer);
            }
        })?;
        Ok(())
    }

    fn on_recv(&self, ctx: &mut LoopContext<'_>, ch: ChannelRef) -> Result<()> {
        let ring = ctx.recv_buffer(ch)?;
        let mut data = vec![0u8; ring.used()];
        ring.read(&mut data);
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!("echo #{n}: {}", String::from_utf8_lossy(&data).trim_end());
        Ok(())
    }

    fn on_connect_timeout(&self, _ctx: &mut LoopContext<'_>, _ch: ChannelRef) -> Result<()> {
        tracing::warn!("server did not answer in time");
        Ok(())
    }

    fn on_close(&self, _ctx: &mut LoopContext<'_>, _ch: ChannelRef) -> Result<()> {
        tracing::info!("connection closed");
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let address: SocketAddr = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 7000)));

    let mut event_loop = Loop::new(LoopConfig::default())?;
    let handle = event_loop.handle();
    event_loop.connect(
        ConnectorConfig::with_shared_handler(address, Arc::new(Heartbeat::default()))
            .timeout(Duration::from_secs(3)),
    )?;

    // stop once the connection is gone
    event_loop.context().start_timer_periodic(500, move |ctx, _| {
        if ctx.channel_count() == 0 {
            handle.stop();
        }
    })?;
    event_loop.run()
}
