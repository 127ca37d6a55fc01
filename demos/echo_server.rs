//! Echo server on top of the raiser + workers framework.
//!
//! ```sh
//! RUST_LOG=millrace=debug cargo run --example echo_server -- 7000 4
//! ```
//! then `nc 127.0.0.1 7000` in another terminal.

use millrace::prelude::*;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Echoes everything back and drops clients that stay silent for a minute.
struct EchoHandler;

impl ChannelHandler for EchoHandler {
    fn on_accept(&self, ctx: &mut LoopContext<'_>, ch: ChannelRef) -> Result<()> {
        let peer = ctx.channel(ch)?.peer_addr();
        tracing::info!("client {} connected from {:?} on loop {}", ch.id(), peer, ctx.loop_id());
        Ok(())
    }

    fn on_recv(&self, ctx: &mut LoopContext<'_>, ch: ChannelRef) -> Result<()> {
        let ring = ctx.recv_buffer(ch)?;
        let mut data = vec![0u8; ring.used()];
        ring.read(&mut data);
        ctx.send(ch, &data)?;
        Ok(())
    }

    fn on_timeout(&self, ctx: &mut LoopContext<'_>, ch: ChannelRef) -> Result<()> {
        tracing::info!("client {} idle, closing", ch.id());
        ctx.close(ch)
    }

    fn on_close(&self, _ctx: &mut LoopContext<'_>, ch: ChannelRef) -> Result<()> {
        tracing::info!("client {} disconnected", ch.id());
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().and_then(|p| p.parse().ok()).unwrap_or(7000);
    let workers = args.next().and_then(|w| w.parse().ok()).unwrap_or(0);

    let acceptor = AcceptorConfig::any(port, EchoHandler).idle_timeout(Duration::from_secs(60));
    let framework = FrameworkConfig::builder()
        .workers(workers)
        .acceptor(acceptor)
        .build();

    tracing::info!("echo server on port {port}");
    Framework::new(framework).start_wait()
}
