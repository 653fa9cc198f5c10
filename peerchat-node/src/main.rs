// PeerChat node: parses the command line, loads config, and runs the chat loop on one thread.

mod config;
mod datagram;
mod event_loop;
mod stream;
mod transport;

use std::future::Future;

use anyhow::Context;
use clap::Parser;
use peerchat_core::{PeerChatCore, SelfIdentity, TransportMode};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::datagram::DatagramTransport;
use crate::event_loop::EventLoop;
use crate::stream::StreamTransport;
use crate::transport::Transport;

#[derive(Debug, Parser)]
#[command(
    name = "peerchat",
    version,
    about = "Peer-to-peer chat over a self-organizing full mesh",
    override_usage = "peerchat [-p <port>] [--transport <mode>] <username> <zip code> <age>"
)]
struct Args {
    /// Listening port (overrides config; default 8129)
    #[arg(short, long)]
    port: Option<u16>,
    /// stream (TCP) or datagram (UDP)
    #[arg(long)]
    transport: Option<TransportMode>,
    username: String,
    zip_code: u32,
    age: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = config::load().context("failed to load configuration")?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(mode) = args.transport {
        cfg.transport = mode;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let me = SelfIdentity::new(&args.username, cfg.port, args.zip_code, args.age);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    run_to_exit(rt, run(me, cfg.transport))
}

/// Drive `fut` to completion, then drop the runtime without joining blocking
/// tasks. A pending stdin read never returns on its own.
fn run_to_exit<F: Future>(rt: tokio::runtime::Runtime, fut: F) -> F::Output {
    let out = rt.block_on(fut);
    rt.shutdown_background();
    out
}

async fn run(me: SelfIdentity, mode: TransportMode) -> anyhow::Result<()> {
    let port = me.port();
    info!(username = me.username(), port, %mode, "starting");
    let core = PeerChatCore::new(me, mode);
    let input = BufReader::new(tokio::io::stdin());
    let out = std::io::stdout();
    match mode {
        TransportMode::Stream => {
            let transport = StreamTransport::bind(port)
                .await
                .with_context(|| format!("failed to listen on port {port}"))?;
            info!(port = transport.local_port(), "listening");
            EventLoop::new(core, transport, out)
                .run(input, shutdown_signal())
                .await
        }
        TransportMode::Datagram => {
            let transport = DatagramTransport::bind(port)
                .await
                .with_context(|| format!("failed to bind port {port}"))?;
            info!(port = transport.local_port(), "bound");
            EventLoop::new(core, transport, out)
                .run(input, shutdown_signal())
                .await
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix). If no handler can be installed, never resolves.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot watch SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot watch Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}
