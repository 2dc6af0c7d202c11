//! Capture node CLI.
//!
//! Joins the configured multicast group and persists validated records to
//! per-symbol tick files until Ctrl-C (or `--duration` elapses).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tickcap::{config::CaptureConfig, node::CaptureNode};

#[derive(Parser, Debug)]
#[command(name = "tickcap")]
#[command(about = "UDP multicast market-data capture node")]
struct Args {
    /// Multicast group to join
    #[arg(long, default_value = "239.255.0.1")]
    multicast_addr: String,

    /// UDP port
    #[arg(long, default_value = "12345")]
    port: u16,

    /// Ring buffer slots (rounded up to a power of two)
    #[arg(long, default_value = "131072")]
    ring_buffer_size: usize,

    /// Per-receive scratch buffer in bytes
    #[arg(long, default_value = "262144")]
    udp_buffer_size: usize,

    /// Kernel receive buffer (SO_RCVBUF) in bytes
    #[arg(long, default_value = "33554432")]
    socket_buffer_size: usize,

    /// Processor drain cap per pass
    #[arg(long, default_value = "256")]
    max_batch_size: usize,

    /// Directory for per-symbol tick files
    #[arg(long)]
    output_dir: PathBuf,

    /// Skip checksum verification during validation
    #[arg(long)]
    no_verify_checksums: bool,

    /// Local bind address for the coordinator channel (empty = local-only)
    #[arg(long, default_value = "")]
    coordinator_address: String,

    /// Peer coordinator addresses (repeatable)
    #[arg(long)]
    peer: Vec<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let config = CaptureConfig {
        multicast_addr: args.multicast_addr,
        port: args.port,
        ring_buffer_size: args.ring_buffer_size,
        udp_buffer_size: args.udp_buffer_size,
        socket_buffer_size: args.socket_buffer_size,
        max_batch_size: args.max_batch_size,
        output_dir: args.output_dir,
        verify_checksums: !args.no_verify_checksums,
        coordinator_address: args.coordinator_address,
        peer_addresses: args.peer,
    };

    let node = CaptureNode::new(config).context("failed to initialize capture node")?;
    node.start().context("failed to start capture node")?;

    match args.duration {
        Some(secs) => {
            std::thread::sleep(Duration::from_secs(secs));
        }
        None => {
            // Thread-based pipeline; only the Ctrl-C wait needs a runtime.
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to create runtime")?;
            rt.block_on(tokio::signal::ctrl_c())
                .context("failed to wait for Ctrl-C")?;
            info!("interrupt received, shutting down");
        }
    }

    node.stop();
    Ok(())
}
