//! Synthetic feed publisher CLI.
//!
//! Drives a paced stream of sealed trade records at a target rate, for
//! exercising a capture node end to end.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tickcap::sim::{MarketDataSimulator, SimulatorConfig};

#[derive(Parser, Debug)]
#[command(name = "market_data_simulator")]
#[command(about = "Synthetic market-data feed for benchmarking tickcap")]
struct Args {
    /// Destination address (multicast group or unicast host)
    #[arg(long, default_value = "239.255.0.1")]
    target_addr: String,

    /// UDP port
    #[arg(long, default_value = "12345")]
    port: u16,

    /// Symbols to simulate (ids 1..=N)
    #[arg(long, default_value = "100")]
    symbols: u32,

    /// Target messages per second
    #[arg(long, default_value = "1000")]
    rate: u32,

    /// Run time in seconds
    #[arg(long, default_value = "60")]
    duration: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let sim = MarketDataSimulator::new(SimulatorConfig {
        target_addr: args.target_addr,
        port: args.port,
        num_symbols: args.symbols,
        base_msg_rate: args.rate,
        ..Default::default()
    })
    .context("failed to initialize simulator")?;

    sim.start()?;
    std::thread::sleep(Duration::from_secs(args.duration));
    sim.stop();

    let stats = sim.stats();
    info!(
        sent = stats.messages_sent,
        errors = stats.send_errors,
        "simulation complete"
    );
    Ok(())
}
