//! Capture throughput benchmark.
//!
//! Runs a simulator + capture node pair at a ladder of target rates over
//! loopback multicast, reports per-rung capture rates, and verifies the
//! persisted tick files against the simulator's message log. Stops the
//! ladder (and exits non-zero) once the capture rate falls below 99%.

use std::{fs, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use tickcap::{
    config::CaptureConfig,
    node::CaptureNode,
    sim::{MarketDataSimulator, SimulatorConfig},
    wire::{MarketMessage, MESSAGE_SIZE},
};

#[derive(Parser, Debug)]
#[command(name = "capture_bench")]
#[command(about = "Rate-ladder benchmark for the tickcap pipeline")]
struct Args {
    /// Base output directory for captured data
    #[arg(long, default_value = "/tmp/tick_bench")]
    output_dir: PathBuf,

    /// Multicast group
    #[arg(long, default_value = "239.255.0.1")]
    multicast_addr: String,

    /// UDP port
    #[arg(long, default_value = "12345")]
    port: u16,

    /// Seconds per rung
    #[arg(long, default_value = "5")]
    duration: u64,

    /// Target message rates to test, lowest first
    #[arg(long, num_args = 1.., default_values = ["1000", "10000", "100000", "500000"])]
    rate: Vec<u32>,

    /// Symbols to simulate
    #[arg(long, default_value = "10")]
    symbols: u32,

    /// Skip file verification
    #[arg(long)]
    no_verify: bool,
}

struct RungResult {
    target_rate: u32,
    sent: u64,
    captured: u64,
    dropped: u64,
    capture_rate: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    for &rate in &args.rate {
        let result = run_rung(&args, rate)?;

        info!(
            target_rate = result.target_rate,
            sent = result.sent,
            captured = result.captured,
            dropped = result.dropped,
            capture_rate = format!("{:.2}%", result.capture_rate),
            "benchmark rung complete"
        );

        if result.capture_rate < 99.0 {
            bail!(
                "capture rate {:.2}% fell below 99% at {} msgs/s",
                result.capture_rate,
                rate
            );
        }

        // Let sockets and files settle between rungs.
        std::thread::sleep(Duration::from_secs(1));
    }

    Ok(())
}

fn run_rung(args: &Args, rate: u32) -> Result<RungResult> {
    let rung_dir = args.output_dir.join(format!("bench_{rate}"));

    let node = CaptureNode::new(CaptureConfig {
        multicast_addr: args.multicast_addr.clone(),
        port: args.port,
        output_dir: rung_dir.clone(),
        ..Default::default()
    })
    .context("failed to initialize capture node")?;

    let sim = MarketDataSimulator::new(SimulatorConfig {
        target_addr: args.multicast_addr.clone(),
        port: args.port,
        num_symbols: args.symbols,
        base_msg_rate: rate,
        track_messages: !args.no_verify,
        ..Default::default()
    })
    .context("failed to initialize simulator")?;

    node.start()?;
    // Give capture a beat to be receive-ready before the feed opens.
    std::thread::sleep(Duration::from_millis(100));
    sim.start()?;

    std::thread::sleep(Duration::from_secs(args.duration));

    sim.stop();
    std::thread::sleep(Duration::from_millis(200));
    node.stop();

    let stats = node.stats();
    let sent = sim.sent_count();
    let captured = stats.messages_processed;
    let capture_rate = if sent > 0 {
        captured as f64 / sent as f64 * 100.0
    } else {
        0.0
    };

    if !args.no_verify {
        verify_files(&rung_dir, &sim)?;
    }

    Ok(RungResult {
        target_rate: rate,
        sent,
        captured,
        dropped: stats.capture.messages_dropped,
        capture_rate,
    })
}

/// Re-read every tick file and compare each record byte-for-byte with what
/// the simulator logged for that sequence number.
fn verify_files(dir: &PathBuf, sim: &MarketDataSimulator) -> Result<()> {
    let mut total = 0u64;
    let mut mismatches = 0u64;
    let mut unknown = 0u64;

    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("tick") {
            continue;
        }

        let data = fs::read(&path)?;
        if data.len() % MESSAGE_SIZE != 0 {
            bail!(
                "{} length {} is not a multiple of {}",
                path.display(),
                data.len(),
                MESSAGE_SIZE
            );
        }

        for chunk in data.chunks_exact(MESSAGE_SIZE) {
            total += 1;
            let msg = MarketMessage::try_from_slice(chunk)?;
            match sim.sent_message(msg.sequence_number) {
                Some(sent) => {
                    if sent.to_bytes() != *chunk {
                        mismatches += 1;
                        if mismatches <= 10 {
                            warn!(seq = msg.sequence_number, "captured record differs from sent");
                        }
                    }
                }
                None => {
                    unknown += 1;
                    if unknown <= 10 {
                        warn!(seq = msg.sequence_number, "captured record was never sent");
                    }
                }
            }
        }
    }

    info!(total, mismatches, unknown, "file verification complete");
    if mismatches > 0 || unknown > 0 {
        bail!("verification failed: {mismatches} mismatches, {unknown} unknown records");
    }
    Ok(())
}
