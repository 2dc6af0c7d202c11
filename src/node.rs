//! Capture node: wiring and lifecycle for the ingest pipeline.
//!
//! One node owns the ring buffer, the capture stage, the storage stage and
//! (optionally) a coordinator endpoint, plus the processor and status
//! threads. Threads start capture -> processor -> status publisher and stop
//! in reverse, with capture unblocked first so the processor can drain the
//! ring before exiting.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::{
    capture::{CaptureStatsSnapshot, PacketCapture},
    config::CaptureConfig,
    coordinator::{Coordinator, StatsPayload},
    ring::RingBuffer,
    storage::{StorageError, StorageStatsSnapshot, TickStorage},
    wire::MarketMessage,
};

/// Records drained per processor pass (further capped by `max_batch_size`).
const DRAIN_BATCH: usize = 32;

/// Backoff when the ring is empty; trades a little tail latency for CPU.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Cadence of the status publisher.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Step size for interruptible sleeps in the status loop.
const STATUS_TICK: Duration = Duration::from_millis(50);

/// Aggregate node statistics, combined from the independent per-stage
/// counters. Not a linearizable snapshot.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct NodeStatsSnapshot {
    #[serde(flatten)]
    pub capture: CaptureStatsSnapshot,
    pub messages_processed: u64,
    pub messages_duplicate: u64,
    pub gaps_detected: u64,
    pub last_sequence: u64,
    pub in_ring: u64,
    pub storage: StorageStatsSnapshot,
}

/// The capture node supervisor.
pub struct CaptureNode {
    config: CaptureConfig,
    ring: Arc<RingBuffer<MarketMessage>>,
    capture: Arc<PacketCapture>,
    storage: Arc<TickStorage>,
    coordinator: Option<Arc<Coordinator>>,

    running: Arc<AtomicBool>,
    /// Set only after capture has fully stopped, so the processor never
    /// exits while records can still arrive in the ring.
    stop_processing: AtomicBool,
    process_thread: Mutex<Option<JoinHandle<()>>>,
    status_thread: Mutex<Option<JoinHandle<()>>>,

    messages_processed: AtomicU64,
    messages_duplicate: AtomicU64,
    gaps_detected: AtomicU64,
    last_sequence: AtomicU64,
}

impl CaptureNode {
    /// Construct the pipeline. All resources with fatal failure modes
    /// (socket, output directory, coordinator bind) are acquired here so a
    /// misconfigured node never half-starts.
    pub fn new(mut config: CaptureConfig) -> Result<Arc<Self>> {
        config.normalize();
        if config.output_dir.as_os_str().is_empty() {
            bail!("output_dir is required");
        }

        let ring = Arc::new(RingBuffer::new(config.ring_buffer_size));
        let capture = PacketCapture::new(config.clone(), Arc::clone(&ring))?;
        let storage = Arc::new(TickStorage::new(&config.output_dir)?);

        let coordinator = if config.coordinator_enabled() {
            Some(Coordinator::new(
                &config.coordinator_address,
                &config.peer_addresses,
            )?)
        } else {
            None
        };

        Ok(Arc::new(Self {
            config,
            ring,
            capture,
            storage,
            coordinator,
            running: Arc::new(AtomicBool::new(false)),
            stop_processing: AtomicBool::new(false),
            process_thread: Mutex::new(None),
            status_thread: Mutex::new(None),
            messages_processed: AtomicU64::new(0),
            messages_duplicate: AtomicU64::new(0),
            gaps_detected: AtomicU64::new(0),
            last_sequence: AtomicU64::new(0),
        }))
    }

    /// Port the capture socket bound (useful with `port = 0`).
    pub fn local_port(&self) -> u16 {
        self.capture.local_port()
    }

    pub fn storage(&self) -> &TickStorage {
        &self.storage
    }

    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start capture, processor and status publisher, in that order.
    /// Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_processing.store(false, Ordering::SeqCst);

        self.capture.start()?;
        if let Some(coord) = &self.coordinator {
            coord.start()?;
        }

        let node = Arc::clone(self);
        *self.process_thread.lock() = Some(
            thread::Builder::new()
                .name("tick-processor".to_string())
                .spawn(move || node.process_loop())?,
        );

        let node = Arc::clone(self);
        *self.status_thread.lock() = Some(
            thread::Builder::new()
                .name("tick-status".to_string())
                .spawn(move || node.status_loop())?,
        );

        info!(
            port = self.local_port(),
            output_dir = %self.config.output_dir.display(),
            ring_capacity = self.ring.capacity(),
            "capture node started"
        );
        Ok(())
    }

    /// Stop in reverse order: unblock capture first, let the processor
    /// drain the ring, stop the publisher, then flush storage. No-op while
    /// already stopped.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Capture joins first; only then may the processor treat an empty
        // ring as fully drained.
        self.capture.stop();
        self.stop_processing.store(true, Ordering::SeqCst);

        if let Some(h) = self.process_thread.lock().take() {
            let _ = h.join();
        }
        if let Some(h) = self.status_thread.lock().take() {
            let _ = h.join();
        }
        if let Some(coord) = &self.coordinator {
            coord.stop();
        }

        self.storage.flush();

        let stats = self.stats();
        info!(
            processed = stats.messages_processed,
            dropped = stats.capture.messages_dropped,
            invalid = stats.capture.messages_invalid,
            gaps = stats.gaps_detected,
            "capture node stopped"
        );
    }

    fn process_loop(self: Arc<Self>) {
        let batch_size = DRAIN_BATCH.min(self.config.max_batch_size);
        let mut batch: Vec<MarketMessage> = Vec::with_capacity(batch_size);

        loop {
            let drained = self.ring.pop_bulk(&mut batch, batch_size);

            if drained > 0 {
                for msg in batch.drain(..) {
                    self.handle_record(&msg);
                }
            } else {
                // stop_processing flips only after the capture thread has
                // joined, so empty-here means fully drained.
                if self.stop_processing.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(IDLE_SLEEP);
            }
        }
    }

    /// Per-record processing: duplicate suppression, gap detection,
    /// dispatch to storage. Must never reorder records.
    fn handle_record(&self, msg: &MarketMessage) {
        let last = self.last_sequence.load(Ordering::Relaxed);

        if last > 0 && msg.sequence_number <= last {
            // Re-delivered record; it already has its one copy on disk.
            self.messages_duplicate.fetch_add(1, Ordering::Relaxed);
            self.messages_processed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if last > 0 && msg.sequence_number > last + 1 {
            self.gaps_detected.fetch_add(1, Ordering::Relaxed);
            info!(
                from = last,
                to = msg.sequence_number,
                missing = msg.sequence_number - last - 1,
                "sequence gap detected"
            );
        }
        self.last_sequence
            .store(msg.sequence_number, Ordering::Relaxed);

        match self.storage.store(msg) {
            Ok(()) => {}
            Err(StorageError::InvalidSymbolId(id)) => {
                // Capture validation is the only gate in front of storage.
                panic!("symbol_id {id} escaped capture validation");
            }
            Err(StorageError::Io(_)) => {
                // Counted and logged by storage; a single bad write must
                // not take down a running capture.
            }
        }
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn status_loop(self: Arc<Self>) {
        let mut last_processed = 0u64;
        let mut next_report = Instant::now() + REPORT_INTERVAL;

        while self.running.load(Ordering::Relaxed) {
            thread::sleep(STATUS_TICK);
            if Instant::now() < next_report {
                continue;
            }
            next_report += REPORT_INTERVAL;

            let stats = self.stats();
            let rate = stats.messages_processed.saturating_sub(last_processed);
            last_processed = stats.messages_processed;

            info!(
                received = stats.capture.messages_received,
                processed = stats.messages_processed,
                dropped = stats.capture.messages_dropped,
                invalid = stats.capture.messages_invalid,
                duplicate = stats.messages_duplicate,
                gaps = stats.gaps_detected,
                in_ring = stats.in_ring,
                rate_per_s = rate,
                "status"
            );

            if let Some(coord) = &self.coordinator {
                coord.publish_status(StatsPayload {
                    received: stats.capture.messages_received,
                    processed: stats.messages_processed,
                    dropped: stats.capture.messages_dropped,
                });
            }
        }
    }

    /// Eventually-consistent aggregate of all pipeline counters.
    pub fn stats(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            capture: self.capture.stats().snapshot(),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_duplicate: self.messages_duplicate.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
            in_ring: self.ring.len() as u64,
            storage: self.storage.stats(),
        }
    }
}

impl Drop for CaptureNode {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            error!("capture node dropped while running; stopping");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MESSAGE_SIZE;
    use tempfile::tempdir;

    fn test_node(dir: &std::path::Path) -> Arc<CaptureNode> {
        let config = CaptureConfig {
            port: 0,
            ring_buffer_size: 1024,
            output_dir: dir.to_path_buf(),
            ..Default::default()
        };
        CaptureNode::new(config).unwrap()
    }

    fn sealed(seq: u64, symbol: u32) -> MarketMessage {
        MarketMessage::trade(seq, 1_700_000_000_000_000_000, symbol, 99.5, 10)
    }

    #[test]
    fn test_requires_output_dir() {
        let config = CaptureConfig {
            port: 0,
            ..Default::default()
        };
        assert!(CaptureNode::new(config).is_err());
    }

    #[test]
    fn test_gap_detection_counts_once_per_gap() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());

        for seq in [1u64, 2, 3, 7, 8] {
            node.handle_record(&sealed(seq, 1));
        }

        let stats = node.stats();
        assert_eq!(stats.gaps_detected, 1);
        assert_eq!(stats.messages_processed, 5);
        assert_eq!(stats.messages_duplicate, 0);
        assert_eq!(stats.last_sequence, 8);
        assert_eq!(stats.storage.messages_stored, 5);
    }

    #[test]
    fn test_duplicates_stored_exactly_once() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());

        for seq in [1u64, 2, 2, 3, 1] {
            node.handle_record(&sealed(seq, 4));
        }
        node.storage.flush();

        let stats = node.stats();
        assert_eq!(stats.messages_processed, 5);
        assert_eq!(stats.messages_duplicate, 2);
        assert_eq!(stats.storage.messages_stored, 3);

        let data = std::fs::read(dir.path().join("4.tick")).unwrap();
        assert_eq!(data.len(), 3 * MESSAGE_SIZE);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());

        node.start().unwrap();
        node.start().unwrap();
        assert!(node.is_running());
        assert!(node.local_port() > 0);

        node.stop();
        node.stop();
        assert!(!node.is_running());
    }

    #[test]
    #[should_panic(expected = "escaped capture validation")]
    fn test_out_of_range_symbol_is_fatal() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        node.handle_record(&sealed(1, 0));
    }
}
