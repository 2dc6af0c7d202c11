//! Multicast capture stage.
//!
//! Owns the UDP socket joined to the feed group and the dedicated capture
//! thread. Datagrams are parsed in 64-byte strides; valid records are
//! pushed into the SPSC ring for the processor, everything else is counted
//! and discarded here so the hot path never allocates or blocks.

use std::{
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::{
    config::CaptureConfig,
    ring::RingBuffer,
    wire::{MarketMessage, MESSAGE_SIZE},
};

/// Receive timeout; bounds how long a stop request can go unobserved when
/// the feed is silent.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Log cadence for high-rate drop/invalid/error events.
const LOG_EVERY: u64 = 10_000;

/// Capture-side counters.
///
/// Written only by the capture thread; read anywhere. A snapshot is
/// eventually consistent: the fields are independent atomics, not a
/// transaction.
#[derive(Debug, Default)]
pub struct CaptureStats {
    /// Records observed on the wire (complete strides plus truncated tails).
    pub messages_received: AtomicU64,
    /// Valid records rejected because the ring was full.
    pub messages_dropped: AtomicU64,
    /// Records failing range or checksum validation, and truncated tails.
    pub messages_invalid: AtomicU64,
    /// Subset of invalid: records whose only defect was the checksum.
    pub checksum_errors: AtomicU64,
    pub bytes_received: AtomicU64,
    pub recv_errors: AtomicU64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_invalid: self.messages_invalid.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CaptureStatsSnapshot {
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub messages_invalid: u64,
    pub checksum_errors: u64,
    pub bytes_received: u64,
    pub recv_errors: u64,
}

/// The capture stage: socket + capture thread + counters.
pub struct PacketCapture {
    config: CaptureConfig,
    socket: UdpSocket,
    ring: Arc<RingBuffer<MarketMessage>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<CaptureStats>,
}

impl PacketCapture {
    /// Bind and configure the multicast socket. Fails fast on an invalid
    /// group address, bind failure, or join failure, all fatal at startup.
    pub fn new(config: CaptureConfig, ring: Arc<RingBuffer<MarketMessage>>) -> Result<Arc<Self>> {
        let socket = Self::setup_socket(&config)?;

        Ok(Arc::new(Self {
            config,
            socket,
            ring,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            stats: Arc::new(CaptureStats::default()),
        }))
    }

    fn setup_socket(config: &CaptureConfig) -> Result<UdpSocket> {
        let group: Ipv4Addr = config
            .multicast_addr
            .parse()
            .with_context(|| format!("invalid multicast address: {}", config.multicast_addr))?;
        if !group.is_multicast() {
            bail!("not a multicast address: {group}");
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create UDP socket")?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(config.socket_buffer_size)?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("failed to join multicast group {group}"))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        // The kernel may silently cap SO_RCVBUF; log what we actually got.
        let effective = socket.recv_buffer_size().unwrap_or(0);
        info!(
            requested = config.socket_buffer_size,
            effective, "capture socket receive buffer"
        );

        Ok(socket.into())
    }

    /// Port the socket actually bound (useful with `port = 0`).
    pub fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.port)
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the capture thread. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.thread.lock();
        if handle.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);

        let capture = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("tick-capture".to_string())
            .spawn(move || capture.capture_loop())
            .context("failed to spawn capture thread")?;

        *handle = Some(thread);
        info!(port = self.local_port(), group = %self.config.multicast_addr, "capture started");
        Ok(())
    }

    /// Stop and join the capture thread. The receive timeout bounds how
    /// long the thread can stay blocked after the flag flips.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn capture_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; self.config.udp_buffer_size];

        while self.running.load(Ordering::Relaxed) {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    self.ingest_datagram(&buf[..n]);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    // Idle feed; loop to re-check the stop flag.
                }
                Err(e) => {
                    // During shutdown the socket error is expected and silent.
                    if !self.running.load(Ordering::Relaxed) {
                        break;
                    }
                    let errors = self.stats.recv_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors == 1 || errors % LOG_EVERY == 0 {
                        warn!(error = %e, total = errors, "socket receive error");
                    }
                }
            }
        }

        debug!("capture loop exited");
    }

    /// Parse one datagram: 64-byte strides, validate, enqueue. Residual
    /// bytes at the tail are discarded and counted as one invalid record.
    pub(crate) fn ingest_datagram(&self, data: &[u8]) {
        let mut offset = 0;

        while offset + MESSAGE_SIZE <= data.len() {
            let bytes: &[u8; MESSAGE_SIZE] =
                data[offset..offset + MESSAGE_SIZE].try_into().unwrap();
            let msg = MarketMessage::from_bytes(bytes);
            offset += MESSAGE_SIZE;

            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

            if !msg.validate(false) {
                let invalid = self.stats.messages_invalid.fetch_add(1, Ordering::Relaxed) + 1;
                if invalid % LOG_EVERY == 0 {
                    debug!(
                        seq = msg.sequence_number,
                        symbol = msg.symbol_id,
                        total = invalid,
                        "invalid record"
                    );
                }
                continue;
            }
            if self.config.verify_checksums && !msg.verify_checksum() {
                self.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
                self.stats.messages_invalid.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if !self.ring.try_push(msg) {
                let dropped = self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % LOG_EVERY == 0 {
                    warn!(total = dropped, "ring buffer full, dropping records");
                }
            }
        }

        if offset < data.len() {
            // Truncated tail: not a decodable record.
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            self.stats.messages_invalid.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for PacketCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_capture(ring_size: usize, verify_checksums: bool) -> Arc<PacketCapture> {
        let config = CaptureConfig {
            port: 0,
            ring_buffer_size: ring_size,
            verify_checksums,
            ..Default::default()
        };
        let ring = Arc::new(RingBuffer::new(ring_size));
        PacketCapture::new(config, ring).unwrap()
    }

    fn sealed(seq: u64, symbol: u32) -> MarketMessage {
        MarketMessage::trade(seq, 1_700_000_000_000_000_000, symbol, 100.0, 10)
    }

    #[test]
    fn test_valid_records_are_enqueued() {
        let capture = test_capture(64, true);

        let mut datagram = Vec::new();
        for seq in 1..=3u64 {
            datagram.extend_from_slice(&sealed(seq, 7).to_bytes());
        }
        capture.ingest_datagram(&datagram);

        let snap = capture.stats().snapshot();
        assert_eq!(snap.messages_received, 3);
        assert_eq!(snap.messages_invalid, 0);
        assert_eq!(snap.messages_dropped, 0);
        assert_eq!(capture.ring.len(), 3);
        assert_eq!(capture.ring.try_pop().unwrap().sequence_number, 1);
    }

    #[test]
    fn test_invalid_record_counted_and_discarded() {
        let capture = test_capture(64, true);

        let mut datagram = Vec::new();
        datagram.extend_from_slice(&sealed(42, 1).to_bytes());
        datagram.extend_from_slice(&sealed(43, 0).to_bytes()); // symbol_id 0
        datagram.extend_from_slice(&sealed(44, 1).to_bytes());
        capture.ingest_datagram(&datagram);

        let snap = capture.stats().snapshot();
        assert_eq!(snap.messages_received, 3);
        assert_eq!(snap.messages_invalid, 1);
        assert_eq!(capture.ring.len(), 2);
    }

    #[test]
    fn test_checksum_error_counted_separately() {
        let capture = test_capture(64, true);

        let mut msg = sealed(1, 1);
        msg.checksum ^= 0xDEAD_BEEF;
        capture.ingest_datagram(&msg.to_bytes());

        let snap = capture.stats().snapshot();
        assert_eq!(snap.messages_invalid, 1);
        assert_eq!(snap.checksum_errors, 1);
        assert!(capture.ring.is_empty());
    }

    #[test]
    fn test_checksum_skipped_when_disabled() {
        let capture = test_capture(64, false);

        let mut msg = sealed(1, 1);
        msg.checksum ^= 0xDEAD_BEEF;
        capture.ingest_datagram(&msg.to_bytes());

        let snap = capture.stats().snapshot();
        assert_eq!(snap.messages_invalid, 0);
        assert_eq!(snap.checksum_errors, 0);
        assert_eq!(capture.ring.len(), 1);
    }

    #[test]
    fn test_residual_bytes_counted_invalid() {
        let capture = test_capture(64, true);

        let mut datagram = Vec::new();
        datagram.extend_from_slice(&sealed(1, 1).to_bytes());
        datagram.extend_from_slice(&[0xAB; 17]); // trailing garbage
        capture.ingest_datagram(&datagram);

        let snap = capture.stats().snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.messages_invalid, 1);
        assert_eq!(capture.ring.len(), 1);
    }

    #[test]
    fn test_overflow_counts_drops() {
        // 8 slots -> 7 usable.
        let capture = test_capture(8, true);

        let mut datagram = Vec::new();
        for seq in 1..=20u64 {
            datagram.extend_from_slice(&sealed(seq, 1).to_bytes());
        }
        capture.ingest_datagram(&datagram);

        let snap = capture.stats().snapshot();
        assert_eq!(snap.messages_received, 20);
        assert_eq!(snap.messages_dropped, 13);
        assert_eq!(capture.ring.len(), 7);
        assert_eq!(capture.ring.push_failures(), 13);
    }

    #[test]
    fn test_backpressure_with_paused_consumer() {
        // Nothing drains the ring here, so pushes past capacity-1 must be
        // rejected without corrupting what made it in.
        let capture = test_capture(1024, true);

        let mut datagram = Vec::new();
        for seq in 1..=4096u64 {
            datagram.extend_from_slice(&sealed(seq, 1).to_bytes());
            if datagram.len() >= 64 * 256 {
                capture.ingest_datagram(&datagram);
                datagram.clear();
            }
        }
        if !datagram.is_empty() {
            capture.ingest_datagram(&datagram);
        }

        let snap = capture.stats().snapshot();
        assert_eq!(snap.messages_received, 4096);
        assert!(snap.messages_dropped >= 3072);
        assert!(snap.messages_received - snap.messages_dropped <= 1023);

        // Resume draining: everything buffered is intact and in order.
        let mut expected = 1u64;
        while let Some(msg) = capture.ring.try_pop() {
            assert_eq!(msg.sequence_number, expected);
            assert!(msg.validate(true));
            expected += 1;
        }
        assert_eq!(expected - 1, 1023);
    }

    #[test]
    fn test_rejects_non_multicast_address() {
        let config = CaptureConfig {
            multicast_addr: "192.168.1.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let ring = Arc::new(RingBuffer::new(16));
        assert!(PacketCapture::new(config, ring).is_err());
    }
}
