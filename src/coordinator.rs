//! Coordinator channel: liveness and throughput fan-out between nodes.
//!
//! Purely observational; it never touches the ingest path. Each node binds
//! a datagram socket, publishes its own status and a once-per-second
//! heartbeat to every configured peer, and tracks the health of peers it
//! hears from. Every message carries the sender identity in the payload, so
//! received status is ascribed to the actual sender.

use std::{
    collections::HashMap,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const HEALTH_HORIZON: Duration = Duration::from_secs(5);

/// The stats triple published once per second.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatsPayload {
    pub received: u64,
    pub processed: u64,
    pub dropped: u64,
}

/// Wire messages on the coordinator channel, tagged by `"type"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoordinatorMessage {
    Status { node: String, stats: StatsPayload },
    Heartbeat { node: String, timestamp: i64 },
}

/// What we know about one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub is_healthy: bool,
    pub last_seen_ms: u64,
    pub stats: Option<StatsPayload>,
}

struct PeerState {
    last_heartbeat: Instant,
    stats: Option<StatsPayload>,
}

/// Coordinator endpoint for one node.
pub struct Coordinator {
    node_id: String,
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    running: Arc<AtomicBool>,
    heartbeat_thread: Mutex<Option<JoinHandle<()>>>,
    message_thread: Mutex<Option<JoinHandle<()>>>,
    nodes: Mutex<HashMap<String, PeerState>>,
    heartbeats_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl Coordinator {
    /// Bind the local endpoint and resolve peers. A bad bind address is
    /// fatal; an unresolvable peer is only a warning, matching a fleet
    /// where nodes come up in any order.
    pub fn new(bind_address: &str, peer_addresses: &[String]) -> Result<Arc<Self>> {
        let bind: SocketAddr = bind_address
            .parse()
            .with_context(|| format!("invalid coordinator address: {bind_address}"))?;
        let socket = UdpSocket::bind(bind)
            .with_context(|| format!("failed to bind coordinator socket {bind}"))?;
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;

        let mut peers = Vec::new();
        for addr in peer_addresses {
            match addr.parse::<SocketAddr>() {
                Ok(a) => peers.push(a),
                Err(e) => warn!(peer = %addr, error = %e, "skipping unparseable peer address"),
            }
        }

        let node_id = socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| bind_address.to_string());

        info!(node = %node_id, peers = peers.len(), "coordinator bound");

        Ok(Arc::new(Self {
            node_id,
            socket,
            peers,
            running: Arc::new(AtomicBool::new(false)),
            heartbeat_thread: Mutex::new(None),
            message_thread: Mutex::new(None),
            nodes: Mutex::new(HashMap::new()),
            heartbeats_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Start the heartbeat and receive threads. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut hb = self.heartbeat_thread.lock();
        if hb.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let coord = Arc::clone(self);
        *hb = Some(
            thread::Builder::new()
                .name("tick-heartbeat".to_string())
                .spawn(move || coord.heartbeat_loop())
                .context("failed to spawn heartbeat thread")?,
        );

        let coord = Arc::clone(self);
        *self.message_thread.lock() = Some(
            thread::Builder::new()
                .name("tick-coord".to_string())
                .spawn(move || coord.message_loop())
                .context("failed to spawn coordinator receive thread")?,
        );

        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.heartbeat_thread.lock().take() {
            let _ = h.join();
        }
        if let Some(h) = self.message_thread.lock().take() {
            let _ = h.join();
        }
    }

    /// Publish this node's stats to every peer.
    pub fn publish_status(&self, stats: StatsPayload) {
        let msg = CoordinatorMessage::Status {
            node: self.node_id.clone(),
            stats,
        };
        self.send_to_peers(&msg);
    }

    pub(crate) fn send_heartbeat(&self) {
        let timestamp = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let msg = CoordinatorMessage::Heartbeat {
            node: self.node_id.clone(),
            timestamp,
        };
        self.send_to_peers(&msg);
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn send_to_peers(&self, msg: &CoordinatorMessage) {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode coordinator message");
                return;
            }
        };
        for peer in &self.peers {
            if let Err(e) = self.socket.send_to(&payload, peer) {
                debug!(peer = %peer, error = %e, "coordinator send failed");
            }
        }
    }

    fn heartbeat_loop(self: Arc<Self>) {
        let mut next = Instant::now();
        while self.running.load(Ordering::Relaxed) {
            self.send_heartbeat();
            next += HEARTBEAT_INTERVAL;
            // Sleep in short steps so stop is honored promptly.
            while self.running.load(Ordering::Relaxed) && Instant::now() < next {
                thread::sleep(POLL_TIMEOUT.min(Duration::from_millis(50)));
            }
        }
    }

    fn message_loop(self: Arc<Self>) {
        let mut buf = [0u8; 64 * 1024];

        while self.running.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    self.messages_received.fetch_add(1, Ordering::Relaxed);
                    match serde_json::from_slice::<CoordinatorMessage>(&buf[..n]) {
                        Ok(msg) => self.note_peer(msg),
                        Err(e) => debug!(from = %from, error = %e, "unparseable coordinator message"),
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        debug!(error = %e, "coordinator receive error");
                    }
                }
            }
        }
    }

    fn note_peer(&self, msg: CoordinatorMessage) {
        let mut nodes = self.nodes.lock();
        match msg {
            CoordinatorMessage::Status { node, stats } => {
                let entry = nodes.entry(node).or_insert(PeerState {
                    last_heartbeat: Instant::now(),
                    stats: None,
                });
                entry.last_heartbeat = Instant::now();
                entry.stats = Some(stats);
            }
            CoordinatorMessage::Heartbeat { node, .. } => {
                let entry = nodes.entry(node).or_insert(PeerState {
                    last_heartbeat: Instant::now(),
                    stats: None,
                });
                entry.last_heartbeat = Instant::now();
            }
        }
    }

    /// Snapshot of every peer heard from, with health derived from the
    /// heartbeat horizon.
    pub fn node_status(&self) -> HashMap<String, PeerStatus> {
        let nodes = self.nodes.lock();
        nodes
            .iter()
            .map(|(id, state)| {
                let age = state.last_heartbeat.elapsed();
                (
                    id.clone(),
                    PeerStatus {
                        is_healthy: age <= HEALTH_HORIZON,
                        last_seen_ms: age.as_millis() as u64,
                        stats: state.stats,
                    },
                )
            })
            .collect()
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg = CoordinatorMessage::Status {
            node: "127.0.0.1:9000".to_string(),
            stats: StatsPayload {
                received: 10,
                processed: 8,
                dropped: 2,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"received\":10"));
        assert!(json.contains("\"processed\":8"));
        assert!(json.contains("\"dropped\":2"));
        assert!(json.contains("\"node\":\"127.0.0.1:9000\""));

        let hb = CoordinatorMessage::Heartbeat {
            node: "n".to_string(),
            timestamp: 123,
        };
        let json = serde_json::to_string(&hb).unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));
        assert!(json.contains("\"timestamp\":123"));
    }

    #[test]
    fn test_status_ascribed_to_sender() {
        let a = Coordinator::new("127.0.0.1:0", &[]).unwrap();
        let a_addr = a.local_addr().unwrap().to_string();
        let b = Coordinator::new("127.0.0.1:0", &[a_addr]).unwrap();

        a.start().unwrap();
        b.publish_status(StatsPayload {
            received: 5,
            processed: 5,
            dropped: 0,
        });

        // Give the datagram a moment to land.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = false;
        while Instant::now() < deadline {
            let status = a.node_status();
            if let Some(peer) = status.get(b.node_id()) {
                assert!(peer.is_healthy);
                assert_eq!(peer.stats.unwrap().received, 5);
                seen = true;
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        a.stop();
        assert!(seen, "peer status never arrived");
    }

    #[test]
    fn test_heartbeat_marks_peer_alive() {
        let a = Coordinator::new("127.0.0.1:0", &[]).unwrap();
        let a_addr = a.local_addr().unwrap().to_string();
        let b = Coordinator::new("127.0.0.1:0", &[a_addr]).unwrap();

        a.start().unwrap();
        b.send_heartbeat();
        assert_eq!(b.heartbeats_sent(), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = false;
        while Instant::now() < deadline {
            if a.node_status().contains_key(b.node_id()) {
                seen = true;
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        a.stop();
        assert!(seen, "heartbeat never arrived");
    }
}
