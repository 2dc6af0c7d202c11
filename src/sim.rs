//! Synthetic market-data feed for benchmarks and soak tests.
//!
//! Publishes sealed trade records at a paced target rate with a per-symbol
//! price random walk. Optionally keeps a sequence-keyed log of everything
//! sent so a benchmark can verify captured files byte-for-byte.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::wire::MarketMessage;

const SEND_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Simulation settings.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Destination address; a multicast group in deployments, a unicast
    /// address in tests.
    pub target_addr: String,
    pub port: u16,
    /// Symbols to simulate (ids 1..=num_symbols).
    pub num_symbols: u32,
    /// Target messages per second.
    pub base_msg_rate: u32,
    /// Trade size range.
    pub min_trade_size: u32,
    pub max_trade_size: u32,
    /// Hard price bounds for the random walk.
    pub min_price: f64,
    pub max_price: f64,
    /// Per-step relative price move bound.
    pub price_volatility: f64,
    /// Keep a log of sent records for post-run verification.
    pub track_messages: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            target_addr: "239.255.0.1".to_string(),
            port: 12345,
            num_symbols: 100,
            base_msg_rate: 1000,
            min_trade_size: 100,
            max_trade_size: 10_000,
            min_price: 50.0,
            max_price: 1000.0,
            price_volatility: 0.0005,
            track_messages: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SimulatorStatsSnapshot {
    pub messages_sent: u64,
    pub send_errors: u64,
}

/// Paced synthetic feed publisher.
pub struct MarketDataSimulator {
    config: SimulatorConfig,
    socket: UdpSocket,
    endpoint: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,

    sequence: AtomicU64,
    messages_sent: AtomicU64,
    send_errors: AtomicU64,
    message_log: Mutex<HashMap<u64, MarketMessage>>,
}

impl MarketDataSimulator {
    pub fn new(config: SimulatorConfig) -> Result<Arc<Self>> {
        let ip: IpAddr = config
            .target_addr
            .parse()
            .with_context(|| format!("invalid target address: {}", config.target_addr))?;
        let endpoint = SocketAddr::new(ip, config.port);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create simulator socket")?;
        socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
        socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
        let socket: UdpSocket = socket.into();

        // Loop sent datagrams back so a capture node on the same host sees
        // the feed.
        if ip.is_multicast() {
            socket.set_multicast_loop_v4(true)?;
        }

        Ok(Arc::new(Self {
            config,
            socket,
            endpoint,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            sequence: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            message_log: Mutex::new(HashMap::new()),
        }))
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.thread.lock();
        if handle.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let sim = Arc::clone(self);
        *handle = Some(
            thread::Builder::new()
                .name("tick-simulator".to_string())
                .spawn(move || sim.run_simulation())
                .context("failed to spawn simulator thread")?,
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> SimulatorStatsSnapshot {
        SimulatorStatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }

    /// A sent record by sequence number (only with `track_messages`).
    pub fn sent_message(&self, sequence: u64) -> Option<MarketMessage> {
        self.message_log.lock().get(&sequence).copied()
    }

    pub fn sent_count(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    fn run_simulation(self: Arc<Self>) {
        let mut rng = rand::thread_rng();

        // Per-symbol price state, seeded into a realistic starting band.
        let mut prices: Vec<f64> = (0..self.config.num_symbols)
            .map(|_| rng.gen_range(100.0..500.0))
            .collect();

        info!(
            rate = self.config.base_msg_rate,
            symbols = self.config.num_symbols,
            target = %self.endpoint,
            "simulator started"
        );

        let interval = Duration::from_nanos(1_000_000_000 / self.config.base_msg_rate.max(1) as u64);
        let mut next_send = Instant::now();
        let mut sent_this_second = 0u64;
        let mut rate_reset = Instant::now() + Duration::from_secs(1);

        while self.running.load(Ordering::Relaxed) {
            let now = Instant::now();

            if now >= rate_reset {
                info!(rate_per_s = sent_this_second, "simulator send rate");
                sent_this_second = 0;
                rate_reset += Duration::from_secs(1);
            }

            if now >= next_send {
                let msg = self.generate_message(&mut rng, &mut prices);
                if self.send_message(&msg) {
                    sent_this_second += 1;
                    next_send += interval;
                } else {
                    // Brief backoff after a send error.
                    next_send += Duration::from_micros(100);
                }
            }

            let now = Instant::now();
            if next_send > now {
                thread::sleep((next_send - now).min(Duration::from_millis(10)));
            }
        }

        info!(total = self.sent_count(), "simulator stopped");
    }

    fn generate_message(&self, rng: &mut impl Rng, prices: &mut [f64]) -> MarketMessage {
        let symbol_id = rng.gen_range(1..=self.config.num_symbols);
        let price = &mut prices[(symbol_id - 1) as usize];

        let step = rng.gen_range(-self.config.price_volatility..=self.config.price_volatility);
        *price = (*price * (1.0 + step)).clamp(self.config.min_price, self.config.max_price);

        let size = rng.gen_range(self.config.min_trade_size..=self.config.max_trade_size);
        let timestamp = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as u64;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        MarketMessage::trade(sequence, timestamp, symbol_id, *price, size)
    }

    fn send_message(&self, msg: &MarketMessage) -> bool {
        if self.config.track_messages {
            self.message_log.lock().insert(msg.sequence_number, *msg);
        }

        match self.socket.send_to(&msg.to_bytes(), self.endpoint) {
            Ok(_) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let errors = self.send_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if errors == 1 || errors % 1000 == 0 {
                    warn!(seq = msg.sequence_number, error = %e, total = errors, "send failed");
                }
                false
            }
        }
    }
}

impl Drop for MarketDataSimulator {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MESSAGE_SIZE;

    #[test]
    fn test_generated_messages_are_sealed_and_valid() {
        let sim = MarketDataSimulator::new(SimulatorConfig {
            target_addr: "127.0.0.1".to_string(),
            port: 9,
            num_symbols: 10,
            ..Default::default()
        })
        .unwrap();

        let mut rng = rand::thread_rng();
        let mut prices = vec![200.0; 10];
        for expected_seq in 1..=50u64 {
            let msg = sim.generate_message(&mut rng, &mut prices);
            assert_eq!(msg.sequence_number, expected_seq);
            assert!(msg.validate(true), "generated record must pass validation");
            assert!(msg.symbol_id >= 1 && msg.symbol_id <= 10);
        }
    }

    #[test]
    fn test_paced_send_reaches_receiver() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let sim = MarketDataSimulator::new(SimulatorConfig {
            target_addr: "127.0.0.1".to_string(),
            port,
            num_symbols: 3,
            base_msg_rate: 2000,
            track_messages: true,
            ..Default::default()
        })
        .unwrap();

        sim.start().unwrap();
        let mut buf = [0u8; MESSAGE_SIZE];
        let n = receiver.recv(&mut buf).unwrap();
        sim.stop();

        assert_eq!(n, MESSAGE_SIZE);
        let msg = MarketMessage::from_bytes(&buf);
        assert!(msg.validate(true));
        assert_eq!(sim.sent_message(msg.sequence_number).unwrap().checksum, msg.checksum);
        assert!(sim.stats().messages_sent >= 1);
    }
}
