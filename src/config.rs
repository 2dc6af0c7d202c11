//! Capture node configuration.

use std::path::PathBuf;

/// Hard ceiling on the processor drain batch.
pub const MAX_BATCH_CEILING: usize = 256;

/// Configuration for a capture node.
///
/// Defaults size the pipeline for a sustained multi-hundred-k msg/s feed;
/// `output_dir` has no useful default and must be set.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Multicast group to join.
    pub multicast_addr: String,
    /// UDP port. 0 lets the OS pick one (tests use this).
    pub port: u16,
    /// Requested ring slots, rounded up to a power of two.
    pub ring_buffer_size: usize,
    /// Reusable per-receive scratch buffer.
    pub udp_buffer_size: usize,
    /// SO_RCVBUF requested from the kernel.
    pub socket_buffer_size: usize,
    /// Processor drain cap per pass (clamped to `MAX_BATCH_CEILING`).
    pub max_batch_size: usize,
    /// Base directory for per-symbol tick files.
    pub output_dir: PathBuf,
    /// When false, validation skips the checksum comparison.
    pub verify_checksums: bool,
    /// Local bind address for the coordinator channel; empty disables it.
    pub coordinator_address: String,
    /// Peer coordinator addresses to publish to.
    pub peer_addresses: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            multicast_addr: "239.255.0.1".to_string(),
            port: 12345,
            ring_buffer_size: 131_072,
            udp_buffer_size: 262_144,
            socket_buffer_size: 32 * 1024 * 1024,
            max_batch_size: MAX_BATCH_CEILING,
            output_dir: PathBuf::new(),
            verify_checksums: true,
            coordinator_address: String::new(),
            peer_addresses: Vec::new(),
        }
    }
}

impl CaptureConfig {
    /// Clamp the tunables into their supported ranges.
    pub fn normalize(&mut self) {
        self.max_batch_size = self.max_batch_size.clamp(1, MAX_BATCH_CEILING);
        if self.udp_buffer_size < crate::wire::MESSAGE_SIZE {
            self.udp_buffer_size = crate::wire::MESSAGE_SIZE;
        }
    }

    pub fn coordinator_enabled(&self) -> bool {
        !self.coordinator_address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment_profile() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.multicast_addr, "239.255.0.1");
        assert_eq!(cfg.port, 12345);
        assert_eq!(cfg.ring_buffer_size, 131_072);
        assert_eq!(cfg.udp_buffer_size, 262_144);
        assert_eq!(cfg.socket_buffer_size, 33_554_432);
        assert_eq!(cfg.max_batch_size, 256);
        assert!(cfg.verify_checksums);
        assert!(!cfg.coordinator_enabled());
    }

    #[test]
    fn test_normalize_clamps_batch() {
        let mut cfg = CaptureConfig {
            max_batch_size: 4096,
            ..Default::default()
        };
        cfg.normalize();
        assert_eq!(cfg.max_batch_size, MAX_BATCH_CEILING);

        cfg.max_batch_size = 0;
        cfg.normalize();
        assert_eq!(cfg.max_batch_size, 1);
    }
}
