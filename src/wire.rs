//! Wire format for market-data records.
//!
//! Fixed 64-byte binary layout, shared verbatim between the multicast feed
//! and the on-disk tick files. Multi-byte fields are host-endian; the format
//! targets homogeneous deployments and replay on a foreign architecture
//! requires a byte-swap pass at ingest.

use std::fmt;

/// Total record size in bytes.
pub const MESSAGE_SIZE: usize = 64;

/// Index of the checksum field when the record is viewed as 16 u32 words.
const CHECKSUM_WORD: usize = 4;

/// Highest valid symbol id; 0 is invalid.
pub const MAX_SYMBOL_ID: u32 = 10_000;

/// Exclusive upper bound for a plausible trade price.
pub const MAX_PRICE: f64 = 1_000_000.0;

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Trade = 1,
    Quote = 2,
    OrderAdd = 3,
    OrderModify = 4,
    OrderCancel = 5,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Trade),
            2 => Some(Self::Quote),
            3 => Some(Self::OrderAdd),
            4 => Some(Self::OrderModify),
            5 => Some(Self::OrderCancel),
            _ => None,
        }
    }
}

/// Trade payload occupying the 32-byte body section.
///
/// Only the first 16 bytes carry data today; the rest is reserved and must
/// be zero so the checksum stays stable.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TradeBody {
    pub price: f64,
    pub size: u32,
    pub flags: u8,
    pub _pad: [u8; 3],
    pub _reserved: [u8; 16],
}

/// A single market-data record (64 bytes, 8-byte aligned).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       8     sequence_number (monotonic, 0 reserved/invalid)
/// 8       8     timestamp (wall-clock ns since epoch)
/// 16      4     checksum (XOR of u32 words 5..16)
/// 20      4     reserved (zero)
/// 24      4     symbol_id (1..=10000 valid)
/// 28      1     kind (MessageType)
/// 29      3     padding (zero)
/// 32      32    body (Trade today)
/// Total: 64 bytes
/// ```
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy)]
pub struct MarketMessage {
    pub sequence_number: u64,
    pub timestamp: u64,
    pub checksum: u32,
    pub reserved: u32,
    pub symbol_id: u32,
    pub kind: u8,
    pub _pad: [u8; 3],
    pub trade: TradeBody,
}

// Layout is load-bearing: wire strides and disk readers assume exactly this.
const _: () = assert!(std::mem::size_of::<MarketMessage>() == MESSAGE_SIZE);
const _: () = assert!(std::mem::align_of::<MarketMessage>() == 8);
const _: () = assert!(std::mem::size_of::<TradeBody>() == 32);

impl Default for MarketMessage {
    fn default() -> Self {
        Self {
            sequence_number: 0,
            timestamp: 0,
            checksum: 0,
            reserved: 0,
            symbol_id: 0,
            kind: MessageType::Trade as u8,
            _pad: [0; 3],
            trade: TradeBody::default(),
        }
    }
}

impl MarketMessage {
    /// Build a sealed trade record.
    pub fn trade(
        sequence_number: u64,
        timestamp: u64,
        symbol_id: u32,
        price: f64,
        size: u32,
    ) -> Self {
        let mut msg = Self {
            sequence_number,
            timestamp,
            symbol_id,
            ..Self::default()
        };
        msg.trade.price = price;
        msg.trade.size = size;
        msg.seal();
        msg
    }

    /// Message type, if the discriminator byte is known.
    #[inline]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.kind)
    }

    /// XOR of every 32-bit word after the checksum field (words 5..16:
    /// reserved, symbol_id, kind+padding, body).
    pub fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        let mut sum = 0u32;
        for word in (CHECKSUM_WORD + 1)..(MESSAGE_SIZE / 4) {
            let off = word * 4;
            sum ^= u32::from_ne_bytes(bytes[off..off + 4].try_into().unwrap());
        }
        sum
    }

    /// Compute and store the checksum before send.
    #[inline]
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    #[inline]
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Full validity check: field ranges plus (optionally) the checksum.
    ///
    /// Records failing this never reach storage and never advance the
    /// processor's last-sequence tracker.
    pub fn validate(&self, verify_checksum: bool) -> bool {
        if self.sequence_number == 0
            || self.symbol_id == 0
            || self.symbol_id > MAX_SYMBOL_ID
            || self.message_type() != Some(MessageType::Trade)
            || self.trade.price <= 0.0
            || self.trade.price >= MAX_PRICE
            || self.trade.size == 0
        {
            return false;
        }
        !verify_checksum || self.verify_checksum()
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        let ptr = self as *const Self as *const u8;
        // SAFETY: MarketMessage is repr(C) with no uninitialized padding
        // (all pad bytes are explicit fields) and exactly MESSAGE_SIZE bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), MESSAGE_SIZE);
        }
        buf
    }

    /// Deserialize from a 64-byte buffer at any alignment.
    pub fn from_bytes(buf: &[u8; MESSAGE_SIZE]) -> Self {
        // SAFETY: any 64-byte pattern is a valid MarketMessage value; the
        // kind byte is range-checked lazily via message_type().
        unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const Self) }
    }

    /// Deserialize from a slice, rejecting wrong lengths.
    pub fn try_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let bytes: &[u8; MESSAGE_SIZE] = buf
            .try_into()
            .map_err(|_| WireError::InvalidLength(buf.len()))?;
        Ok(Self::from_bytes(bytes))
    }
}

/// Errors during wire decoding.
#[derive(Debug, Clone)]
pub enum WireError {
    InvalidLength(usize),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength(n) => {
                write!(f, "invalid record length: {} (expected {})", n, MESSAGE_SIZE)
            }
        }
    }
}

impl std::error::Error for WireError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64, symbol: u32) -> MarketMessage {
        MarketMessage::trade(seq, 1_700_000_000_000_000_000, symbol, 123.45, 500)
    }

    #[test]
    fn test_roundtrip() {
        let msg = sample(42, 7);
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), MESSAGE_SIZE);

        let restored = MarketMessage::try_from_slice(&bytes).unwrap();
        assert_eq!(restored.sequence_number, 42);
        assert_eq!(restored.symbol_id, 7);
        assert_eq!(restored.trade.price, 123.45);
        assert_eq!(restored.trade.size, 500);
        assert!(restored.validate(true));
    }

    #[test]
    fn test_seal_then_validate() {
        let mut msg = sample(1, 1);
        msg.trade.price = 999.99;
        msg.seal();
        assert!(msg.validate(true));

        // Sealing twice must be stable.
        let sealed = msg.checksum;
        msg.seal();
        assert_eq!(msg.checksum, sealed);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let msg = sample(5, 9);
        let mut bytes = msg.to_bytes();
        bytes[40] ^= 0xFF; // flip a byte inside the body
        let corrupted = MarketMessage::from_bytes(&bytes);
        assert!(!corrupted.verify_checksum());
        assert!(!corrupted.validate(true));
        // Range checks alone still pass, only the checksum catches this.
        assert!(corrupted.validate(false));
    }

    #[test]
    fn test_checksum_excludes_header_words() {
        // Words before the checksum field do not participate.
        let mut a = sample(1, 3);
        let mut b = sample(2, 3);
        b.timestamp = a.timestamp.wrapping_add(12345);
        a.seal();
        b.seal();
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_symbol_id_bounds() {
        assert!(sample(1, 1).validate(true));
        assert!(sample(1, MAX_SYMBOL_ID).validate(true));
        assert!(!sample(1, MAX_SYMBOL_ID + 1).validate(true));
        assert!(!sample(1, 0).validate(true));
    }

    #[test]
    fn test_rejects_zero_sequence_and_bad_fields() {
        assert!(!sample(0, 1).validate(true));

        let mut msg = sample(1, 1);
        msg.trade.size = 0;
        msg.seal();
        assert!(!msg.validate(true));

        let mut msg = sample(1, 1);
        msg.trade.price = 0.0;
        msg.seal();
        assert!(!msg.validate(true));

        let mut msg = sample(1, 1);
        msg.trade.price = MAX_PRICE;
        msg.seal();
        assert!(!msg.validate(true));
    }

    #[test]
    fn test_non_trade_types_rejected() {
        let mut msg = sample(1, 1);
        msg.kind = MessageType::Quote as u8;
        msg.seal();
        assert!(!msg.validate(true));

        msg.kind = 99;
        msg.seal();
        assert!(!msg.validate(true));
        assert!(msg.message_type().is_none());
    }

    #[test]
    fn test_wrong_length_rejected() {
        let msg = sample(1, 1);
        let bytes = msg.to_bytes();
        assert!(MarketMessage::try_from_slice(&bytes[..32]).is_err());
    }
}
