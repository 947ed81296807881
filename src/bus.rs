//! Overlay bus seam and the datagram wire formats of the fetch protocol.

use crate::types::{BundleId, SubscriberId, BUNDLE_ID_BYTES};
use thiserror::Error;

// =============================================================================
// PORTS
// =============================================================================

/// Overlay port peers listen on for block and manifest requests.
pub const PORT_RHIZOME_REQUEST: u32 = 12;

/// Overlay port content flows back to; requests are sourced from it.
pub const PORT_RHIZOME_RESPONSE: u32 = 13;

/// Fetch traffic never travels more than one hop.
pub const FETCH_TTL: u8 = 1;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("overlay send failed: {0}")]
    Send(String),
}

/// Contract the engine holds against the overlay bus.
pub trait OverlayBus {
    fn send_datagram(
        &self,
        src_port: u32,
        dst: &SubscriberId,
        dst_port: u32,
        ttl: u8,
        bytes: &[u8],
    ) -> Result<(), BusError>;
}

// =============================================================================
// BLOCK REQUEST
// =============================================================================

/// Request for the next window of payload blocks.
///
/// Wire layout, big-endian, 62 bytes total. The id occupies the first field
/// with its region padded to the version offset; the two reserved gaps are
/// transmitted as zero.
///
/// | offset | len | field          |
/// |--------|-----|----------------|
/// | 0      | 32  | bundle id      |
/// | 32     | 8   | version        |
/// | 40     | 8   | window start   |
/// | 48     | 4   | window bitmap  |
/// | 56     | 2   | block length   |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub id: BundleId,
    pub version: u64,
    /// Absolute byte offset of the first outstanding block.
    pub window_start: u64,
    /// Bit *k* set means the block at `window_start + k * block_len` has
    /// already been received out of order.
    pub bitmap: u32,
    pub block_len: u16,
}

impl BlockRequest {
    pub const WIRE_BYTES: usize = 62;

    pub fn encode(&self) -> [u8; Self::WIRE_BYTES] {
        let mut buf = [0u8; Self::WIRE_BYTES];
        buf[..BUNDLE_ID_BYTES].copy_from_slice(&self.id.0);
        buf[32..40].copy_from_slice(&self.version.to_be_bytes());
        buf[40..48].copy_from_slice(&self.window_start.to_be_bytes());
        buf[48..52].copy_from_slice(&self.bitmap.to_be_bytes());
        buf[56..58].copy_from_slice(&self.block_len.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_BYTES {
            return None;
        }
        let mut id = [0u8; BUNDLE_ID_BYTES];
        id.copy_from_slice(&bytes[..BUNDLE_ID_BYTES]);
        Some(Self {
            id: BundleId(id),
            version: u64::from_be_bytes(bytes[32..40].try_into().ok()?),
            window_start: u64::from_be_bytes(bytes[40..48].try_into().ok()?),
            bitmap: u32::from_be_bytes(bytes[48..52].try_into().ok()?),
            block_len: u16::from_be_bytes(bytes[56..58].try_into().ok()?),
        })
    }
}

// =============================================================================
// CONTENT BLOCKS
// =============================================================================

/// Kind marker carried by an inbound content datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Ordinary block; more data follows.
    Partial,
    /// Terminal block; the payload ends at `offset + len`.
    Terminal,
}

impl BlockKind {
    /// `'T'` marks the terminal block; every other marker is ordinary data.
    pub fn from_wire(byte: u8) -> Self {
        if byte == b'T' { Self::Terminal } else { Self::Partial }
    }
}
