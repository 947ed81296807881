//! Core identifiers and bundle metadata shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddrV4;
use std::path::PathBuf;

// =============================================================================
// SIZES
// =============================================================================

/// Bundle identifier length in bytes.
pub const BUNDLE_ID_BYTES: usize = 32;

/// Overlay subscriber identifier length in bytes.
pub const SUBSCRIBER_ID_BYTES: usize = 32;

/// Payload hash length in bytes (rendered as 64 hex digits on the wire).
pub const PAYLOAD_HASH_BYTES: usize = 32;

/// Upper bound on a serialized manifest.
/// Used to pick a fetch slot for manifest-by-prefix requests: any queue
/// whose size threshold exceeds this can carry one.
pub const MAX_MANIFEST_BYTES: u64 = 8192;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// 32-byte bundle identifier.
///
/// A nil (all-zero) id never identifies a real bundle; the engine rejects
/// manifests carrying one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleId(pub [u8; BUNDLE_ID_BYTES]);

impl BundleId {
    pub const NIL: BundleId = BundleId([0u8; BUNDLE_ID_BYTES]);

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; BUNDLE_ID_BYTES]
    }

    /// Leading bytes of the id, for prefix matching against datagrams.
    pub fn prefix(&self, len: usize) -> &[u8] {
        &self.0[..len.min(BUNDLE_ID_BYTES)]
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 32-byte content hash of a bundle payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadHash(pub [u8; PAYLOAD_HASH_BYTES]);

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 32-byte overlay subscriber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub [u8; SUBSCRIBER_ID_BYTES]);

impl SubscriberId {
    pub const NIL: SubscriberId = SubscriberId([0u8; SUBSCRIBER_ID_BYTES]);
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// =============================================================================
// MANIFEST AND PEER COORDINATE
// =============================================================================

/// Immutable descriptor of a content bundle.
///
/// Ownership moves into the engine on `suggest`; the engine drops it exactly
/// once: on rejection, on dequeue-for-discard, or after fetch completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: BundleId,
    pub version: u64,
    pub payload_len: u64,
    pub payload_hash: PayloadHash,
    pub ttl: u8,
    /// Self-signed manifests skip signature verification at queue time.
    pub self_signed: bool,
    /// Filesystem location of the fetched payload, attached just before
    /// the bundle is handed to the importer.
    pub payload_path: Option<PathBuf>,
}

impl Manifest {
    pub fn new(id: BundleId, version: u64, payload_len: u64, payload_hash: PayloadHash) -> Self {
        Self {
            id,
            version,
            payload_len,
            payload_hash,
            ttl: 1,
            self_signed: false,
            payload_path: None,
        }
    }
}

/// Where a bundle can be fetched from.
///
/// A stream address enables the request/response transport; the overlay id
/// is always present and enables the datagram transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub stream: Option<SocketAddrV4>,
    pub overlay: SubscriberId,
}

impl PeerAddr {
    pub fn overlay_only(overlay: SubscriberId) -> Self {
        Self { stream: None, overlay }
    }
}
