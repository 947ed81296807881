//! Time-bounded suppression of manifests from misbehaving peers.
//!
//! When a peer supplies a manifest that fails verification, its bundle id
//! is remembered here so the engine does not waste effort re-examining the
//! same bad advertisement on every packet.

use crate::types::{BundleId, PeerAddr};
use rand::Rng;
use tracing::debug;

/// 64 bins × 8 ways; bounded memory regardless of how many bad manifests a
/// hostile peer advertises.
const BINS: usize = 64;
const WAYS: usize = 8;

#[derive(Clone)]
struct Entry {
    id: BundleId,
    /// Peer that supplied the bad manifest, kept for diagnostics.
    peer: PeerAddr,
    expires_at_ms: u64,
}

/// Cache of recently rejected bundle ids.
pub struct IgnoreCache {
    bins: Vec<Vec<Option<Entry>>>,
}

impl IgnoreCache {
    pub fn new() -> Self {
        Self { bins: vec![vec![None; WAYS]; BINS] }
    }

    /// Bin index: top six bits of the first id byte.
    fn bin(id: &BundleId) -> usize {
        (id.0[0] >> 2) as usize
    }

    /// Whether this id is currently suppressed.
    pub fn check(&self, id: &BundleId, now_ms: u64) -> bool {
        self.bins[Self::bin(id)]
            .iter()
            .flatten()
            .any(|e| e.id == *id && e.expires_at_ms > now_ms)
    }

    /// Suppress this id for `ttl_ms`, refreshing an existing entry or
    /// displacing a uniformly random way.
    pub fn remember<R: Rng>(
        &mut self,
        id: &BundleId,
        peer: &PeerAddr,
        ttl_ms: u64,
        now_ms: u64,
        rng: &mut R,
    ) {
        debug!(id = %id, ttl_ms, "ignoring bundle");
        let bin = &mut self.bins[Self::bin(id)];
        let way = match bin.iter().position(|e| e.as_ref().is_some_and(|e| e.id == *id)) {
            Some(i) => i,
            None => match bin.iter().position(Option::is_none) {
                Some(i) => i,
                None => rng.gen_range(0..WAYS),
            },
        };
        bin[way] = Some(Entry { id: *id, peer: *peer, expires_at_ms: now_ms + ttl_ms });
    }

    /// Peer that supplied the suppressed manifest, while the entry lives.
    pub fn source_of(&self, id: &BundleId, now_ms: u64) -> Option<PeerAddr> {
        self.bins[Self::bin(id)]
            .iter()
            .flatten()
            .find(|e| e.id == *id && e.expires_at_ms > now_ms)
            .map(|e| e.peer)
    }
}

impl Default for IgnoreCache {
    fn default() -> Self {
        Self::new()
    }
}
