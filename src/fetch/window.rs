//! Windowed reassembly of datagram payload blocks.
//!
//! Blocks can arrive in any order. In-order data is surfaced to the caller
//! immediately; blocks ahead of the frontier are staged (at most
//! [`WINDOW_BLOCKS`], bounding memory) and drained as the frontier reaches
//! them. The bitmap advertised in block requests is derived from the staged
//! offsets, so peers skip blocks we already hold.

use tracing::trace;

/// Maximum out-of-order blocks staged ahead of the in-order frontier.
pub const WINDOW_BLOCKS: usize = 32;

#[derive(Debug)]
struct Staged {
    offset: u64,
    terminal: bool,
    bytes: Vec<u8>,
}

/// Receive window for one in-flight payload transfer.
#[derive(Debug)]
pub struct RecvWindow {
    /// Next in-order byte offset; monotonically non-decreasing.
    start: u64,
    block_len: u16,
    /// Total payload length, known once a terminal block has been seen.
    total: Option<u64>,
    staged: Vec<Staged>,
}

impl RecvWindow {
    pub fn new(start: u64, block_len: u16) -> Self {
        Self { start, block_len: block_len.max(1), total: None, staged: Vec::new() }
    }

    /// Absolute offset of the first byte not yet surfaced in order.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn block_len(&self) -> u16 {
        self.block_len
    }

    /// Known payload length, if a terminal block has arrived.
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Bit *k* set: the block at `start + k * block_len` is already staged.
    pub fn bitmap(&self) -> u32 {
        let mut map = 0u32;
        for s in &self.staged {
            let delta = s.offset - self.start;
            if delta % self.block_len as u64 == 0 {
                let k = delta / self.block_len as u64;
                if k < WINDOW_BLOCKS as u64 {
                    map |= 1 << k;
                }
            }
        }
        map
    }

    /// Absorb one received block.
    ///
    /// Bytes that become in-order (the block itself and any staged
    /// successors it unblocks) are appended to `out`. Returns false when
    /// the block was dropped: stale, misaligned, beyond the window, or a
    /// duplicate of a staged block.
    pub fn absorb(&mut self, offset: u64, bytes: &[u8], terminal: bool, out: &mut Vec<u8>) -> bool {
        if terminal {
            self.total = Some(offset + bytes.len() as u64);
        }
        if offset == self.start {
            out.extend_from_slice(bytes);
            self.start += bytes.len() as u64;
            self.drain(out);
            return true;
        }
        if offset < self.start {
            trace!(offset, start = self.start, "stale block");
            return false;
        }
        // Ahead of the frontier: stage if it lands on a block boundary
        // inside the window.
        let delta = offset - self.start;
        if delta % self.block_len as u64 != 0 || delta / self.block_len as u64 >= WINDOW_BLOCKS as u64
        {
            trace!(offset, start = self.start, "block outside window");
            return false;
        }
        if self.staged.iter().any(|s| s.offset == offset) {
            return false;
        }
        self.staged.push(Staged { offset, terminal, bytes: bytes.to_vec() });
        true
    }

    /// Surface staged blocks that have become in-order.
    fn drain(&mut self, out: &mut Vec<u8>) {
        loop {
            // Anything the frontier has passed is dead weight.
            self.staged.retain(|s| s.offset >= self.start);
            let Some(i) = self.staged.iter().position(|s| s.offset == self.start) else {
                return;
            };
            let s = self.staged.swap_remove(i);
            out.extend_from_slice(&s.bytes);
            self.start += s.bytes.len() as u64;
        }
    }
}
