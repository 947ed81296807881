//! Fetch slot state machine and dispatcher.
//!
//! One engine owns the size-classed candidate queues, one active fetch slot
//! per queue, and the caches that keep duplicate work off the wire. The
//! embedder drives it: readiness on a slot's stream arrives via
//! [`FetchEngine::on_stream_ready`], overlay content via
//! [`FetchEngine::on_datagram_content`], and due timers via
//! [`FetchEngine::on_alarm`], with the next deadline read back out of
//! [`FetchEngine::next_alarm`]. All times are monotonic milliseconds
//! supplied by the caller.

use crate::bus::{
    BlockKind, BlockRequest, OverlayBus, FETCH_TTL, PORT_RHIZOME_REQUEST, PORT_RHIZOME_RESPONSE,
};
use crate::config::FetchConfig;
use crate::fetch::http;
use crate::fetch::ignore::IgnoreCache;
use crate::fetch::queue::{self, Candidate, FetchQueue, DEFAULT_PRIORITY};
use crate::fetch::version_cache::{VersionCache, VersionLookup};
use crate::fetch::window::RecvWindow;
use crate::link::{StreamConnector, StreamLink};
use crate::store::{Store, StoreError};
use crate::types::{BundleId, Manifest, PeerAddr, SubscriberId, MAX_MANIFEST_BYTES};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Response headers larger than this are treated as malformed.
const RESPONSE_HEAD_MAX: usize = 1024;

/// Body read chunk size.
const READ_CHUNK: usize = 8192;

// =============================================================================
// OUTCOMES AND ERRORS
// =============================================================================

/// Result of offering a manifest to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suggestion {
    /// Accepted into a candidate queue; a fetch will begin after the
    /// activation delay.
    Queued,
    /// Nothing to fetch (nil payload or payload already stored); the bundle
    /// was imported immediately.
    Imported,
    /// The store already holds this version or newer.
    Superseded,
    /// An equal-or-newer candidate for the same bundle is already queued.
    Duplicate,
    /// Every usable queue position is taken by candidates of equal or
    /// higher priority.
    QueueFull,
    /// The bundle id is currently suppressed by the ignore cache.
    Ignored,
}

/// Result of asking for a manifest by id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Started,
    /// No suitable fetch slot is idle.
    SlotBusy,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("manifest has nil bundle id")]
    NilId,
    #[error("manifest prefix length {0} out of range 1..=32")]
    BadPrefix(usize),
    #[error("import directory unusable: {0}")]
    ImportDir(io::Error),
    #[error("scratch file error: {0}")]
    Scratch(io::Error),
    #[error("manifest failed verification")]
    Verify(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// SLOTS
// =============================================================================

/// Lifecycle of one fetch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Stream connect in flight.
    Connecting,
    /// Writing the request bytes.
    SendingRequest,
    /// Accumulating response headers.
    ReceivingHeaders,
    /// Streaming the body into the scratch file.
    ReceivingBody,
    /// Datagram transport: block-request loop with windowed reception.
    ReceivingBodyDatagram,
}

/// What a slot is fetching.
#[derive(Debug, Clone)]
enum FetchTarget {
    /// A bundle payload; the manifest rides in `Slot::manifest`.
    Payload { id: BundleId, version: u64 },
    /// A manifest identified by an id prefix.
    ManifestPrefix { prefix: Vec<u8> },
}

struct Slot {
    state: SlotState,
    target: Option<FetchTarget>,
    manifest: Option<Manifest>,
    peer: PeerAddr,
    link: Option<Box<dyn StreamLink>>,
    file: Option<File>,
    path: Option<PathBuf>,
    /// Expected payload length; `None` while unknown (datagram transport
    /// before the terminal block).
    file_len: Option<u64>,
    /// Bytes written so far; monotonically non-decreasing.
    file_ofs: u64,
    request: Vec<u8>,
    request_ofs: usize,
    head_buf: Vec<u8>,
    window: Option<RecvWindow>,
    last_rx_ms: u64,
    idle_timeout_ms: u64,
    /// The slot's single pending alarm deadline.
    alarm_ms: Option<u64>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            state: SlotState::Free,
            target: None,
            manifest: None,
            peer: PeerAddr::overlay_only(SubscriberId::NIL),
            link: None,
            file: None,
            path: None,
            file_len: None,
            file_ofs: 0,
            request: Vec::new(),
            request_ofs: 0,
            head_buf: Vec::new(),
            window: None,
            last_rx_ms: 0,
            idle_timeout_ms: 0,
            alarm_ms: None,
        }
    }

    fn is_free(&self) -> bool {
        self.state == SlotState::Free
    }

    fn in_stream_state(&self) -> bool {
        matches!(
            self.state,
            SlotState::Connecting
                | SlotState::SendingRequest
                | SlotState::ReceivingHeaders
                | SlotState::ReceivingBody
        )
    }
}

/// What happened when a candidate was offered to a slot.
enum Activation {
    /// The slot took the fetch; the candidate is consumed.
    Started,
    /// An older version of the same bundle is mid-fetch; keep the candidate
    /// queued so the newer version is fetched afterwards.
    Requeue(Candidate),
    /// The candidate is spent (imported, superseded, duplicate of an active
    /// fetch, or failed to start); its manifest has been released.
    Discard,
}

// =============================================================================
// STATS
// =============================================================================

/// Point-in-time view of one queue.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub threshold: Option<u64>,
    pub queued: usize,
    pub active: SlotState,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub queues: Vec<QueueStats>,
}

impl EngineStats {
    pub fn total_queued(&self) -> usize {
        self.queues.iter().map(|q| q.queued).sum()
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct FetchEngine {
    cfg: FetchConfig,
    store: Box<dyn Store>,
    bus: Box<dyn OverlayBus>,
    connector: Box<dyn StreamConnector>,
    local: SubscriberId,
    queues: Vec<FetchQueue>,
    slots: Vec<Slot>,
    versions: VersionCache,
    ignored: IgnoreCache,
    /// Pending activation-tick deadline; at most one at a time.
    activation_ms: Option<u64>,
    rng: ChaCha8Rng,
    import_dir_ready: bool,
}

impl FetchEngine {
    pub fn new(
        cfg: FetchConfig,
        store: Box<dyn Store>,
        bus: Box<dyn OverlayBus>,
        connector: Box<dyn StreamConnector>,
        local: SubscriberId,
    ) -> Self {
        let queues = queue::default_queues();
        let slots = (0..queues.len()).map(|_| Slot::empty()).collect();
        Self {
            cfg,
            store,
            bus,
            connector,
            local,
            queues,
            slots,
            versions: VersionCache::new(),
            ignored: IgnoreCache::new(),
            activation_ms: None,
            rng: ChaCha8Rng::seed_from_u64(rand::random()),
            import_dir_ready: false,
        }
    }

    /// Reseed the engine's RNG, making cache way selection deterministic.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Local subscriber id requests are sourced from.
    pub fn local_subscriber(&self) -> SubscriberId {
        self.local
    }

    // -------------------------------------------------------------------------
    // INBOUND API
    // -------------------------------------------------------------------------

    /// Consider fetching the bundle described by `manifest`, offered by
    /// `peer`. Takes ownership; the manifest is dropped on every non-queued
    /// path.
    pub fn suggest(
        &mut self,
        manifest: Manifest,
        peer: PeerAddr,
        now_ms: u64,
    ) -> Result<Suggestion, FetchError> {
        if manifest.id.is_nil() {
            return Err(FetchError::NilId);
        }
        if self.ignored.check(&manifest.id, now_ms) {
            debug!(id = %manifest.id, "suggestion suppressed by ignore cache");
            return Ok(Suggestion::Ignored);
        }
        debug!(id = %manifest.id, version = manifest.version, size = manifest.payload_len,
               "considering bundle");

        if self
            .versions
            .lookup(&manifest, &*self.store, &mut self.rng)?
            .superseded()
        {
            return Ok(Suggestion::Superseded);
        }

        // Nil payload: nothing to fetch, verify and import on the spot.
        if manifest.payload_len == 0 {
            if let Err(e) = self.store.verify_manifest(&manifest) {
                self.reject_unverifiable(&manifest, &peer, now_ms);
                return Err(FetchError::Verify(e));
            }
            self.import(&manifest)?;
            return Ok(Suggestion::Imported);
        }

        let qi = queue::find_queue(&self.queues, manifest.payload_len);
        let mut verified = manifest.self_signed;
        let mut insert_at: Option<usize> = None;

        // The same bundle could sit in any queue (payload size may differ
        // between versions), so scan them all: an equal-or-newer queued
        // candidate wins; older queued candidates are evicted.
        for q in 0..self.queues.len() {
            let mut j = 0;
            while j < self.queues[q].len() {
                let peek = self.queues[q]
                    .get(j)
                    .map(|c| (c.manifest.id, c.manifest.version, c.priority));
                let Some((qid, qversion, qpriority)) = peek else {
                    break;
                };
                if qid != manifest.id {
                    if insert_at.is_none() && q == qi && qpriority < DEFAULT_PRIORITY {
                        insert_at = Some(j);
                    }
                    j += 1;
                    continue;
                }
                if qversion >= manifest.version {
                    debug!(id = %manifest.id, "equal or newer candidate already queued");
                    return Ok(Suggestion::Duplicate);
                }
                if !verified {
                    if let Err(e) = self.store.verify_manifest(&manifest) {
                        self.reject_unverifiable(&manifest, &peer, now_ms);
                        return Err(FetchError::Verify(e));
                    }
                    verified = true;
                }
                let old = self.queues[q].remove(j);
                debug!(id = %old.manifest.id, version = old.manifest.version,
                       "unqueued older candidate");
            }
        }
        if insert_at.is_none() && !self.queues[qi].is_full() {
            insert_at = Some(self.queues[qi].len());
        }
        let Some(i) = insert_at else {
            debug!(id = %manifest.id, queue = qi, "queue full, dropping suggestion");
            return Ok(Suggestion::QueueFull);
        };

        if !verified {
            if let Err(e) = self.store.verify_manifest(&manifest) {
                self.reject_unverifiable(&manifest, &peer, now_ms);
                return Err(FetchError::Verify(e));
            }
        }

        debug!(id = %manifest.id, queue = qi, position = i, "queued fetch candidate");
        self.queues[qi].insert(i, Candidate { manifest, peer, priority: DEFAULT_PRIORITY });

        if self.activation_ms.is_none() {
            self.activation_ms = Some(now_ms + self.cfg.activation_delay_ms);
        }
        Ok(Suggestion::Queued)
    }

    /// Ask a peer for a manifest whose id starts with `prefix`.
    pub fn request_manifest_by_prefix(
        &mut self,
        peer: PeerAddr,
        prefix: &[u8],
        now_ms: u64,
    ) -> Result<RequestOutcome, FetchError> {
        if prefix.is_empty() || prefix.len() > 32 {
            return Err(FetchError::BadPrefix(prefix.len()));
        }
        let Some(qi) = self.find_free_slot(MAX_MANIFEST_BYTES) else {
            return Ok(RequestOutcome::SlotBusy);
        };
        self.begin_fetch(
            qi,
            None,
            FetchTarget::ManifestPrefix { prefix: prefix.to_vec() },
            peer,
            now_ms,
        )?;
        Ok(RequestOutcome::Started)
    }

    /// Readiness notification for the stream socket of the given slot.
    pub fn on_stream_ready(&mut self, slot: usize, now_ms: u64) {
        if slot >= self.slots.len() {
            return;
        }
        if matches!(
            self.slots[slot].state,
            SlotState::Connecting | SlotState::SendingRequest
        ) {
            self.drive_send(slot, now_ms);
        }
        if self.slots[slot].state == SlotState::ReceivingHeaders {
            self.drive_headers(slot, now_ms);
        }
        if self.slots[slot].state == SlotState::ReceivingBody {
            self.drive_body(slot, now_ms);
        }
    }

    /// Content datagram from the overlay. Returns true if a slot absorbed it.
    pub fn on_datagram_content(
        &mut self,
        bid_prefix: &[u8],
        version: u64,
        offset: u64,
        bytes: &[u8],
        kind: BlockKind,
        now_ms: u64,
    ) -> bool {
        if bid_prefix.len() < 16 {
            return false;
        }
        for qi in 0..self.slots.len() {
            let slot = &self.slots[qi];
            if slot.state != SlotState::ReceivingBodyDatagram {
                continue;
            }
            let Some(FetchTarget::Payload { id, .. }) = &slot.target else {
                continue;
            };
            if id.prefix(16) != &bid_prefix[..16] {
                continue;
            }
            debug!(slot = qi, version, offset, len = bytes.len(), "content datagram");
            self.absorb_datagram(qi, offset, bytes, kind, now_ms);
            return true;
        }
        false
    }

    /// Fire all timers due at `now_ms`.
    pub fn on_alarm(&mut self, now_ms: u64) {
        if self.activation_ms.is_some_and(|t| t <= now_ms) {
            self.activation_ms = None;
            debug!("activation tick");
            for qi in (0..self.slots.len()).rev() {
                self.start_next(qi, now_ms);
            }
        }
        for qi in 0..self.slots.len() {
            if self.slots[qi].alarm_ms.is_some_and(|t| t <= now_ms) {
                self.slot_alarm(qi, now_ms);
            }
        }
    }

    /// Earliest pending deadline, if any.
    pub fn next_alarm(&self) -> Option<u64> {
        self.slots
            .iter()
            .filter_map(|s| s.alarm_ms)
            .chain(self.activation_ms)
            .min()
    }

    pub fn any_active(&self) -> bool {
        self.slots.iter().any(|s| !s.is_free())
    }

    pub fn any_queued(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots.get(slot).map_or(SlotState::Free, |s| s.state)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queues: self
                .queues
                .iter()
                .zip(&self.slots)
                .map(|(q, s)| QueueStats {
                    threshold: q.threshold(),
                    queued: q.len(),
                    active: s.state,
                })
                .collect(),
        }
    }

    // -------------------------------------------------------------------------
    // DISPATCH
    // -------------------------------------------------------------------------

    fn find_free_slot(&self, size: u64) -> Option<usize> {
        (0..self.queues.len()).find(|&i| self.queues[i].accepts(size) && self.slots[i].is_free())
    }

    /// Fill the given slot from its own queue, then from smaller classes.
    fn start_next(&mut self, slot: usize, now_ms: u64) {
        for q in (0..=slot).rev() {
            let mut i = 0;
            while i < self.queues[q].len() {
                if !self.slots[slot].is_free() {
                    return;
                }
                let candidate = self.queues[q].remove(i);
                match self.try_activate(slot, candidate, now_ms) {
                    Activation::Started => return,
                    Activation::Requeue(c) => {
                        self.queues[q].insert(i, c);
                        i += 1;
                    }
                    Activation::Discard => {}
                }
            }
        }
    }

    /// Revalidate a candidate against current state and start its fetch.
    fn try_activate(&mut self, slot: usize, candidate: Candidate, now_ms: u64) -> Activation {
        let m = &candidate.manifest;

        // Nil payload: import immediately.
        if m.payload_len == 0 {
            if let Err(e) = self.import(m) {
                warn!(id = %m.id, error = %e, "import of nil-payload bundle failed");
            }
            return Activation::Discard;
        }

        // The store may have caught up since the candidate was queued.
        match self.versions.lookup(m, &*self.store, &mut self.rng) {
            Ok(v) if v.superseded() => return Activation::Discard,
            Ok(VersionLookup::BadManifest) => return Activation::Discard,
            Ok(_) => {}
            Err(e) => {
                warn!(id = %m.id, error = %e, "version lookup failed");
                return Activation::Discard;
            }
        }

        // Same bundle already mid-fetch? Let an older fetch finish first so
        // constant republishing cannot postpone completion forever.
        for s in &self.slots {
            if s.is_free() {
                continue;
            }
            if let Some(am) = &s.manifest {
                if am.id == m.id {
                    return if am.version < m.version {
                        debug!(id = %m.id, "older version in flight, keeping candidate queued");
                        Activation::Requeue(candidate)
                    } else {
                        debug!(id = %m.id, "same or newer version already in flight");
                        Activation::Discard
                    };
                }
            }
        }

        // Payload already stored (under another bundle, say): just attach
        // the manifest.
        match self.store.has_payload(&m.payload_hash) {
            Ok(true) => {
                debug!(id = %m.id, "payload already present, importing manifest");
                if let Err(e) = self.import(m) {
                    warn!(id = %m.id, error = %e, "import of stored payload failed");
                }
                return Activation::Discard;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(id = %m.id, error = %e, "payload lookup failed");
                return Activation::Discard;
            }
        }

        // Same payload being fetched by another slot?
        for s in &self.slots {
            if !s.is_free()
                && s.manifest
                    .as_ref()
                    .is_some_and(|am| am.payload_hash == m.payload_hash)
            {
                debug!(hash = %m.payload_hash, "payload already being fetched");
                return Activation::Discard;
            }
        }

        let target = FetchTarget::Payload { id: m.id, version: m.version };
        let Candidate { manifest, peer, .. } = candidate;
        if let Err(e) = self.begin_fetch(slot, Some(manifest), target, peer, now_ms) {
            warn!(slot, error = %e, "failed to start fetch");
            return Activation::Discard;
        }
        Activation::Started
    }

    // -------------------------------------------------------------------------
    // SLOT LIFECYCLE
    // -------------------------------------------------------------------------

    /// Open the scratch file, build the request, and kick off the stream
    /// connect (or go straight to the datagram transport).
    fn begin_fetch(
        &mut self,
        slot: usize,
        manifest: Option<Manifest>,
        target: FetchTarget,
        peer: PeerAddr,
        now_ms: u64,
    ) -> Result<(), FetchError> {
        self.ensure_import_dir()?;
        let (path, request) = match (&target, &manifest) {
            (FetchTarget::Payload { .. }, Some(m)) => (
                self.cfg.import_dir.join(format!("payload.{}", m.id)),
                http::payload_request(&m.payload_hash),
            ),
            (FetchTarget::ManifestPrefix { prefix }, _) => (
                self.cfg.import_dir.join(format!("manifest.{}", hex::encode(prefix))),
                http::manifest_request(prefix),
            ),
            (FetchTarget::Payload { .. }, None) => {
                return Err(FetchError::Scratch(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "payload fetch without manifest",
                )));
            }
        };
        let file = File::create(&path).map_err(FetchError::Scratch)?;

        {
            let s = &mut self.slots[slot];
            s.state = SlotState::Connecting;
            s.target = Some(target);
            s.manifest = manifest;
            s.peer = peer;
            s.link = None;
            s.file = Some(file);
            s.path = Some(path);
            s.file_len = None;
            s.file_ofs = 0;
            s.request = request;
            s.request_ofs = 0;
            s.head_buf = Vec::new();
            s.window = None;
            s.last_rx_ms = now_ms;
            s.idle_timeout_ms = self.cfg.idle_timeout_ms;
            s.alarm_ms = None;
        }

        let Some(addr) = peer.stream else {
            debug!(slot, "peer has no stream address, using datagram transport");
            self.switch_to_datagram(slot, now_ms);
            return Ok(());
        };
        match self.connector.connect(addr) {
            Ok(link) => {
                debug!(slot, %addr, "stream connect initiated");
                let s = &mut self.slots[slot];
                s.link = Some(link);
                s.alarm_ms = Some(now_ms + s.idle_timeout_ms);
            }
            Err(e) => {
                debug!(slot, %addr, error = %e, "stream connect failed");
                self.switch_to_datagram(slot, now_ms);
            }
        }
        Ok(())
    }

    /// Abandon the stream transport, keeping whatever progress the scratch
    /// file already holds, and run the fetch over the overlay instead.
    fn switch_to_datagram(&mut self, slot: usize, now_ms: u64) {
        debug!(slot, "switching to datagram transport");
        let target = {
            let s = &mut self.slots[slot];
            s.link = None;
            s.state = SlotState::ReceivingBodyDatagram;
            s.last_rx_ms = now_ms;
            s.target.clone()
        };
        match target {
            Some(FetchTarget::Payload { .. }) => {
                {
                    let s = &mut self.slots[slot];
                    s.idle_timeout_ms = self.cfg.idle_timeout_ms;
                    s.window = Some(RecvWindow::new(s.file_ofs, self.cfg.default_block_len));
                }
                self.send_block_request(slot, now_ms);
            }
            Some(FetchTarget::ManifestPrefix { .. }) => {
                self.slots[slot].idle_timeout_ms = self.cfg.manifest_idle_timeout_ms;
                self.send_manifest_request(slot, now_ms);
            }
            None => self.close(slot, now_ms),
        }
    }

    /// Tear the slot down and start the next fetch. Runs on every exit path
    /// (success, error, timeout); idempotent.
    fn close(&mut self, slot: usize, now_ms: u64) {
        {
            let s = &mut self.slots[slot];
            if !s.is_free() {
                debug!(slot, "closing fetch slot");
            }
            s.link = None;
            s.alarm_ms = None;
            s.file = None;
            if let Some(path) = s.path.take() {
                let _ = fs::remove_file(&path);
            }
            s.manifest = None;
            s.target = None;
            s.window = None;
            s.request = Vec::new();
            s.request_ofs = 0;
            s.head_buf = Vec::new();
            s.file_len = None;
            s.file_ofs = 0;
            s.state = SlotState::Free;
        }
        self.start_next(slot, now_ms);
    }

    fn slot_alarm(&mut self, slot: usize, now_ms: u64) {
        match self.slots[slot].state {
            SlotState::Free => self.slots[slot].alarm_ms = None,
            SlotState::ReceivingBodyDatagram => {
                let idle = {
                    let s = &self.slots[slot];
                    now_ms.saturating_sub(s.last_rx_ms) > s.idle_timeout_ms
                };
                if idle {
                    debug!(slot, "datagram transfer idle, giving up");
                    self.close(slot, now_ms);
                    return;
                }
                let is_payload =
                    matches!(self.slots[slot].target, Some(FetchTarget::Payload { .. }));
                if self.slots[slot].target.is_none() {
                    self.close(slot, now_ms);
                } else if is_payload {
                    self.send_block_request(slot, now_ms);
                } else {
                    self.send_manifest_request(slot, now_ms);
                }
            }
            _ => {
                debug!(slot, "stream transfer idle, closing");
                self.close(slot, now_ms);
            }
        }
    }

    // -------------------------------------------------------------------------
    // STREAM TRANSPORT
    // -------------------------------------------------------------------------

    fn drive_send(&mut self, slot: usize, now_ms: u64) {
        loop {
            let s = &mut self.slots[slot];
            if s.request_ofs >= s.request.len() {
                s.state = SlotState::ReceivingHeaders;
                return;
            }
            let Slot { link, request, request_ofs, state, alarm_ms, idle_timeout_ms, .. } = s;
            let Some(link) = link.as_mut() else {
                self.switch_to_datagram(slot, now_ms);
                return;
            };
            match link.try_write(&request[*request_ofs..]) {
                Ok(n) => {
                    *request_ofs += n;
                    *alarm_ms = Some(now_ms + *idle_timeout_ms);
                    if *request_ofs >= request.len() {
                        *state = SlotState::ReceivingHeaders;
                        return;
                    }
                    *state = SlotState::SendingRequest;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(slot, error = %e, "request send failed");
                    self.switch_to_datagram(slot, now_ms);
                    return;
                }
            }
        }
    }

    fn drive_headers(&mut self, slot: usize, now_ms: u64) {
        loop {
            let s = &mut self.slots[slot];
            let Some(link) = s.link.as_mut() else {
                self.switch_to_datagram(slot, now_ms);
                return;
            };
            let mut buf = [0u8; RESPONSE_HEAD_MAX];
            let read = link.try_read(&mut buf);
            match read {
                Ok(0) => {
                    debug!(slot, "stream closed during response headers");
                    self.switch_to_datagram(slot, now_ms);
                    return;
                }
                Ok(n) => {
                    s.head_buf.extend_from_slice(&buf[..n]);
                    s.alarm_ms = Some(now_ms + s.idle_timeout_ms);
                    if let Some(end) = http::header_end(&s.head_buf) {
                        let head = http::parse_response(&s.head_buf[..end]);
                        let ok = match head {
                            Some(h) if h.code == 200 && h.content_length.is_some() => h,
                            Some(h) if h.code != 200 => {
                                debug!(slot, code = h.code, "peer refused request");
                                self.switch_to_datagram(slot, now_ms);
                                return;
                            }
                            _ => {
                                debug!(slot, "malformed response or missing Content-Length");
                                self.switch_to_datagram(slot, now_ms);
                                return;
                            }
                        };
                        let s = &mut self.slots[slot];
                        s.file_len = ok.content_length;
                        s.state = SlotState::ReceivingBody;
                        let residual = s.head_buf.split_off(end);
                        s.head_buf = Vec::new();
                        if !residual.is_empty() {
                            self.write_content(slot, &residual, now_ms);
                        }
                        return;
                    }
                    if s.head_buf.len() >= RESPONSE_HEAD_MAX {
                        debug!(slot, "response headers too large");
                        self.switch_to_datagram(slot, now_ms);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(slot, error = %e, "read failed during response headers");
                    self.switch_to_datagram(slot, now_ms);
                    return;
                }
            }
        }
    }

    fn drive_body(&mut self, slot: usize, now_ms: u64) {
        loop {
            let s = &mut self.slots[slot];
            let Some(link) = s.link.as_mut() else {
                self.switch_to_datagram(slot, now_ms);
                return;
            };
            let mut buf = [0u8; READ_CHUNK];
            let read = link.try_read(&mut buf);
            match read {
                Ok(0) => {
                    debug!(slot, "stream closed mid-body");
                    self.switch_to_datagram(slot, now_ms);
                    return;
                }
                Ok(n) => {
                    if self.write_content(slot, &buf[..n], now_ms) {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(slot, error = %e, "read failed mid-body");
                    self.switch_to_datagram(slot, now_ms);
                    return;
                }
            }
        }
    }

    /// Append body bytes to the scratch file. Returns true when the slot
    /// finished (transfer complete, or torn down on write failure).
    fn write_content(&mut self, slot: usize, bytes: &[u8], now_ms: u64) -> bool {
        let wrote = {
            let s = &mut self.slots[slot];
            let mut chunk = bytes;
            if let Some(len) = s.file_len {
                let remaining = len.saturating_sub(s.file_ofs) as usize;
                if chunk.len() > remaining {
                    chunk = &chunk[..remaining];
                }
            }
            let result = match s.file.as_mut() {
                Some(file) => file.write_all(chunk),
                None => Ok(()),
            };
            match result {
                Ok(()) => {
                    s.file_ofs += chunk.len() as u64;
                    if s.in_stream_state() {
                        s.alarm_ms = Some(now_ms + s.idle_timeout_ms);
                    }
                    Ok(s.file_len == Some(s.file_ofs))
                }
                Err(e) => Err(e),
            }
        };
        match wrote {
            Ok(true) => {
                self.finish(slot, now_ms);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(slot, error = %e, "scratch file write failed");
                self.close(slot, now_ms);
                true
            }
        }
    }

    // -------------------------------------------------------------------------
    // DATAGRAM TRANSPORT
    // -------------------------------------------------------------------------

    fn send_block_request(&mut self, slot: usize, now_ms: u64) {
        let prepared = {
            let s = &mut self.slots[slot];
            match (&s.target, &s.window) {
                (Some(FetchTarget::Payload { id, version }), Some(window)) => {
                    let request = BlockRequest {
                        id: *id,
                        version: *version,
                        window_start: window.start(),
                        bitmap: window.bitmap(),
                        block_len: window.block_len(),
                    };
                    s.alarm_ms = Some(now_ms + self.cfg.block_tx_interval_ms);
                    Some((request, s.peer.overlay))
                }
                _ => None,
            }
        };
        let Some((request, dst)) = prepared else {
            return;
        };
        if let Err(e) = self.bus.send_datagram(
            PORT_RHIZOME_RESPONSE,
            &dst,
            PORT_RHIZOME_REQUEST,
            FETCH_TTL,
            &request.encode(),
        ) {
            warn!(slot, error = %e, "block request send failed");
        }
    }

    fn send_manifest_request(&mut self, slot: usize, now_ms: u64) {
        let prepared = {
            let s = &mut self.slots[slot];
            match &s.target {
                Some(FetchTarget::ManifestPrefix { prefix }) => {
                    let prefix = prefix.clone();
                    s.alarm_ms = Some(now_ms + self.cfg.manifest_tx_interval_ms);
                    Some((prefix, s.peer.overlay))
                }
                _ => None,
            }
        };
        let Some((prefix, dst)) = prepared else {
            return;
        };
        if let Err(e) = self.bus.send_datagram(
            PORT_RHIZOME_RESPONSE,
            &dst,
            PORT_RHIZOME_REQUEST,
            FETCH_TTL,
            &prefix,
        ) {
            warn!(slot, error = %e, "manifest request send failed");
        }
    }

    fn absorb_datagram(
        &mut self,
        slot: usize,
        offset: u64,
        bytes: &[u8],
        kind: BlockKind,
        now_ms: u64,
    ) {
        let mut in_order = Vec::new();
        {
            let s = &mut self.slots[slot];
            s.last_rx_ms = now_ms;
            let Some(window) = s.window.as_mut() else {
                return;
            };
            window.absorb(offset, bytes, kind == BlockKind::Terminal, &mut in_order);
            if let Some(total) = window.total() {
                s.file_len = Some(total);
            }
        }
        if !in_order.is_empty() {
            self.write_content(slot, &in_order, now_ms);
        } else {
            // A retransmitted terminal block can reveal a length we have
            // already reached.
            let s = &self.slots[slot];
            if s.file_len.is_some() && s.file_len == Some(s.file_ofs) {
                self.finish(slot, now_ms);
            }
        }
    }

    // -------------------------------------------------------------------------
    // IMPORT
    // -------------------------------------------------------------------------

    /// Hand a completed transfer to the importer and recycle the slot.
    fn finish(&mut self, slot: usize, now_ms: u64) {
        // Close the scratch file so the importer sees every byte.
        self.slots[slot].file = None;
        let target = self.slots[slot].target.take();
        match target {
            Some(FetchTarget::Payload { .. }) => {
                if let Some(mut m) = self.slots[slot].manifest.take() {
                    m.payload_path = self.slots[slot].path.clone();
                    match self.import(&m) {
                        Ok(()) => {
                            info!(id = %m.id, version = m.version,
                                  bytes = self.slots[slot].file_ofs, "fetch complete");
                        }
                        Err(e) => {
                            warn!(id = %m.id, error = %e, "import of fetched bundle failed");
                        }
                    }
                }
            }
            Some(FetchTarget::ManifestPrefix { prefix }) => {
                let peer = self.slots[slot].peer;
                let parsed = self.slots[slot]
                    .path
                    .clone()
                    .map(|p| self.store.read_manifest_file(&p));
                match parsed {
                    Some(Ok(m)) => {
                        debug!(id = %m.id, "fetched manifest by prefix, reconsidering");
                        if let Err(e) = self.suggest(m, peer, now_ms) {
                            debug!(error = %e, "fetched manifest rejected");
                        }
                    }
                    Some(Err(e)) => {
                        debug!(prefix = %hex::encode(&prefix), error = %e,
                               "fetched manifest unreadable");
                    }
                    None => {}
                }
            }
            None => {}
        }
        self.close(slot, now_ms);
    }

    fn import(&mut self, manifest: &Manifest) -> Result<(), StoreError> {
        self.store
            .import_bundle(manifest, manifest.ttl.saturating_sub(1))?;
        self.versions.store(manifest, &mut self.rng);
        Ok(())
    }

    fn reject_unverifiable(&mut self, manifest: &Manifest, peer: &PeerAddr, now_ms: u64) {
        warn!(id = %manifest.id, "manifest failed verification, ignoring for a while");
        self.ignored.remember(
            &manifest.id,
            peer,
            self.cfg.ignore_ttl_ms,
            now_ms,
            &mut self.rng,
        );
    }

    fn ensure_import_dir(&mut self) -> Result<(), FetchError> {
        if self.import_dir_ready {
            return Ok(());
        }
        if !self.cfg.import_dir.is_absolute() {
            return Err(FetchError::ImportDir(io::Error::new(
                io::ErrorKind::InvalidInput,
                "import directory must be an absolute path",
            )));
        }
        fs::create_dir_all(&self.cfg.import_dir).map_err(FetchError::ImportDir)?;
        self.import_dir_ready = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use crate::store::MemStore;
    use crate::types::PayloadHash;
    use std::net::SocketAddrV4;

    struct NullBus;
    impl OverlayBus for NullBus {
        fn send_datagram(
            &self,
            _src_port: u32,
            _dst: &SubscriberId,
            _dst_port: u32,
            _ttl: u8,
            _bytes: &[u8],
        ) -> Result<(), BusError> {
            Ok(())
        }
    }

    struct NullConnector;
    impl StreamConnector for NullConnector {
        fn connect(&mut self, _addr: SocketAddrV4) -> io::Result<Box<dyn StreamLink>> {
            Err(io::ErrorKind::ConnectionRefused.into())
        }
    }

    fn engine() -> FetchEngine {
        let mut cfg = FetchConfig::default();
        cfg.import_dir = std::env::temp_dir().join(format!(
            "rhizome-engine-unit-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        FetchEngine::new(
            cfg,
            Box::new(MemStore::new()),
            Box::new(NullBus),
            Box::new(NullConnector),
            SubscriberId([1; 32]),
        )
        .with_rng_seed(7)
    }

    fn manifest(id_byte: u8, version: u64, size: u64) -> Manifest {
        let mut m = Manifest::new(
            BundleId([id_byte; 32]),
            version,
            size,
            PayloadHash([id_byte; 32]),
        );
        m.self_signed = true;
        m
    }

    fn peer() -> PeerAddr {
        PeerAddr::overlay_only(SubscriberId([2; 32]))
    }

    #[test]
    fn test_nil_id_is_an_error() {
        let mut e = engine();
        let mut m = manifest(0, 1, 10);
        m.id = BundleId::NIL;
        assert!(matches!(e.suggest(m, peer(), 0), Err(FetchError::NilId)));
    }

    #[test]
    fn test_nil_payload_imports_immediately() {
        let mut e = engine();
        let m = manifest(3, 1, 0);
        assert_eq!(e.suggest(m, peer(), 0).unwrap(), Suggestion::Imported);
        assert!(!e.any_queued());
        assert!(!e.any_active());
    }

    #[test]
    fn test_queued_suggestion_arms_activation_alarm() {
        let mut e = engine();
        assert_eq!(e.next_alarm(), None);
        assert_eq!(e.suggest(manifest(4, 1, 10), peer(), 100).unwrap(), Suggestion::Queued);
        assert_eq!(e.next_alarm(), Some(100 + FetchConfig::default().activation_delay_ms));
        // A second suggestion does not re-arm.
        e.suggest(manifest(5, 1, 10), peer(), 400).unwrap();
        assert_eq!(e.next_alarm(), Some(100 + FetchConfig::default().activation_delay_ms));
    }

    #[test]
    fn test_duplicate_version_leaves_queue_unchanged() {
        let mut e = engine();
        e.suggest(manifest(6, 5, 10), peer(), 0).unwrap();
        let before = e.stats().total_queued();
        assert_eq!(e.suggest(manifest(6, 5, 10), peer(), 1).unwrap(), Suggestion::Duplicate);
        assert_eq!(e.stats().total_queued(), before);
    }

    #[test]
    fn test_newer_version_replaces_queued_candidate() {
        let mut e = engine();
        e.suggest(manifest(7, 1, 10), peer(), 0).unwrap();
        assert_eq!(e.suggest(manifest(7, 2, 10), peer(), 1).unwrap(), Suggestion::Queued);
        assert_eq!(e.stats().total_queued(), 1);
    }

    #[test]
    fn test_queue_overflow_reports_queue_full() {
        let mut e = engine();
        // The smallest class holds five candidates.
        for i in 0..5u8 {
            assert_eq!(
                e.suggest(manifest(10 + i, 1, 10), peer(), 0).unwrap(),
                Suggestion::Queued
            );
        }
        assert_eq!(e.suggest(manifest(20, 1, 10), peer(), 0).unwrap(), Suggestion::QueueFull);
    }
}
