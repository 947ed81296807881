//! Fetch engine integration tests
//!
//! Run with: cargo test --test fetch_test

use rhizome_engine::{
    BlockKind, BlockRequest, BundleId, BusError, FetchConfig, FetchEngine, FetchError, Manifest,
    MemStore, OverlayBus, PayloadHash, PeerAddr, RequestOutcome, SlotState, StreamConnector,
    StreamLink, SubscriberId, Suggestion,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddrV4;
use std::rc::Rc;

// =============================================================================
// FAKES
// =============================================================================

#[derive(Debug, Clone)]
struct Sent {
    src_port: u32,
    dst: SubscriberId,
    dst_port: u32,
    ttl: u8,
    bytes: Vec<u8>,
}

#[derive(Clone, Default)]
struct RecordingBus {
    sent: Rc<RefCell<Vec<Sent>>>,
}

impl OverlayBus for RecordingBus {
    fn send_datagram(
        &self,
        src_port: u32,
        dst: &SubscriberId,
        dst_port: u32,
        ttl: u8,
        bytes: &[u8],
    ) -> Result<(), BusError> {
        self.sent.borrow_mut().push(Sent {
            src_port,
            dst: *dst,
            dst_port,
            ttl,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }
}

enum ReadStep {
    Data(Vec<u8>),
    Eof,
}

#[derive(Default)]
struct LinkScript {
    rx: VecDeque<ReadStep>,
    tx: Vec<u8>,
    /// Remaining bytes the link will accept before reporting WouldBlock;
    /// `None` accepts everything.
    write_budget: Option<usize>,
    fail_writes: bool,
}

/// Scripted stream: the test pushes reads in and collects writes out.
#[derive(Clone, Default)]
struct ScriptedLink(Rc<RefCell<LinkScript>>);

impl ScriptedLink {
    fn push_data(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx.push_back(ReadStep::Data(bytes.to_vec()));
    }

    fn push_eof(&self) {
        self.0.borrow_mut().rx.push_back(ReadStep::Eof);
    }

    fn written(&self) -> Vec<u8> {
        self.0.borrow().tx.clone()
    }
}

impl StreamLink for ScriptedLink {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut s = self.0.borrow_mut();
        if s.fail_writes {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = s.write_budget.map_or(buf.len(), |budget| budget.min(buf.len()));
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        if let Some(budget) = s.write_budget.as_mut() {
            *budget -= n;
        }
        s.tx.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut s = self.0.borrow_mut();
        match s.rx.pop_front() {
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    let rest = data.split_off(n);
                    s.rx.push_front(ReadStep::Data(rest));
                }
                Ok(n)
            }
            Some(ReadStep::Eof) => Ok(0),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

/// Hands out pre-scripted links in order; refuses once the script runs dry.
#[derive(Clone, Default)]
struct ScriptedConnector {
    links: Rc<RefCell<VecDeque<ScriptedLink>>>,
}

impl ScriptedConnector {
    fn expect(&self) -> ScriptedLink {
        let link = ScriptedLink::default();
        self.links.borrow_mut().push_back(link.clone());
        link
    }
}

impl StreamConnector for ScriptedConnector {
    fn connect(&mut self, _addr: SocketAddrV4) -> io::Result<Box<dyn StreamLink>> {
        match self.links.borrow_mut().pop_front() {
            Some(link) => Ok(Box::new(link)),
            None => Err(io::ErrorKind::ConnectionRefused.into()),
        }
    }
}

// =============================================================================
// HARNESS
// =============================================================================

const ACTIVATION: u64 = 500;

struct Harness {
    engine: FetchEngine,
    store: MemStore,
    bus: RecordingBus,
    connector: ScriptedConnector,
    dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = FetchConfig::default();
    cfg.import_dir = dir.path().to_path_buf();
    let store = MemStore::new();
    let bus = RecordingBus::default();
    let connector = ScriptedConnector::default();
    let engine = FetchEngine::new(
        cfg,
        Box::new(store.clone()),
        Box::new(bus.clone()),
        Box::new(connector.clone()),
        SubscriberId([0xEE; 32]),
    )
    .with_rng_seed(42);
    Harness { engine, store, bus, connector, dir }
}

impl Harness {
    fn sent(&self) -> Vec<Sent> {
        self.bus.sent.borrow().clone()
    }

    /// Scratch files left in the import directory.
    fn scratch_files(&self) -> usize {
        std::fs::read_dir(self.dir.path()).map(|d| d.count()).unwrap_or(0)
    }

    /// Index of the slot currently running a fetch, if exactly one is.
    fn active_slot(&self) -> usize {
        let stats = self.engine.stats();
        let busy: Vec<usize> = (0..stats.queues.len())
            .filter(|&i| stats.queues[i].active != SlotState::Free)
            .collect();
        assert_eq!(busy.len(), 1, "expected exactly one active slot");
        busy[0]
    }
}

fn manifest(id_byte: u8, version: u64, size: u64) -> Manifest {
    let mut m = Manifest::new(
        BundleId([id_byte; 32]),
        version,
        size,
        PayloadHash([0x40 ^ id_byte; 32]),
    );
    m.ttl = 2;
    m.self_signed = true;
    m
}

fn stream_peer() -> PeerAddr {
    PeerAddr {
        stream: Some("127.0.0.1:4110".parse().unwrap()),
        overlay: SubscriberId([0x77; 32]),
    }
}

fn overlay_peer() -> PeerAddr {
    PeerAddr::overlay_only(SubscriberId([0x77; 32]))
}

// =============================================================================
// QUEUEING
// =============================================================================

#[test]
fn test_queue_routing_by_payload_size() {
    let mut h = harness();
    for (id, size) in [(1u8, 9_999u64), (2, 10_000), (3, 100_000), (4, 10_000_001)] {
        assert_eq!(
            h.engine.suggest(manifest(id, 1, size), overlay_peer(), 0).unwrap(),
            Suggestion::Queued
        );
    }
    let stats = h.engine.stats();
    let queued: Vec<usize> = stats.queues.iter().map(|q| q.queued).collect();
    assert_eq!(queued, vec![1, 1, 1, 0, 1]);
}

#[test]
fn test_supersession_against_store() {
    let mut h = harness();
    let a = manifest(0xA1, 5, 1_000);
    h.store.insert_manifest(a.id, 5);

    assert_eq!(
        h.engine.suggest(a.clone(), overlay_peer(), 0).unwrap(),
        Suggestion::Superseded
    );
    let mut newer = a;
    newer.version = 6;
    assert_eq!(h.engine.suggest(newer, overlay_peer(), 0).unwrap(), Suggestion::Queued);
}

#[test]
fn test_repeated_suggestion_is_idempotent() {
    let mut h = harness();
    h.engine.suggest(manifest(0xB2, 3, 500), overlay_peer(), 0).unwrap();
    let before = h.engine.stats().total_queued();
    // Same id and version from a different peer changes nothing.
    assert_eq!(
        h.engine.suggest(manifest(0xB2, 3, 500), stream_peer(), 1).unwrap(),
        Suggestion::Duplicate
    );
    assert_eq!(h.engine.stats().total_queued(), before);
}

#[test]
fn test_zero_length_payload_imports_without_queueing() {
    let mut h = harness();
    assert_eq!(
        h.engine.suggest(manifest(0xC3, 1, 0), overlay_peer(), 0).unwrap(),
        Suggestion::Imported
    );
    assert!(!h.engine.any_queued());
    let imports = h.store.imports();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].manifest.id, BundleId([0xC3; 32]));
    // Advertised ttl is decremented on import.
    assert_eq!(imports[0].ttl, 1);
}

// =============================================================================
// STREAM TRANSPORT
// =============================================================================

#[test]
fn test_stream_happy_path() {
    let mut h = harness();
    let link = h.connector.expect();
    let m = manifest(0xD4, 1, 4);
    let hash_hex = m.payload_hash.to_string();

    assert_eq!(h.engine.suggest(m, stream_peer(), 0).unwrap(), Suggestion::Queued);
    assert!(!h.engine.any_active());

    h.engine.on_alarm(ACTIVATION);
    let slot = h.active_slot();
    assert_eq!(h.engine.slot_state(slot), SlotState::Connecting);

    // Nothing to read yet: the request goes out and we wait on headers.
    h.engine.on_stream_ready(slot, ACTIVATION + 10);
    assert_eq!(h.engine.slot_state(slot), SlotState::ReceivingHeaders);
    assert_eq!(
        link.written(),
        format!("GET /rhizome/file/{hash_hex} HTTP/1.0\r\n\r\n").into_bytes()
    );

    link.push_data(b"HTTP/1.0 200 OK\r\nContent-Length: 4\r\n\r\nBODY");
    h.engine.on_stream_ready(slot, ACTIVATION + 20);

    assert_eq!(h.engine.slot_state(slot), SlotState::Free);
    assert!(!h.engine.any_active());
    let imports = h.store.imports();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].payload.as_deref(), Some(&b"BODY"[..]));
    // The scratch file does not outlive the slot.
    assert_eq!(h.scratch_files(), 0);
}

#[test]
fn test_partial_writes_walk_through_sending_state() {
    let mut h = harness();
    let link = h.connector.expect();
    link.0.borrow_mut().write_budget = Some(10);

    h.engine.suggest(manifest(0xE5, 1, 4), stream_peer(), 0).unwrap();
    h.engine.on_alarm(ACTIVATION);
    let slot = h.active_slot();

    // First readiness: ten bytes go out, then the socket blocks.
    h.engine.on_stream_ready(slot, ACTIVATION + 1);
    assert_eq!(h.engine.slot_state(slot), SlotState::SendingRequest);
    assert_eq!(link.written().len(), 10);

    link.0.borrow_mut().write_budget = None;
    h.engine.on_stream_ready(slot, ACTIVATION + 2);
    assert_eq!(h.engine.slot_state(slot), SlotState::ReceivingHeaders);
}

#[test]
fn test_bad_status_falls_back_to_datagram() {
    let mut h = harness();
    let link = h.connector.expect();
    let m = manifest(0xF6, 9, 4_000);
    let id = m.id;

    h.engine.suggest(m, stream_peer(), 0).unwrap();
    h.engine.on_alarm(ACTIVATION);
    let slot = h.active_slot();

    link.push_data(b"HTTP/1.0 500 X\r\n\r\n");
    link.push_eof();
    h.engine.on_stream_ready(slot, ACTIVATION + 5);

    // The fetch survives on the datagram transport, manifest still held.
    assert_eq!(h.engine.slot_state(slot), SlotState::ReceivingBodyDatagram);
    assert!(h.engine.any_active());

    // First block request went out immediately.
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let req = BlockRequest::decode(&sent[0].bytes).expect("block request");
    assert_eq!(req.id, id);
    assert_eq!(req.version, 9);
    assert_eq!(req.window_start, 0);
    assert_eq!(req.block_len, 200);
    assert_eq!(sent[0].ttl, 1);
    assert_eq!(sent[0].dst, overlay_peer().overlay);

    // Retransmissions run on the 133 ms cadence.
    let t0 = ACTIVATION + 5;
    assert_eq!(h.engine.next_alarm(), Some(t0 + 133));
    h.engine.on_alarm(t0 + 133);
    assert_eq!(h.sent().len(), 2);
    assert_eq!(h.engine.next_alarm(), Some(t0 + 266));
}

#[test]
fn test_fallback_preserves_stream_progress() {
    let mut h = harness();
    let link = h.connector.expect();
    let m = manifest(0x17, 1, 10);
    let id = m.id;

    h.engine.suggest(m, stream_peer(), 0).unwrap();
    h.engine.on_alarm(ACTIVATION);
    let slot = h.active_slot();

    // Headers plus the first half of the body, then the peer dies.
    link.push_data(b"HTTP/1.0 200 OK\r\nContent-Length: 10\r\n\r\nHELLO");
    link.push_eof();
    h.engine.on_stream_ready(slot, ACTIVATION + 5);
    assert_eq!(h.engine.slot_state(slot), SlotState::ReceivingBodyDatagram);

    // The block request resumes from the bytes already banked.
    let sent = h.sent();
    let req = BlockRequest::decode(&sent[0].bytes).unwrap();
    assert_eq!(req.window_start, 5);

    // The datagram transport finishes the job.
    let absorbed = h.engine.on_datagram_content(
        id.prefix(16),
        1,
        5,
        b"WORLD",
        BlockKind::Terminal,
        ACTIVATION + 50,
    );
    assert!(absorbed);
    assert_eq!(h.engine.slot_state(slot), SlotState::Free);
    let imports = h.store.imports();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].payload.as_deref(), Some(&b"HELLOWORLD"[..]));
}

#[test]
fn test_stream_idle_timeout_closes_slot() {
    let mut h = harness();
    let _link = h.connector.expect();

    h.engine.suggest(manifest(0x28, 1, 64), stream_peer(), 0).unwrap();
    h.engine.on_alarm(ACTIVATION);
    let slot = h.active_slot();
    assert_eq!(h.engine.slot_state(slot), SlotState::Connecting);

    // Silence until the idle alarm fires.
    let deadline = h.engine.next_alarm().unwrap();
    assert_eq!(deadline, ACTIVATION + 5_000);
    h.engine.on_alarm(deadline);
    assert!(!h.engine.any_active());
}

// =============================================================================
// DATAGRAM TRANSPORT
// =============================================================================

#[test]
fn test_datagram_assembly_in_order() {
    let mut h = harness();
    let m = manifest(0x39, 4, 750);
    let id = m.id;

    h.engine.suggest(m, overlay_peer(), 0).unwrap();
    h.engine.on_alarm(ACTIVATION);
    let slot = h.active_slot();
    assert_eq!(h.engine.slot_state(slot), SlotState::ReceivingBodyDatagram);

    let mut t = ACTIVATION + 10;
    for offset in [0u64, 200, 400] {
        let block = vec![(offset / 200) as u8 + 1; 200];
        assert!(h.engine.on_datagram_content(
            id.prefix(16),
            4,
            offset,
            &block,
            BlockKind::Partial,
            t,
        ));
        t += 5;
    }
    assert!(h.engine.on_datagram_content(
        id.prefix(16),
        4,
        600,
        &[9u8; 150],
        BlockKind::Terminal,
        t,
    ));

    assert_eq!(h.engine.slot_state(slot), SlotState::Free);
    let imports = h.store.imports();
    assert_eq!(imports.len(), 1);
    let payload = imports[0].payload.as_ref().unwrap();
    assert_eq!(payload.len(), 750);
    assert_eq!(&payload[..200], &[1u8; 200][..]);
    assert_eq!(&payload[400..600], &[3u8; 200][..]);
    assert_eq!(&payload[600..], &[9u8; 150][..]);
}

#[test]
fn test_datagram_out_of_order_blocks_advertised_in_bitmap() {
    let mut h = harness();
    let m = manifest(0x4A, 1, 750);
    let id = m.id;

    h.engine.suggest(m, overlay_peer(), 0).unwrap();
    h.engine.on_alarm(ACTIVATION);
    let slot = h.active_slot();

    // Block 1 arrives before block 0 and is staged, not written.
    let t = ACTIVATION + 10;
    assert!(h.engine.on_datagram_content(
        id.prefix(16),
        1,
        200,
        &[2u8; 200],
        BlockKind::Partial,
        t,
    ));
    h.engine.on_alarm(h.engine.next_alarm().unwrap());
    let last = h.sent().pop().unwrap();
    let req = BlockRequest::decode(&last.bytes).unwrap();
    assert_eq!(req.window_start, 0);
    assert_eq!(req.bitmap, 0b10);

    // The missing block unblocks both.
    assert!(h.engine.on_datagram_content(
        id.prefix(16),
        1,
        0,
        &[1u8; 200],
        BlockKind::Partial,
        ACTIVATION + 150,
    ));
    assert!(h.engine.on_datagram_content(
        id.prefix(16),
        1,
        400,
        &[3u8; 350],
        BlockKind::Terminal,
        ACTIVATION + 155,
    ));
    assert_eq!(h.engine.slot_state(slot), SlotState::Free);
    assert_eq!(h.store.imports()[0].payload.as_ref().unwrap().len(), 750);
}

#[test]
fn test_datagram_idle_timeout_abandons_fetch() {
    let mut h = harness();
    h.engine.suggest(manifest(0x5B, 1, 300), overlay_peer(), 0).unwrap();
    h.engine.on_alarm(ACTIVATION);
    assert!(h.engine.any_active());

    // Step the retransmission alarm with no content ever arriving.
    let mut sends = h.sent().len();
    loop {
        let Some(deadline) = h.engine.next_alarm() else {
            break;
        };
        h.engine.on_alarm(deadline);
        if !h.engine.any_active() {
            break;
        }
        assert!(h.sent().len() > sends, "no retransmission before giving up");
        sends = h.sent().len();
        assert!(deadline < ACTIVATION + 6_000, "fetch should have timed out");
    }
    assert!(!h.engine.any_active());
    assert!(h.store.imports().is_empty());
    // The abandoned transfer's scratch file was unlinked on close.
    assert_eq!(h.scratch_files(), 0);
}

#[test]
fn test_datagram_ignores_unknown_bid_prefix() {
    let mut h = harness();
    h.engine.suggest(manifest(0x6C, 1, 300), overlay_peer(), 0).unwrap();
    h.engine.on_alarm(ACTIVATION);

    let other = BundleId([0x11; 32]);
    assert!(!h.engine.on_datagram_content(
        other.prefix(16),
        1,
        0,
        &[0u8; 200],
        BlockKind::Partial,
        ACTIVATION + 1,
    ));
}

// =============================================================================
// MANIFEST BY PREFIX
// =============================================================================

#[test]
fn test_manifest_by_prefix_round_trip() {
    let mut h = harness();
    let link = h.connector.expect();

    let wanted = manifest(0x7D, 3, 0);
    let prefix = wanted.id.prefix(8).to_vec();
    let body = format!(
        "id={}\nversion=3\nfilesize=0\nfilehash={}\n",
        wanted.id, wanted.payload_hash
    );

    assert_eq!(
        h.engine
            .request_manifest_by_prefix(stream_peer(), &prefix, 0)
            .unwrap(),
        RequestOutcome::Started
    );
    let slot = h.active_slot();

    h.engine.on_stream_ready(slot, 1);
    assert_eq!(
        link.written(),
        format!("GET /rhizome/manifestbyprefix/{} HTTP/1.0\r\n\r\n", hex::encode(&prefix))
            .into_bytes()
    );

    let response = format!("HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
    link.push_data(response.as_bytes());
    h.engine.on_stream_ready(slot, 2);

    // The fetched manifest is fed back through suggestion; with a nil
    // payload it is imported on the spot.
    assert!(!h.engine.any_active());
    let imports = h.store.imports();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].manifest.id, wanted.id);
}

#[test]
fn test_manifest_request_when_all_slots_busy() {
    let mut h = harness();
    // One active fetch per queue class.
    for (id, size) in [
        (1u8, 100u64),
        (2, 20_000),
        (3, 200_000),
        (4, 2_000_000),
        (5, 20_000_000),
    ] {
        h.engine.suggest(manifest(id, 1, size), overlay_peer(), 0).unwrap();
    }
    h.engine.on_alarm(ACTIVATION);
    assert!(h.engine.any_active());

    let out = h
        .engine
        .request_manifest_by_prefix(stream_peer(), &[1, 2, 3, 4], ACTIVATION + 1)
        .unwrap();
    assert_eq!(out, RequestOutcome::SlotBusy);
}

#[test]
fn test_manifest_prefix_bounds() {
    let mut h = harness();
    assert!(matches!(
        h.engine.request_manifest_by_prefix(stream_peer(), &[], 0),
        Err(FetchError::BadPrefix(0))
    ));
    assert!(matches!(
        h.engine.request_manifest_by_prefix(stream_peer(), &[0u8; 33], 0),
        Err(FetchError::BadPrefix(33))
    ));
}

// =============================================================================
// IGNORE CACHE
// =============================================================================

#[test]
fn test_unverifiable_manifest_is_ignored_for_a_minute() {
    let mut h = harness();
    let mut bad = manifest(0x8E, 1, 128);
    bad.self_signed = false;
    h.store.set_unverifiable(bad.id, true);

    let t0 = 1_000;
    assert!(matches!(
        h.engine.suggest(bad.clone(), overlay_peer(), t0),
        Err(FetchError::Verify(_))
    ));
    assert!(!h.engine.any_queued());

    // Within the ignore ttl the same bundle is silently dropped, even from
    // another peer.
    assert_eq!(
        h.engine.suggest(bad.clone(), stream_peer(), t0 + 59_999).unwrap(),
        Suggestion::Ignored
    );

    // Once the suppression lapses (and the manifest verifies) it queues.
    h.store.set_unverifiable(bad.id, false);
    assert_eq!(
        h.engine.suggest(bad, stream_peer(), t0 + 60_001).unwrap(),
        Suggestion::Queued
    );
}

// =============================================================================
// TOKIO CONNECTOR
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_tokio_connector_completes_connect() {
    use rhizome_engine::TokioConnector;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = match listener.local_addr().unwrap() {
        std::net::SocketAddr::V4(a) => a,
        other => panic!("unexpected address family: {other}"),
    };
    let server = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");
        conn.write_all(b"PONG").await.unwrap();
    });

    let mut connector = TokioConnector::new(tokio::runtime::Handle::current());
    let mut link = connector.connect(addr).unwrap();

    // The link reports WouldBlock until the background connect lands.
    let mut written = 0;
    while written < 4 {
        match link.try_write(&b"PING"[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            Err(e) => panic!("write failed: {e}"),
        }
    }

    let mut reply = Vec::new();
    while reply.len() < 4 {
        let mut buf = [0u8; 16];
        match link.try_read(&mut buf) {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(reply, b"PONG");
    server.await.unwrap();
}
