use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use sha1::{Digest, Sha1};
use tokio::sync::oneshot;

use crate::{
    block::{bytes_to_request, BlockInfo},
    fs::FileManager,
    metainfo::Metainfo,
    p2p::{PeerConnection, PeerConnector},
    tracker::TrackerClient,
    Bitfield,
};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator already initialized")]
    AlreadyInitialized,

    #[error("coordinator not initialized")]
    NotInitialized,

    #[error("metainfo descriptor is malformed: {0}")]
    MalformedDescriptor(String),

    #[error("metainfo descriptor could not be read: {0}")]
    DescriptorIoError(String),

    #[error("tracker unreachable: {0}")]
    TrackerUnreachable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Uninitialized,
    Initialized,
    Started,
}

/// An async follow-up a synchronous event handler asked the actor to perform.
/// `ConnectPeers(k)` is the only one this core needs: request `k` more
/// tracker peers and open connections to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ConnectPeers(usize),
}

#[derive(Clone)]
struct Reservation {
    piece_index: usize,
    bytes_received: usize,
    hasher: Sha1,
    tick: u64,
}

struct ActiveRequest {
    reservation: Reservation,
    retries: u32,
}

struct PartialPiece {
    piece_index: usize,
    bytes_received: usize,
    hasher: Sha1,
}

/// The piece/peer bookkeeping state machine. Owned exclusively by one task
/// (see `CoordinatorActor`); every method here either runs to completion
/// synchronously or, for the two lifecycle entry points, suspends only on
/// its own collaborators, never on peer I/O.
pub struct Coordinator {
    metainfo: Arc<dyn Metainfo>,
    file_manager: Arc<dyn FileManager>,
    tracker: Box<dyn TrackerClient>,
    connector: Box<dyn PeerConnector>,

    peer_pool_size: usize,
    stale_interest_ticks: u64,
    stale_request_ticks: u64,
    max_request_retries: u32,

    state: CoordinatorState,
    have: Bitfield,
    needed: HashMap<usize, (u32, HashSet<SocketAddr>)>,
    peers: BTreeMap<SocketAddr, Box<dyn PeerConnection>>,
    bitfields: HashMap<SocketAddr, Bitfield>,
    interested: HashMap<SocketAddr, Reservation>,
    requesting: HashMap<SocketAddr, ActiveRequest>,
    partial: Vec<PartialPiece>,
    tick_count: u64,
    completion_tx: Option<oneshot::Sender<()>>,
}

impl Coordinator {
    pub fn new(
        metainfo: Arc<dyn Metainfo>,
        file_manager: Arc<dyn FileManager>,
        tracker: Box<dyn TrackerClient>,
        connector: Box<dyn PeerConnector>,
        config: &crate::CoordinatorConfig,
    ) -> Self {
        Self {
            metainfo,
            file_manager,
            tracker,
            connector,
            peer_pool_size: config.peer_pool_size,
            stale_interest_ticks: config.stale_interest_ticks,
            stale_request_ticks: config.stale_request_ticks,
            max_request_retries: config.max_request_retries,
            state: CoordinatorState::Uninitialized,
            have: Bitfield::new(),
            needed: HashMap::new(),
            peers: BTreeMap::new(),
            bitfields: HashMap::new(),
            interested: HashMap::new(),
            requesting: HashMap::new(),
            partial: Vec::new(),
            tick_count: 0,
            completion_tx: None,
        }
    }

    fn num_pieces(&self) -> usize {
        self.metainfo.num_pieces() as usize
    }

    fn piece_length(&self, index: usize) -> usize {
        if index as u32 == self.metainfo.num_pieces() - 1 {
            (self.metainfo.total_length()
                - self.metainfo.piece_length() as u64 * (self.metainfo.num_pieces() as u64 - 1))
                as usize
        } else {
            self.metainfo.piece_length()
        }
    }

    // -- 4.1 Lifecycle controller --------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn initialize(&mut self) -> Result<(), CoordinatorError> {
        if self.state != CoordinatorState::Uninitialized {
            return Err(CoordinatorError::AlreadyInitialized);
        }

        self.have = self.file_manager.have();
        self.needed = (0..self.num_pieces())
            .filter(|&i| !self.have[i])
            .map(|i| (i, (0u32, HashSet::new())))
            .collect();

        self.tracker
            .start()
            .await
            .map_err(|e| CoordinatorError::TrackerUnreachable(e.to_string()))?;

        self.state = CoordinatorState::Initialized;
        tracing::info!(needed = self.needed.len(), total = self.num_pieces(), "coordinator initialized");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<oneshot::Receiver<()>, CoordinatorError> {
        match self.state {
            CoordinatorState::Uninitialized => return Err(CoordinatorError::NotInitialized),
            CoordinatorState::Started => return Err(CoordinatorError::AlreadyInitialized),
            CoordinatorState::Initialized => {}
        }

        let (tx, rx) = oneshot::channel();
        self.completion_tx = Some(tx);
        self.tick_count = 1;
        self.state = CoordinatorState::Started;

        if self.needed.is_empty() {
            self.fire_completion();
        } else {
            self.connect_to_peers(self.peer_pool_size).await;
        }

        Ok(rx)
    }

    pub fn percent(&self) -> Result<f64, CoordinatorError> {
        if self.state == CoordinatorState::Uninitialized {
            return Err(CoordinatorError::NotInitialized);
        }
        let total = self.num_pieces().max(1);
        Ok(100.0 * (1.0 - self.needed.len() as f64 / total as f64))
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.metainfo.info_hash()
    }

    pub fn name(&self) -> String {
        self.metainfo.name().to_string()
    }

    pub fn get_bitfield(&self) -> Bitfield {
        self.have.clone()
    }

    fn fire_completion(&mut self) {
        if let Some(tx) = self.completion_tx.take() {
            let _ = tx.send(());
        }
    }

    // -- 4.2 Peer-pool maintainer ----------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn connect_to_peers(&mut self, k: usize) {
        let addrs = match self.tracker.get_peers(k).await {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::warn!(error = %e, "get_peers failed, pool left smaller than requested");
                return;
            }
        };

        let num_pieces = self.num_pieces();
        for addr in addrs {
            if self.peers.contains_key(&addr) {
                continue;
            }
            match self.connector.connect(addr).await {
                Ok(conn) => {
                    self.peers.insert(addr, conn);
                    self.bitfields.insert(addr, Bitfield::repeat(false, num_pieces));
                }
                Err(e) => tracing::warn!(%addr, error = %e, "failed to connect to peer"),
            }
        }
    }

    pub fn remove_peer(&mut self, peer: SocketAddr) -> Vec<Effect> {
        self.remove_peer_bookkeeping(peer);
        vec![Effect::ConnectPeers(1)]
    }

    fn remove_peer_bookkeeping(&mut self, peer: SocketAddr) {
        self.peers.remove(&peer);
        if let Some(bf) = self.bitfields.remove(&peer) {
            for i in 0..bf.len().min(self.have.len()) {
                if bf[i] {
                    if let Some((rarity, set)) = self.needed.get_mut(&i) {
                        if set.remove(&peer) {
                            *rarity -= 1;
                        }
                    }
                }
            }
        }
        self.interested.remove(&peer);
        if let Some(active) = self.requesting.remove(&peer) {
            self.partial.push(PartialPiece {
                piece_index: active.reservation.piece_index,
                bytes_received: active.reservation.bytes_received,
                hasher: active.reservation.hasher,
            });
        }
    }

    fn drop_as_protocol_violation(&mut self, peer: SocketAddr) -> Vec<Effect> {
        tracing::warn!(%peer, "protocol violation, dropping peer");
        if let Some(conn) = self.peers.get(&peer) {
            conn.drop_connection();
        }
        self.remove_peer_bookkeeping(peer);
        vec![Effect::ConnectPeers(1)]
    }

    // -- 4.3 Availability tracker ------------------------------------------

    pub fn peer_bitfield(&mut self, peer: SocketAddr, bitfield: Bitfield) -> Vec<Effect> {
        let num_pieces = self.num_pieces();
        if bitfield.len() < num_pieces || bitfield[num_pieces..].iter().any(|b| *b) {
            return self.drop_as_protocol_violation(peer);
        }

        let mut bitfield = bitfield;
        bitfield.truncate(num_pieces);

        if let Some(old) = self.bitfields.remove(&peer) {
            for i in 0..old.len() {
                if old[i] {
                    if let Some((rarity, set)) = self.needed.get_mut(&i) {
                        if set.remove(&peer) {
                            *rarity -= 1;
                        }
                    }
                }
            }
        }

        for i in 0..num_pieces {
            if bitfield[i] {
                if let Some((rarity, set)) = self.needed.get_mut(&i) {
                    if set.insert(peer) {
                        *rarity += 1;
                    }
                }
            }
        }

        self.bitfields.insert(peer, bitfield);
        self.check_interest(peer)
    }

    pub fn peer_has(&mut self, peer: SocketAddr, index: usize) -> Vec<Effect> {
        if index >= self.num_pieces() {
            return self.drop_as_protocol_violation(peer);
        }

        if let Some(bf) = self.bitfields.get_mut(&peer) {
            bf.set(index, true);
        }
        if let Some((rarity, set)) = self.needed.get_mut(&index) {
            if set.insert(peer) {
                *rarity += 1;
            }
        }

        self.check_interest(peer)
    }

    // -- 4.4 Interest & assignment policy ----------------------------------

    pub fn check_interest(&mut self, peer: SocketAddr) -> Vec<Effect> {
        if self.interested.contains_key(&peer) || self.requesting.contains_key(&peer) {
            return vec![];
        }

        let Some(bf) = self.bitfields.get(&peer) else { return vec![] };
        let mut candidates: Vec<usize> =
            (0..self.have.len()).filter(|&i| !self.have[i] && bf[i]).collect();

        if candidates.is_empty() {
            if let Some(conn) = self.peers.get(&peer) {
                if conn.is_interested() {
                    conn.not_interested();
                    return vec![Effect::ConnectPeers(1)];
                }
            }
            return vec![];
        }

        if let Some(pos) = self.partial.iter().position(|p| candidates.contains(&p.piece_index)) {
            let partial = self.partial.remove(pos);
            self.interested.insert(
                peer,
                Reservation {
                    piece_index: partial.piece_index,
                    bytes_received: partial.bytes_received,
                    hasher: partial.hasher,
                    tick: self.tick_count,
                },
            );
            self.begin_or_wait(peer);
            return vec![];
        }

        let reserved: HashSet<usize> = self
            .interested
            .values()
            .map(|r| r.piece_index)
            .chain(self.requesting.values().map(|a| a.reservation.piece_index))
            .collect();
        candidates.retain(|i| !reserved.contains(i));
        if candidates.is_empty() {
            return vec![];
        }

        candidates.sort_by_key(|&i| (self.needed.get(&i).map(|(r, _)| *r).unwrap_or(u32::MAX), i));
        let chosen = candidates[0];
        self.interested.insert(
            peer,
            Reservation { piece_index: chosen, bytes_received: 0, hasher: Sha1::new(), tick: self.tick_count },
        );
        self.begin_or_wait(peer);
        vec![]
    }

    fn begin_or_wait(&mut self, peer: SocketAddr) {
        let Some(conn) = self.peers.get(&peer) else { return };
        if !conn.is_interested() {
            conn.interested();
        }
        if !conn.is_peer_choked() {
            self.request(peer);
        }
    }

    // -- 4.5 Block-request engine ------------------------------------------

    fn request(&mut self, peer: SocketAddr) {
        if let Some(reservation) = self.interested.remove(&peer) {
            self.requesting.insert(peer, ActiveRequest { reservation, retries: 0 });
        }
        let Some(active) = self.requesting.get(&peer) else { return };
        let piece_len = self.piece_length(active.reservation.piece_index);
        let len = bytes_to_request(piece_len, active.reservation.bytes_received);
        if let Some(conn) = self.peers.get(&peer) {
            conn.request(BlockInfo {
                piece_idx: active.reservation.piece_index,
                offset: active.reservation.bytes_received,
                len,
            });
        }
    }

    pub fn peer_sent_block(&mut self, peer: SocketAddr, index: usize, begin: usize, data: Vec<u8>) -> Vec<Effect> {
        let piece_len = self.piece_length(index);
        let Some(active) = self.requesting.get_mut(&peer) else { return vec![] };
        if active.reservation.piece_index != index || active.reservation.bytes_received != begin {
            return vec![];
        }

        active.reservation.hasher.update(&data);
        self.file_manager.write_block(index, begin, &data);
        active.reservation.bytes_received += data.len();
        active.reservation.tick = self.tick_count;
        active.retries = 0;

        if active.reservation.bytes_received < piece_len {
            self.request(peer);
            return vec![];
        }

        let active = self.requesting.remove(&peer).unwrap();
        let got: [u8; 20] = active.reservation.hasher.clone().finalize().into();
        let expected = self.metainfo.piece_hash(index);

        if got == expected {
            self.needed.remove(&index);
            self.have.set(index, true);
            tracing::info!(index, "piece verified");
        } else {
            tracing::warn!(index, "hash mismatch, piece remains needed");
        }

        if self.needed.is_empty() {
            self.fire_completion();
            vec![]
        } else {
            self.check_interest(peer)
        }
    }

    // -- 4.6 Choke/unchoke handling -----------------------------------------

    pub fn peer_unchoked(&mut self, peer: SocketAddr) -> Vec<Effect> {
        if self.interested.contains_key(&peer) {
            self.request(peer);
        }
        vec![]
    }

    pub fn peer_choked(&mut self, peer: SocketAddr) -> Vec<Effect> {
        if self.interested.remove(&peer).is_some() {
            return vec![];
        }
        if let Some(active) = self.requesting.remove(&peer) {
            self.partial.push(PartialPiece {
                piece_index: active.reservation.piece_index,
                bytes_received: active.reservation.bytes_received,
                hasher: active.reservation.hasher,
            });
        }
        vec![]
    }

    // -- 4.7 Timer sweep ------------------------------------------------------

    pub fn tick(&mut self) -> Vec<Effect> {
        self.tick_count += 1;
        let tick = self.tick_count;
        let mut effects = Vec::new();

        let stale_interest: Vec<SocketAddr> = self
            .interested
            .iter()
            .filter(|(_, r)| r.tick + self.stale_interest_ticks == tick)
            .map(|(p, _)| *p)
            .collect();
        for peer in stale_interest {
            self.interested.remove(&peer);
            if let Some(conn) = self.peers.get(&peer) {
                conn.not_interested();
            }
            effects.push(Effect::ConnectPeers(1));
        }

        let stale_request: Vec<SocketAddr> = self
            .requesting
            .iter()
            .filter(|(_, a)| a.reservation.tick + self.stale_request_ticks == tick)
            .map(|(p, _)| *p)
            .collect();
        for peer in stale_request {
            let give_up = self.requesting.get(&peer).map(|a| a.retries >= self.max_request_retries).unwrap_or(false);
            if give_up {
                if let Some(active) = self.requesting.remove(&peer) {
                    self.partial.push(PartialPiece {
                        piece_index: active.reservation.piece_index,
                        bytes_received: active.reservation.bytes_received,
                        hasher: active.reservation.hasher,
                    });
                }
                if let Some(conn) = self.peers.get(&peer) {
                    conn.not_interested();
                }
                effects.push(Effect::ConnectPeers(1));
            } else {
                if let Some(active) = self.requesting.get_mut(&peer) {
                    active.retries += 1;
                    active.reservation.tick = tick;
                }
                self.request(peer);
            }
        }

        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileInfo;
    use std::sync::Mutex;

    struct FakeMetainfo {
        pieces: Vec<[u8; 20]>,
        piece_len: usize,
        last_piece_len: usize,
    }

    impl FakeMetainfo {
        fn new(pieces: Vec<[u8; 20]>, piece_len: usize, last_piece_len: usize) -> Self {
            Self { pieces, piece_len, last_piece_len }
        }
    }

    impl Metainfo for FakeMetainfo {
        fn num_pieces(&self) -> u32 {
            self.pieces.len() as u32
        }
        fn piece_length(&self) -> usize {
            self.piece_len
        }
        fn total_length(&self) -> u64 {
            (self.piece_len * (self.pieces.len() - 1) + self.last_piece_len) as u64
        }
        fn piece_hash(&self, index: usize) -> [u8; 20] {
            self.pieces[index]
        }
        fn announce_tiers(&self) -> Vec<Vec<crate::tracker::TrackerDescriptor>> {
            Vec::new()
        }
        fn info_hash(&self) -> [u8; 20] {
            [0u8; 20]
        }
        fn name(&self) -> &str {
            "fake"
        }
        fn is_multi_file(&self) -> bool {
            false
        }
        fn files(&self) -> Vec<FileInfo> {
            Vec::new()
        }
    }

    struct FakeFileManager {
        writes: Mutex<Vec<(usize, usize, Vec<u8>)>>,
    }

    impl FakeFileManager {
        fn new() -> Self {
            Self { writes: Mutex::new(Vec::new()) }
        }
    }

    impl FileManager for FakeFileManager {
        fn have(&self) -> Bitfield {
            Bitfield::new()
        }
        fn write_block(&self, piece_index: usize, offset: usize, data: &[u8]) {
            self.writes.lock().unwrap().push((piece_index, offset, data.to_vec()));
        }
    }

    struct FakeTracker;

    #[async_trait::async_trait]
    impl TrackerClient for FakeTracker {
        async fn start(&mut self) -> Result<Vec<SocketAddr>, crate::tracker::TrackerError> {
            Ok(Vec::new())
        }
        async fn get_peers(&mut self, _n: usize) -> Result<Vec<SocketAddr>, crate::tracker::TrackerError> {
            Ok(Vec::new())
        }
    }

    struct FakeConnector;

    #[async_trait::async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn PeerConnection>, crate::p2p::PeerError> {
            Ok(Box::new(FakePeer::new(addr)))
        }
    }

    struct FakePeer {
        addr: SocketAddr,
        interested: std::sync::atomic::AtomicBool,
        peer_choked: std::sync::atomic::AtomicBool,
        requests: Mutex<Vec<BlockInfo>>,
        dropped: std::sync::atomic::AtomicBool,
    }

    impl FakePeer {
        fn new(addr: SocketAddr) -> Self {
            Self {
                addr,
                interested: std::sync::atomic::AtomicBool::new(false),
                peer_choked: std::sync::atomic::AtomicBool::new(true),
                requests: Mutex::new(Vec::new()),
                dropped: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn unchoke(&self) {
            self.peer_choked.store(false, std::sync::atomic::Ordering::Relaxed);
        }
    }

    impl PeerConnection for FakePeer {
        fn addr(&self) -> SocketAddr {
            self.addr
        }
        fn interested(&self) {
            self.interested.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        fn not_interested(&self) {
            self.interested.store(false, std::sync::atomic::Ordering::Relaxed);
        }
        fn request(&self, block: BlockInfo) {
            self.requests.lock().unwrap().push(block);
        }
        fn drop_connection(&self) {
            self.dropped.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        fn is_interested(&self) -> bool {
            self.interested.load(std::sync::atomic::Ordering::Relaxed)
        }
        fn is_peer_choked(&self) -> bool {
            self.peer_choked.load(std::sync::atomic::Ordering::Relaxed)
        }
    }

    fn addr(n: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], n))
    }

    fn new_coordinator(num_pieces: usize, piece_len: usize, last_piece_len: usize) -> Coordinator {
        let pieces = vec![[0u8; 20]; num_pieces];
        let metainfo: Arc<dyn Metainfo> = Arc::new(FakeMetainfo::new(pieces, piece_len, last_piece_len));
        let file_manager: Arc<dyn FileManager> = Arc::new(FakeFileManager::new());
        let tracker: Box<dyn TrackerClient> = Box::new(FakeTracker);
        let connector: Box<dyn PeerConnector> = Box::new(FakeConnector);
        let config = crate::CoordinatorConfig::default();
        let mut c = Coordinator::new(metainfo, file_manager, tracker, connector, &config);
        c.have = Bitfield::repeat(false, num_pieces);
        c.needed = (0..num_pieces).map(|i| (i, (0u32, HashSet::new()))).collect();
        c.state = CoordinatorState::Started;
        c.tick_count = 1;
        c
    }

    fn add_peer(c: &mut Coordinator, a: SocketAddr) {
        c.peers.insert(a, Box::new(FakePeer::new(a)));
        let n = c.num_pieces();
        c.bitfields.insert(a, Bitfield::repeat(false, n));
    }

    // Tests need to inspect a peer's recorded commands after handing the
    // coordinator a `Box<dyn PeerConnection>`, so they keep their own
    // `Arc<FakePeer>` alongside the boxed trait object via this wrapper.
    struct SharedFakePeer(Arc<FakePeer>);

    impl PeerConnection for SharedFakePeer {
        fn addr(&self) -> SocketAddr {
            self.0.addr()
        }
        fn interested(&self) {
            self.0.interested()
        }
        fn not_interested(&self) {
            self.0.not_interested()
        }
        fn request(&self, block: BlockInfo) {
            self.0.request(block)
        }
        fn drop_connection(&self) {
            self.0.drop_connection()
        }
        fn is_interested(&self) -> bool {
            self.0.is_interested()
        }
        fn is_peer_choked(&self) -> bool {
            self.0.is_peer_choked()
        }
    }

    fn add_peer_shared(c: &mut Coordinator, a: SocketAddr) -> Arc<FakePeer> {
        let fake = Arc::new(FakePeer::new(a));
        c.peers.insert(a, Box::new(SharedFakePeer(fake.clone())));
        let n = c.num_pieces();
        c.bitfields.insert(a, Bitfield::repeat(false, n));
        fake
    }

    fn set_bits(n: usize, set: &[usize]) -> Bitfield {
        let mut bf = Bitfield::repeat(false, n);
        for &i in set {
            bf.set(i, true);
        }
        bf
    }

    #[test]
    fn s1_rarest_first() {
        // Left choked: reservations stay visible in `interested` instead of
        // immediately promoting to `requesting`.
        let mut c = new_coordinator(3, 100, 100);
        let a = addr(1);
        let b = addr(2);
        let cc = addr(3);
        let _peer_a = add_peer_shared(&mut c, a);
        let _peer_b = add_peer_shared(&mut c, b);
        let _peer_c = add_peer_shared(&mut c, cc);

        c.peer_bitfield(a, set_bits(3, &[0, 1]));
        c.peer_bitfield(b, set_bits(3, &[1]));
        c.peer_bitfield(cc, set_bits(3, &[0, 2]));

        // Piece 2 has rarity 1 (only C) and must go to C.
        assert_eq!(c.interested.get(&cc).map(|r| r.piece_index), Some(2));
        // A claims piece 0 first (assigned before B or C report in), B then
        // gets the only piece left it can have.
        assert_eq!(c.interested.get(&a).map(|r| r.piece_index), Some(0));
        assert_eq!(c.interested.get(&b).map(|r| r.piece_index), Some(1));
    }

    #[test]
    fn s2_partial_resume() {
        let piece_len = 3 * crate::BLOCK_SIZE;
        let mut c = new_coordinator(1, piece_len, piece_len);
        let a = addr(1);
        let b = addr(2);
        let peer_a = add_peer_shared(&mut c, a);
        let peer_b = add_peer_shared(&mut c, b);
        peer_a.unchoke();

        // check_interest() sees `a` already unchoked and promotes the
        // reservation straight into `requesting`.
        c.peer_bitfield(a, set_bits(1, &[0]));
        assert_eq!(c.requesting.get(&a).map(|r| r.reservation.piece_index), Some(0));

        let block0 = vec![1u8; crate::BLOCK_SIZE];
        let block1 = vec![2u8; crate::BLOCK_SIZE];
        c.peer_sent_block(a, 0, 0, block0.clone());
        c.peer_sent_block(a, 0, crate::BLOCK_SIZE, block1.clone());

        // A chokes us mid-piece: its progress spills into `partial`.
        c.peer_choked(a);
        assert_eq!(c.partial.len(), 1);
        assert_eq!(c.partial[0].bytes_received, 2 * crate::BLOCK_SIZE);

        c.peer_bitfield(b, set_bits(1, &[0]));
        peer_b.unchoke();
        c.peer_unchoked(b);

        let reqs = peer_b.requests.lock().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].offset, 2 * crate::BLOCK_SIZE);
        assert_eq!(reqs[0].len, crate::BLOCK_SIZE);
    }

    #[test]
    fn s3_hash_failure_leaves_piece_needed() {
        let mut c = new_coordinator(1, 16, 16);
        let a = addr(1);
        let peer_a = add_peer_shared(&mut c, a);
        peer_a.unchoke();
        c.peer_bitfield(a, set_bits(1, &[0]));
        c.peer_unchoked(a);

        c.peer_sent_block(a, 0, 0, vec![0xFFu8; 16]);

        assert!(c.needed.contains_key(&0));
        assert!(!c.have[0]);
    }

    #[test]
    fn s4_stale_interest_timeout() {
        let mut c = new_coordinator(1, 16, 16);
        let a = addr(1);
        let _peer_a = add_peer_shared(&mut c, a);
        c.peer_bitfield(a, set_bits(1, &[0]));
        assert!(c.interested.contains_key(&a));

        let mut effects = Vec::new();
        for _ in 0..4 {
            effects = c.tick();
        }
        assert!(!c.interested.contains_key(&a));
        assert!(effects.contains(&Effect::ConnectPeers(1)));
    }

    #[test]
    fn s5_request_retry_then_give_up() {
        let mut c = new_coordinator(1, crate::BLOCK_SIZE, crate::BLOCK_SIZE);
        let a = addr(1);
        let peer_a = add_peer_shared(&mut c, a);
        peer_a.unchoke();
        c.peer_bitfield(a, set_bits(1, &[0]));
        c.peer_unchoked(a);
        assert!(c.requesting.contains_key(&a));

        for _ in 0..5 {
            c.tick();
        }
        assert_eq!(c.requesting.get(&a).map(|r| r.retries), Some(1));

        for _ in 0..5 {
            c.tick();
        }
        assert_eq!(c.requesting.get(&a).map(|r| r.retries), Some(2));

        let effects = (0..5).map(|_| c.tick()).last().unwrap();
        assert!(!c.requesting.contains_key(&a));
        assert_eq!(c.partial.len(), 1);
        assert!(effects.contains(&Effect::ConnectPeers(1)));
    }

    #[test]
    fn s6_misaligned_block_discarded() {
        let mut c = new_coordinator(1, 2 * crate::BLOCK_SIZE, 2 * crate::BLOCK_SIZE);
        let a = addr(1);
        let peer_a = add_peer_shared(&mut c, a);
        peer_a.unchoke();
        c.peer_bitfield(a, set_bits(1, &[0]));
        c.peer_unchoked(a);

        let before = c.requesting.get(&a).map(|r| r.reservation.bytes_received);
        c.peer_sent_block(a, 0, crate::BLOCK_SIZE, vec![0u8; crate::BLOCK_SIZE]);
        let after = c.requesting.get(&a).map(|r| r.reservation.bytes_received);
        assert_eq!(before, after);
    }

    #[test]
    fn duplicate_have_does_not_double_count_rarity() {
        let mut c = new_coordinator(1, 16, 16);
        let a = addr(1);
        add_peer(&mut c, a);
        c.peer_has(a, 0);
        c.peer_has(a, 0);
        assert_eq!(c.needed.get(&0).map(|(r, _)| *r), Some(1));
    }

    #[test]
    fn bitfield_replaces_not_merges() {
        let mut c = new_coordinator(2, 16, 16);
        let a = addr(1);
        add_peer(&mut c, a);
        c.peer_bitfield(a, set_bits(2, &[0]));
        c.peer_bitfield(a, set_bits(2, &[1]));
        assert_eq!(c.needed.get(&0).map(|(r, _)| *r), Some(0));
        assert_eq!(c.needed.get(&1).map(|(r, _)| *r), Some(1));
    }

    #[test]
    fn invalid_bitfield_length_drops_peer() {
        let mut c = new_coordinator(4, 16, 16);
        let a = addr(1);
        add_peer(&mut c, a);
        let effects = c.peer_bitfield(a, Bitfield::repeat(false, 2));
        assert!(!c.peers.contains_key(&a));
        assert!(effects.contains(&Effect::ConnectPeers(1)));
    }
}
