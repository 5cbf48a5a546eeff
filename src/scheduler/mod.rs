//! Block-request scheduling and piece assembly.
//!
//! The scheduler matches wanted blocks to the peers that can supply them
//! and reassembles arriving blocks into pieces. It never touches the
//! network: the session layer sends the requests it allocates and feeds
//! back the blocks that arrive.

use crate::bitfield::BitField;
use crate::storage::PieceStore;
use crate::wire::BlockInfo;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Request/transfer granularity within a piece.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Downstream notifications emitted by the scheduler.
///
/// Callbacks run outside the scheduler lock, so they may call back into
/// the scheduler (a `piece_assembled` handler that fails verification can
/// re-request immediately, for example).
pub trait SchedulerListener: Send + Sync {
    /// Every block of `piece` has arrived. The piece is *unverified* and
    /// stays wanted until [`RequestScheduler::set_piece_not_needed`] is
    /// called, so a verification failure cannot lose track of it.
    /// Emitted exactly once per assembly.
    fn piece_assembled(&self, piece: u32, data: Bytes, verification: Option<Bytes>);

    /// Requests previously allocated to `peer` have been withdrawn; the
    /// session should send matching cancel messages.
    fn requests_cancelled(&self, peer: SocketAddr, blocks: Vec<BlockInfo>);
}

struct PeerEntry {
    have: BitField,
    allowed_fast: HashSet<u32>,
    suggested: Vec<u32>,
    outstanding: HashSet<BlockInfo>,
}

struct PartialPiece {
    data: Vec<u8>,
    received: Vec<bool>,
    received_count: usize,
    verification: Option<Bytes>,
    assembled: bool,
}

impl PartialPiece {
    fn new(piece_size: u32) -> Self {
        let blocks = piece_size.div_ceil(BLOCK_SIZE) as usize;
        Self {
            data: vec![0; piece_size as usize],
            received: vec![false; blocks],
            received_count: 0,
            verification: None,
            assembled: false,
        }
    }

    fn block_count(&self) -> usize {
        self.received.len()
    }
}

struct SchedulerState {
    piece_count: u32,
    wanted: BitField,
    availability: Vec<u32>,
    peers: HashMap<SocketAddr, PeerEntry>,
    partial: HashMap<u32, PartialPiece>,
    /// How many peers currently hold an outstanding request for a block;
    /// drives end-game duplication.
    outstanding_global: HashMap<BlockInfo, u32>,
}

/// Allocates block requests and assembles received pieces.
///
/// All methods take `&self`: the state is guarded by an internal mutex so
/// `handle_block` from the session and `set_piece_not_needed` from the
/// verification path may race safely.
pub struct RequestScheduler {
    store: Arc<dyn PieceStore>,
    listener: Arc<dyn SchedulerListener>,
    state: Mutex<SchedulerState>,
}

impl RequestScheduler {
    pub fn new(store: Arc<dyn PieceStore>, listener: Arc<dyn SchedulerListener>) -> Self {
        let piece_count = store.piece_count();
        Self {
            store,
            listener,
            state: Mutex::new(SchedulerState {
                piece_count,
                wanted: BitField::new(piece_count),
                availability: vec![0; piece_count as usize],
                peers: HashMap::new(),
                partial: HashMap::new(),
                outstanding_global: HashMap::new(),
            }),
        }
    }

    /// Registers a peer. Registering the same peer twice is a caller bug
    /// and panics.
    pub fn register_peer(&self, peer: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        let piece_count = state.piece_count;
        let previous = state.peers.insert(
            peer,
            PeerEntry {
                have: BitField::new(piece_count),
                allowed_fast: HashSet::new(),
                suggested: Vec::new(),
                outstanding: HashSet::new(),
            },
        );
        assert!(previous.is_none(), "peer {} registered twice", peer);
    }

    /// Removes a peer, releasing its availability contribution and any
    /// outstanding requests.
    pub fn deregister_peer(&self, peer: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(entry) = state.peers.remove(&peer) else {
            return;
        };
        for piece in entry.have.iter_set() {
            state.availability[piece as usize] -= 1;
        }
        for block in entry.outstanding {
            release_global(&mut state.outstanding_global, block);
        }
    }

    /// Applies a full possession bitfield for `peer`, replacing whatever
    /// was recorded before. Returns true if the update created new
    /// interest: some wanted piece this peer newly has.
    pub fn pieces_available(&self, peer: SocketAddr, bitfield: &BitField) -> bool {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let piece_count = state.piece_count;
        let mut interesting = false;

        for piece in 0..piece_count {
            let now_has = bitfield.get(piece);
            let entry = state.peers.get_mut(&peer).expect("peer not registered");
            let had = entry.have.get(piece);
            if now_has && !had {
                entry.have.set(piece);
                state.availability[piece as usize] += 1;
                if state.wanted.get(piece) {
                    interesting = true;
                }
            } else if !now_has && had {
                entry.have.unset(piece);
                state.availability[piece as usize] -= 1;
            }
        }
        interesting
    }

    /// Records that `peer` now has `piece` (a have message). Returns true
    /// if that created new interest.
    pub fn piece_available(&self, peer: SocketAddr, piece: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        if piece >= state.piece_count {
            warn!(%peer, piece, "have for out-of-range piece ignored");
            return false;
        }
        let entry = state.peers.get_mut(&peer).expect("peer not registered");
        if !entry.have.set(piece) {
            return false;
        }
        state.availability[piece as usize] += 1;
        state.wanted.get(piece)
    }

    /// Marks a piece the peer allows us to request while choked.
    pub fn set_piece_allowed_fast(&self, peer: SocketAddr, piece: u32) {
        let mut state = self.state.lock().unwrap();
        let entry = state.peers.get_mut(&peer).expect("peer not registered");
        entry.allowed_fast.insert(piece);
    }

    /// Records a piece the peer suggested we fetch from it.
    pub fn set_piece_suggested(&self, peer: SocketAddr, piece: u32) {
        let mut state = self.state.lock().unwrap();
        let entry = state.peers.get_mut(&peer).expect("peer not registered");
        if !entry.suggested.contains(&piece) {
            entry.suggested.push(piece);
        }
    }

    /// Pieces the peer suggested, consulted only when the caller asks.
    pub fn suggested_pieces(&self, peer: SocketAddr) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        state
            .peers
            .get(&peer)
            .map(|entry| entry.suggested.clone())
            .unwrap_or_default()
    }

    /// Greedily fills up to `count` request slots from pieces the peer has
    /// and the engine still wants, preferring pieces nearer completion.
    ///
    /// With `allowed_fast_only` the candidates are restricted to the
    /// peer's allowed-fast set. Blocks no peer has been asked for yet come
    /// first; once every missing block of the candidate pieces is already
    /// on the wire somewhere, the same blocks are issued again to other
    /// peers rather than stalling on a slow holder. The result is
    /// deterministic for identical state: pieces ordered by fewest missing
    /// blocks then lowest index, blocks by offset.
    pub fn allocate_requests(
        &self,
        peer: SocketAddr,
        count: usize,
        allowed_fast_only: bool,
    ) -> Vec<BlockInfo> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let entry = state.peers.get_mut(&peer).expect("peer not registered");

        let mut candidates: Vec<(u32, usize)> = Vec::new();
        for piece in 0..state.piece_count {
            if !state.wanted.get(piece) || !entry.have.get(piece) {
                continue;
            }
            if allowed_fast_only && !entry.allowed_fast.contains(&piece) {
                continue;
            }
            let total_blocks =
                self.store.piece_size(piece).div_ceil(BLOCK_SIZE) as usize;
            let received = state
                .partial
                .get(&piece)
                .map(|p| p.received_count)
                .unwrap_or(0);
            if received < total_blocks {
                candidates.push((piece, total_blocks - received));
            }
        }
        candidates.sort_by_key(|&(piece, missing)| (missing, piece));

        let mut allocated = Vec::new();
        // First pass: blocks nobody has been asked for.
        for &(piece, _) in &candidates {
            if allocated.len() >= count {
                break;
            }
            self.take_blocks(state, piece, peer, count, false, &mut allocated);
        }
        // Second pass, end-game: duplicate requests already on the wire.
        for &(piece, _) in &candidates {
            if allocated.len() >= count {
                break;
            }
            self.take_blocks(state, piece, peer, count, true, &mut allocated);
        }

        let entry = state.peers.get_mut(&peer).expect("peer not registered");
        for block in &allocated {
            entry.outstanding.insert(*block);
            *state.outstanding_global.entry(*block).or_insert(0) += 1;
        }
        allocated
    }

    fn take_blocks(
        &self,
        state: &SchedulerState,
        piece: u32,
        peer: SocketAddr,
        count: usize,
        duplicates: bool,
        allocated: &mut Vec<BlockInfo>,
    ) {
        let piece_size = self.store.piece_size(piece);
        let total_blocks = piece_size.div_ceil(BLOCK_SIZE);
        let entry = &state.peers[&peer];

        for index in 0..total_blocks {
            if allocated.len() >= count {
                return;
            }
            if state
                .partial
                .get(&piece)
                .is_some_and(|p| p.received[index as usize])
            {
                continue;
            }
            let offset = index * BLOCK_SIZE;
            let length = (piece_size - offset).min(BLOCK_SIZE);
            let block = BlockInfo::new(piece, offset, length);
            if entry.outstanding.contains(&block) || allocated.contains(&block) {
                continue;
            }
            let on_wire = state.outstanding_global.get(&block).copied().unwrap_or(0) > 0;
            if on_wire != duplicates {
                continue;
            }
            allocated.push(block);
        }
    }

    /// Records an arrived block.
    ///
    /// Blocks for pieces no longer wanted (or never known) are silently
    /// dropped: a cancelled request may legitimately still deliver. When
    /// the last block of a piece arrives the assembled notification fires
    /// exactly once, and the piece stays wanted until
    /// [`RequestScheduler::set_piece_not_needed`].
    pub fn handle_block(
        &self,
        peer: SocketAddr,
        block: BlockInfo,
        verification: Option<Bytes>,
        data: &[u8],
    ) {
        let notification = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            let piece = block.piece_index;

            if let Some(entry) = state.peers.get_mut(&peer) {
                if entry.outstanding.remove(&block) {
                    release_global(&mut state.outstanding_global, block);
                }
            }

            if piece >= state.piece_count || !state.wanted.get(piece) {
                debug!(%peer, piece, "block for unwanted piece dropped");
                return;
            }
            if data.len() != block.length as usize {
                warn!(%peer, piece, "block length disagrees with payload, dropped");
                return;
            }

            let piece_size = self.store.piece_size(piece);
            if block.offset % BLOCK_SIZE != 0 || block.offset + block.length > piece_size {
                warn!(%peer, piece, offset = block.offset, "block off the request grid, dropped");
                return;
            }

            let partial = state
                .partial
                .entry(piece)
                .or_insert_with(|| PartialPiece::new(piece_size));
            let index = (block.offset / BLOCK_SIZE) as usize;
            if partial.received[index] {
                // End-game duplicate from a second peer.
                return;
            }
            partial.received[index] = true;
            partial.received_count += 1;
            partial.data[block.offset as usize..(block.offset + block.length) as usize]
                .copy_from_slice(data);
            if partial.verification.is_none() {
                partial.verification = verification;
            }

            if partial.received_count == partial.block_count() && !partial.assembled {
                partial.assembled = true;
                info!(piece, "piece assembled, awaiting verification");
                Some((
                    piece,
                    Bytes::from(partial.data.clone()),
                    partial.verification.clone(),
                ))
            } else {
                None
            }
        };

        if let Some((piece, data, verification)) = notification {
            self.listener.piece_assembled(piece, data, verification);
        }
    }

    /// Replaces the want-set wholesale.
    pub fn set_needed_pieces(&self, wanted: &BitField) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(
            wanted.len(),
            state.piece_count,
            "want-set length disagrees with piece count"
        );
        state.wanted = wanted.clone();
    }

    /// Drops interest in one piece and synchronously withdraws every
    /// outstanding request for its blocks. Late blocks already on the wire
    /// are silently discarded by `handle_block` from here on.
    pub fn set_piece_not_needed(&self, piece: u32) {
        let cancellations = {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            if piece >= state.piece_count {
                return;
            }
            state.wanted.unset(piece);
            state.partial.remove(&piece);

            let mut cancellations: Vec<(SocketAddr, Vec<BlockInfo>)> = Vec::new();
            let peers: Vec<SocketAddr> = state.peers.keys().copied().collect();
            for peer in peers {
                let entry = state.peers.get_mut(&peer).expect("peer present");
                let withdrawn: Vec<BlockInfo> = entry
                    .outstanding
                    .iter()
                    .filter(|b| b.piece_index == piece)
                    .copied()
                    .collect();
                if withdrawn.is_empty() {
                    continue;
                }
                for block in &withdrawn {
                    entry.outstanding.remove(block);
                }
                for block in &withdrawn {
                    release_global(&mut state.outstanding_global, *block);
                }
                cancellations.push((peer, withdrawn));
            }
            cancellations
        };

        for (peer, blocks) in cancellations {
            debug!(%peer, piece, count = blocks.len(), "outstanding requests withdrawn");
            self.listener.requests_cancelled(peer, blocks);
        }
    }

    /// Grows the scheduler to the store's current piece count (elastic
    /// content). New pieces start unwanted; never shrinks.
    pub fn extend(&self) {
        let mut state = self.state.lock().unwrap();
        let new_count = self.store.piece_count();
        if new_count <= state.piece_count {
            return;
        }
        info!(from = state.piece_count, to = new_count, "piece space extended");
        state.piece_count = new_count;
        state.wanted.extend(new_count);
        state.availability.resize(new_count as usize, 0);
        for entry in state.peers.values_mut() {
            entry.have.extend(new_count);
        }
    }

    /// Number of peers currently holding `piece`.
    pub fn availability(&self, piece: u32) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .availability
            .get(piece as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_wanted(&self, piece: u32) -> bool {
        self.state.lock().unwrap().wanted.get(piece)
    }
}

fn release_global(outstanding: &mut HashMap<BlockInfo, u32>, block: BlockInfo) {
    if let Some(count) = outstanding.get_mut(&block) {
        *count -= 1;
        if *count == 0 {
            outstanding.remove(&block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedLayout {
        piece_count: AtomicU32,
        piece_size: u32,
    }

    impl FixedLayout {
        fn new(piece_count: u32, piece_size: u32) -> Arc<Self> {
            Arc::new(Self {
                piece_count: AtomicU32::new(piece_count),
                piece_size,
            })
        }
    }

    impl PieceStore for FixedLayout {
        fn piece_count(&self) -> u32 {
            self.piece_count.load(Ordering::SeqCst)
        }

        fn piece_size(&self, _piece: u32) -> u32 {
            self.piece_size
        }

        fn read_block(&self, block: &BlockInfo) -> Result<Bytes> {
            Ok(Bytes::from(vec![0u8; block.length as usize]))
        }

        fn write_block(&self, _block: &BlockInfo, _data: &[u8]) -> Result<bool> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct Recording {
        assembled: Mutex<Vec<u32>>,
        cancelled: Mutex<Vec<(SocketAddr, Vec<BlockInfo>)>>,
    }

    impl SchedulerListener for Recording {
        fn piece_assembled(&self, piece: u32, _data: Bytes, _verification: Option<Bytes>) {
            self.assembled.lock().unwrap().push(piece);
        }

        fn requests_cancelled(&self, peer: SocketAddr, blocks: Vec<BlockInfo>) {
            self.cancelled.lock().unwrap().push((peer, blocks));
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// 4 pieces of 2 blocks each, everything wanted.
    fn scheduler() -> (RequestScheduler, Arc<Recording>, Arc<FixedLayout>) {
        let store = FixedLayout::new(4, 2 * BLOCK_SIZE);
        let listener = Arc::new(Recording::default());
        let scheduler = RequestScheduler::new(
            Arc::clone(&store) as Arc<dyn PieceStore>,
            Arc::clone(&listener) as Arc<dyn SchedulerListener>,
        );
        scheduler.set_needed_pieces(&BitField::full(4));
        (scheduler, listener, store)
    }

    fn fill_piece(scheduler: &RequestScheduler, peer: SocketAddr, piece: u32) {
        for index in 0..2 {
            let block = BlockInfo::new(piece, index * BLOCK_SIZE, BLOCK_SIZE);
            scheduler.handle_block(peer, block, None, &vec![7u8; BLOCK_SIZE as usize]);
        }
    }

    #[test]
    fn availability_tracks_interest() {
        let (scheduler, _, _) = scheduler();
        let peer = addr(1000);
        scheduler.register_peer(peer);

        let mut held = BitField::new(4);
        held.set(1);
        held.set(2);
        assert!(scheduler.pieces_available(peer, &held));
        assert_eq!(scheduler.availability(1), 1);
        assert_eq!(scheduler.availability(0), 0);

        // Re-announcing the same bitfield adds nothing new.
        assert!(!scheduler.pieces_available(peer, &held));

        assert!(scheduler.piece_available(peer, 3));
        assert!(!scheduler.piece_available(peer, 3));

        scheduler.deregister_peer(peer);
        assert_eq!(scheduler.availability(1), 0);
        assert_eq!(scheduler.availability(3), 0);
    }

    #[test]
    fn have_for_unwanted_piece_is_not_interesting() {
        let (scheduler, _, _) = scheduler();
        let peer = addr(1001);
        scheduler.register_peer(peer);

        let mut wanted = BitField::full(4);
        wanted.unset(2);
        scheduler.set_needed_pieces(&wanted);

        assert!(!scheduler.piece_available(peer, 2));
        assert!(scheduler.piece_available(peer, 1));
    }

    #[test]
    fn allocation_is_deterministic_and_prefers_near_completion() {
        let (scheduler, _, _) = scheduler();
        let peer = addr(1002);
        scheduler.register_peer(peer);
        scheduler.pieces_available(peer, &BitField::full(4));

        // One block of piece 2 has arrived: piece 2 is nearest completion.
        fillable_block(&scheduler, peer, 2);

        let requests = scheduler.allocate_requests(peer, 3, false);
        assert_eq!(
            requests,
            vec![
                BlockInfo::new(2, BLOCK_SIZE, BLOCK_SIZE),
                BlockInfo::new(0, 0, BLOCK_SIZE),
                BlockInfo::new(0, BLOCK_SIZE, BLOCK_SIZE),
            ]
        );

        // Already-outstanding blocks are not re-issued to the same peer.
        let more = scheduler.allocate_requests(peer, 8, false);
        assert_eq!(
            more,
            vec![
                BlockInfo::new(1, 0, BLOCK_SIZE),
                BlockInfo::new(1, BLOCK_SIZE, BLOCK_SIZE),
                BlockInfo::new(3, 0, BLOCK_SIZE),
                BlockInfo::new(3, BLOCK_SIZE, BLOCK_SIZE),
            ]
        );
    }

    fn fillable_block(scheduler: &RequestScheduler, peer: SocketAddr, piece: u32) {
        scheduler.handle_block(
            peer,
            BlockInfo::new(piece, 0, BLOCK_SIZE),
            None,
            &vec![1u8; BLOCK_SIZE as usize],
        );
    }

    #[test]
    fn allowed_fast_only_draws_from_the_allowed_set() {
        let (scheduler, _, _) = scheduler();
        let peer = addr(1003);
        scheduler.register_peer(peer);
        scheduler.pieces_available(peer, &BitField::full(4));
        scheduler.set_piece_allowed_fast(peer, 3);

        let requests = scheduler.allocate_requests(peer, 10, true);
        assert!(!requests.is_empty());
        assert!(requests.iter().all(|b| b.piece_index == 3));
    }

    #[test]
    fn end_game_duplicates_only_when_nothing_fresh_remains() {
        let (scheduler, _, _) = scheduler();
        let slow = addr(1004);
        let fast = addr(1005);
        scheduler.register_peer(slow);
        scheduler.register_peer(fast);

        let mut only_last = BitField::new(4);
        only_last.set(3);
        scheduler.pieces_available(slow, &only_last);
        scheduler.pieces_available(fast, &only_last);

        let first = scheduler.allocate_requests(slow, 10, false);
        assert_eq!(first.len(), 2);

        // Every missing block is on the wire to the slow peer, so the fast
        // peer receives the same descriptors rather than nothing.
        let duplicated = scheduler.allocate_requests(fast, 10, false);
        assert_eq!(duplicated, first);
    }

    #[test]
    fn assembly_notifies_once_and_piece_stays_wanted() {
        let (scheduler, listener, _) = scheduler();
        let peer = addr(1006);
        scheduler.register_peer(peer);
        scheduler.pieces_available(peer, &BitField::full(4));

        fill_piece(&scheduler, peer, 1);
        assert_eq!(*listener.assembled.lock().unwrap(), vec![1]);
        assert!(scheduler.is_wanted(1));

        // A duplicate of the last block must not re-notify.
        scheduler.handle_block(
            peer,
            BlockInfo::new(1, BLOCK_SIZE, BLOCK_SIZE),
            None,
            &vec![7u8; BLOCK_SIZE as usize],
        );
        assert_eq!(*listener.assembled.lock().unwrap(), vec![1]);

        scheduler.set_piece_not_needed(1);
        assert!(!scheduler.is_wanted(1));
    }

    #[test]
    fn not_needed_withdraws_requests_and_silences_late_blocks() {
        let (scheduler, listener, _) = scheduler();
        let peer = addr(1007);
        scheduler.register_peer(peer);
        scheduler.pieces_available(peer, &BitField::full(4));

        let requests = scheduler.allocate_requests(peer, 2, false);
        let piece = requests[0].piece_index;
        scheduler.set_piece_not_needed(piece);

        let cancelled = listener.cancelled.lock().unwrap().clone();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].0, peer);
        assert!(cancelled[0].1.iter().all(|b| b.piece_index == piece));

        // A block already in flight arrives late: no notification, no state.
        scheduler.handle_block(
            peer,
            requests[0],
            None,
            &vec![2u8; requests[0].length as usize],
        );
        assert!(listener.assembled.lock().unwrap().is_empty());

        // The withdrawn blocks are not considered outstanding anymore, so
        // a re-wanted piece can be allocated from scratch.
        let mut wanted = BitField::new(4);
        for index in 0..4 {
            if scheduler.is_wanted(index) || index == piece {
                wanted.set(index);
            }
        }
        scheduler.set_needed_pieces(&wanted);
        let again = scheduler.allocate_requests(peer, 2, false);
        assert!(again.iter().any(|b| b.piece_index == piece));
    }

    #[test]
    fn extend_grows_the_piece_space() {
        let (scheduler, _, store) = scheduler();
        let peer = addr(1008);
        scheduler.register_peer(peer);
        scheduler.pieces_available(peer, &BitField::full(4));

        store.piece_count.store(6, Ordering::SeqCst);
        scheduler.extend();

        assert_eq!(scheduler.availability(4), 0);
        assert!(!scheduler.is_wanted(4));

        // Newly appended pieces flow through the usual announcements.
        let mut wanted = BitField::full(6);
        wanted.unset(0);
        scheduler.set_needed_pieces(&wanted);
        assert!(scheduler.piece_available(peer, 5));
    }

    #[test]
    #[should_panic]
    fn double_registration_panics() {
        let (scheduler, _, _) = scheduler();
        scheduler.register_peer(addr(1009));
        scheduler.register_peer(addr(1009));
    }

    #[test]
    fn blocks_from_unknown_peers_are_dropped() {
        let (scheduler, listener, _) = scheduler();
        scheduler.handle_block(
            addr(1010),
            BlockInfo::new(0, 0, BLOCK_SIZE),
            None,
            &vec![0u8; BLOCK_SIZE as usize],
        );
        // Piece progress is tracked even without registration, but an
        // unwanted piece index is silently ignored.
        scheduler.set_piece_not_needed(0);
        scheduler.handle_block(
            addr(1010),
            BlockInfo::new(0, BLOCK_SIZE, BLOCK_SIZE),
            None,
            &vec![0u8; BLOCK_SIZE as usize],
        );
        assert!(listener.assembled.lock().unwrap().is_empty());
    }
}
