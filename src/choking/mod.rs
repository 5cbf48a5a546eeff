//! Periodic choking policy.
//!
//! Every invocation of [`ChokingEngine::choke_peers`] re-decides which
//! registered peers may upload to us (downloading) or receive our upload
//! bandwidth (seeding). Decisions are made from a snapshot of per-peer
//! block counters over a trailing window plus the peers' interest and
//! request state, then applied through the [`ChokeTarget`] capability of
//! each peer.

use crate::stats::{Period, TemporalCounter};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

/// Total unchoke slots per round.
const UNCHOKE_SLOTS: usize = 4;
/// Slots filled by throughput ranking while downloading; the remaining
/// slot belongs to the optimistic unchoke.
const RANKED_SLOTS: usize = 3;
/// Trailing window for "recent" block counts, and the horizon for a
/// seeding peer to count as recently unchoked.
const RECENT_WINDOW: Period = Period::new(1_000, 20);

/// What the engine may ask of and do to one registered peer.
pub trait ChokeTarget: Send + Sync {
    fn is_interested(&self) -> bool;
    /// Whether the peer has requests queued with us that we have not yet
    /// served.
    fn has_pending_requests(&self) -> bool;
    fn set_choked(&self, choked: bool);
}

struct PeerRecord {
    target: Arc<dyn ChokeTarget>,
    last_choke_time: Instant,
    sent: TemporalCounter,
    received: TemporalCounter,
    choked: bool,
}

struct ChokeState {
    peers: HashMap<SocketAddr, PeerRecord>,
    /// At most one distinguished optimistic unchoke; a lookup key, not an
    /// ownership edge.
    optimistic: Option<SocketAddr>,
    round: u8,
}

/// Snapshot row fed to the two algorithms.
struct PeerView {
    addr: SocketAddr,
    interested: bool,
    choked: bool,
    pending_requests: bool,
    recent_received: u64,
    recent_sent: u64,
    last_choke_time: Instant,
}

/// Round-based choke/unchoke selection.
pub struct ChokingEngine {
    state: Mutex<ChokeState>,
}

impl ChokingEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChokeState {
                peers: HashMap::new(),
                optimistic: None,
                round: 0,
            }),
        }
    }

    /// Registers a peer, initially choked. Registering the same peer
    /// twice is a caller bug and panics.
    pub fn register(&self, addr: SocketAddr, target: Arc<dyn ChokeTarget>) {
        let mut state = self.state.lock().unwrap();
        let previous = state.peers.insert(
            addr,
            PeerRecord {
                target,
                last_choke_time: Instant::now(),
                sent: TemporalCounter::new(RECENT_WINDOW),
                received: TemporalCounter::new(RECENT_WINDOW),
                choked: true,
            },
        );
        assert!(previous.is_none(), "peer {} registered twice", addr);
    }

    /// Removes a peer, clearing the optimistic slot if it held it.
    pub fn deregister(&self, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        state.peers.remove(&addr);
        if state.optimistic == Some(addr) {
            state.optimistic = None;
        }
    }

    /// Feeds the trailing window: one block of data uploaded to `addr`.
    pub fn record_block_sent(&self, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.peers.get_mut(&addr) {
            record.sent.add(1);
        }
    }

    /// Feeds the trailing window: one block of data received from `addr`.
    pub fn record_block_received(&self, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.peers.get_mut(&addr) {
            record.received.add(1);
        }
    }

    pub fn is_choked(&self, addr: SocketAddr) -> Option<bool> {
        self.state.lock().unwrap().peers.get(&addr).map(|r| r.choked)
    }

    pub fn optimistic_peer(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().optimistic
    }

    /// Runs one choking round.
    ///
    /// Always advances the round counter mod 3, whatever the outcome.
    /// Must not run concurrently with register/deregister for the same
    /// peer set; the periodic task thread owns both.
    pub fn choke_peers(&self, seeding: bool) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let round = state.round;
        state.round = (state.round + 1) % 3;

        let mut views: Vec<PeerView> = state
            .peers
            .iter_mut()
            .map(|(addr, record)| PeerView {
                addr: *addr,
                interested: record.target.is_interested(),
                choked: record.choked,
                pending_requests: record.target.has_pending_requests(),
                recent_received: record.received.total_with_partial(),
                recent_sent: record.sent.total_with_partial(),
                last_choke_time: record.last_choke_time,
            })
            .collect();
        // Deterministic base order so equal ranks resolve identically.
        views.sort_by_key(|view| view.addr);

        let selected = if seeding {
            seeding_selection(&views, round)
        } else {
            downloading_selection(&views, round, &mut state.optimistic)
        };

        debug!(
            seeding,
            round,
            unchoked = selected.len(),
            optimistic = ?state.optimistic,
            "choking round applied"
        );

        let now = Instant::now();
        for (addr, record) in state.peers.iter_mut() {
            let unchoke = selected.contains(addr);
            if record.choked == !unchoke {
                continue;
            }
            record.choked = !unchoke;
            record.last_choke_time = now;
            record.target.set_choked(!unchoke);
        }
    }
}

impl Default for ChokingEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Downloading: reciprocate with the peers that fed us most recently,
/// keep one optimistic slot open to discover better partners.
fn downloading_selection(
    views: &[PeerView],
    round: u8,
    optimistic: &mut Option<SocketAddr>,
) -> Vec<SocketAddr> {
    // Eligible: interested and sent us at least one block in the window,
    // best feeders first.
    let mut eligible: Vec<&PeerView> = views
        .iter()
        .filter(|v| v.interested && v.recent_received > 0)
        .collect();
    eligible.sort_by(|a, b| b.recent_received.cmp(&a.recent_received));

    let mut selected: Vec<SocketAddr> =
        eligible.iter().take(RANKED_SLOTS).map(|v| v.addr).collect();

    // The optimistic peer is retained across rounds and reselected only on
    // round 2, uniformly from the choked interested pool.
    if round == 2 {
        let pool: Vec<SocketAddr> = views
            .iter()
            .filter(|v| v.choked && v.interested)
            .map(|v| v.addr)
            .collect();
        if !pool.is_empty() {
            *optimistic = Some(pool[rand::thread_rng().gen_range(0..pool.len())]);
        }
    }
    if let Some(addr) = *optimistic {
        if views.iter().any(|v| v.addr == addr) && !selected.contains(&addr) {
            selected.push(addr);
        }
    }

    // Top up to four unchoked from whoever is left, interested peers
    // first. A randomly drawn interested peer also takes the optimistic
    // slot; a non-interested filler does not.
    while selected.len() < UNCHOKE_SLOTS {
        let interested_pool: Vec<SocketAddr> = views
            .iter()
            .filter(|v| v.interested && !selected.contains(&v.addr))
            .map(|v| v.addr)
            .collect();
        if !interested_pool.is_empty() {
            let addr = interested_pool[rand::thread_rng().gen_range(0..interested_pool.len())];
            *optimistic = Some(addr);
            selected.push(addr);
            continue;
        }
        let rest: Vec<SocketAddr> = views
            .iter()
            .filter(|v| !selected.contains(&v.addr))
            .map(|v| v.addr)
            .collect();
        if rest.is_empty() {
            break;
        }
        selected.push(rest[rand::thread_rng().gen_range(0..rest.len())]);
    }

    selected
}

/// Seeding: cycle upload slots through the interested peers, favoring
/// fresh unchokes and peers actively draining their request queue.
fn seeding_selection(views: &[PeerView], round: u8) -> Vec<SocketAddr> {
    let window = std::time::Duration::from_millis(RECENT_WINDOW.span_millis());

    // Eligible: interested, currently unchoked, and either unchoked
    // recently or still holding requests with us. Most recent unchoke
    // first, recent upload volume as the tie-break.
    let mut eligible: Vec<&PeerView> = views
        .iter()
        .filter(|v| {
            v.interested
                && !v.choked
                && (v.last_choke_time.elapsed() < window || v.pending_requests)
        })
        .collect();
    eligible.sort_by(|a, b| {
        b.last_choke_time
            .cmp(&a.last_choke_time)
            .then(b.recent_sent.cmp(&a.recent_sent))
    });

    // Everyone else still unchoked and interested: last-resort backfill.
    let ineligible: Vec<SocketAddr> = views
        .iter()
        .filter(|v| {
            v.interested && !v.choked && !eligible.iter().any(|e| e.addr == v.addr)
        })
        .map(|v| v.addr)
        .collect();

    // Interested but choked: the random discovery pool.
    let mut random_pool: Vec<SocketAddr> = views
        .iter()
        .filter(|v| v.interested && v.choked)
        .map(|v| v.addr)
        .collect();

    // Rounds 0 and 1 reserve one slot for a random choked peer; round 2
    // gives all four to the eligible ranking.
    let random_slots = if round == 2 { 0 } else { 1.min(random_pool.len()) };
    let mut selected: Vec<SocketAddr> = Vec::with_capacity(UNCHOKE_SLOTS);

    for view in eligible.iter().take(UNCHOKE_SLOTS - random_slots) {
        selected.push(view.addr);
    }
    for _ in 0..random_slots {
        if random_pool.is_empty() {
            break;
        }
        let index = rand::thread_rng().gen_range(0..random_pool.len());
        selected.push(random_pool.swap_remove(index));
    }

    // Shortfall in either source backfills from the other, then from the
    // ineligible unchoked set rather than choking without a replacement.
    for view in eligible.iter().skip(UNCHOKE_SLOTS - random_slots) {
        if selected.len() >= UNCHOKE_SLOTS {
            break;
        }
        selected.push(view.addr);
    }
    while selected.len() < UNCHOKE_SLOTS && !random_pool.is_empty() {
        let index = rand::thread_rng().gen_range(0..random_pool.len());
        selected.push(random_pool.swap_remove(index));
    }
    for addr in ineligible {
        if selected.len() >= UNCHOKE_SLOTS {
            break;
        }
        selected.push(addr);
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockPeer {
        interested: AtomicBool,
        pending: AtomicBool,
    }

    impl MockPeer {
        fn interested() -> Arc<Self> {
            Arc::new(Self {
                interested: AtomicBool::new(true),
                pending: AtomicBool::new(false),
            })
        }

        fn not_interested() -> Arc<Self> {
            Arc::new(Self {
                interested: AtomicBool::new(false),
                pending: AtomicBool::new(false),
            })
        }
    }

    impl ChokeTarget for MockPeer {
        fn is_interested(&self) -> bool {
            self.interested.load(Ordering::SeqCst)
        }

        fn has_pending_requests(&self) -> bool {
            self.pending.load(Ordering::SeqCst)
        }

        fn set_choked(&self, _choked: bool) {}
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn unchoked_peers(engine: &ChokingEngine, addrs: &[SocketAddr]) -> Vec<SocketAddr> {
        addrs
            .iter()
            .filter(|&&a| engine.is_choked(a) == Some(false))
            .copied()
            .collect()
    }

    #[test]
    fn downloading_unchokes_the_best_feeders() {
        let engine = ChokingEngine::new();
        let addrs: Vec<SocketAddr> = (0..6).map(|i| addr(2000 + i)).collect();
        for &a in &addrs {
            engine.register(a, MockPeer::interested());
        }
        // Strictly distinct recent-received counts: peer k fed us k blocks.
        for (rank, &a) in addrs.iter().enumerate() {
            for _ in 0..rank * 10 {
                engine.record_block_received(a);
            }
        }

        engine.choke_peers(false);

        let unchoked = unchoked_peers(&engine, &addrs);
        assert_eq!(unchoked.len(), 4);
        // The three best feeders are always selected.
        for &top in &addrs[3..] {
            assert!(unchoked.contains(&top), "top feeder {} choked", top);
        }
        // The fourth slot went to an interested peer, which takes the
        // optimistic slot.
        let optimistic = engine.optimistic_peer().expect("optimistic set");
        assert!(unchoked.contains(&optimistic));
        assert!(!addrs[3..].contains(&optimistic));
    }

    #[test]
    fn optimistic_is_retained_until_round_two() {
        let engine = ChokingEngine::new();
        let addrs: Vec<SocketAddr> = (0..8).map(|i| addr(2100 + i)).collect();
        for &a in &addrs {
            engine.register(a, MockPeer::interested());
        }
        for (rank, &a) in addrs.iter().enumerate() {
            for _ in 0..rank * 10 {
                engine.record_block_received(a);
            }
        }

        engine.choke_peers(false); // round 0
        let first = engine.optimistic_peer().expect("optimistic chosen");

        engine.choke_peers(false); // round 1: retained
        assert_eq!(engine.optimistic_peer(), Some(first));

        // Round 2 reselects from the peers that were choked and interested
        // going into the round.
        let choked_before: Vec<SocketAddr> = addrs
            .iter()
            .filter(|&&a| engine.is_choked(a) == Some(true))
            .copied()
            .collect();
        engine.choke_peers(false); // round 2
        let reselected = engine.optimistic_peer().expect("optimistic still set");
        assert!(choked_before.contains(&reselected));
    }

    #[test]
    fn slot_filler_without_interest_never_takes_the_optimistic_slot() {
        let engine = ChokingEngine::new();
        // One interested peer, three not interested: the top-up must
        // unchoke fillers without granting them optimistic status.
        let interested = addr(2200);
        engine.register(interested, MockPeer::interested());
        let fillers: Vec<SocketAddr> = (1..4).map(|i| addr(2200 + i)).collect();
        for &a in &fillers {
            engine.register(a, MockPeer::not_interested());
        }
        engine.record_block_received(interested);

        engine.choke_peers(false);

        let mut all = vec![interested];
        all.extend(&fillers);
        assert_eq!(unchoked_peers(&engine, &all).len(), 4);
        assert_eq!(engine.optimistic_peer(), None);
    }

    #[test]
    fn round_counter_cycles_independent_of_outcome() {
        let engine = ChokingEngine::new();
        // No peers at all: rounds still advance.
        engine.choke_peers(false);
        engine.choke_peers(false);
        engine.choke_peers(true);
        assert_eq!(engine.state.lock().unwrap().round, 0);
    }

    #[test]
    fn seeding_cycles_slots_through_interested_peers() {
        let engine = ChokingEngine::new();
        let addrs: Vec<SocketAddr> = (0..6).map(|i| addr(2300 + i)).collect();
        for &a in &addrs {
            engine.register(a, MockPeer::interested());
        }

        // Round 0: nobody is unchoked yet, so the eligible ranking is
        // empty and every slot backfills from the random pool.
        engine.choke_peers(true);
        let first = unchoked_peers(&engine, &addrs);
        assert_eq!(first.len(), 4);

        // Round 1: the four fresh unchokes are all eligible; three keep
        // their slot, one random choked peer gets the reserved slot.
        engine.choke_peers(true);
        let second = unchoked_peers(&engine, &addrs);
        assert_eq!(second.len(), 4);
        let kept = second.iter().filter(|a| first.contains(a)).count();
        assert_eq!(kept, 3);

        // Round 2: no random slot, all four from the eligible ranking.
        engine.choke_peers(true);
        assert_eq!(unchoked_peers(&engine, &addrs).len(), 4);
    }

    #[test]
    fn seeding_ignores_uninterested_peers() {
        let engine = ChokingEngine::new();
        let quiet = addr(2400);
        engine.register(quiet, MockPeer::not_interested());
        engine.choke_peers(true);
        assert_eq!(engine.is_choked(quiet), Some(true));
    }

    #[test]
    fn deregister_clears_the_optimistic_slot() {
        let engine = ChokingEngine::new();
        let addrs: Vec<SocketAddr> = (0..4).map(|i| addr(2500 + i)).collect();
        for &a in &addrs {
            engine.register(a, MockPeer::interested());
        }
        engine.choke_peers(false);
        let optimistic = engine.optimistic_peer().expect("optimistic chosen");

        engine.deregister(optimistic);
        assert_eq!(engine.optimistic_peer(), None);
        assert_eq!(engine.is_choked(optimistic), None);
    }

    #[test]
    #[should_panic]
    fn double_registration_panics() {
        let engine = ChokingEngine::new();
        engine.register(addr(2600), MockPeer::interested());
        engine.register(addr(2600), MockPeer::interested());
    }
}
