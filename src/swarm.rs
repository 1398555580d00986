//! The swarm controller: the state shared by all sessions and the reaction
//! to every inbound message.
//!
//! Sessions dispatch here synchronously, one message at a time, so within a
//! single neighbor the effects of message N are visible before message N+1.
//! Outbound frames are never written under a state lock: the controller
//! copies the target session's channel handle out of the sender map and
//! enqueues the frame, and the owning session task performs the actual write.
//!
//! Lock ordering, for the locks held simultaneously anywhere in the crate:
//! local bitfield, then neighbor map, then choke sets, then sender map, then
//! requested set, then RNG. No lock is held across an await point.

use {
    rand::{rngs::StdRng, seq::SliceRandom, SeedableRng},
    std::{
        collections::HashMap,
        sync::{Mutex, MutexGuard, RwLock},
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
    tokio_util::sync::CancellationToken,
};

use crate::{
    bitfield::{self, Bitfield},
    conf::{CommonConfig, PeerInfo},
    disk::PieceStore,
    error::{Error, Result},
    journal::Journal,
    peer::{Message, Sender},
    PeerId, PieceIndex,
};

/// Protocol state of one neighbor. Both directions of a fresh connection
/// start out choked and not interested.
struct NeighborState {
    /// Whether the neighbor is choking us (inbound direction).
    peer_choking: bool,
    /// Whether the neighbor declared interest in our pieces.
    peer_interested: bool,
    /// Whether we are choking the neighbor (egress policy).
    am_choking: bool,
    /// Our last interest signal sent to the neighbor.
    am_interested: bool,
    /// The neighbor's observed piece availability; grows with HAVE messages
    /// and survives disconnection, as it is the evidence used for
    /// termination.
    bitfield: Bitfield,
    /// Piece payload bytes received from this neighbor since the last
    /// preferred-neighbor selection; the selection's download rate.
    downloaded_in_window: u64,
    /// Whether a live session currently exists for the neighbor.
    connected: bool,
}

impl NeighborState {
    fn new(num_pieces: usize) -> Self {
        Self {
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            bitfield: bitfield::empty(num_pieces),
            downloaded_in_window: 0,
            connected: false,
        }
    }
}

/// The choking scheduler's published output.
#[derive(Default)]
struct ChokeSets {
    /// At most `k` currently preferred neighbors.
    preferred: Vec<PeerId>,
    /// The one optimistically unchoked neighbor, if any.
    optimistic: Option<PeerId>,
}

pub(crate) struct Swarm {
    conf: CommonConfig,
    local_id: PeerId,
    /// The whole cohort, keyed by id (the local peer included).
    peers: HashMap<PeerId, PeerInfo>,
    store: PieceStore,
    journal: Journal,
    shutdown: CancellationToken,

    bitfield: RwLock<Bitfield>,
    neighbors: Mutex<HashMap<PeerId, NeighborState>>,
    choke_sets: Mutex<ChokeSets>,
    senders: Mutex<HashMap<PeerId, Sender>>,
    /// Piece index to the neighbor it was requested from; at most one entry
    /// per piece suppresses duplicate requests.
    requested: Mutex<HashMap<PieceIndex, PeerId>>,
    rng: Mutex<StdRng>,
}

impl Swarm {
    pub fn new(
        conf: CommonConfig,
        peers: Vec<PeerInfo>,
        local: PeerInfo,
        store: PieceStore,
        journal: Journal,
        shutdown: CancellationToken,
    ) -> Self {
        let num_pieces = conf.num_pieces();
        let bitfield = if local.has_file {
            bitfield::full(num_pieces)
        } else {
            bitfield::empty(num_pieces)
        };
        // co-hosted peers must not share a random sequence
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|t| t.as_secs())
            .unwrap_or_default()
            + u64::from(local.id);
        Self {
            conf,
            local_id: local.id,
            peers: peers.into_iter().map(|p| (p.id, p)).collect(),
            store,
            journal,
            shutdown,
            bitfield: RwLock::new(bitfield),
            neighbors: Mutex::new(HashMap::new()),
            choke_sets: Mutex::new(ChokeSets::default()),
            senders: Mutex::new(HashMap::new()),
            requested: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn piece_size(&self) -> u32 {
        self.conf.piece_size
    }

    pub fn unchoking_interval(&self) -> Duration {
        self.conf.unchoking_interval
    }

    pub fn optimistic_interval(&self) -> Duration {
        self.conf.optimistic_interval
    }

    /// Whether the id belongs to another member of the cohort.
    pub fn is_cohort_member(&self, id: PeerId) -> bool {
        id != self.local_id && self.peers.contains_key(&id)
    }

    /// The cohort members this peer must dial: everyone with a lower id.
    pub fn lower_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .values()
            .filter(|p| p.id < self.local_id)
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// The local piece availability in wire form.
    pub fn local_bitfield_bytes(&self) -> Vec<u8> {
        bitfield::to_bytes(&self.lock_bitfield_read())
    }

    /// Registers a session's egress channel. Fails if the neighbor already
    /// has a live session; each pair keeps exactly one connection.
    pub fn register_session(&self, remote: PeerId, sender: Sender) -> Result<()> {
        {
            let mut neighbors = self.lock_neighbors();
            let state = neighbors
                .entry(remote)
                .or_insert_with(|| NeighborState::new(self.conf.num_pieces()));
            if state.connected {
                return Err(Error::AlreadyConnected(remote));
            }
            state.connected = true;
        }
        self.lock_senders().insert(remote, sender);
        Ok(())
    }

    /// Discards a finished session: its egress channel and its in-flight
    /// requests go away, while the observed remote bitfield is kept.
    pub fn deregister_session(&self, remote: PeerId) {
        if let Some(state) = self.lock_neighbors().get_mut(&remote) {
            state.connected = false;
        }
        self.lock_senders().remove(&remote);
        self.lock_requested().retain(|_, by| *by != remote);
    }

    /// Reacts to one message received from the given neighbor.
    pub fn handle_message(&self, remote: PeerId, msg: Message) {
        match msg {
            Message::Choke => self.handle_choke(remote),
            Message::Unchoke => self.handle_unchoke(remote),
            Message::Interested => self.handle_interested(remote),
            Message::NotInterested => self.handle_not_interested(remote),
            Message::Have(index) => self.handle_have(remote, index),
            Message::Bitfield(bytes) => self.handle_bitfield(remote, &bytes),
            Message::Request(index) => self.handle_request(remote, index),
            Message::Piece { index, data } => self.handle_piece(remote, index, data),
        }
    }

    fn handle_bitfield(&self, remote: PeerId, bytes: &[u8]) {
        let remote_bitfield = bitfield::from_bytes(bytes, self.conf.num_pieces());
        let (interesting, peer_choking) = {
            let local = self.lock_bitfield_read();
            let mut neighbors = self.lock_neighbors();
            let state = match neighbors.get_mut(&remote) {
                Some(state) => state,
                None => return,
            };
            let interesting = bitfield::has_interesting(&local, &remote_bitfield);
            state.bitfield = remote_bitfield;
            state.am_interested = interesting;
            (interesting, state.peer_choking)
        };

        if interesting {
            self.send_to(remote, Message::Interested);
        } else {
            self.send_to(remote, Message::NotInterested);
        }
        if !peer_choking {
            self.request_next_piece(remote);
        }
        // the announced bitfield may already prove the remote complete
        self.evaluate_termination();
    }

    fn handle_have(&self, remote: PeerId, index: PieceIndex) {
        if index >= self.conf.num_pieces() {
            log::warn!(
                "peer {}: HAVE from peer {} for invalid piece {}",
                self.local_id,
                remote,
                index
            );
            return;
        }
        let (gained_interest, lost_interest, peer_choking) = {
            let local = self.lock_bitfield_read();
            let mut neighbors = self.lock_neighbors();
            let state = match neighbors.get_mut(&remote) {
                Some(state) => state,
                None => return,
            };
            let was_interested = state.am_interested;
            state.bitfield.set(index, true);
            let interesting = bitfield::has_interesting(&local, &state.bitfield);
            state.am_interested = interesting;
            (
                interesting && !was_interested,
                !interesting && was_interested,
                state.peer_choking,
            )
        };
        self.journal.received_have(remote, index);

        if gained_interest {
            self.send_to(remote, Message::Interested);
            // the announced piece may be requestable right away if the
            // neighbor already unchoked us
            if !peer_choking {
                self.request_next_piece(remote);
            }
        }
        if lost_interest {
            self.send_to(remote, Message::NotInterested);
        }
        self.evaluate_termination();
    }

    fn handle_interested(&self, remote: PeerId) {
        if let Some(state) = self.lock_neighbors().get_mut(&remote) {
            state.peer_interested = true;
        }
        self.journal.received_interested(remote);
    }

    fn handle_not_interested(&self, remote: PeerId) {
        if let Some(state) = self.lock_neighbors().get_mut(&remote) {
            state.peer_interested = false;
        }
        self.journal.received_not_interested(remote);
    }

    fn handle_choke(&self, remote: PeerId) {
        if let Some(state) = self.lock_neighbors().get_mut(&remote) {
            state.peer_choking = true;
        }
        // in-flight requests to this neighbor won't be served; the pieces
        // become eligible for re-selection
        self.lock_requested().retain(|_, by| *by != remote);
        self.journal.choked_by(remote);
    }

    fn handle_unchoke(&self, remote: PeerId) {
        if let Some(state) = self.lock_neighbors().get_mut(&remote) {
            state.peer_choking = false;
        }
        self.journal.unchoked_by(remote);
        self.request_next_piece(remote);
    }

    fn handle_request(&self, remote: PeerId, index: PieceIndex) {
        if index >= self.conf.num_pieces() {
            log::warn!(
                "peer {}: request from peer {} for invalid piece {}",
                self.local_id,
                remote,
                index
            );
            return;
        }
        let serving = self
            .lock_neighbors()
            .get(&remote)
            .map(|state| !state.am_choking)
            .unwrap_or(false);
        if !serving {
            log::debug!(
                "peer {}: ignoring request for piece {} from choked peer {}",
                self.local_id,
                index,
                remote
            );
            return;
        }
        if !self.lock_bitfield_read()[index] {
            log::warn!(
                "peer {}: peer {} requested piece {} we don't have",
                self.local_id,
                remote,
                index
            );
            return;
        }
        match self.store.read_piece(index) {
            Ok(data) => self.send_to(remote, Message::Piece { index, data }),
            // a disk failure drops this request; the session lives on
            Err(e) => log::warn!(
                "peer {}: failed to read piece {}: {}",
                self.local_id,
                index,
                e
            ),
        }
    }

    fn handle_piece(&self, remote: PeerId, index: PieceIndex, data: Vec<u8>) {
        if index >= self.conf.num_pieces() {
            log::warn!(
                "peer {}: piece message with invalid index {} from peer {}",
                self.local_id,
                index,
                remote
            );
            return;
        }
        // the neighbor served us regardless of what we do with the bytes;
        // credit its window for the next preferred-neighbor selection
        if let Some(state) = self.lock_neighbors().get_mut(&remote) {
            state.downloaded_in_window += data.len() as u64;
        }

        if self.lock_bitfield_read()[index] {
            // duplicate or unsolicited; keep the pipeline moving
            self.lock_requested().remove(&index);
            self.request_next_piece(remote);
            return;
        }

        if let Err(e) = self.store.write_piece(index, &data) {
            log::warn!(
                "peer {}: failed to store piece {}: {}; it stays re-requestable",
                self.local_id,
                index,
                e
            );
            self.lock_requested().remove(&index);
            // the dropped piece is re-requestable, possibly right away
            self.request_next_piece(remote);
            return;
        }

        let owned = {
            let mut local = self.lock_bitfield_write();
            local.set(index, true);
            local.count_ones()
        };
        self.lock_requested().remove(&index);
        self.journal.downloaded_piece(remote, index, owned);
        log::info!(
            "peer {}: downloaded piece {} from peer {} ({}/{})",
            self.local_id,
            index,
            remote,
            owned,
            self.conf.num_pieces()
        );

        self.broadcast(Message::Have(index));
        self.withdraw_stale_interest();

        if owned == self.conf.num_pieces() {
            self.journal.download_complete();
            log::info!("peer {}: download complete", self.local_id);
        }
        self.request_next_piece(remote);
        self.evaluate_termination();
    }

    /// Picks one more piece to ask of the neighbor: uniformly random among
    /// the pieces it has, we lack, and nobody has been asked for. An empty
    /// choice withdraws our interest.
    fn request_next_piece(&self, remote: PeerId) {
        let outbound = {
            let local = self.lock_bitfield_read();
            let mut neighbors = self.lock_neighbors();
            let state = match neighbors.get_mut(&remote) {
                Some(state) => state,
                None => return,
            };
            if state.peer_choking {
                return;
            }
            let mut requested = self.lock_requested();
            let candidates: Vec<PieceIndex> = state
                .bitfield
                .iter_ones()
                .filter(|&index| !local[index] && !requested.contains_key(&index))
                .collect();
            match candidates.choose(&mut *self.lock_rng()).copied() {
                Some(index) => {
                    requested.insert(index, remote);
                    Some(Message::Request(index))
                }
                None if state.am_interested => {
                    state.am_interested = false;
                    Some(Message::NotInterested)
                }
                None => None,
            }
        };
        if let Some(msg) = outbound {
            if let Message::Request(index) = msg {
                log::debug!(
                    "peer {}: requesting piece {} from peer {}",
                    self.local_id,
                    index,
                    remote
                );
            }
            self.send_to(remote, msg);
        }
    }

    /// After acquiring a piece, neighbors that held nothing else we lack stop
    /// being interesting; tell them so.
    fn withdraw_stale_interest(&self) {
        let stale: Vec<PeerId> = {
            let local = self.lock_bitfield_read();
            let mut neighbors = self.lock_neighbors();
            neighbors
                .iter_mut()
                .filter(|(_, state)| {
                    state.am_interested && !bitfield::has_interesting(&local, &state.bitfield)
                })
                .map(|(&id, state)| {
                    state.am_interested = false;
                    id
                })
                .collect()
        };
        for id in stale {
            self.send_to(id, Message::NotInterested);
        }
    }

    /// Recomputes the preferred-neighbor set. Runs every unchoking interval.
    pub fn recompute_preferred(&self) {
        let complete = self.lock_bitfield_read().all();
        let mut to_unchoke = Vec::new();
        let mut to_choke = Vec::new();
        let preferred = {
            let mut neighbors = self.lock_neighbors();
            let mut sets = self.lock_choke_sets();
            let mut candidates: Vec<(PeerId, u64)> = neighbors
                .iter()
                .filter(|(_, state)| state.connected && state.peer_interested)
                .map(|(&id, state)| (id, state.downloaded_in_window))
                .collect();
            {
                let mut rng = self.lock_rng();
                // a completed peer has no use for rates: pick fairly at
                // random. Otherwise order by rate; the shuffle before the
                // stable sort randomizes ties.
                candidates.shuffle(&mut *rng);
                if !complete {
                    candidates.sort_by(|a, b| b.1.cmp(&a.1));
                }
            }
            let preferred: Vec<PeerId> = candidates
                .iter()
                .take(self.conf.preferred_count)
                .map(|&(id, _)| id)
                .collect();

            for (&id, state) in neighbors.iter_mut() {
                let keep = preferred.contains(&id) || sets.optimistic == Some(id);
                if preferred.contains(&id) && state.am_choking {
                    state.am_choking = false;
                    to_unchoke.push(id);
                } else if !keep && !state.am_choking {
                    state.am_choking = true;
                    to_choke.push(id);
                }
                // start the next measurement window
                state.downloaded_in_window = 0;
            }
            sets.preferred = preferred.clone();
            preferred
        };

        if !preferred.is_empty() {
            self.journal.preferred_neighbors(&preferred);
            log::debug!(
                "peer {}: preferred neighbors now {:?}",
                self.local_id,
                preferred
            );
        }
        for id in to_unchoke {
            self.send_to(id, Message::Unchoke);
        }
        for id in to_choke {
            self.send_to(id, Message::Choke);
        }
    }

    /// Rotates the optimistically unchoked neighbor. Runs every optimistic
    /// unchoking interval.
    pub fn rotate_optimistic(&self) {
        let mut choke_prior = None;
        let chosen = {
            let mut neighbors = self.lock_neighbors();
            let mut sets = self.lock_choke_sets();
            let candidates: Vec<PeerId> = neighbors
                .iter()
                .filter(|(_, state)| state.connected && state.am_choking && state.peer_interested)
                .map(|(&id, _)| id)
                .collect();
            let chosen = match candidates.choose(&mut *self.lock_rng()).copied() {
                Some(id) => id,
                None => return,
            };
            if let Some(prior) = sets.optimistic {
                // the outgoing neighbor keeps its unchoke only if the
                // scheduler prefers it on its own merit
                if prior != chosen && !sets.preferred.contains(&prior) {
                    if let Some(state) = neighbors.get_mut(&prior) {
                        if !state.am_choking {
                            state.am_choking = true;
                            choke_prior = Some(prior);
                        }
                    }
                }
            }
            sets.optimistic = Some(chosen);
            if let Some(state) = neighbors.get_mut(&chosen) {
                state.am_choking = false;
            }
            chosen
        };

        if let Some(prior) = choke_prior {
            self.send_to(prior, Message::Choke);
        }
        self.send_to(chosen, Message::Unchoke);
        self.journal.optimistic_unchoke(chosen);
        log::debug!(
            "peer {}: optimistically unchoked peer {}",
            self.local_id,
            chosen
        );
    }

    /// Shuts the swarm down once everyone, ourselves included, holds every
    /// piece. Remote completeness is judged by the observed bitfields.
    pub fn evaluate_termination(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.lock_bitfield_read().all() {
            return;
        }
        let everyone_complete = {
            let neighbors = self.lock_neighbors();
            self.peers
                .keys()
                .filter(|&&id| id != self.local_id)
                .all(|id| {
                    neighbors
                        .get(id)
                        .map(|state| state.bitfield.all())
                        .unwrap_or(false)
                })
        };
        if everyone_complete {
            log::info!(
                "peer {}: every peer holds the complete file, shutting down",
                self.local_id
            );
            self.shutdown.cancel();
        }
    }

    /// Enqueues a frame for one neighbor. The channel handle is copied out
    /// under the sender lock and the enqueue happens outside it; the session
    /// task serializes the actual socket writes.
    fn send_to(&self, remote: PeerId, msg: Message) {
        let sender = self.lock_senders().get(&remote).cloned();
        if let Some(sender) = sender {
            // a failed enqueue means the session is tearing down; its
            // deregistration cleans up after the frame we just lost
            let _ = sender.send(msg);
        }
    }

    /// Enqueues a frame for every active session.
    fn broadcast(&self, msg: Message) {
        let senders: Vec<Sender> = self.lock_senders().values().cloned().collect();
        for sender in senders {
            let _ = sender.send(msg.clone());
        }
    }

    // Lock accessors. A poisoned lock means another session task panicked
    // mid-mutation; the state mutations here are small enough to stay
    // consistent, so the swarm carries on rather than poisoning every other
    // neighbor's session.

    fn lock_bitfield_read(&self) -> std::sync::RwLockReadGuard<'_, Bitfield> {
        self.bitfield.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_bitfield_write(&self) -> std::sync::RwLockWriteGuard<'_, Bitfield> {
        self.bitfield.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_neighbors(&self) -> MutexGuard<'_, HashMap<PeerId, NeighborState>> {
        self.neighbors.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_choke_sets(&self) -> MutexGuard<'_, ChokeSets> {
        self.choke_sets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_senders(&self) -> MutexGuard<'_, HashMap<PeerId, Sender>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_requested(&self) -> MutexGuard<'_, HashMap<PieceIndex, PeerId>> {
        self.requested.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }
}
