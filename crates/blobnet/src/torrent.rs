use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::debug;

use crate::bitfield::Bitfield;
use crate::conn::ConnCommand;
use crate::digest::{Digest, PeerId};
use crate::error::{Error, Result};
use crate::metainfo::{InfoHash, MetaInfo};
use crate::picker::PiecePicker;

/// Torrent lifecycle state. Evicted torrents are removed from the
/// registry entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Downloading,
    Seeding,
}

/// Status observed by download waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    Downloading,
    Complete,
    Evicted,
    NotFound,
}

/// Events fanned out to this torrent's connections.
#[derive(Debug, Clone)]
pub enum TorrentEvent {
    /// A piece was committed locally. The announcement is not echoed back
    /// to the delivering peer `from`.
    PieceCompleted { index: u32, from: Option<PeerId> },
    /// The local bitfield saturated.
    Completed,
}

/// Per-connection state tracked by the controller.
pub(crate) struct ConnInfo {
    pub addr: SocketAddr,
    pub bitfield: Bitfield,
    pub pipeline: usize,
    pub last_delivery: Option<Instant>,
    pub cmd: mpsc::Sender<ConnCommand>,
}

/// Per-blob runtime state: local progress, connection roster, request
/// scheduling and the completion signal.
pub struct Torrent {
    metainfo: MetaInfo,
    info_hash: InfoHash,
    namespace: String,
    bitfield: Bitfield,
    state: TorrentState,
    picker: PiecePicker,
    conns: HashMap<PeerId, ConnInfo>,
    request_times: HashMap<(u32, PeerId), Instant>,
    events: broadcast::Sender<TorrentEvent>,
    status_tx: watch::Sender<TorrentStatus>,
    created_at: Instant,
    last_activity: Instant,
}

pub type SharedTorrent = Arc<RwLock<Torrent>>;

impl Torrent {
    pub fn new(metainfo: MetaInfo, namespace: String, local: Bitfield) -> Self {
        let num_pieces = metainfo.num_pieces();
        debug_assert_eq!(local.len(), num_pieces);
        let complete = local.complete();
        let (events, _) = broadcast::channel(256);
        let (status_tx, _) = watch::channel(if complete {
            TorrentStatus::Complete
        } else {
            TorrentStatus::Downloading
        });
        let now = Instant::now();
        Self {
            info_hash: metainfo.info_hash(),
            metainfo,
            namespace,
            bitfield: local,
            state: if complete { TorrentState::Seeding } else { TorrentState::Downloading },
            picker: PiecePicker::new(num_pieces),
            conns: HashMap::new(),
            request_times: HashMap::new(),
            events,
            status_tx,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn digest(&self) -> &Digest {
        self.metainfo.digest()
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn metainfo(&self) -> &MetaInfo {
        &self.metainfo
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn state(&self) -> TorrentState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.complete()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TorrentEvent> {
        self.events.subscribe()
    }

    pub fn status_watch(&self) -> watch::Receiver<TorrentStatus> {
        self.status_tx.subscribe()
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn has_conn(&self, peer: &PeerId) -> bool {
        self.conns.contains_key(peer)
    }

    pub fn conn_addrs(&self) -> Vec<SocketAddr> {
        self.conns.values().map(|c| c.addr).collect()
    }

    /// Bitfields of connected peers, sent as a handshake hint.
    pub fn conn_bitfields(&self) -> Vec<([u8; 20], Bytes)> {
        self.conns
            .iter()
            .map(|(p, c)| (*p.as_bytes(), Bytes::copy_from_slice(c.bitfield.as_bytes())))
            .collect()
    }

    /// Adds an established connection. At most one connection per remote
    /// peer may exist.
    pub(crate) fn register_conn(
        &mut self,
        peer: PeerId,
        addr: SocketAddr,
        bitfield: Bitfield,
        cmd: mpsc::Sender<ConnCommand>,
    ) -> Result<()> {
        if self.conns.contains_key(&peer) {
            return Err(Error::HandshakeReject(format!("duplicate connection from {peer}")));
        }
        self.picker.add_peer(&bitfield);
        self.conns.insert(peer, ConnInfo { addr, bitfield, pipeline: 0, last_delivery: None, cmd });
        self.touch();
        Ok(())
    }

    pub(crate) fn unregister_conn(&mut self, peer: &PeerId) {
        let Some(conn) = self.conns.remove(peer) else { return };
        self.picker.remove_peer(&conn.bitfield);
        let stale: Vec<(u32, PeerId)> = self
            .request_times
            .keys()
            .filter(|(_, p)| p == peer)
            .copied()
            .collect();
        for (index, p) in stale {
            self.request_times.remove(&(index, p));
            self.picker.clear_request(index, &p);
        }
    }

    /// A connected peer announced possession of one more piece.
    pub fn peer_has(&mut self, peer: &PeerId, index: u32) {
        if let Some(conn) = self.conns.get_mut(peer) {
            if conn.bitfield.set(index as usize) {
                self.picker.peer_gained(index);
            }
        }
    }

    /// A connected peer declared itself a seed.
    pub fn mark_remote_complete(&mut self, peer: &PeerId) {
        let num_pieces = self.metainfo.num_pieces();
        if let Some(conn) = self.conns.get_mut(peer) {
            let old = std::mem::replace(&mut conn.bitfield, Bitfield::full(num_pieces));
            let full = conn.bitfield.clone();
            self.picker.remove_peer(&old);
            self.picker.add_peer(&full);
        }
    }

    /// One round of request scheduling: repeatedly pick the rarest
    /// assignable piece, hand it to the best-ranked connection, and stop
    /// when nothing more can be assigned.
    pub(crate) fn dispatch(&mut self, pipeline_limit: usize, now: Instant) {
        let mut skip: HashSet<PeerId> = HashSet::new();
        while let Some((index, peer)) = self.pick_global(pipeline_limit, &skip) {
            let Some(conn) = self.conns.get_mut(&peer) else {
                skip.insert(peer);
                continue;
            };
            match conn.cmd.try_send(ConnCommand::Request(index)) {
                Ok(()) => {
                    conn.pipeline += 1;
                    self.picker.mark_requested(index, peer);
                    self.request_times.insert((index, peer), now);
                }
                Err(_) => {
                    skip.insert(peer);
                }
            }
        }
    }

    /// Picks `(piece, peer)` per the selection policy: rarest first with
    /// lower-index tie-break, then the eligible peer with the smallest
    /// pipeline, ties broken by most recent successful delivery.
    fn pick_global(&self, pipeline_limit: usize, skip: &HashSet<PeerId>) -> Option<(u32, PeerId)> {
        let endgame = self.picker.is_endgame(&self.bitfield);
        let eligible = |index: u32, peer: &PeerId, conn: &ConnInfo| {
            !skip.contains(peer)
                && conn.bitfield.has(index as usize)
                && conn.pipeline < pipeline_limit
                && self.picker.assignable(index, peer, endgame)
        };

        let mut best: Option<(u32, u32)> = None;
        for i in self.bitfield.missing_indices() {
            let index = i as u32;
            if self.picker.rarity(index) == 0 {
                continue;
            }
            if !self.conns.iter().any(|(p, c)| eligible(index, p, c)) {
                continue;
            }
            let rarity = self.picker.rarity(index);
            match best {
                None => best = Some((rarity, index)),
                Some((r, _)) if rarity < r => best = Some((rarity, index)),
                _ => {}
            }
        }
        let (_, index) = best?;
        let peer = self
            .conns
            .iter()
            .filter(|(p, c)| eligible(index, p, c))
            .min_by_key(|(_, c)| (c.pipeline, std::cmp::Reverse(c.last_delivery)))
            .map(|(p, _)| *p)?;
        Some((index, peer))
    }

    /// Clears requests which have been in flight longer than `timeout`,
    /// cancelling them on their connections so the pieces can be retried
    /// elsewhere.
    pub(crate) fn expire_requests(&mut self, timeout: Duration, now: Instant) {
        let expired: Vec<(u32, PeerId)> = self
            .request_times
            .iter()
            .filter(|(_, &t)| now.duration_since(t) > timeout)
            .map(|(k, _)| *k)
            .collect();
        for (index, peer) in expired {
            debug!(piece = index, peer = %peer, "request timed out");
            self.request_times.remove(&(index, peer));
            self.picker.clear_request(index, &peer);
            if let Some(conn) = self.conns.get_mut(&peer) {
                conn.pipeline = conn.pipeline.saturating_sub(1);
                let _ = conn.cmd.try_send(ConnCommand::Cancel(index));
            }
        }
    }

    /// Clears one in-flight request, recording a successful delivery.
    pub(crate) fn clear_request(&mut self, index: u32, peer: &PeerId, delivered: bool) {
        self.request_times.remove(&(index, *peer));
        self.picker.clear_request(index, peer);
        if let Some(conn) = self.conns.get_mut(peer) {
            conn.pipeline = conn.pipeline.saturating_sub(1);
            if delivered {
                conn.last_delivery = Some(Instant::now());
            }
        }
        if delivered {
            self.touch();
        }
    }

    /// Records a committed piece. Cancels duplicate in-flight requests,
    /// announces the piece to every other connection, and fires the
    /// completion signal when the bitfield saturates. Returns whether the
    /// torrent just completed.
    pub fn mark_piece_complete(&mut self, index: u32, from: Option<PeerId>) -> bool {
        if !self.bitfield.set(index as usize) {
            return false;
        }
        self.touch();
        for dup in self.picker.clear_piece(index) {
            self.request_times.remove(&(index, dup));
            if let Some(conn) = self.conns.get_mut(&dup) {
                conn.pipeline = conn.pipeline.saturating_sub(1);
                let _ = conn.cmd.try_send(ConnCommand::Cancel(index));
            }
        }
        let _ = self.events.send(TorrentEvent::PieceCompleted { index, from });
        if self.bitfield.complete() {
            self.state = TorrentState::Seeding;
            let _ = self.status_tx.send(TorrentStatus::Complete);
            let _ = self.events.send(TorrentEvent::Completed);
            return true;
        }
        false
    }

    /// Records read or transfer activity for eviction accounting.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Marks the torrent as torn down, waking waiters with the given
    /// terminal status.
    pub(crate) fn shut_down(&mut self, status: TorrentStatus) {
        let _ = self.status_tx.send(status);
    }
}
