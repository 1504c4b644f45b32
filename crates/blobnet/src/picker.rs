use std::collections::HashMap;

use crate::bitfield::Bitfield;
use crate::digest::PeerId;

/// How many connections may request the same piece during endgame.
const ENDGAME_DUP_LIMIT: usize = 2;

/// Rarest-first piece selection.
///
/// Tracks per-piece availability across connected peers and which pieces
/// have requests in flight. Outside endgame a piece is requested from at
/// most one connection; once every remaining piece is in flight, duplicate
/// requests are allowed across up to two connections.
pub struct PiecePicker {
    num_pieces: usize,
    availability: Vec<u32>,
    outstanding: HashMap<u32, Vec<PeerId>>,
}

impl PiecePicker {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            num_pieces,
            availability: vec![0; num_pieces],
            outstanding: HashMap::new(),
        }
    }

    /// Folds a newly connected peer's bitfield into availability.
    pub fn add_peer(&mut self, bitfield: &Bitfield) {
        for i in 0..self.num_pieces {
            if bitfield.has(i) {
                self.availability[i] += 1;
            }
        }
    }

    pub fn remove_peer(&mut self, bitfield: &Bitfield) {
        for i in 0..self.num_pieces {
            if bitfield.has(i) && self.availability[i] > 0 {
                self.availability[i] -= 1;
            }
        }
    }

    /// A connected peer announced one more piece.
    pub fn peer_gained(&mut self, index: u32) {
        if let Some(a) = self.availability.get_mut(index as usize) {
            *a += 1;
        }
    }

    pub fn rarity(&self, index: u32) -> u32 {
        self.availability.get(index as usize).copied().unwrap_or(0)
    }

    /// Endgame: every missing piece already has a request in flight.
    pub fn is_endgame(&self, local: &Bitfield) -> bool {
        let missing = local.missing_indices();
        !missing.is_empty()
            && missing.iter().all(|&i| self.outstanding.contains_key(&(i as u32)))
    }

    /// Whether `peer` may be assigned `index` under the in-flight rules.
    pub fn assignable(&self, index: u32, peer: &PeerId, endgame: bool) -> bool {
        match self.outstanding.get(&index) {
            None => true,
            Some(peers) => {
                endgame && peers.len() < ENDGAME_DUP_LIMIT && !peers.contains(peer)
            }
        }
    }

    pub fn mark_requested(&mut self, index: u32, peer: PeerId) {
        self.outstanding.entry(index).or_default().push(peer);
    }

    /// Drops one peer's in-flight request for `index`.
    pub fn clear_request(&mut self, index: u32, peer: &PeerId) {
        if let Some(peers) = self.outstanding.get_mut(&index) {
            peers.retain(|p| p != peer);
            if peers.is_empty() {
                self.outstanding.remove(&index);
            }
        }
    }

    /// Drops every in-flight request for a completed piece, returning the
    /// peers whose duplicate requests should be cancelled.
    pub fn clear_piece(&mut self, index: u32) -> Vec<PeerId> {
        self.outstanding.remove(&index).unwrap_or_default()
    }

    pub fn outstanding_peers(&self, index: u32) -> &[PeerId] {
        self.outstanding.get(&index).map(Vec::as_slice).unwrap_or(&[])
    }
}
