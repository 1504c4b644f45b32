use std::io::Read;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::digest::{Digest, DIGEST_LEN};
use crate::error::{Error, Result};
use crate::store::PieceStore;

/// Swarm identifier derived from a metainfo record.
pub type InfoHash = [u8; DIGEST_LEN];

const READ_CHUNK: usize = 64 * 1024;

/// Piece layout and per-piece hashes for one blob.
///
/// Invariant: `piece_hashes.len() == ceil(total_length / piece_length)`;
/// every piece has length `piece_length` except the last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    digest: Digest,
    total_length: u64,
    piece_length: u64,
    piece_hashes: Vec<Digest>,
}

impl MetaInfo {
    /// Streams `reader`, accumulating per-piece digests and the total
    /// length. The streamed content must hash to `digest`.
    pub fn new(digest: Digest, mut reader: impl Read, piece_length: u64) -> Result<Self> {
        if piece_length == 0 {
            return Err(Error::InvalidConfig("piece length must be positive".into()));
        }
        let mut piece_hashes = Vec::new();
        let mut piece_hasher = Sha256::new();
        let mut piece_filled: u64 = 0;
        let mut blob_hasher = Sha256::new();
        let mut total_length: u64 = 0;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            blob_hasher.update(&buf[..n]);
            total_length += n as u64;
            let mut off = 0;
            while off < n {
                let room = (piece_length - piece_filled) as usize;
                let take = room.min(n - off);
                piece_hasher.update(&buf[off..off + take]);
                piece_filled += take as u64;
                off += take;
                if piece_filled == piece_length {
                    piece_hashes.push(finish(&mut piece_hasher));
                    piece_filled = 0;
                }
            }
        }
        if piece_filled > 0 {
            piece_hashes.push(finish(&mut piece_hasher));
        }
        let actual = finish(&mut blob_hasher);
        if actual != digest {
            return Err(Error::checksum_mismatch(digest, actual));
        }
        Ok(Self { digest, total_length, piece_length, piece_hashes })
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_hash(&self, index: u32) -> Option<&Digest> {
        self.piece_hashes.get(index as usize)
    }

    /// Length of piece `index`; only the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        let n = self.num_pieces() as u64;
        let i = index as u64;
        if n == 0 || i >= n {
            return 0;
        }
        if i == n - 1 {
            self.total_length - (n - 1) * self.piece_length
        } else {
            self.piece_length
        }
    }

    /// Deterministic swarm identifier: a digest over the layout fields in
    /// fixed order.
    pub fn info_hash(&self) -> InfoHash {
        let mut h = Sha256::new();
        h.update(self.digest.as_bytes());
        h.update(self.total_length.to_be_bytes());
        h.update(self.piece_length.to_be_bytes());
        for p in &self.piece_hashes {
            h.update(p.as_bytes());
        }
        let out = h.finalize();
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&out);
        bytes
    }
}

fn finish(hasher: &mut Sha256) -> Digest {
    let out = std::mem::take(hasher).finalize();
    let mut bytes = [0u8; DIGEST_LEN];
    bytes.copy_from_slice(&out);
    Digest::from_bytes(bytes)
}

/// Maps total blob size to a piece length through a sorted piecewise
/// table, so every host derives the same layout for the same blob.
#[derive(Debug, Clone)]
pub struct PieceLengths {
    /// `(max_total_size, piece_length)` sorted by bound; sizes beyond the
    /// last bound use the last entry's piece length.
    bounds: Vec<(u64, u64)>,
}

impl PieceLengths {
    pub fn new<I>(table: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut bounds: Vec<(u64, u64)> = table.into_iter().collect();
        if bounds.is_empty() {
            return Err(Error::InvalidConfig("piece length table is empty".into()));
        }
        if bounds.iter().any(|&(_, pl)| pl == 0) {
            return Err(Error::InvalidConfig("piece length must be positive".into()));
        }
        bounds.sort_by_key(|&(bound, _)| bound);
        Ok(Self { bounds })
    }

    pub fn piece_length(&self, total_size: u64) -> u64 {
        for &(bound, piece_length) in &self.bounds {
            if total_size <= bound {
                return piece_length;
            }
        }
        self.bounds[self.bounds.len() - 1].1
    }
}

impl Default for PieceLengths {
    fn default() -> Self {
        Self {
            bounds: vec![
                (2 << 30, 4 << 20),
                (4 << 30, 8 << 20),
                (8 << 30, 16 << 20),
            ],
        }
    }
}

/// Deterministically generates metainfo for cached blobs and persists it
/// as a store sidecar.
pub struct MetaInfoGenerator {
    piece_lengths: PieceLengths,
    store: Arc<PieceStore>,
}

impl MetaInfoGenerator {
    pub fn new(piece_lengths: PieceLengths, store: Arc<PieceStore>) -> Self {
        Self { piece_lengths, store }
    }

    pub async fn generate(&self, d: &Digest) -> Result<MetaInfo> {
        let path = self.store.cache_file_path(d);
        let digest = *d;
        let lengths = self.piece_lengths.clone();
        let mi = tokio::task::spawn_blocking(move || -> Result<MetaInfo> {
            let f = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::NotCached)
                }
                Err(e) => return Err(e.into()),
            };
            let total = f.metadata()?.len();
            let piece_length = lengths.piece_length(total);
            MetaInfo::new(digest, std::io::BufReader::new(f), piece_length)
        })
        .await
        .map_err(|_| Error::Cancelled)??;
        self.store.put_metainfo(&mi).await?;
        Ok(mi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_for(data: &[u8], piece_length: u64) -> MetaInfo {
        MetaInfo::new(Digest::compute(data), data, piece_length).unwrap()
    }

    #[test]
    fn test_piece_layout() {
        let data = vec![7u8; 100];
        let mi = meta_for(&data, 64);
        assert_eq!(mi.total_length(), 100);
        assert_eq!(mi.num_pieces(), 2);
        assert_eq!(mi.piece_size(0), 64);
        assert_eq!(mi.piece_size(1), 36);
        assert_eq!(mi.piece_size(2), 0);
        assert_eq!(mi.piece_hash(0), Some(&Digest::compute(&data[..64])));
        assert_eq!(mi.piece_hash(1), Some(&Digest::compute(&data[64..])));
    }

    #[test]
    fn test_exact_multiple_has_no_short_piece() {
        let data = vec![1u8; 128];
        let mi = meta_for(&data, 64);
        assert_eq!(mi.num_pieces(), 2);
        assert_eq!(mi.piece_size(1), 64);
    }

    #[test]
    fn test_digest_mismatch_rejected() {
        let err = MetaInfo::new(Digest::compute(b"other"), &b"data"[..], 16).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_info_hash_deterministic() {
        let data = vec![3u8; 500];
        let a = meta_for(&data, 64);
        let b = meta_for(&data, 64);
        assert_eq!(a, b);
        assert_eq!(a.info_hash(), b.info_hash());
        // Layout is part of the identity.
        let c = meta_for(&data, 128);
        assert_ne!(a.info_hash(), c.info_hash());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mi = meta_for(&vec![9u8; 300], 128);
        let json = serde_json::to_string(&mi).unwrap();
        let back: MetaInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mi);
        assert_eq!(back.info_hash(), mi.info_hash());
    }

    #[test]
    fn test_piece_lengths_table() {
        let pl = PieceLengths::new([(100, 10), (1000, 50)]).unwrap();
        assert_eq!(pl.piece_length(1), 10);
        assert_eq!(pl.piece_length(100), 10);
        assert_eq!(pl.piece_length(101), 50);
        // Out-of-range sizes fall back to the largest configured length.
        assert_eq!(pl.piece_length(5000), 50);
    }

    #[test]
    fn test_piece_lengths_rejects_bad_config() {
        assert!(matches!(
            PieceLengths::new(std::iter::empty()),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(PieceLengths::new([(100, 0)]), Err(Error::InvalidConfig(_))));
    }
}
