use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::digest::{Digest, PeerId, PeerInfo};
use crate::error::{Error, Result};
use crate::hashring::Ring;
use crate::healthcheck::PassiveFilter;
use crate::metainfo::MetaInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceRequest {
    /// Hex form of the blob digest.
    pub name: String,
    /// Hex form of the swarm info-hash.
    pub info_hash: String,
    pub peer_id: PeerId,
    pub ip: String,
    pub port: u16,
    pub complete: bool,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceResponse {
    pub peers: Vec<PeerInfo>,
}

/// Client side of the tracker protocol.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Reports possession and learns the current peer list.
    async fn announce(&self, req: &AnnounceRequest) -> Result<Vec<PeerInfo>>;

    /// Fetches the metainfo record for a blob.
    async fn get_metainfo(&self, namespace: &str, d: &Digest) -> Result<MetaInfo>;
}

/// HTTP tracker client. Tracker hosts are selected per digest through the
/// rendezvous ring; network failures feed the passive health filter so
/// dead hosts age out of the replica sets.
pub struct HttpTracker {
    client: reqwest::Client,
    ring: Arc<Ring>,
    passive: Arc<PassiveFilter>,
}

impl HttpTracker {
    pub fn new(ring: Arc<Ring>, passive: Arc<PassiveFilter>) -> Self {
        Self { client: reqwest::Client::new(), ring, passive }
    }

    fn hosts(&self, d: &Digest) -> Result<Vec<String>> {
        let locs = self.ring.locations(d);
        if locs.is_empty() {
            return Err(Error::InvalidConfig("tracker ring has no members".into()));
        }
        Ok(locs)
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&self, req: &AnnounceRequest) -> Result<Vec<PeerInfo>> {
        let d = Digest::parse(&req.name)?;
        let mut last_err = None;
        for addr in self.hosts(&d)? {
            let url = format!("http://{addr}/announce");
            match self.client.post(&url).json(req).send().await {
                Ok(resp) => {
                    if resp.status() == reqwest::StatusCode::NOT_FOUND {
                        return Err(Error::TorrentNotFound);
                    }
                    match resp.error_for_status() {
                        Ok(resp) => {
                            let out: AnnounceResponse = resp.json().await?;
                            return Ok(out.peers);
                        }
                        Err(e) => last_err = Some(e.into()),
                    }
                }
                Err(e) => {
                    self.passive.failed(&addr);
                    last_err = Some(e.into());
                }
            }
        }
        Err(last_err.unwrap_or(Error::TorrentNotFound))
    }

    async fn get_metainfo(&self, namespace: &str, d: &Digest) -> Result<MetaInfo> {
        let mut last_err = None;
        for addr in self.hosts(d)? {
            let url = format!("http://{addr}/namespace/{namespace}/blobs/{}/metainfo", d.hex());
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    if resp.status() == reqwest::StatusCode::NOT_FOUND {
                        return Err(Error::TorrentNotFound);
                    }
                    match resp.error_for_status() {
                        Ok(resp) => return Ok(resp.json().await?),
                        Err(e) => last_err = Some(e.into()),
                    }
                }
                Err(e) => {
                    self.passive.failed(&addr);
                    last_err = Some(e.into());
                }
            }
        }
        Err(last_err.unwrap_or(Error::TorrentNotFound))
    }
}

/// FIFO of torrents pending announce. Enqueueing is idempotent: a torrent
/// appears at most once.
pub struct AnnounceQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    fifo: VecDeque<Digest>,
    queued: HashSet<Digest>,
}

impl AnnounceQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(QueueInner::default()) }
    }

    /// Returns whether the torrent was newly queued.
    pub fn enqueue(&self, d: Digest) -> bool {
        let mut inner = self.inner.lock();
        if !inner.queued.insert(d) {
            return false;
        }
        inner.fifo.push_back(d);
        true
    }

    pub fn next(&self) -> Option<Digest> {
        let mut inner = self.inner.lock();
        let d = inner.fifo.pop_front()?;
        inner.queued.remove(&d);
        Some(d)
    }

    pub fn eject(&self, h: &Digest) {
        let mut inner = self.inner.lock();
        if inner.queued.remove(h) {
            inner.fifo.retain(|q| q != h);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AnnounceQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-torrent announce timing: the base interval after a successful
/// announce, exponential growth capped at `max` after failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, current: base }
    }

    pub fn success(&mut self) -> Duration {
        self.current = self.base;
        self.base
    }

    pub fn failure(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.max);
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> Digest {
        Digest::from_bytes([b; 32])
    }

    #[test]
    fn test_queue_fifo_order() {
        let q = AnnounceQueue::new();
        assert!(q.enqueue(hash(1)));
        assert!(q.enqueue(hash(2)));
        assert!(q.enqueue(hash(3)));
        assert_eq!(q.next(), Some(hash(1)));
        assert_eq!(q.next(), Some(hash(2)));
        assert_eq!(q.next(), Some(hash(3)));
        assert_eq!(q.next(), None);
    }

    #[test]
    fn test_queue_enqueue_is_idempotent() {
        let q = AnnounceQueue::new();
        assert!(q.enqueue(hash(1)));
        assert!(!q.enqueue(hash(1)));
        assert_eq!(q.len(), 1);
        assert_eq!(q.next(), Some(hash(1)));
        // After popping, the torrent may be queued again.
        assert!(q.enqueue(hash(1)));
    }

    #[test]
    fn test_queue_eject() {
        let q = AnnounceQueue::new();
        q.enqueue(hash(1));
        q.enqueue(hash(2));
        q.eject(&hash(1));
        assert_eq!(q.next(), Some(hash(2)));
        assert_eq!(q.next(), None);
    }

    #[test]
    fn test_backoff_growth_and_reset() {
        let base = Duration::from_secs(3);
        let max = Duration::from_secs(20);
        let mut b = Backoff::new(base, max);

        assert_eq!(b.failure(), Duration::from_secs(6));
        assert_eq!(b.failure(), Duration::from_secs(12));
        assert_eq!(b.failure(), Duration::from_secs(20));
        assert_eq!(b.failure(), Duration::from_secs(20));

        assert_eq!(b.success(), base);
        assert_eq!(b.failure(), Duration::from_secs(6));
    }
}
