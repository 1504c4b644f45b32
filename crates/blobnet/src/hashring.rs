use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::digest::Digest;
use crate::healthcheck::Filter;
use crate::hostlist::HostList;

const DEFAULT_WEIGHT: u32 = 100;

/// Notified with the latest membership whenever the ring changes.
pub trait Watcher: Send + Sync {
    fn notify(&self, latest: HashSet<String>);
}

#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Maximum number of healthy replicas returned per digest.
    pub max_replica: usize,
    /// How often `monitor` refreshes membership and health.
    pub refresh_interval: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self { max_replica: 3, refresh_interval: Duration::from_secs(10) }
    }
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// MurmurHash3 x64 variant, low 64 bits.
fn murmur3_64(data: &[u8]) -> u64 {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let len = data.len();
    let nblocks = len / 16;
    let mut h1: u64 = 0;
    let mut h2: u64 = 0;

    for i in 0..nblocks {
        let b = &data[i * 16..i * 16 + 16];
        let mut k1 = u64::from_le_bytes(b[0..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(b[8..16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27).wrapping_add(h2).wrapping_mul(5).wrapping_add(0x52dc_e729);
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31).wrapping_add(h1).wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    if tail.len() > 8 {
        for i in (8..tail.len()).rev() {
            k2 ^= (tail[i] as u64) << ((i - 8) * 8);
        }
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        for i in (0..tail.len().min(8)).rev() {
            k1 ^= (tail[i] as u64) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1.wrapping_add(h2)
}

struct Node {
    addr: String,
    weight: u32,
}

/// Weighted rendezvous (highest-random-weight) hash over a node set.
/// Per-pair scores map the Murmur3 hash into (0,1) and scale by weight,
/// so identical `(members, weights)` always produce identical orderings.
struct RendezvousHash {
    nodes: Vec<Node>,
}

impl RendezvousHash {
    fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    fn add_node(&mut self, addr: String, weight: u32) {
        self.nodes.push(Node { addr, weight });
    }

    fn score(node: &Node, key: u32) -> f64 {
        let mut buf = Vec::with_capacity(node.addr.len() + 4);
        buf.extend_from_slice(node.addr.as_bytes());
        buf.extend_from_slice(&key.to_be_bytes());
        let h = murmur3_64(&buf);
        let u = ((h >> 11) as f64 + 0.5) / (1u64 << 53) as f64;
        -(node.weight as f64) / u.ln()
    }

    /// All node addrs ordered by descending score for `key`.
    fn ordered_nodes(&self, key: u32) -> Vec<&str> {
        let mut scored: Vec<(f64, &str)> = self
            .nodes
            .iter()
            .map(|n| (Self::score(n, key), n.addr.as_str()))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(b.1)));
        scored.into_iter().map(|(_, addr)| addr).collect()
    }
}

/// Rendezvous hashing ring which calculates an ordered replica set of
/// healthy addresses owning any given digest.
///
/// Membership comes from a dynamic [`HostList`]; replica sets are filtered
/// by health. The ring can always provide locations once it has at least
/// one member, though under total unhealthiness the provided location is
/// not guaranteed to be healthy.
pub struct Ring {
    config: RingConfig,
    cluster: Arc<dyn HostList>,
    filter: Arc<dyn Filter>,
    inner: RwLock<RingInner>,
    watchers: Vec<Box<dyn Watcher>>,
}

struct RingInner {
    addrs: HashSet<String>,
    hash: RendezvousHash,
    healthy: HashSet<String>,
}

impl Ring {
    pub fn new(
        config: RingConfig,
        cluster: Arc<dyn HostList>,
        filter: Arc<dyn Filter>,
        watchers: Vec<Box<dyn Watcher>>,
    ) -> Self {
        let ring = Self {
            config,
            cluster,
            filter,
            inner: RwLock::new(RingInner {
                addrs: HashSet::new(),
                hash: RendezvousHash::new(),
                healthy: HashSet::new(),
            }),
            watchers,
        };
        ring.refresh();
        ring
    }

    /// Returns an ordered replica set of healthy addresses which own `d`.
    /// If the first `max_replica` owners are all unhealthy, returns the
    /// next healthy address; if every address is unhealthy, returns the
    /// top-ranked owner regardless of health. Non-empty whenever the ring
    /// has at least one member.
    pub fn locations(&self, d: &Digest) -> Vec<String> {
        let inner = self.inner.read();
        let nodes = inner.hash.ordered_nodes(d.shard_id());
        debug_assert_eq!(nodes.len(), inner.addrs.len());
        if nodes.is_empty() {
            return Vec::new();
        }
        if inner.healthy.is_empty() {
            return vec![nodes[0].to_string()];
        }
        let mut locs = Vec::new();
        let mut i = 0;
        while i < nodes.len() && (locs.is_empty() || i < self.config.max_replica) {
            if inner.healthy.contains(nodes[i]) {
                locs.push(nodes[i].to_string());
            }
            i += 1;
        }
        locs
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.inner.read().addrs.contains(addr)
    }

    /// Updates membership and health. Publishes both atomically; readers
    /// never observe a half-updated ring.
    pub fn refresh(&self) {
        let latest = self.cluster.resolve();
        let healthy = self.filter.run(&latest);

        let changed = self.inner.read().addrs != latest;
        let hash = if changed {
            let mut hash = RendezvousHash::new();
            for addr in &latest {
                hash.add_node(addr.clone(), DEFAULT_WEIGHT);
            }
            info!(members = latest.len(), "hash ring membership changed");
            for w in &self.watchers {
                w.notify(latest.clone());
            }
            Some(hash)
        } else {
            None
        };

        let mut inner = self.inner.write();
        inner.addrs = latest;
        if let Some(hash) = hash {
            inner.hash = hash;
        }
        inner.healthy = healthy;
    }

    /// Refreshes at the configured interval until `stop` fires.
    pub async fn monitor(&self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(self.config.refresh_interval) => self.refresh(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DIGEST_LEN;
    use crate::hostlist::StaticHostList;
    use parking_lot::Mutex;

    struct FixedFilter(Mutex<HashSet<String>>);

    impl FixedFilter {
        fn healthy(addrs: &[&str]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(addrs.iter().map(|s| s.to_string()).collect())))
        }

        fn set(&self, addrs: &[&str]) {
            *self.0.lock() = addrs.iter().map(|s| s.to_string()).collect();
        }
    }

    impl Filter for FixedFilter {
        fn run(&self, addrs: &HashSet<String>) -> HashSet<String> {
            self.0.lock().intersection(addrs).cloned().collect()
        }
    }

    fn digest_with_shard(shard: u32) -> Digest {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes[..4].copy_from_slice(&shard.to_be_bytes());
        Digest::from_bytes(bytes)
    }

    fn ring(members: &[&str], filter: Arc<dyn Filter>, max_replica: usize) -> Ring {
        Ring::new(
            RingConfig { max_replica, ..Default::default() },
            Arc::new(StaticHostList::new(members.to_vec())),
            filter,
            Vec::new(),
        )
    }

    #[test]
    fn test_locations_returns_top_replicas() {
        let members = ["h1", "h2", "h3"];
        let r = ring(&members, FixedFilter::healthy(&members), 2);
        let locs = r.locations(&digest_with_shard(1));
        assert_eq!(locs.len(), 2);
        for addr in &locs {
            assert!(members.contains(&addr.as_str()));
        }
        // Stable across repeated calls.
        assert_eq!(r.locations(&digest_with_shard(1)), locs);
    }

    #[test]
    fn test_locations_all_unhealthy_falls_back_to_top_owner() {
        let members = ["h1", "h2", "h3"];
        let healthy = ring(&members, FixedFilter::healthy(&members), 2);
        let unhealthy = ring(&members, FixedFilter::healthy(&[]), 2);

        let d = digest_with_shard(1);
        let locs = unhealthy.locations(&d);
        assert_eq!(locs.len(), 1);
        // The fallback is the overall top-ranked owner.
        assert_eq!(locs[0], healthy.locations(&d)[0]);
    }

    #[test]
    fn test_locations_walks_past_unhealthy_replicas() {
        let members = ["h1", "h2", "h3"];
        let d = digest_with_shard(7);
        let ranked = ring(&members, FixedFilter::healthy(&members), 3).locations(&d);
        let worst = ranked.last().unwrap().clone();

        // Only the worst-ranked owner is healthy; the walk continues past
        // max_replica and finds it.
        let partial = ring(&members, FixedFilter::healthy(&[worst.as_str()]), 2);
        assert_eq!(partial.locations(&d), vec![worst]);
    }

    #[test]
    fn test_rendezvous_determinism() {
        let members = ["h1:1234", "h2:1234", "h3:1234", "h4:1234"];
        let a = ring(&members, FixedFilter::healthy(&members), 3);
        let b = ring(&members, FixedFilter::healthy(&members), 3);
        for shard in [0u32, 1, 42, 0xdead_beef, u32::MAX] {
            let d = digest_with_shard(shard);
            assert_eq!(a.locations(&d), b.locations(&d));
            assert!(!a.locations(&d).is_empty());
        }
    }

    #[test]
    fn test_keys_spread_over_nodes() {
        let members = ["h1", "h2", "h3", "h4", "h5"];
        let r = ring(&members, FixedFilter::healthy(&members), 1);
        let mut seen = HashSet::new();
        for shard in 0..64u32 {
            seen.insert(r.locations(&digest_with_shard(shard))[0].clone());
        }
        // With 64 keys over 5 nodes every node should own something.
        assert_eq!(seen.len(), members.len());
    }

    #[test]
    fn test_refresh_picks_up_health_changes() {
        let members = ["h1", "h2", "h3"];
        let filter = FixedFilter::healthy(&members);
        let r = ring(&members, filter.clone(), 3);
        let d = digest_with_shard(3);
        assert_eq!(r.locations(&d).len(), 3);

        filter.set(&[]);
        r.refresh();
        assert_eq!(r.locations(&d).len(), 1);

        filter.set(&members);
        r.refresh();
        assert_eq!(r.locations(&d).len(), 3);
    }

    struct RecordingWatcher(Mutex<Vec<usize>>);

    impl Watcher for RecordingWatcher {
        fn notify(&self, latest: HashSet<String>) {
            self.0.lock().push(latest.len());
        }
    }

    #[test]
    fn test_watcher_notified_on_membership_change_only() {
        let watcher = Arc::new(RecordingWatcher(Mutex::new(Vec::new())));

        struct Fwd(Arc<RecordingWatcher>);
        impl Watcher for Fwd {
            fn notify(&self, latest: HashSet<String>) {
                self.0.notify(latest)
            }
        }

        let members = ["h1", "h2"];
        let r = Ring::new(
            RingConfig::default(),
            Arc::new(StaticHostList::new(members.to_vec())),
            FixedFilter::healthy(&members),
            vec![Box::new(Fwd(watcher.clone()))],
        );
        // Initial refresh populates membership once.
        assert_eq!(watcher.0.lock().as_slice(), &[2]);
        // No change, no notification.
        r.refresh();
        assert_eq!(watcher.0.lock().as_slice(), &[2]);
    }

    #[test]
    fn test_murmur3_reference_vectors() {
        // Low 64 bits of MurmurHash3 x64_128 with zero seed.
        assert_eq!(murmur3_64(b""), 0);
        assert_ne!(murmur3_64(b"a"), murmur3_64(b"b"));
        assert_eq!(murmur3_64(b"hello"), murmur3_64(b"hello"));
        // 16-byte block path and tail path must both contribute.
        assert_ne!(murmur3_64(b"0123456789abcdef"), murmur3_64(b"0123456789abcdeX"));
        assert_ne!(murmur3_64(b"0123456789abcdefg"), murmur3_64(b"0123456789abcdef"));
    }
}
