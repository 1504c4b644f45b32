use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blobnet_proto::{Frame, HandshakePayload, Message};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::announce::{AnnounceQueue, AnnounceRequest, Backoff, Tracker};
use crate::bitfield::Bitfield;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::conn::{self, CloseReason, ConnCommand, PeerConn};
use crate::dedup::IntervalTrap;
use crate::digest::{Digest, PeerId, PeerInfo};
use crate::error::{Error, Result};
use crate::metainfo::MetaInfo;
use crate::store::PieceStore;
use crate::torrent::{SharedTorrent, Torrent, TorrentStatus};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// One entry in the public blacklist snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BlacklistEntry {
    pub digest: String,
    pub addr: String,
    pub remaining_secs: u64,
}

enum Event {
    ConnClosed {
        id: u64,
        digest: Digest,
        peer: PeerId,
        addr: SocketAddr,
        reason: CloseReason,
    },
    AnnounceDone {
        digest: Digest,
        result: Result<Vec<PeerInfo>>,
    },
}

struct ConnEntry {
    id: u64,
    addr: SocketAddr,
    /// Peer id of the side which opened the connection; duplicate
    /// resolution keeps the connection with the smaller initiator.
    initiator: PeerId,
    cmd: mpsc::Sender<ConnCommand>,
}

/// The torrent scheduler: multiplexes inbound accepts, outbound dials,
/// per-torrent request scheduling, announces and eviction over a single
/// event loop plus one task per connection.
pub struct Scheduler {
    config: Config,
    peer_id: PeerId,
    listen_addr: SocketAddr,
    store: Arc<PieceStore>,
    tracker: Arc<dyn Tracker>,
    torrents: RwLock<HashMap<Digest, SharedTorrent>>,
    conns: SyncMutex<HashMap<(Digest, PeerId), ConnEntry>>,
    blacklist: DashMap<(Digest, SocketAddr), Instant>,
    blacklist_trap: IntervalTrap,
    announce_queue: AnnounceQueue,
    next_announce: SyncMutex<HashMap<Digest, Instant>>,
    backoffs: SyncMutex<HashMap<Digest, Backoff>>,
    last_tick: SyncMutex<Instant>,
    events_tx: mpsc::Sender<Event>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Binds the listener, rediscovers cached blobs as seeding torrents,
    /// and spawns the scheduler tasks.
    pub async fn start(
        config: Config,
        peer_id: PeerId,
        store: Arc<PieceStore>,
        tracker: Arc<dyn Tracker>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(1024);
        let sched = Arc::new(Self {
            blacklist_trap: IntervalTrap::new(
                config.blacklist_cleanup_interval(),
                Arc::new(SystemClock),
            ),
            config,
            peer_id,
            listen_addr,
            store,
            tracker,
            torrents: RwLock::new(HashMap::new()),
            conns: SyncMutex::new(HashMap::new()),
            blacklist: DashMap::new(),
            announce_queue: AnnounceQueue::new(),
            next_announce: SyncMutex::new(HashMap::new()),
            backoffs: SyncMutex::new(HashMap::new()),
            last_tick: SyncMutex::new(Instant::now()),
            events_tx,
            shutdown: CancellationToken::new(),
        });
        sched.rediscover().await?;
        tokio::spawn(sched.clone().listen_loop(listener));
        tokio::spawn(sched.clone().event_loop(events_rx));
        tokio::spawn(sched.clone().announce_loop());
        info!(addr = %listen_addr, peer_id = %peer_id, "scheduler started");
        Ok(sched)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Succeeds iff the event loop has serviced a tick recently.
    pub fn probe(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::SchedulerReloading);
        }
        if self.last_tick.lock().elapsed() > self.config.probe_interval() {
            return Err(Error::Overloaded);
        }
        Ok(())
    }

    pub async fn num_torrents(&self) -> usize {
        self.torrents.read().await.len()
    }

    pub fn blacklist_snapshot(&self) -> Vec<BlacklistEntry> {
        let now = Instant::now();
        self.blacklist
            .iter()
            .filter(|e| *e.value() > now)
            .map(|e| BlacklistEntry {
                digest: e.key().0.hex(),
                addr: e.key().1.to_string(),
                remaining_secs: e.value().saturating_duration_since(now).as_secs(),
            })
            .collect()
    }

    /// Downloads a blob through the swarm, returning once every piece is
    /// committed. Returns immediately if the blob is already cached.
    pub async fn download(&self, namespace: &str, d: &Digest) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::SchedulerReloading);
        }
        if self.store.get_file_reader(d).await.is_ok() {
            if let Some(t) = self.torrents.read().await.get(d) {
                t.write().await.touch();
            }
            return Ok(());
        }
        let torrent = match self.torrents.read().await.get(d).cloned() {
            Some(t) => t,
            None => {
                let mi = match self.store.get_metainfo(d).await {
                    Ok(mi) => mi,
                    Err(Error::NotCached) => self.tracker.get_metainfo(namespace, d).await?,
                    Err(e) => return Err(e),
                };
                self.create_torrent(mi, namespace.to_string()).await?
            }
        };
        let mut status = {
            let mut t = torrent.write().await;
            t.touch();
            t.status_watch()
        };
        let wait = async move {
            loop {
                match *status.borrow_and_update() {
                    TorrentStatus::Complete => return Ok(()),
                    TorrentStatus::Evicted => return Err(Error::TorrentEvicted),
                    TorrentStatus::NotFound => return Err(Error::TorrentNotFound),
                    TorrentStatus::Downloading => {}
                }
                if status.changed().await.is_err() {
                    return Err(Error::TorrentEvicted);
                }
            }
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::SchedulerReloading),
            res = tokio::time::timeout(self.config.download_timeout(), wait) => match res {
                Ok(r) => r,
                Err(_) => Err(Error::DownloadTimeout),
            },
        }
    }

    /// Tears the torrent down and removes the blob from the store.
    pub async fn remove_torrent(&self, d: &Digest) -> Result<()> {
        self.evict_torrent(d, TorrentStatus::Evicted, CloseReason::TorrentEvicted).await;
        self.store.delete(d).await
    }

    /// Stops the scheduler: cancels every task, closes connections with
    /// `SchedulerReload` and drains the announce queue. Download waiters
    /// observe `SchedulerReloading`.
    pub async fn stop(&self) {
        info!("scheduler stopping");
        self.shutdown.cancel();
        let cmds: Vec<mpsc::Sender<ConnCommand>> =
            self.conns.lock().values().map(|e| e.cmd.clone()).collect();
        for cmd in cmds {
            let _ = cmd.try_send(ConnCommand::Close(CloseReason::SchedulerReload));
        }
        while self.announce_queue.next().is_some() {}
    }

    /// Recreates seeding torrents for blobs already committed to the
    /// cache; the scheduler itself keeps no state across restarts.
    async fn rediscover(&self) -> Result<()> {
        for d in self.store.scan().await? {
            let Ok(mi) = self.store.get_metainfo(&d).await else {
                continue;
            };
            let bitfield = Bitfield::full(mi.num_pieces());
            let torrent = Arc::new(RwLock::new(Torrent::new(mi, String::new(), bitfield)));
            self.torrents.write().await.insert(d, torrent);
            self.announce_queue.enqueue(d);
            debug!(digest = %d, "rediscovered cached blob");
        }
        Ok(())
    }

    async fn listen_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(x) => x,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if self.conns.lock().len() >= self.config.max_open_conns_global {
                        warn!(remote = %addr, "dropping inbound connection: global limit");
                        continue;
                    }
                    stream.set_nodelay(true).ok();
                    let sched = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sched.establish(stream, addr, None).await {
                            debug!(remote = %addr, error = %e, "inbound connection rejected");
                        }
                    });
                }
            }
        }
    }

    async fn event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<Event>) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                Some(ev) = events_rx.recv() => self.clone().handle_event(ev).await,
                _ = tick.tick() => self.on_tick().await,
            }
        }
    }

    async fn on_tick(&self) {
        *self.last_tick.lock() = Instant::now();
        self.blacklist_trap.trap(|| {
            let now = Instant::now();
            self.blacklist.retain(|_, expiry| *expiry > now);
        });

        let now = Instant::now();
        let due: Vec<Digest> = {
            let next = self.next_announce.lock();
            next.iter().filter(|(_, &t)| t <= now).map(|(d, _)| *d).collect()
        };
        for d in due {
            if self.announce_queue.enqueue(d) {
                self.next_announce.lock().remove(&d);
            }
        }

        let torrents: Vec<(Digest, SharedTorrent)> =
            self.torrents.read().await.iter().map(|(d, t)| (*d, t.clone())).collect();
        for (d, torrent) in torrents {
            let evict = {
                let mut t = torrent.write().await;
                t.expire_requests(self.config.request_timeout(), now);
                t.dispatch(self.config.pipeline_limit, now);
                t.idle_for(now) >= self.config.idle_ttl()
            };
            if evict {
                self.evict_torrent(&d, TorrentStatus::Evicted, CloseReason::TorrentEvicted).await;
            }
        }
    }

    async fn handle_event(self: Arc<Self>, ev: Event) {
        match ev {
            Event::ConnClosed { id, digest, peer, addr, reason } => {
                let removed = {
                    let mut conns = self.conns.lock();
                    match conns.get(&(digest, peer)) {
                        Some(e) if e.id == id => {
                            conns.remove(&(digest, peer));
                            true
                        }
                        _ => false,
                    }
                };
                if reason.blacklists() {
                    self.blacklist_addr(&digest, addr);
                }
                if !removed {
                    return;
                }
                let torrent = self.torrents.read().await.get(&digest).cloned();
                if let Some(torrent) = torrent {
                    let mut t = torrent.write().await;
                    t.unregister_conn(&peer);
                    // Losing the last connection of an incomplete torrent
                    // warrants an immediate re-announce.
                    if !t.is_complete() && t.conn_count() == 0 {
                        self.next_announce.lock().insert(digest, Instant::now());
                    }
                }
            }
            Event::AnnounceDone { digest, result } => {
                if !self.torrents.read().await.contains_key(&digest) {
                    return;
                }
                let delay = {
                    let mut backoffs = self.backoffs.lock();
                    let b = backoffs.entry(digest).or_insert_with(|| {
                        Backoff::new(
                            self.config.announce_interval(),
                            self.config.max_announce_interval(),
                        )
                    });
                    match &result {
                        Ok(_) => b.success(),
                        Err(_) => b.failure(),
                    }
                };
                self.next_announce.lock().insert(digest, Instant::now() + delay);
                match result {
                    Ok(peers) => self.dial_peers(digest, peers).await,
                    Err(Error::TorrentNotFound) => self.fail_unserved(&digest).await,
                    Err(e) => warn!(digest = %digest, error = %e, "announce failed"),
                }
            }
        }
    }

    /// The tracker has no record of this torrent; if no connected peer can
    /// still serve it, waiters are told it cannot be found.
    async fn fail_unserved(&self, d: &Digest) {
        let Some(torrent) = self.torrents.read().await.get(d).cloned() else {
            return;
        };
        let dead = {
            let t = torrent.read().await;
            !t.is_complete() && t.conn_count() == 0
        };
        if dead {
            warn!(digest = %d, "tracker has no record and no peers remain");
            self.evict_torrent(d, TorrentStatus::NotFound, CloseReason::TorrentEvicted).await;
        }
    }

    async fn evict_torrent(&self, d: &Digest, status: TorrentStatus, reason: CloseReason) {
        let Some(torrent) = self.torrents.write().await.remove(d) else {
            return;
        };
        info!(digest = %d, status = ?status, "evicting torrent");
        self.announce_queue.eject(d);
        self.next_announce.lock().remove(d);
        self.backoffs.lock().remove(d);
        torrent.write().await.shut_down(status);
        let cmds: Vec<mpsc::Sender<ConnCommand>> = {
            let conns = self.conns.lock();
            conns
                .iter()
                .filter(|((cd, _), _)| cd == d)
                .map(|(_, e)| e.cmd.clone())
                .collect()
        };
        for cmd in cmds {
            let _ = cmd.try_send(ConnCommand::Close(reason));
        }
    }

    async fn announce_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let Some(d) = self.announce_queue.next() else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.config.tick_interval()) => continue,
                }
            };
            let result = self.announce_once(&d).await;
            if self.events_tx.send(Event::AnnounceDone { digest: d, result }).await.is_err() {
                return;
            }
        }
    }

    async fn announce_once(&self, d: &Digest) -> Result<Vec<PeerInfo>> {
        let Some(torrent) = self.torrents.read().await.get(d).cloned() else {
            return Err(Error::TorrentEvicted);
        };
        let (name, info_hash, complete, namespace) = {
            let t = torrent.read().await;
            (
                t.digest().hex(),
                hex::encode(t.info_hash()),
                t.is_complete(),
                t.namespace().to_string(),
            )
        };
        let req = AnnounceRequest {
            name,
            info_hash,
            peer_id: self.peer_id,
            ip: self.listen_addr.ip().to_string(),
            port: self.listen_addr.port(),
            complete,
            namespace,
        };
        self.tracker.announce(&req).await
    }

    async fn dial_peers(self: Arc<Self>, digest: Digest, mut peers: Vec<PeerInfo>) {
        let Some(torrent) = self.torrents.read().await.get(&digest).cloned() else {
            return;
        };
        // Origin peers have authoritative backend access; dial them first.
        peers.sort_by_key(|p| !p.origin);
        let now = Instant::now();
        for peer in peers {
            if peer.peer_id == self.peer_id {
                continue;
            }
            let Ok(addr) = peer.addr().parse::<SocketAddr>() else {
                continue;
            };
            if self.is_blacklisted(&digest, addr, now) {
                debug!(digest = %digest, addr = %addr, "skipping blacklisted peer");
                continue;
            }
            {
                let conns = self.conns.lock();
                if conns.contains_key(&(digest, peer.peer_id)) {
                    continue;
                }
                if conns.len() >= self.config.max_open_conns_global {
                    break;
                }
            }
            if torrent.read().await.conn_count() >= self.config.max_open_conns_per_torrent {
                break;
            }
            let sched = self.clone();
            let torrent = torrent.clone();
            tokio::spawn(async move {
                if let Err(e) = sched.dial(digest, torrent, addr).await {
                    debug!(digest = %digest, addr = %addr, error = %e, "dial failed");
                }
            });
        }
    }

    async fn dial(
        self: Arc<Self>,
        digest: Digest,
        torrent: SharedTorrent,
        addr: SocketAddr,
    ) -> Result<()> {
        let stream = tokio::time::timeout(self.config.dial_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(format!("dial {addr}")))??;
        stream.set_nodelay(true).ok();
        self.establish(stream, addr, Some((digest, torrent))).await
    }

    /// Performs the handshake in both directions and hands the socket to a
    /// connection task. `outbound` carries the torrent for dials; inbound
    /// connections identify their torrent from the remote handshake.
    async fn establish(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        outbound: Option<(Digest, SharedTorrent)>,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(8192);
        let timeout = self.config.handshake_timeout();
        let (digest, torrent, payload, initiator) = match outbound {
            Some((digest, torrent)) => {
                let local = self.local_handshake(&torrent).await;
                conn::write_frame(&mut stream, &Frame::new(Message::Bitfield(local)), timeout)
                    .await?;
                let payload = conn::read_handshake(&mut stream, &mut buf, timeout).await?;
                (digest, torrent, payload, self.peer_id)
            }
            None => {
                let payload = conn::read_handshake(&mut stream, &mut buf, timeout).await?;
                let digest = Digest::parse(&payload.name)
                    .map_err(|_| Error::HandshakeReject("unparseable torrent name".into()))?;
                let torrent = match self.lookup_or_create_torrent(&digest, &payload.namespace).await
                {
                    Ok(t) => t,
                    Err(e) => {
                        if matches!(e, Error::HandshakeReject(_)) {
                            self.blacklist_addr(&digest, addr);
                        }
                        return Err(e);
                    }
                };
                let local = self.local_handshake(&torrent).await;
                conn::write_frame(&mut stream, &Frame::new(Message::Bitfield(local)), timeout)
                    .await?;
                let initiator = PeerId::from_bytes(payload.peer_id);
                (digest, torrent, payload, initiator)
            }
        };
        self.finish_establish(stream, addr, digest, torrent, payload, initiator, buf).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_establish(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        digest: Digest,
        torrent: SharedTorrent,
        payload: HandshakePayload,
        initiator: PeerId,
        buf: BytesMut,
    ) -> Result<()> {
        let remote_peer = PeerId::from_bytes(payload.peer_id);
        if remote_peer == self.peer_id {
            return Err(Error::HandshakeReject("connected to self".into()));
        }
        let (metainfo, events_rx, remote_bitfield) = {
            let t = torrent.read().await;
            if payload.info_hash != t.info_hash() {
                drop(t);
                self.blacklist_addr(&digest, addr);
                return Err(Error::HandshakeReject("info hash mismatch".into()));
            }
            let mi = t.metainfo().clone();
            let bf = match Bitfield::from_bytes(&payload.bitfield, mi.num_pieces()) {
                Ok(bf) => bf,
                Err(_) => {
                    drop(t);
                    self.blacklist_addr(&digest, addr);
                    return Err(Error::HandshakeReject("bitfield piece count mismatch".into()));
                }
            };
            (mi, t.subscribe(), bf)
        };

        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        {
            let mut conns = self.conns.lock();
            if conns.len() >= self.config.max_open_conns_global {
                return Err(Error::Overloaded);
            }
            if let Some(existing) = conns.get(&(digest, remote_peer)) {
                if initiator < existing.initiator {
                    // The new connection wins; the incumbent is told to
                    // close and its eventual teardown is ignored.
                    let _ = existing
                        .cmd
                        .try_send(ConnCommand::Close(CloseReason::DuplicateConnection));
                } else {
                    drop(conns);
                    self.blacklist_addr(&digest, addr);
                    return Err(Error::HandshakeReject("duplicate connection".into()));
                }
            }
            conns.insert(
                (digest, remote_peer),
                ConnEntry { id, addr, initiator, cmd: cmd_tx.clone() },
            );
        }

        {
            let mut t = torrent.write().await;
            if !t.has_conn(&remote_peer)
                && t.conn_count() >= self.config.max_open_conns_per_torrent
            {
                let mut conns = self.conns.lock();
                if conns.get(&(digest, remote_peer)).map(|e| e.id) == Some(id) {
                    conns.remove(&(digest, remote_peer));
                }
                return Err(Error::Overloaded);
            }
            if t.has_conn(&remote_peer) {
                t.unregister_conn(&remote_peer);
            }
            t.register_conn(remote_peer, addr, remote_bitfield, cmd_tx.clone())?;
        }

        let conn = PeerConn::new(
            stream,
            addr,
            remote_peer,
            metainfo,
            torrent,
            self.store.clone(),
            &self.config,
            buf,
            cmd_rx,
            events_rx,
            self.shutdown.clone(),
        );
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let reason = conn.run().await;
            let _ = events_tx
                .send(Event::ConnClosed { id, digest, peer: remote_peer, addr, reason })
                .await;
        });
        debug!(digest = %digest, remote = %addr, peer = %remote_peer, "connection established");
        Ok(())
    }

    async fn local_handshake(&self, torrent: &SharedTorrent) -> HandshakePayload {
        let t = torrent.read().await;
        HandshakePayload {
            info_hash: t.info_hash(),
            name: t.digest().hex(),
            peer_id: *self.peer_id.as_bytes(),
            bitfield: Bytes::copy_from_slice(t.bitfield().as_bytes()),
            namespace: t.namespace().to_string(),
            remote_bitfields: t.conn_bitfields(),
        }
    }

    /// Resolves the torrent an inbound handshake names. Unknown blobs are
    /// only admitted for whitelisted namespaces, by fetching metainfo from
    /// the tracker and starting a download.
    async fn lookup_or_create_torrent(
        &self,
        d: &Digest,
        namespace: &str,
    ) -> Result<SharedTorrent> {
        if let Some(t) = self.torrents.read().await.get(d).cloned() {
            return Ok(t);
        }
        let mi = match self.store.get_metainfo(d).await {
            Ok(mi) => mi,
            Err(Error::NotCached) => {
                if !self.config.namespace_whitelist.iter().any(|ns| ns == namespace) {
                    return Err(Error::HandshakeReject(format!("unknown torrent {d}")));
                }
                self.tracker
                    .get_metainfo(namespace, d)
                    .await
                    .map_err(|e| Error::HandshakeReject(format!("metainfo fetch: {e}")))?
            }
            Err(e) => return Err(e),
        };
        self.create_torrent(mi, namespace.to_string()).await
    }

    async fn create_torrent(&self, mi: MetaInfo, namespace: String) -> Result<SharedTorrent> {
        let d = *mi.digest();
        let mut torrents = self.torrents.write().await;
        if let Some(t) = torrents.get(&d) {
            return Ok(t.clone());
        }
        let bitfield = match self.store.have_bitfield(&d).await {
            Ok(bf) => bf,
            Err(Error::NotCached) => {
                self.store.create_download(&mi).await?;
                Bitfield::new(mi.num_pieces())
            }
            Err(e) => return Err(e),
        };
        let torrent = Arc::new(RwLock::new(Torrent::new(mi, namespace, bitfield)));
        torrents.insert(d, torrent.clone());
        drop(torrents);
        self.announce_queue.enqueue(d);
        info!(digest = %d, "torrent created");
        Ok(torrent)
    }

    fn is_blacklisted(&self, d: &Digest, addr: SocketAddr, now: Instant) -> bool {
        self.blacklist.get(&(*d, addr)).map(|e| *e > now).unwrap_or(false)
    }

    fn blacklist_addr(&self, d: &Digest, addr: SocketAddr) {
        let expiry = Instant::now() + self.config.blacklist_duration();
        info!(digest = %d, addr = %addr, "blacklisting peer address");
        self.blacklist.insert((*d, addr), expiry);
    }
}

/// Scheduler wrapper supporting live reconfiguration by hot-swap: the
/// running scheduler is stopped and a fresh one is constructed around the
/// same store, tracker and peer id. A restart failure is unrecoverable
/// and reported as [`Error::Fatal`]; the caller should abort the process.
pub struct ReloadableScheduler {
    reload_mu: tokio::sync::Mutex<()>,
    current: SyncMutex<Arc<Scheduler>>,
    store: Arc<PieceStore>,
    tracker: Arc<dyn Tracker>,
}

impl ReloadableScheduler {
    pub async fn new(
        config: Config,
        store: Arc<PieceStore>,
        tracker: Arc<dyn Tracker>,
    ) -> Result<Self> {
        let sched = Scheduler::start(config, PeerId::random(), store.clone(), tracker.clone())
            .await?;
        Ok(Self {
            reload_mu: tokio::sync::Mutex::new(()),
            current: SyncMutex::new(sched),
            store,
            tracker,
        })
    }

    /// The currently running scheduler.
    pub fn get(&self) -> Arc<Scheduler> {
        self.current.lock().clone()
    }

    pub async fn download(&self, namespace: &str, d: &Digest) -> Result<()> {
        self.get().download(namespace, d).await
    }

    pub fn probe(&self) -> Result<()> {
        self.get().probe()
    }

    pub fn blacklist_snapshot(&self) -> Vec<BlacklistEntry> {
        self.get().blacklist_snapshot()
    }

    /// Restarts the scheduler with new configuration. Reloads are
    /// serialized; in-flight downloads fail with `SchedulerReloading`.
    pub async fn reload(&self, config: Config) -> Result<()> {
        let _guard = self.reload_mu.lock().await;
        let old = self.get();
        old.stop().await;
        match Scheduler::start(config, old.peer_id(), self.store.clone(), self.tracker.clone())
            .await
        {
            Ok(new) => {
                *self.current.lock() = new;
                info!("scheduler reloaded");
                Ok(())
            }
            Err(e) => Err(Error::Fatal(format!("scheduler restart failed: {e}"))),
        }
    }

    pub async fn stop(&self) {
        self.get().stop().await;
    }
}
