use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blobnet_proto::{
    version_compatible, ErrorCode, Frame, HandshakePayload, Message, PROTOCOL_VERSION,
};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::digest::{Digest, PeerId};
use crate::error::{Error, Result};
use crate::metainfo::MetaInfo;
use crate::store::PieceStore;
use crate::torrent::{SharedTorrent, TorrentEvent};

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// Why a connection ended. Some reasons blacklist the remote address on
/// the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    HandshakeReject,
    BadPiece,
    DuplicateConnection,
    IdleTimeout,
    WriteTimeout,
    TorrentEvicted,
    SchedulerReload,
    PeerClosed,
    NetworkError,
    ConnLimit,
}

impl CloseReason {
    pub fn blacklists(self) -> bool {
        matches!(
            self,
            CloseReason::HandshakeReject | CloseReason::BadPiece | CloseReason::DuplicateConnection
        )
    }
}

/// Commands issued to a connection by the torrent controller and the
/// scheduler.
#[derive(Debug, Clone, Copy)]
pub enum ConnCommand {
    /// Request a piece from the remote, subject to the pipeline limit.
    Request(u32),
    /// Withdraw an outstanding request.
    Cancel(u32),
    Close(CloseReason),
}

/// Sends one frame with a deadline.
pub(crate) async fn write_frame(
    stream: &mut TcpStream,
    frame: &Frame,
    timeout: Duration,
) -> Result<()> {
    let buf = frame.encode();
    tokio::time::timeout(timeout, stream.write_all(&buf))
        .await
        .map_err(|_| Error::Timeout("handshake write".into()))??;
    Ok(())
}

/// Reads the remote handshake, leaving any trailing bytes in `buf` for the
/// established connection to consume.
pub(crate) async fn read_handshake(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<HandshakePayload> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some((frame, consumed)) = Frame::decode(buf)? {
            let _ = buf.split_to(consumed);
            if !version_compatible(PROTOCOL_VERSION, &frame.version) {
                return Err(Error::HandshakeReject(format!(
                    "incompatible protocol version {}",
                    frame.version
                )));
            }
            return match frame.message {
                Message::Bitfield(payload) => Ok(payload),
                other => {
                    Err(Error::HandshakeReject(format!("expected handshake, got {other:?}")))
                }
            };
        }
        let n = tokio::time::timeout_at(deadline, stream.read_buf(buf))
            .await
            .map_err(|_| Error::Timeout("handshake read".into()))??;
        if n == 0 {
            return Err(Error::HandshakeReject("peer closed during handshake".into()));
        }
    }
}

struct PendingPiece {
    index: u32,
    size: usize,
    solicited: bool,
}

/// One established peer link: a bidirectional frame pump serving the
/// remote's requests and executing the controller's request commands.
pub struct PeerConn {
    stream: TcpStream,
    addr: SocketAddr,
    remote_peer_id: PeerId,
    digest: Digest,
    metainfo: MetaInfo,
    torrent: SharedTorrent,
    store: Arc<PieceStore>,
    state: ConnState,
    pipeline: HashSet<u32>,
    pipeline_limit: usize,
    read_timeout: Duration,
    write_timeout: Duration,
    egress_limit: u64,
    sent_in_window: u64,
    window_start: Instant,
    read_buf: BytesMut,
    last_rx: Instant,
    pending_payload: Option<PendingPiece>,
    cmd_rx: mpsc::Receiver<ConnCommand>,
    events_rx: broadcast::Receiver<TorrentEvent>,
    shutdown: CancellationToken,
}

impl PeerConn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream: TcpStream,
        addr: SocketAddr,
        remote_peer_id: PeerId,
        metainfo: MetaInfo,
        torrent: SharedTorrent,
        store: Arc<PieceStore>,
        config: &Config,
        read_buf: BytesMut,
        cmd_rx: mpsc::Receiver<ConnCommand>,
        events_rx: broadcast::Receiver<TorrentEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            stream,
            addr,
            remote_peer_id,
            digest: *metainfo.digest(),
            metainfo,
            torrent,
            store,
            state: ConnState::Handshaking,
            pipeline: HashSet::new(),
            pipeline_limit: config.pipeline_limit,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            egress_limit: config.egress_bytes_per_sec,
            sent_in_window: 0,
            window_start: now,
            read_buf,
            last_rx: now,
            pending_payload: None,
            cmd_rx,
            events_rx,
            shutdown,
        }
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Runs the connection to completion and returns the close reason.
    pub async fn run(mut self) -> CloseReason {
        self.state = ConnState::Established;
        let reason = self.message_loop().await;
        self.state = ConnState::Closing;
        let _ = self.stream.shutdown().await;
        self.state = ConnState::Closed;
        debug!(remote = %self.addr, peer = %self.remote_peer_id, reason = ?reason, "connection closed");
        reason
    }

    async fn message_loop(&mut self) -> CloseReason {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        loop {
            match self.drain_buffer().await {
                Ok(None) => {}
                Ok(Some(reason)) => return reason,
                Err(e) => {
                    warn!(remote = %self.addr, error = %e, "connection failed");
                    return CloseReason::NetworkError;
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return CloseReason::SchedulerReload,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(reason) = self.handle_command(cmd).await {
                            return reason;
                        }
                    }
                    None => return CloseReason::SchedulerReload,
                },
                ev = self.events_rx.recv() => match ev {
                    Ok(ev) => {
                        if let Some(reason) = self.handle_event(ev).await {
                            return reason;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(remote = %self.addr, missed, "torrent event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return CloseReason::TorrentEvicted,
                },
                res = self.stream.read_buf(&mut self.read_buf) => match res {
                    Ok(0) => return CloseReason::PeerClosed,
                    Ok(_) => self.last_rx = Instant::now(),
                    Err(e) => {
                        debug!(remote = %self.addr, error = %e, "read failed");
                        return CloseReason::NetworkError;
                    }
                },
                _ = tick.tick() => {
                    if self.last_rx.elapsed() >= self.read_timeout {
                        return CloseReason::IdleTimeout;
                    }
                }
            }
        }
    }

    /// Processes every complete frame currently buffered.
    async fn drain_buffer(&mut self) -> Result<Option<CloseReason>> {
        loop {
            if let Some(pending) = &self.pending_payload {
                if self.read_buf.len() < pending.size {
                    return Ok(None);
                }
                let size = pending.size;
                let data = self.read_buf.split_to(size).freeze();
                let pending = self.pending_payload.take().expect("pending payload present");
                if let Some(reason) = self.handle_piece(pending, data).await? {
                    return Ok(Some(reason));
                }
                continue;
            }
            match Frame::decode(&self.read_buf)? {
                Some((frame, consumed)) => {
                    let _ = self.read_buf.split_to(consumed);
                    if let Some(reason) = self.handle_frame(frame.message).await? {
                        return Ok(Some(reason));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    async fn handle_command(&mut self, cmd: ConnCommand) -> Option<CloseReason> {
        match cmd {
            ConnCommand::Request(index) => {
                if self.pipeline.len() >= self.pipeline_limit || !self.pipeline.insert(index) {
                    return None;
                }
                self.send(Message::PieceRequest { index, offset: 0, length: 0 }).await.err()
            }
            ConnCommand::Cancel(index) => {
                if self.pipeline.remove(&index) {
                    return self.send(Message::CancelPiece { index }).await.err();
                }
                None
            }
            ConnCommand::Close(reason) => Some(reason),
        }
    }

    async fn handle_event(&mut self, ev: TorrentEvent) -> Option<CloseReason> {
        match ev {
            TorrentEvent::PieceCompleted { index, from } => {
                if from == Some(self.remote_peer_id) {
                    return None;
                }
                self.send(Message::AnnouncePiece { index }).await.err()
            }
            TorrentEvent::Completed => self.send(Message::Complete).await.err(),
        }
    }

    async fn handle_frame(&mut self, msg: Message) -> Result<Option<CloseReason>> {
        match msg {
            Message::Bitfield(_) => {
                debug!(remote = %self.addr, "ignoring handshake frame on established connection");
                Ok(None)
            }
            Message::PieceRequest { index, offset, length } => {
                if offset != 0 || length != 0 {
                    debug!(remote = %self.addr, index, "rejecting ranged piece request");
                    return Ok(self.send_request_failed(index).await.err());
                }
                self.serve_piece(index).await
            }
            Message::PiecePayload { index, digest } => {
                let Some(expected) = self.metainfo.piece_hash(index) else {
                    warn!(remote = %self.addr, index, "piece payload with bad index");
                    return Ok(Some(CloseReason::BadPiece));
                };
                if expected.as_bytes() != &digest {
                    warn!(remote = %self.addr, index, "piece payload digest disagrees with metainfo");
                    return Ok(Some(CloseReason::BadPiece));
                }
                let solicited = self.pipeline.remove(&index);
                self.pending_payload = Some(PendingPiece {
                    index,
                    size: self.metainfo.piece_size(index) as usize,
                    solicited,
                });
                Ok(None)
            }
            Message::AnnouncePiece { index } => {
                self.torrent.write().await.peer_has(&self.remote_peer_id, index);
                Ok(None)
            }
            // Requests are served inline, so there is nothing to withdraw.
            Message::CancelPiece { .. } => Ok(None),
            Message::Error { message, index, code } => {
                warn!(remote = %self.addr, index, code = ?code, error = %message, "remote error");
                match code {
                    ErrorCode::PieceRequestFailed => {
                        self.pipeline.remove(&index);
                        self.torrent.write().await.clear_request(
                            index,
                            &self.remote_peer_id,
                            false,
                        );
                    }
                }
                Ok(None)
            }
            Message::Complete => {
                self.torrent.write().await.mark_remote_complete(&self.remote_peer_id);
                Ok(None)
            }
        }
    }

    async fn serve_piece(&mut self, index: u32) -> Result<Option<CloseReason>> {
        let (data, digest) = match self.store.get_piece(&self.digest, index).await {
            Ok(data) => match self.metainfo.piece_hash(index) {
                Some(h) => (data, *h.as_bytes()),
                None => return Ok(self.send_request_failed(index).await.err()),
            },
            Err(Error::NotCached) | Err(Error::StillDownloading) | Err(Error::Parse(_)) => {
                return Ok(self.send_request_failed(index).await.err());
            }
            Err(e) => return Err(e),
        };
        self.apply_egress_limit(data.len() as u64).await;
        if let Err(reason) = self.send(Message::PiecePayload { index, digest }).await {
            return Ok(Some(reason));
        }
        if let Err(reason) = self.send_raw(&data).await {
            return Ok(Some(reason));
        }
        self.torrent.write().await.touch();
        Ok(None)
    }

    async fn send_request_failed(&mut self, index: u32) -> std::result::Result<(), CloseReason> {
        self.send(Message::Error {
            message: "piece not available".to_string(),
            index,
            code: ErrorCode::PieceRequestFailed,
        })
        .await
    }

    async fn handle_piece(
        &mut self,
        pending: PendingPiece,
        data: Bytes,
    ) -> Result<Option<CloseReason>> {
        let Some(expected) = self.metainfo.piece_hash(pending.index).copied() else {
            return Ok(Some(CloseReason::BadPiece));
        };
        let actual = Digest::compute(&data);
        if actual != expected {
            warn!(
                remote = %self.addr,
                index = pending.index,
                expected = %expected,
                actual = %actual,
                "received corrupt piece",
            );
            if pending.solicited {
                self.torrent.write().await.clear_request(pending.index, &self.remote_peer_id, false);
            }
            return Ok(Some(CloseReason::BadPiece));
        }
        match self.store.put_piece(&self.digest, pending.index, &data).await {
            Ok(_) => {
                let mut t = self.torrent.write().await;
                if pending.solicited {
                    t.clear_request(pending.index, &self.remote_peer_id, true);
                }
                t.mark_piece_complete(pending.index, Some(self.remote_peer_id));
                Ok(None)
            }
            // An endgame duplicate beat us to the commit.
            Err(Error::AlreadyHave) => {
                if pending.solicited {
                    self.torrent.write().await.clear_request(pending.index, &self.remote_peer_id, true);
                }
                Ok(None)
            }
            Err(Error::NotCached) => {
                if pending.solicited {
                    self.torrent.write().await.clear_request(pending.index, &self.remote_peer_id, false);
                }
                Ok(None)
            }
            Err(Error::ChecksumMismatch { .. }) => Ok(Some(CloseReason::BadPiece)),
            Err(e) => Err(e),
        }
    }

    async fn send(&mut self, msg: Message) -> std::result::Result<(), CloseReason> {
        let buf = Frame::new(msg).encode();
        self.send_raw(&buf).await
    }

    async fn send_raw(&mut self, data: &[u8]) -> std::result::Result<(), CloseReason> {
        match tokio::time::timeout(self.write_timeout, self.stream.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(remote = %self.addr, error = %e, "write failed");
                Err(CloseReason::NetworkError)
            }
            Err(_) => Err(CloseReason::WriteTimeout),
        }
    }

    /// Fixed-window egress throttle for piece uploads.
    async fn apply_egress_limit(&mut self, bytes: u64) {
        if self.egress_limit == 0 {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.sent_in_window = 0;
        }
        if self.sent_in_window + bytes > self.egress_limit {
            let wait = Duration::from_secs(1)
                .saturating_sub(now.duration_since(self.window_start));
            tokio::time::sleep(wait).await;
            self.window_start = Instant::now();
            self.sent_in_window = 0;
        }
        self.sent_in_window += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::Bitfield;
    use crate::torrent::Torrent;
    use tempfile::tempdir;
    use tokio::net::TcpListener;
    use tokio::sync::RwLock;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn handshake_payload(mi: &MetaInfo, peer_id: PeerId, bitfield: &Bitfield) -> HandshakePayload {
        HandshakePayload {
            info_hash: mi.info_hash(),
            name: mi.digest().hex(),
            peer_id: *peer_id.as_bytes(),
            bitfield: Bytes::copy_from_slice(bitfield.as_bytes()),
            namespace: "test-ns".to_string(),
            remote_bitfields: Vec::new(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<PieceStore>,
        metainfo: MetaInfo,
        data: Vec<u8>,
        torrent: SharedTorrent,
    }

    async fn fixture(seeded: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(PieceStore::new(dir.path()).await.unwrap());
        let data = (0..200u32).flat_map(|i| i.to_be_bytes()).collect::<Vec<u8>>();
        let digest = Digest::compute(&data);
        let metainfo = MetaInfo::new(digest, &data[..], 128).unwrap();
        let bitfield = if seeded {
            store.create_cache_file(&digest, &data[..]).await.unwrap();
            store.put_metainfo(&metainfo).await.unwrap();
            Bitfield::full(metainfo.num_pieces())
        } else {
            store.create_download(&metainfo).await.unwrap();
            Bitfield::new(metainfo.num_pieces())
        };
        let torrent = Arc::new(RwLock::new(Torrent::new(
            metainfo.clone(),
            "test-ns".to_string(),
            bitfield,
        )));
        Fixture { _dir: dir, store, metainfo, data, torrent }
    }

    async fn spawn_conn(
        fx: &Fixture,
        stream: TcpStream,
    ) -> (mpsc::Sender<ConnCommand>, tokio::task::JoinHandle<CloseReason>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let events_rx = fx.torrent.read().await.subscribe();
        let addr = stream.peer_addr().unwrap();
        let remote = PeerId::random();
        {
            let mut t = fx.torrent.write().await;
            let n = t.metainfo().num_pieces();
            t.register_conn(remote, addr, Bitfield::full(n), cmd_tx.clone()).unwrap();
        }
        let conn = PeerConn::new(
            stream,
            addr,
            remote,
            fx.metainfo.clone(),
            fx.torrent.clone(),
            fx.store.clone(),
            &Config::default(),
            BytesMut::new(),
            cmd_rx,
            events_rx,
            CancellationToken::new(),
        );
        (cmd_tx, tokio::spawn(conn.run()))
    }

    async fn read_frame_raw(stream: &mut TcpStream, buf: &mut BytesMut) -> Frame {
        loop {
            if let Some((frame, consumed)) = Frame::decode(buf).unwrap() {
                let _ = buf.split_to(consumed);
                return frame;
            }
            let n = stream.read_buf(buf).await.unwrap();
            assert!(n > 0, "peer closed mid-frame");
        }
    }

    async fn read_exact_raw(stream: &mut TcpStream, buf: &mut BytesMut, len: usize) -> Bytes {
        while buf.len() < len {
            let n = stream.read_buf(buf).await.unwrap();
            assert!(n > 0, "peer closed mid-payload");
        }
        buf.split_to(len).freeze()
    }

    #[tokio::test]
    async fn test_handshake_helpers_roundtrip() {
        let fx = fixture(true).await;
        let (mut client, mut server) = socket_pair().await;
        let payload =
            handshake_payload(&fx.metainfo, PeerId::random(), &Bitfield::full(fx.metainfo.num_pieces()));

        let frame = Frame::new(Message::Bitfield(payload.clone()));
        write_frame(&mut client, &frame, Duration::from_secs(5)).await.unwrap();

        let mut buf = BytesMut::new();
        let got = read_handshake(&mut server, &mut buf, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_handshake_frame() {
        let (mut client, mut server) = socket_pair().await;
        let frame = Frame::new(Message::Complete);
        write_frame(&mut client, &frame, Duration::from_secs(5)).await.unwrap();

        let mut buf = BytesMut::new();
        let err = read_handshake(&mut server, &mut buf, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeReject(_)));
    }

    #[tokio::test]
    async fn test_serves_piece_requests() {
        let fx = fixture(true).await;
        let (mut client, server) = socket_pair().await;
        let (_cmd, task) = spawn_conn(&fx, server).await;

        let mut buf = BytesMut::new();
        let req = Frame::new(Message::PieceRequest { index: 1, offset: 0, length: 0 });
        client.write_all(&req.encode()).await.unwrap();

        let frame = read_frame_raw(&mut client, &mut buf).await;
        let Message::PiecePayload { index, digest } = frame.message else {
            panic!("expected piece payload, got {:?}", frame.message);
        };
        assert_eq!(index, 1);
        assert_eq!(&digest, fx.metainfo.piece_hash(1).unwrap().as_bytes());
        let data = read_exact_raw(&mut client, &mut buf, 128).await;
        assert_eq!(&data[..], &fx.data[128..256]);

        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_unknown_piece_request_gets_error() {
        let fx = fixture(false).await;
        let (mut client, server) = socket_pair().await;
        let (_cmd, task) = spawn_conn(&fx, server).await;

        let mut buf = BytesMut::new();
        let req = Frame::new(Message::PieceRequest { index: 0, offset: 0, length: 0 });
        client.write_all(&req.encode()).await.unwrap();

        let frame = read_frame_raw(&mut client, &mut buf).await;
        assert!(matches!(
            frame.message,
            Message::Error { code: ErrorCode::PieceRequestFailed, index: 0, .. }
        ));

        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_downloads_requested_piece() {
        let fx = fixture(false).await;
        let (mut client, server) = socket_pair().await;
        let (cmd, task) = spawn_conn(&fx, server).await;

        cmd.send(ConnCommand::Request(0)).await.unwrap();
        let mut buf = BytesMut::new();
        let frame = read_frame_raw(&mut client, &mut buf).await;
        assert!(matches!(frame.message, Message::PieceRequest { index: 0, offset: 0, length: 0 }));

        let payload = Frame::new(Message::PiecePayload {
            index: 0,
            digest: *fx.metainfo.piece_hash(0).unwrap().as_bytes(),
        });
        client.write_all(&payload.encode()).await.unwrap();
        client.write_all(&fx.data[..128]).await.unwrap();

        // The piece commits and the announcement loops back to the sender
        // being excluded, so no frame arrives; the store proves delivery.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if fx.store.have_bitfield(fx.metainfo.digest()).await.unwrap().has(0) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_corrupt_piece_closes_with_bad_piece() {
        let fx = fixture(false).await;
        let (mut client, server) = socket_pair().await;
        let (cmd, task) = spawn_conn(&fx, server).await;

        cmd.send(ConnCommand::Request(0)).await.unwrap();
        let mut buf = BytesMut::new();
        let frame = read_frame_raw(&mut client, &mut buf).await;
        assert!(matches!(frame.message, Message::PieceRequest { index: 0, .. }));

        let payload = Frame::new(Message::PiecePayload {
            index: 0,
            digest: *fx.metainfo.piece_hash(0).unwrap().as_bytes(),
        });
        let mut corrupt = fx.data[..128].to_vec();
        corrupt[0] ^= 0xff;
        client.write_all(&payload.encode()).await.unwrap();
        client.write_all(&corrupt).await.unwrap();

        assert_eq!(task.await.unwrap(), CloseReason::BadPiece);
        assert!(!fx.store.have_bitfield(fx.metainfo.digest()).await.unwrap().has(0));
    }

    #[tokio::test]
    async fn test_close_command() {
        let fx = fixture(true).await;
        let (_client, server) = socket_pair().await;
        let (cmd, task) = spawn_conn(&fx, server).await;
        cmd.send(ConnCommand::Close(CloseReason::TorrentEvicted)).await.unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::TorrentEvicted);
    }

    #[test]
    fn test_blacklistable_reasons() {
        assert!(CloseReason::HandshakeReject.blacklists());
        assert!(CloseReason::BadPiece.blacklists());
        assert!(CloseReason::DuplicateConnection.blacklists());
        assert!(!CloseReason::IdleTimeout.blacklists());
        assert!(!CloseReason::SchedulerReload.blacklists());
        assert!(!CloseReason::PeerClosed.blacklists());
    }
}
