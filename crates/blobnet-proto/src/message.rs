use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol version carried on every frame. Peers with a different major
/// component reject the handshake.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Length of a blob or piece digest (sha256).
pub const DIGEST_LEN: usize = 32;

/// Length of a peer identifier.
pub const PEER_ID_LEN: usize = 20;

/// Upper bound on a single frame, excluding raw piece payloads which are
/// streamed separately after a PIECE_PAYLOAD frame.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),
    #[error("unknown error code: {0}")]
    UnknownErrorCode(u8),
    #[error("truncated {0} field")]
    Truncated(&'static str),
    #[error("invalid utf-8 in {0} field")]
    InvalidUtf8(&'static str),
    #[error("incompatible protocol version: ours {ours}, theirs {theirs}")]
    IncompatibleVersion { ours: String, theirs: String },
}

/// Error codes carried by ERROR messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PieceRequestFailed,
}

impl ErrorCode {
    fn to_u8(self) -> u8 {
        match self {
            ErrorCode::PieceRequestFailed => 0,
        }
    }

    fn from_u8(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(ErrorCode::PieceRequestFailed),
            other => Err(WireError::UnknownErrorCode(other)),
        }
    }
}

/// Handshake payload exchanged in both directions when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    pub info_hash: [u8; DIGEST_LEN],
    /// Hex form of the blob digest.
    pub name: String,
    pub peer_id: [u8; PEER_ID_LEN],
    pub bitfield: Bytes,
    pub namespace: String,
    /// Bitfields of peers the sender is currently connected to, as a hint.
    pub remote_bitfields: Vec<([u8; PEER_ID_LEN], Bytes)>,
}

/// Peer wire protocol messages.
///
/// PIECE_PAYLOAD frames are followed on the stream by the raw piece bytes;
/// the receiver knows the exact length from its metainfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake: declare identity and piece possession for one torrent.
    Bitfield(HandshakePayload),
    /// Request a whole piece. Offset and length are reserved and must be zero.
    PieceRequest { index: u32, offset: u32, length: u32 },
    /// Header preceding the raw bytes of one piece.
    PiecePayload { index: u32, digest: [u8; DIGEST_LEN] },
    /// Announce possession of a newly committed piece.
    AnnouncePiece { index: u32 },
    /// Withdraw an outstanding request (endgame duplicate resolution).
    CancelPiece { index: u32 },
    /// Report a failure to the remote.
    Error { message: String, index: u32, code: ErrorCode },
    /// The sender now has every piece.
    Complete,
}

impl Message {
    fn id(&self) -> u8 {
        match self {
            Message::Bitfield(_) => 0,
            Message::PieceRequest { .. } => 1,
            Message::PiecePayload { .. } => 2,
            Message::AnnouncePiece { .. } => 3,
            Message::CancelPiece { .. } => 4,
            Message::Error { .. } => 5,
            Message::Complete => 6,
        }
    }
}

/// One framed message: version string plus message body, length-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: String,
    pub message: Message,
}

impl Frame {
    pub fn new(message: Message) -> Self {
        Self { version: PROTOCOL_VERSION.to_string(), message }
    }

    /// Encode to bytes: u32 BE length, message id, version, body.
    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(self.message.id());
        put_short_str(&mut body, &self.version);
        match &self.message {
            Message::Bitfield(hs) => {
                body.put_slice(&hs.info_hash);
                put_str(&mut body, &hs.name);
                body.put_slice(&hs.peer_id);
                put_bytes(&mut body, &hs.bitfield);
                put_str(&mut body, &hs.namespace);
                body.put_u16(hs.remote_bitfields.len() as u16);
                for (peer_id, bitfield) in &hs.remote_bitfields {
                    body.put_slice(peer_id);
                    put_bytes(&mut body, bitfield);
                }
            }
            Message::PieceRequest { index, offset, length } => {
                body.put_u32(*index);
                body.put_u32(*offset);
                body.put_u32(*length);
            }
            Message::PiecePayload { index, digest } => {
                body.put_u32(*index);
                body.put_slice(digest);
            }
            Message::AnnouncePiece { index } | Message::CancelPiece { index } => {
                body.put_u32(*index);
            }
            Message::Error { message, index, code } => {
                put_str(&mut body, message);
                body.put_u32(*index);
                body.put_u8(code.to_u8());
            }
            Message::Complete => {}
        }
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        buf
    }

    /// Decode a frame from the front of `buf`.
    /// Returns `(frame, bytes_consumed)`, or `None` if more data is needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(length));
        }
        let total = 4 + length;
        if buf.len() < total {
            return Ok(None);
        }
        let mut r = Reader { buf: &buf[4..total] };
        let id = r.u8("message id")?;
        let version = r.short_str("version")?;
        let message = match id {
            0 => {
                let info_hash = r.array::<DIGEST_LEN>("info hash")?;
                let name = r.str("name")?;
                let peer_id = r.array::<PEER_ID_LEN>("peer id")?;
                let bitfield = r.bytes("bitfield")?;
                let namespace = r.str("namespace")?;
                let count = r.u16("remote bitfield count")? as usize;
                let mut remote_bitfields = Vec::with_capacity(count);
                for _ in 0..count {
                    let peer_id = r.array::<PEER_ID_LEN>("remote peer id")?;
                    let bitfield = r.bytes("remote bitfield")?;
                    remote_bitfields.push((peer_id, bitfield));
                }
                Message::Bitfield(HandshakePayload {
                    info_hash,
                    name,
                    peer_id,
                    bitfield,
                    namespace,
                    remote_bitfields,
                })
            }
            1 => Message::PieceRequest {
                index: r.u32("index")?,
                offset: r.u32("offset")?,
                length: r.u32("length")?,
            },
            2 => Message::PiecePayload {
                index: r.u32("index")?,
                digest: r.array::<DIGEST_LEN>("piece digest")?,
            },
            3 => Message::AnnouncePiece { index: r.u32("index")? },
            4 => Message::CancelPiece { index: r.u32("index")? },
            5 => Message::Error {
                message: r.str("error message")?,
                index: r.u32("index")?,
                code: ErrorCode::from_u8(r.u8("error code")?)?,
            },
            6 => Message::Complete,
            other => return Err(WireError::UnknownMessageId(other)),
        };
        Ok(Some((Frame { version, message }, total)))
    }
}

/// Checks that two version strings share a major component.
pub fn version_compatible(ours: &str, theirs: &str) -> bool {
    major(ours).is_some() && major(ours) == major(theirs)
}

fn major(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

fn put_short_str(buf: &mut BytesMut, s: &str) {
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated(field));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, WireError> {
        let b = self.take(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        let b = self.take(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], WireError> {
        let b = self.take(N, field)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn bytes(&mut self, field: &'static str) -> Result<Bytes, WireError> {
        let len = self.u32(field)? as usize;
        Ok(Bytes::copy_from_slice(self.take(len, field)?))
    }

    fn short_str(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = self.u8(field)? as usize;
        let b = self.take(len, field)?;
        String::from_utf8(b.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
    }

    fn str(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = self.u32(field)? as usize;
        let b = self.take(len, field)?;
        String::from_utf8(b.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
    }
}
